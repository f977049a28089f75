use concurrency_limit::{app, cli::Opts};

fn main() {
    let opts = Opts::get_matches();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("concurrency-limit-worker")
        .build()
        .expect("Unable to create async runtime");

    let code = runtime.block_on(app::run(opts));
    // Give background slot releases a moment to finish.
    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    std::process::exit(code);
}
