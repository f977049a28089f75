use tracing_subscriber::EnvFilter;

/// Installs the global subscriber writing to stderr.
///
/// `LOG` takes precedence over `levels` when set.
pub fn init(color: bool, json: bool, levels: &str) {
    let filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new(levels));

    let result = if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(color)
            .try_init()
    };

    if let Err(error) = result {
        eprintln!("Unable to install the log subscriber: {}", error);
    }
}
