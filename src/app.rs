use crate::{
    cli::{ExecOpts, KeysOpts, LimitOpts, LogFormat, Opts, SubCommand},
    config::Config,
    connections,
    limit::{self, ConcurrencyLimit, LimitError},
    trace,
};
use exitcode::ExitCode;
use std::{ffi::OsString, path::Path, process::ExitStatus};
use tokio::{process::Command, signal};

/// Exit code used when the program was stopped with Ctrl-C.
const INTERRUPTED: ExitCode = 130;

pub async fn run(opts: Opts) -> ExitCode {
    let json = opts.root.log_format == LogFormat::Json;
    trace::init(opts.root.color.use_color(), json, opts.log_level());

    let config_path = opts.root.config.as_deref();
    match opts.sub_command {
        SubCommand::Validate => validate(config_path),
        SubCommand::Exec(exec_opts) => match load_config(config_path) {
            Ok(config) => exec(config, exec_opts).await,
            Err(code) => code,
        },
        SubCommand::Clean(limit_opts) => match load_config(config_path) {
            Ok(config) => clean(config, limit_opts).await,
            Err(code) => code,
        },
        SubCommand::Keys(keys_opts) => match load_config(config_path) {
            Ok(config) => keys(config, keys_opts).await,
            Err(code) => code,
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<Config, ExitCode> {
    let path = match path {
        Some(path) => path,
        None => return Ok(Config::default()),
    };

    match Config::load(path) {
        Ok((config, warnings)) => {
            for warning in warnings {
                warn!(message = "Configuration warning.", %warning);
            }
            Ok(config)
        }
        Err(errors) => {
            for error in errors {
                error!(message = "Configuration error.", %error);
            }
            Err(exitcode::CONFIG)
        }
    }
}

fn validate(path: Option<&Path>) -> ExitCode {
    let path = match path {
        Some(path) => path,
        None => {
            println!("x No configuration file given, pass --config");
            return exitcode::CONFIG;
        }
    };

    match Config::load(path) {
        Ok((config, warnings)) => {
            for warning in warnings {
                println!("~ {}", warning);
            }
            println!("√ Loaded {:?}", path);
            match config.limit {
                Some(limit) => println!(
                    "√ Limit {:?} allows {} concurrent holders",
                    limit.key, limit.limit
                ),
                None => println!("~ No [limit] table, limits must be given on the command line"),
            }
            exitcode::OK
        }
        Err(errors) => {
            for error in errors {
                println!("x {}", error);
            }
            exitcode::CONFIG
        }
    }
}

async fn exec(config: Config, opts: ExecOpts) -> ExitCode {
    let limit = match connect_limit(&config, &opts.limit).await {
        Ok(limit) => limit,
        Err(code) => return code,
    };

    let slot = match limit.acquire_until(signal::ctrl_c()).await {
        Ok(Some(slot)) => slot,
        Ok(None) => {
            info!(message = "Interrupted while waiting for a slot.");
            return INTERRUPTED;
        }
        Err(error) => return limit_error(&error),
    };

    let code = run_program(&opts.command).await;
    // Release failures are reported by the slot itself.
    let _ = slot.release().await;
    code
}

async fn clean(config: Config, opts: LimitOpts) -> ExitCode {
    let limit = match connect_limit(&config, &opts).await {
        Ok(limit) => limit,
        Err(code) => return code,
    };

    match limit.clean().await {
        Ok(removed) => {
            println!("{}", removed);
            exitcode::OK
        }
        Err(error) => limit_error(&error),
    }
}

async fn keys(config: Config, opts: KeysOpts) -> ExitCode {
    let store = match connections::connect(&config.redis).await {
        Ok(store) => store,
        Err(error) => {
            error!(message = "Unable to connect.", %error);
            return exitcode::UNAVAILABLE;
        }
    };

    match limit::keys(&store, &opts.pattern).await {
        Ok(keys) => {
            for key in keys {
                println!("{}", key);
            }
            exitcode::OK
        }
        Err(error) => limit_error(&error),
    }
}

async fn connect_limit(
    config: &Config,
    opts: &LimitOpts,
) -> Result<ConcurrencyLimit<crate::store::RedisStore>, ExitCode> {
    let limit_config = opts.merge(config.limit.as_ref()).map_err(|errors| {
        for error in errors {
            error!(message = "Configuration error.", %error);
        }
        exitcode::CONFIG
    })?;

    ConcurrencyLimit::connect(&config.redis, limit_config)
        .await
        .map_err(|error| limit_error(&error))
}

fn limit_error(error: &LimitError) -> ExitCode {
    match error {
        LimitError::InvalidConfig { .. } => {
            error!(message = "Configuration error.", %error);
            exitcode::CONFIG
        }
        LimitError::LimitExceeded { .. } => {
            error!(message = "No execution slot available.", %error);
            exitcode::TEMPFAIL
        }
        LimitError::Store { .. } => {
            error!(message = "Lock store unavailable.", %error);
            exitcode::UNAVAILABLE
        }
    }
}

async fn run_program(command: &[OsString]) -> ExitCode {
    let (program, args) = match command.split_first() {
        Some(split) => split,
        None => return exitcode::USAGE,
    };

    let mut child = match Command::new(program).args(args).kill_on_drop(true).spawn() {
        Ok(child) => child,
        Err(error) => {
            error!(message = "Unable to start program.", ?program, %error);
            return exitcode::OSERR;
        }
    };

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = signal::ctrl_c() => None,
    };

    match status {
        Some(Ok(status)) => exit_code(status),
        Some(Err(error)) => {
            error!(message = "Lost track of program.", ?program, %error);
            exitcode::OSERR
        }
        None => {
            info!(message = "Interrupted, stopping program.", ?program);
            if let Err(error) = child.kill().await {
                warn!(message = "Unable to stop program.", ?program, %error);
            }
            INTERRUPTED
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;

    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(exitcode::SOFTWARE)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> ExitCode {
    status.code().unwrap_or(exitcode::SOFTWARE)
}
