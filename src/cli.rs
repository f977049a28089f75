use crate::config::LimitConfig;
use std::{ffi::OsString, path::PathBuf, str::FromStr};
use structopt::{clap::AppSettings, StructOpt};

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct Opts {
    #[structopt(flatten)]
    pub root: RootOpts,

    #[structopt(subcommand)]
    pub sub_command: SubCommand,
}

impl Opts {
    pub fn get_matches() -> Self {
        Opts::from_args()
    }

    pub fn log_level(&self) -> &'static str {
        match self.root.quiet {
            0 => match self.root.verbose {
                0 => "info",
                1 => "debug",
                2..=255 => "trace",
            },
            1 => "warn",
            2..=255 => "error",
        }
    }
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct RootOpts {
    /// Read Redis and limit settings from this TOML file.
    #[structopt(short, long, env = "CONCURRENCY_LIMIT_CONFIG", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Enable more detailed internal logging. Repeat to increase level. Overridden by `--quiet`.
    #[structopt(short, long, parse(from_occurrences))]
    pub verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further. Overrides `--verbose`.
    #[structopt(short, long, parse(from_occurrences))]
    pub quiet: u8,

    /// Set the logging format
    #[structopt(long, default_value = "text", possible_values = &["text", "json"])]
    pub log_format: LogFormat,

    /// Control when ANSI terminal formatting is used.
    ///
    /// By default, formatting is only used when the output is a terminal.
    #[structopt(long, default_value = "auto", possible_values = &["auto", "always", "never"])]
    pub color: Color,
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub enum SubCommand {
    /// Run a program while holding an execution slot.
    ///
    /// Waits for a free slot, runs the program, releases the slot and exits
    /// with the program's exit code.
    #[structopt(setting = AppSettings::TrailingVarArg)]
    Exec(ExecOpts),

    /// Remove expired or unreadable holders of a limit key.
    Clean(LimitOpts),

    /// List limit keys matching a pattern.
    Keys(KeysOpts),

    /// Validate the configuration and exit.
    Validate,
}

/// Limit settings; each flag overrides the `[limit]` table of the config file.
#[derive(StructOpt, Debug, Default, Clone)]
#[structopt(rename_all = "kebab-case")]
pub struct LimitOpts {
    /// Name of the limit.
    #[structopt(short, long)]
    pub key: Option<String>,

    /// Maximum number of concurrent holders.
    #[structopt(short, long)]
    pub limit: Option<usize>,

    /// Give up waiting for a slot after this many seconds.
    #[structopt(long)]
    pub timeout_secs: Option<f64>,

    /// Seconds after which a holder is considered stale.
    #[structopt(long)]
    pub expire_secs: Option<u64>,

    /// Milliseconds to wait between two attempts.
    #[structopt(long)]
    pub interval_ms: Option<u64>,
}

impl LimitOpts {
    /// Applies the flags on top of `base` and validates the result.
    pub fn merge(&self, base: Option<&LimitConfig>) -> Result<LimitConfig, Vec<String>> {
        let key = self.key.clone().or_else(|| base.map(|base| base.key.clone()));
        let limit = self.limit.or_else(|| base.map(|base| base.limit));

        let mut config = match (key, limit) {
            (Some(key), Some(limit)) => match base {
                Some(base) => LimitConfig {
                    key,
                    limit,
                    ..base.clone()
                },
                None => LimitConfig::new(key, limit),
            },
            (key, limit) => {
                let mut errors = Vec::new();
                if key.is_none() {
                    errors.push("No limit key given, pass --key or set limit.key".to_owned());
                }
                if limit.is_none() {
                    errors.push("No limit given, pass --limit or set limit.limit".to_owned());
                }
                return Err(errors);
            }
        };

        if let Some(timeout_secs) = self.timeout_secs {
            config.timeout_secs = timeout_secs;
        }
        if let Some(expire_secs) = self.expire_secs {
            config.expire_secs = expire_secs;
        }
        if let Some(interval_ms) = self.interval_ms {
            config.interval_ms = interval_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct ExecOpts {
    #[structopt(flatten)]
    pub limit: LimitOpts,

    /// Program to run, followed by its arguments.
    #[structopt(required = true, parse(from_os_str))]
    pub command: Vec<OsString>,
}

#[derive(StructOpt, Debug)]
#[structopt(rename_all = "kebab-case")]
pub struct KeysOpts {
    /// Glob-style pattern keys must match.
    #[structopt(short, long, default_value = "*")]
    pub pattern: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Color {
    Auto,
    Always,
    Never,
}

impl Color {
    pub fn use_color(&self) -> bool {
        match self {
            Color::Auto => atty::is(atty::Stream::Stderr),
            Color::Always => true,
            Color::Never => false,
        }
    }
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Color::Auto),
            "always" => Ok(Color::Always),
            "never" => Ok(Color::Never),
            s => Err(format!(
                "{} is not a valid option, expected `auto`, `always` or `never`",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            s => Err(format!(
                "{} is not a valid option, expected `text` or `json`",
                s
            )),
        }
    }
}
