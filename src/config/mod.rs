//! Connection and limit settings, loadable from a TOML file.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::{collections::HashMap, fs, path::Path, time::Duration};

mod vars;

pub use vars::interpolate;

/// Characters left untouched in the userinfo part of a connection URL.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Where the shared limit state lives.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// A complete `redis://` or `rediss://` URL, taking precedence over the
    /// individual fields.
    #[serde(default)]
    pub url: Option<String>,
}

fn default_host() -> String {
    "localhost".to_owned()
}

const fn default_port() -> u16 {
    6379
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            username: None,
            password: None,
            url: None,
        }
    }
}

impl RedisConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }

        let encode = |s: &str| utf8_percent_encode(s, USERINFO).to_string();
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(password)) => format!("{}:{}@", encode(user), encode(password)),
            (Some(user), None) => format!("{}@", encode(user)),
            (None, Some(password)) => format!(":{}@", encode(password)),
            (None, None) => String::new(),
        };

        let host = if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };

        format!("redis://{}{}:{}/{}", auth, host, self.port, self.db)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match &self.url {
            None => {
                if self.host.is_empty() {
                    errors.push("Redis host must not be empty".to_owned());
                }
                if self.port == 0 {
                    errors.push("Redis port must not be 0".to_owned());
                }
                if self.db < 0 {
                    errors.push(format!("Redis db must not be negative, got {}", self.db));
                }
            }
            Some(url) => {
                if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                    errors.push(format!("Redis url {:?} must use redis:// or rediss://", url));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Settings of a single named limit.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LimitConfig {
    /// Name of the hash holding the slot holders.
    pub key: String,
    /// Maximum number of concurrent holders.
    pub limit: usize,
    /// How long to keep retrying before giving up.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Lifetime of a holder entry, and the TTL of the whole key.
    #[serde(default = "default_expire_secs")]
    pub expire_secs: u64,
    /// Pause between two acquisition attempts.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

/// Upper bound of `timeout_secs` and `expire_secs`.
pub const MAX_SECS: u64 = u32::MAX as u64;

const fn default_timeout_secs() -> f64 {
    10.0
}

const fn default_expire_secs() -> u64 {
    30
}

const fn default_interval_ms() -> u64 {
    100
}

impl LimitConfig {
    pub fn new(key: impl Into<String>, limit: usize) -> Self {
        Self {
            key: key.into(),
            limit,
            timeout_secs: default_timeout_secs(),
            expire_secs: default_expire_secs(),
            interval_ms: default_interval_ms(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    /// Sub-second precision is rounded up, Redis expiry works in whole seconds.
    pub fn with_expire(mut self, expire: Duration) -> Self {
        let secs = expire.as_secs();
        self.expire_secs = if expire.subsec_nanos() > 0 { secs + 1 } else { secs };
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Out of range values are clamped to `0..=MAX_SECS`.
    pub fn timeout(&self) -> Duration {
        if self.timeout_secs.is_finite() && self.timeout_secs > 0.0 {
            Duration::from_secs_f64(self.timeout_secs.min(MAX_SECS as f64))
        } else {
            Duration::ZERO
        }
    }

    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs.min(MAX_SECS))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.key.is_empty() {
            errors.push("Limit key must not be empty".to_owned());
        }
        if self.limit == 0 {
            errors.push(format!("Limit for key {:?} must be at least 1", self.key));
        }
        if !self.timeout_secs.is_finite() || self.timeout_secs < 0.0 {
            errors.push(format!(
                "Timeout for key {:?} must be a non-negative number of seconds, got {}",
                self.key, self.timeout_secs
            ));
        } else if self.timeout_secs > MAX_SECS as f64 {
            errors.push(format!(
                "Timeout for key {:?} must be at most {} seconds, got {}",
                self.key, MAX_SECS, self.timeout_secs
            ));
        }
        if self.expire_secs == 0 {
            errors.push(format!("Expiry for key {:?} must be at least 1 second", self.key));
        } else if self.expire_secs > MAX_SECS {
            errors.push(format!(
                "Expiry for key {:?} must be at most {} seconds, got {}",
                self.key, MAX_SECS, self.expire_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Contents of a configuration file.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub limit: Option<LimitConfig>,
}

impl Config {
    /// Reads, interpolates and validates the file at `path`.
    ///
    /// Returns the config together with any warnings, or every error found.
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), Vec<String>> {
        let input = fs::read_to_string(path)
            .map_err(|error| vec![format!("Could not read {:?}: {}", path, error)])?;
        Self::from_toml(&input).map_err(|errors| {
            errors
                .into_iter()
                .map(|error| format!("{:?}: {}", path, error))
                .collect()
        })
    }

    pub fn from_toml(input: &str) -> Result<(Self, Vec<String>), Vec<String>> {
        let vars = std::env::vars().collect::<HashMap<_, _>>();
        Self::from_toml_with_vars(input, &vars)
    }

    pub fn from_toml_with_vars(
        input: &str,
        vars: &HashMap<String, String>,
    ) -> Result<(Self, Vec<String>), Vec<String>> {
        let (input, warnings) = interpolate(input, vars);
        let config: Config = toml::from_str(&input).map_err(|error| vec![error.to_string()])?;
        config.validate()?;
        Ok((config, warnings))
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if let Err(redis_errors) = self.redis.validate() {
            errors.extend(redis_errors);
        }
        if let Some(Err(limit_errors)) = self.limit.as_ref().map(LimitConfig::validate) {
            errors.extend(limit_errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
