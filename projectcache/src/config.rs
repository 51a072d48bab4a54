use serde::{Deserialize, Deserializer, de};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("project_expiry must be greater than 0")]
    ZeroProjectExpiry,

    #[error("batch_size must be greater than 0")]
    ZeroBatchSize,

    #[error("{0} must be greater than 0")]
    ZeroInterval(&'static str),

    #[error("backoff_multiplier must be greater than 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    #[error("shared cache prefix cannot be empty")]
    EmptyPrefix,
}

/// Deserializes a duration given in (possibly fractional) seconds.
fn secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if !value.is_finite() || value < 0.0 {
        return Err(de::Error::custom(format!(
            "duration must be a non-negative number of seconds, got {value}"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

fn millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// The authoritative source of project configs.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Upstream {
    pub url: Url,
    /// Base of the exponential backoff. The n-th retry waits
    /// `initial_backoff * backoff_multiplier^n`.
    #[serde(deserialize_with = "secs")]
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for a single backoff step.
    #[serde(deserialize_with = "secs")]
    pub max_backoff: Duration,
    /// Timeout of a single request. A timed out request is retried.
    #[serde(deserialize_with = "secs")]
    pub timeout: Duration,
}

impl Default for Upstream {
    fn default() -> Self {
        Upstream {
            url: Url::parse("http://127.0.0.1:8000/").expect("static URL is valid"),
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Cache {
    /// How long a fetched project config is used without revalidation.
    #[serde(deserialize_with = "secs")]
    pub project_expiry: Duration,
    /// Additional time an expired config is still served while it is revalidated.
    #[serde(deserialize_with = "secs")]
    pub project_grace_period: Duration,
    /// How long a "project not found" answer is remembered.
    #[serde(deserialize_with = "secs")]
    pub miss_expiry: Duration,
    #[serde(rename = "batch_interval_ms", deserialize_with = "millis")]
    pub batch_interval: Duration,
    pub batch_size: usize,
    /// Poll interval of the local override directory.
    #[serde(deserialize_with = "secs")]
    pub file_interval: Duration,
    #[serde(deserialize_with = "secs")]
    pub global_config_interval: Duration,
    #[serde(deserialize_with = "secs")]
    pub eviction_interval: Duration,
}

impl Default for Cache {
    fn default() -> Self {
        Cache {
            project_expiry: Duration::from_secs(300),
            project_grace_period: Duration::from_secs(120),
            miss_expiry: Duration::from_secs(60),
            batch_interval: Duration::from_millis(100),
            batch_size: 500,
            file_interval: Duration::from_secs(10),
            global_config_interval: Duration::from_secs(10),
            eviction_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// Total time budget of an upstream query, including all retries.
    #[serde(deserialize_with = "secs")]
    pub query_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            query_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct SharedCache {
    pub url: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "relayconfig".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Overrides {
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub cache: Cache,
    #[serde(default)]
    pub limits: Limits,
    pub shared_cache: Option<SharedCache>,
    pub overrides: Option<Overrides>,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.cache.project_expiry.is_zero() {
            return Err(ValidationError::ZeroProjectExpiry);
        }

        if self.cache.batch_size == 0 {
            return Err(ValidationError::ZeroBatchSize);
        }

        for (name, interval) in [
            ("batch_interval_ms", self.cache.batch_interval),
            ("file_interval", self.cache.file_interval),
            ("global_config_interval", self.cache.global_config_interval),
            ("eviction_interval", self.cache.eviction_interval),
            ("upstream.timeout", self.upstream.timeout),
        ] {
            if interval.is_zero() {
                return Err(ValidationError::ZeroInterval(name));
            }
        }

        let multiplier = self.upstream.backoff_multiplier;
        if multiplier.is_nan() || multiplier <= 1.0 {
            return Err(ValidationError::InvalidBackoffMultiplier(multiplier));
        }

        if let Some(shared_cache) = &self.shared_cache
            && shared_cache.prefix.is_empty()
        {
            return Err(ValidationError::EmptyPrefix);
        }

        Ok(())
    }
}
