use crate::config::Upstream as UpstreamConfig;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial_interval: Duration::from_secs(1),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
        }
    }
}

impl From<&UpstreamConfig> for BackoffConfig {
    fn from(config: &UpstreamConfig) -> Self {
        BackoffConfig {
            initial_interval: config.initial_backoff,
            multiplier: config.backoff_multiplier,
            max_interval: config.max_backoff,
        }
    }
}

/// Exponential backoff between attempts of a single query.
///
/// The n-th retry waits `initial_interval * multiplier^n`, capped at
/// `max_interval`.
#[derive(Debug)]
pub struct RetryBackoff {
    config: BackoffConfig,
    retries: u32,
}

impl RetryBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        RetryBackoff { config, retries: 0 }
    }

    pub fn next_backoff(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        let exponent = i32::try_from(self.retries).unwrap_or(i32::MAX);
        let factor = self.config.multiplier.powi(exponent);
        let seconds = self.config.initial_interval.as_secs_f64() * factor;

        Duration::try_from_secs_f64(seconds)
            .unwrap_or(self.config.max_interval)
            .min(self.config.max_interval)
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}
