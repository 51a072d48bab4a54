use projectcache::config::{Config as ProjectCacheConfig, ValidationError};
use serde::Deserialize;
use std::fs::File;

fn default_metrics_prefix() -> String {
    "gatekeeper".into()
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Config {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    #[serde(flatten)]
    pub project_cache: ProjectCacheConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.project_cache.validate()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            listener:
                host: 0.0.0.0
                port: 8080
            upstream:
                url: http://sentry.internal:9000/
            cache:
                project_expiry: 60
                batch_interval_ms: 250
            limits:
                query_timeout: 10
            shared_cache:
                url: redis://127.0.0.1:6379
            overrides:
                path: /etc/gatekeeper/projects
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.validate().is_ok());

        let project_cache = &config.project_cache;
        assert_eq!(project_cache.listener.port, 8080);
        assert_eq!(
            project_cache.upstream.url.as_str(),
            "http://sentry.internal:9000/"
        );
        assert_eq!(project_cache.cache.project_expiry, Duration::from_secs(60));
        assert_eq!(
            project_cache.cache.batch_interval,
            Duration::from_millis(250)
        );
        assert_eq!(project_cache.limits.query_timeout, Duration::from_secs(10));
        assert_eq!(
            project_cache.shared_cache.as_ref().unwrap().prefix,
            "relayconfig"
        );
        assert_eq!(
            project_cache.overrides.as_ref().unwrap().path,
            std::path::PathBuf::from("/etc/gatekeeper/projects")
        );

        assert_eq!(
            config.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
                prefix: "gatekeeper".into(),
            })
        );
        let logging = config.logging.expect("logging config");
        assert_eq!(logging.level, "debug");
        assert_eq!(
            logging.sentry_dsn.as_deref(),
            Some("https://key@sentry.example.com/1")
        );
    }

    #[test]
    fn empty_config_uses_defaults() {
        let tmp = write_tmp_file("{}");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_config() {
        let tmp = write_tmp_file(
            r#"
            cache:
                batch_size: 0
            "#,
        );
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config.validate(), Err(ValidationError::ZeroBatchSize));

        let tmp = write_tmp_file("listener: [1, 2]");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/does/not/exist.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
