use crate::metrics_defs::{MetricDef, describe_all};
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Installs a global recorder that sends all metrics to StatsD and registers
/// the descriptions of the given metric definitions.
pub fn install_statsd(
    statsd_host: &str,
    statsd_port: u16,
    prefix: &str,
    defs: &[&[MetricDef]],
) -> Result<(), MetricsError> {
    let recorder = StatsdBuilder::from(statsd_host, statsd_port)
        .with_queue_size(5000)
        .with_buffer_size(1024)
        .build(Some(prefix))?;

    metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;

    for group in defs {
        describe_all(group);
    }

    tracing::info!(host = statsd_host, port = statsd_port, "statsd metrics enabled");
    Ok(())
}
