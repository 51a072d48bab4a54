mod config;
mod logging;

use clap::{Args, Parser};
use config::{Config, ConfigError};
use projectcache::admission::TracingOutcomeSink;
use projectcache::api::{self, ApiError};
use projectcache::{ProjectCache, ServiceError};
use shared::metrics::MetricsError;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(version, about = "Project config cache and admission service")]
enum CliCommand {
    /// Run the project cache and the admission API
    Run(ConfigArgs),
    /// Validate a config file and exit
    CheckConfig(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short)]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Logging(#[from] logging::LoggingError),
    #[error("could not install metrics: {0}")]
    Metrics(#[from] MetricsError),
    #[error("could not start runtime: {0}")]
    Runtime(std::io::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let result = match &cli {
        CliCommand::Run(args) => run(args),
        CliCommand::CheckConfig(args) => check_config(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &ConfigArgs) -> Result<Config, ConfigError> {
    let config = Config::from_file(&args.config)?;
    config.validate()?;
    Ok(config)
}

fn check_config(args: &ConfigArgs) -> Result<(), CliError> {
    load_config(args)?;
    println!("{}: ok", args.config.display());
    Ok(())
}

fn run(args: &ConfigArgs) -> Result<(), CliError> {
    let config = load_config(args)?;

    let logging_config = config.logging.clone().unwrap_or_default();
    let _sentry = logging::init(&logging_config)?;

    if let Some(metrics) = &config.metrics {
        shared::metrics::install_statsd(
            &metrics.statsd_host,
            metrics.statsd_port,
            &metrics.prefix,
            &[projectcache::metrics_defs::ALL_METRICS],
        )?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)?;

    rt.block_on(serve(config))
}

async fn serve(config: Config) -> Result<(), CliError> {
    let project_cache = &config.project_cache;
    let cache = ProjectCache::from_config(project_cache, Arc::new(TracingOutcomeSink)).await?;

    tracing::info!(upstream = %project_cache.upstream.url, "starting gatekeeper");
    let result = api::serve(&project_cache.listener, cache.clone(), shutdown_signal()).await;

    cache.shutdown().await;
    tracing::info!("gatekeeper stopped");
    Ok(result?)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("could not listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("received shutdown signal");
}
