use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshlink_core::config::Config;
use meshlink_core::core_signaling::SignalingServer;
use meshlink_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use meshlink_core::metrics::init_metrics;
use meshlink_core::shutdown::{install_signal_handlers, ShutdownCoordinator};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshlink")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file. MESHLINK_* variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the signaling server
    Serve {
        /// Listen address, overrides the configuration
        #[arg(long)]
        bind: Option<std::net::SocketAddr>,
    },
    /// Print the effective configuration as TOML
    Config {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::from_env().context("loading configuration from environment")?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;

    if let Command::Config { output } = &args.command {
        match output {
            Some(path) => config
                .save_to_file(path)
                .with_context(|| format!("writing {}", path.display()))?,
            None => println!("{}", config.to_toml()?),
        }
        return Ok(());
    }

    let mut log_config = LogConfig::try_from(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level.parse::<LogLevel>()?;
    }
    init_logging_with_config(log_config.json_format(args.json_logs || config.logging.json_format))?;

    if config.metrics.enabled {
        PrometheusBuilder::new()
            .with_http_listener(config.metrics.bind_address)
            .install()
            .context("installing Prometheus exporter")?;
        info!(address = %config.metrics.bind_address, "Prometheus exporter listening");
    }
    init_metrics();

    let Command::Serve { bind } = args.command else {
        return Ok(());
    };
    if let Some(bind) = bind {
        config.signaling.bind_address = bind;
    }

    let coordinator = Arc::new(ShutdownCoordinator::new(config.shutdown_timeout));
    install_signal_handlers(coordinator.clone());

    let server = SignalingServer::start(&config.signaling, &coordinator).await?;
    info!(url = %server.ws_url(), "MeshLink signaling server started");

    coordinator.wait_for_completion().await;
    info!("MeshLink signaling server stopped");
    Ok(())
}
