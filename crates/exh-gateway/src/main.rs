use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use exh_gateway::{ExhaustConfig, ExhaustService};

/// Exhaust log-stream server.
#[derive(Parser, Debug)]
#[command(name = "exhaustd", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind_addr`.
    #[arg(long)]
    bind: Option<String>,

    /// Base URL handed out in `stream_url`, overriding `server.public_base_url`.
    #[arg(long)]
    public_url: Option<String>,

    /// Log filter directive, overriding `logging.filter`. `RUST_LOG` still wins.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ExhaustConfig::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if let Some(url) = cli.public_url {
        config.server.public_base_url = Some(url);
    }
    if let Some(filter) = cli.log_level {
        config.logging.filter = Some(filter);
    }

    let fallback = config.logging.filter.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();

    match &cli.config {
        Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
        None => match exh_gateway::config::default_config_path().filter(|p| p.exists()) {
            Some(path) => tracing::info!(path = %path.display(), "Loaded configuration"),
            None => tracing::info!("No configuration file; using defaults"),
        },
    }

    let service = Arc::new(ExhaustService::new(&config)?);
    tracing::info!(
        bind = %config.server.bind_addr,
        public_url = %config.server.public_base_url(),
        rules = config.analyzer.rule_set()?.len(),
        admin_token = service.admin().is_enabled(),
        "Starting Exhaust"
    );

    let reaper = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                service.reap_partials().await;
                service.prune_rate_limits().await;
            }
        })
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutting down");
    };
    let result = exh_gateway::serve(&config.server.bind_addr, Arc::clone(&service), shutdown).await;

    reaper.abort();
    service.shutdown().await;
    result
}
