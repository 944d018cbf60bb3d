//! DCA Dealbot - Main entry point
//!
//! Runs one deal to its end. Settings come from the environment the job
//! launcher provides, or from a file passed with `--config <path>`.

use anyhow::{Context, Result};
use dca_dealbot::app::{init_components, init_logging, spawn_price_walk};
use dca_dealbot::trading::DealError;
use dca_dealbot::{Config, DealOutcome, DealWorker, VERSION};
use tracing::{error, info, warn};

fn config_path() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    std::env::var("DEALBOT_CONFIG").ok().filter(|p| !p.trim().is_empty())
}

fn load_config() -> Result<Config> {
    match config_path() {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading {}", path)),
        None => Config::from_env().context("loading configuration from environment"),
    }
}

#[tokio::main]
async fn main() {
    // Log panics with their location before the default hook runs
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("🛑 PANIC at {}: {}", location, info);
        default_panic(info);
    }));

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not configured yet
            eprintln!("❌ Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.runtime.log_level, &config.runtime.log_format);

    if let Err(e) = run(config).await {
        error!("❌ {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting DCA Dealbot v{}", VERSION);
    info!("Configuration: {:?}", config.redacted());

    let components = init_components(&config).context("initializing clients")?;
    let worker = DealWorker::new(&config, components.brokerage, components.store);
    let token = worker.shutdown_token();

    let price_walk = components
        .paper
        .map(|paper| spawn_price_walk(paper, config.poll_interval(), token.clone()));

    let shutdown = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown requested, leaving open orders in place");
            shutdown.cancel();
        }
    });

    let result = worker.run().await;
    token.cancel();
    if let Some(handle) = price_walk {
        let _ = handle.await;
    }

    match result {
        Ok(DealOutcome::Completed(profit)) => {
            info!(
                profit = profit.value,
                percent = %profit.percent_string(),
                "✅ Deal {} completed",
                config.deal.deal_id
            );
            Ok(())
        }
        Ok(DealOutcome::Cancelled) => {
            info!("Deal {} cancelled", config.deal.deal_id);
            Ok(())
        }
        Err(DealError::Shutdown) => Err(anyhow::anyhow!(
            "deal {} interrupted before it finished",
            config.deal.deal_id
        )),
        Err(e) => Err(e).context(format!("deal {} failed", config.deal.deal_id)),
    }
}
