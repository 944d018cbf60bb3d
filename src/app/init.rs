//! Application initialization
//! Handles logging setup and component initialization

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::api::{
    Brokerage, DealRecord, DealStore, HttpBrokerage, HttpDocumentStore, MemoryStore, PaperBrokerage,
    StrategyRecord,
};
use crate::config::Config;
use crate::DealbotError;

/// Largest relative move of the paper price per step
const PRICE_WALK_STEP: f64 = 0.005;

/// Application components container
pub struct AppComponents {
    pub brokerage: Arc<dyn Brokerage>,
    pub store: Arc<dyn DealStore>,
    /// Present in simulation mode so the caller can drive the paper market
    pub paper: Option<Arc<PaperBrokerage>>,
}

/// Initialize logging.
/// `RUST_LOG` wins over the configured level when set.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_log_level(log_level).to_string().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Parse log level string
pub fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the brokerage and store clients.
/// Simulation mode swaps both for in-process fakes seeded with this deal.
pub fn init_components(config: &Config) -> Result<AppComponents, DealbotError> {
    if config.runtime.simulation_mode {
        warn!("🎮 SIMULATION MODE ENABLED - No real orders will be placed!");
        let paper = Arc::new(PaperBrokerage::new(config.runtime.simulation_price));

        let store = MemoryStore::new();
        store.insert_deal(DealRecord::new(
            &config.deal.deal_id,
            &config.deal.strategy_id,
            &config.deal.user_id,
            &config.deal.asset,
        ));
        store.insert_strategy(StrategyRecord {
            id: config.deal.strategy_id.clone(),
            active_deals: 1,
            status: "running".to_string(),
        });

        return Ok(AppComponents {
            brokerage: paper.clone(),
            store: Arc::new(store),
            paper: Some(paper),
        });
    }

    let brokerage = HttpBrokerage::new(
        &config.brokerage.base_url,
        &config.brokerage.data_url,
        &config.brokerage.api_key,
        &config.brokerage.api_secret,
    )?;
    let store = HttpDocumentStore::new(&config.store.url, &config.store.api_key)?;
    info!(brokerage = %config.brokerage.base_url, store = %config.store.url, "Clients initialized");

    Ok(AppComponents {
        brokerage: Arc::new(brokerage),
        store: Arc::new(store),
        paper: None,
    })
}

/// Move the paper price by a small random step every `interval` until cancelled
pub fn spawn_price_walk(
    paper: Arc<PaperBrokerage>,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let step = rand::thread_rng().gen_range(-PRICE_WALK_STEP..=PRICE_WALK_STEP);
            let price = paper.price() * (1.0 + step);
            paper.set_price(price);
            debug!(price, "Paper price moved");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::collections::HashMap;

    fn simulation_config() -> Config {
        let env = HashMap::from([
            ("deal_id", "deal-1"),
            ("strategy_id", "strat-1"),
            ("user_id", "user-1"),
            ("asset", "ASMB"),
            ("base_order_size", "15"),
            ("safety_order_size", "10"),
            ("target_profit_percent", "1"),
            ("max_safety_order_count", "5"),
            ("max_active_safety_order_count", "3"),
            ("price_deviation", "1"),
            ("safety_order_step_scale", "1"),
            ("safety_order_volume_scale", "1"),
            ("SIMULATION_MODE", "true"),
            ("SIMULATION_PRICE", "10"),
        ]);
        Config::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_log_level("warn"), Level::WARN);
        assert_eq!(parse_log_level("nonsense"), Level::INFO);
    }

    #[tokio::test]
    async fn test_simulation_components_are_seeded() {
        let config = simulation_config();
        let components = init_components(&config).unwrap();

        let paper = components.paper.expect("paper brokerage in simulation");
        assert_eq!(paper.price(), 10.0);

        let deal = components.store.get_deal("deal-1").await.unwrap();
        assert_eq!(deal.stock, "ASMB");
        let strategy = components.store.get_strategy("strat-1").await.unwrap();
        assert_eq!(strategy.active_deals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_walk_stays_near_start() {
        let paper = Arc::new(PaperBrokerage::new(100.0));
        let token = CancellationToken::new();
        let handle = spawn_price_walk(paper.clone(), Duration::from_millis(10), token.clone());

        tokio::time::sleep(Duration::from_millis(55)).await;
        token.cancel();
        handle.await.unwrap();

        // At most six steps of half a percent
        let price = paper.price();
        assert!(price > 100.0 * 0.995f64.powi(6) - 1e-9);
        assert!(price < 100.0 * 1.005f64.powi(6) + 1e-9);
    }
}
