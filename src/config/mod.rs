//! Configuration management
//! One immutable value built at startup from the environment or a TOML, YAML or JSON file

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::api::OrderLinkage;
use crate::trading::ladder::LadderParams;
use crate::utils::RetryPolicy;

const REDACTED: &str = "******REDACTED******";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Validation(String),
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(String),
}

/// Deal identity and the asset it trades
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealConfig {
    pub deal_id: String,
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_name: String,
    pub user_id: String,
    #[serde(default)]
    pub exchange_id: String,
    pub asset: String,
}

/// Strategy parameters for the deal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Base order size in shares
    pub base_order_size: f64,
    /// First safety order size in shares
    pub safety_order_size: f64,
    pub target_profit_percent: f64,
    #[serde(default)]
    pub stop_loss_percent: f64,
    pub max_safety_order_count: u32,
    pub max_active_safety_order_count: u32,
    /// Deviation of the first safety order, in percent
    pub price_deviation: f64,
    pub safety_order_step_scale: f64,
    pub safety_order_volume_scale: f64,
}

/// Brokerage endpoint and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerageConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_brokerage_url")]
    pub base_url: String,
    #[serde(default = "default_data_url")]
    pub data_url: String,
}

/// Document store endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

/// Polling, retry, simulation and logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub poll_interval_ms: u64,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_stuck_after: u32,
    /// Minimum spacing between brokerage calls
    pub min_call_spacing_ms: u64,
    pub simulation_mode: bool,
    /// Starting price of the paper market in simulation mode
    pub simulation_price: f64,
    pub log_level: String,
    /// "pretty" or "json"
    pub log_format: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            retry_initial_delay_ms: 500,
            retry_max_delay_ms: 30_000,
            retry_stuck_after: 20,
            min_call_spacing_ms: 0,
            simulation_mode: false,
            simulation_price: 100.0,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub deal: DealConfig,
    pub strategy: StrategyConfig,
    pub brokerage: BrokerageConfig,
    #[serde(default = "StoreConfig::empty")]
    pub store: StoreConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

fn default_brokerage_url() -> String {
    "https://paper-api.alpaca.markets".to_string()
}

fn default_data_url() -> String {
    "https://data.alpaca.markets".to_string()
}

impl StoreConfig {
    fn empty() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
        }
    }
}

struct Lookup<F: Fn(&str) -> Option<String>>(F);

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    /// Blank values count as unset
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
            None => Ok(None),
        }
    }

    fn parse_required<T: std::str::FromStr>(&self, key: &str) -> Result<T, ConfigError> {
        self.parse(key)?.ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn flag(&self, key: &str) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(false),
            Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
            Some(v) if v == "0" || v == "false" || v == "no" => Ok(false),
            Some(value) => Err(ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        }
    }
}

impl Config {
    /// Load from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source using the job launcher's variable names
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self, ConfigError> {
        let env = Lookup(lookup);
        let defaults = RuntimeConfig::default();

        let config = Config {
            deal: DealConfig {
                deal_id: env.required("deal_id")?,
                strategy_id: env.required("strategy_id")?,
                strategy_name: env.get("strategy_name").unwrap_or_default(),
                user_id: env.required("user_id")?,
                exchange_id: env.get("exchange_id").unwrap_or_default(),
                asset: env.required("asset")?,
            },
            strategy: StrategyConfig {
                base_order_size: env.parse_required("base_order_size")?,
                safety_order_size: env.parse_required("safety_order_size")?,
                target_profit_percent: env.parse_required("target_profit_percent")?,
                stop_loss_percent: env.parse("stop_loss_percent")?.unwrap_or(0.0),
                max_safety_order_count: env.parse_required("max_safety_order_count")?,
                max_active_safety_order_count: env.parse_required("max_active_safety_order_count")?,
                price_deviation: env.parse_required("price_deviation")?,
                safety_order_step_scale: env.parse_required("safety_order_step_scale")?,
                safety_order_volume_scale: env.parse_required("safety_order_volume_scale")?,
            },
            brokerage: BrokerageConfig {
                api_key: env.get("alpaca_api_key").unwrap_or_default(),
                api_secret: env.get("alpaca_api_secret").unwrap_or_default(),
                base_url: env.get("alpaca_url").unwrap_or_else(default_brokerage_url),
                data_url: env.get("MARKET_DATA_URL").unwrap_or_else(default_data_url),
            },
            store: StoreConfig {
                url: env.get("STORE_URL").unwrap_or_default(),
                api_key: env.get("STORE_API_KEY").unwrap_or_default(),
            },
            runtime: RuntimeConfig {
                poll_interval_ms: env.parse("POLL_INTERVAL_MS")?.unwrap_or(defaults.poll_interval_ms),
                retry_initial_delay_ms: env
                    .parse("RETRY_INITIAL_DELAY_MS")?
                    .unwrap_or(defaults.retry_initial_delay_ms),
                retry_max_delay_ms: env
                    .parse("RETRY_MAX_DELAY_MS")?
                    .unwrap_or(defaults.retry_max_delay_ms),
                retry_stuck_after: env
                    .parse("RETRY_STUCK_AFTER")?
                    .unwrap_or(defaults.retry_stuck_after),
                min_call_spacing_ms: env
                    .parse("MIN_CALL_SPACING_MS")?
                    .unwrap_or(defaults.min_call_spacing_ms),
                simulation_mode: env.flag("SIMULATION_MODE")?,
                simulation_price: env
                    .parse("SIMULATION_PRICE")?
                    .unwrap_or(defaults.simulation_price),
                log_level: env.get("LOG_LEVEL").unwrap_or(defaults.log_level),
                log_format: env.get("LOG_FORMAT").unwrap_or(defaults.log_format),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let parse_err = |e: &dyn std::fmt::Display| ConfigError::Parse(e.to_string());

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config: Config = match extension {
            "toml" => toml::from_str(&content).map_err(|e| parse_err(&e))?,
            "yaml" | "yml" => serde_yaml::from_str(&content).map_err(|e| parse_err(&e))?,
            "json" => serde_json::from_str(&content).map_err(|e| parse_err(&e))?,
            _ => {
                // Try to auto-detect format
                if content.trim().starts_with('{') {
                    serde_json::from_str(&content).map_err(|e| parse_err(&e))?
                } else if content.contains("---") {
                    serde_yaml::from_str(&content).map_err(|e| parse_err(&e))?
                } else {
                    toml::from_str(&content).map_err(|e| parse_err(&e))?
                }
            }
        };

        config.validate()?;
        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Validation(msg.to_string()));
        let s = &self.strategy;

        for (name, value) in [
            ("deal_id", &self.deal.deal_id),
            ("strategy_id", &self.deal.strategy_id),
            ("user_id", &self.deal.user_id),
            ("asset", &self.deal.asset),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name.to_string()));
            }
        }

        if s.base_order_size < 1.0 {
            return fail("base_order_size must be at least one share");
        }
        if s.safety_order_size < 1.0 {
            return fail("safety_order_size must be at least one share");
        }
        if s.target_profit_percent <= 0.0 {
            return fail("target_profit_percent must be positive");
        }
        if s.stop_loss_percent < 0.0 {
            return fail("stop_loss_percent must not be negative");
        }
        if s.price_deviation <= 0.0 || s.price_deviation >= 100.0 {
            return fail("price_deviation must be between 0 and 100");
        }
        if s.safety_order_step_scale <= 0.0 || s.safety_order_volume_scale <= 0.0 {
            return fail("safety order step and volume scales must be positive");
        }
        if s.max_active_safety_order_count == 0 {
            return fail("max_active_safety_order_count must be at least 1");
        }
        if s.max_active_safety_order_count > s.max_safety_order_count {
            return fail("max_active_safety_order_count must not exceed max_safety_order_count");
        }
        if self.runtime.poll_interval_ms == 0 {
            return fail("poll interval must be positive");
        }

        if !self.runtime.simulation_mode {
            if self.brokerage.api_key.is_empty() || self.brokerage.api_secret.is_empty() {
                return Err(ConfigError::Missing("alpaca_api_key / alpaca_api_secret".to_string()));
            }
            if self.store.url.is_empty() {
                return Err(ConfigError::Missing("STORE_URL".to_string()));
            }
        } else if self.runtime.simulation_price <= 0.0 {
            return fail("simulation price must be positive");
        }
        Ok(())
    }

    /// Copy with credentials replaced, safe to log
    pub fn redacted(&self) -> Config {
        let mut safe = self.clone();
        if !safe.brokerage.api_key.is_empty() {
            safe.brokerage.api_key = REDACTED.to_string();
        }
        if !safe.brokerage.api_secret.is_empty() {
            safe.brokerage.api_secret = REDACTED.to_string();
        }
        if !safe.store.api_key.is_empty() {
            safe.store.api_key = REDACTED.to_string();
        }
        safe
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.runtime.poll_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.runtime.retry_initial_delay_ms,
            self.runtime.retry_max_delay_ms,
            self.runtime.retry_stuck_after,
        )
    }

    pub fn ladder_params(&self) -> LadderParams {
        LadderParams {
            base_deviation: self.strategy.price_deviation,
            step_scale: self.strategy.safety_order_step_scale,
            volume_scale: self.strategy.safety_order_volume_scale,
            safety_order_size: self.strategy.safety_order_size,
        }
    }

    pub fn order_linkage(&self) -> OrderLinkage {
        OrderLinkage {
            user_id: self.deal.user_id.clone(),
            exchange_id: self.deal.exchange_id.clone(),
            strategy_id: self.deal.strategy_id.clone(),
            strategy_name: self.deal.strategy_name.clone(),
            deal_id: self.deal.deal_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("base_order_size", "15"),
            ("safety_order_size", "10"),
            ("target_profit_percent", "1"),
            ("stop_loss_percent", ""),
            ("max_safety_order_count", "5"),
            ("max_active_safety_order_count", "3"),
            ("price_deviation", "1"),
            ("safety_order_step_scale", "1.5"),
            ("safety_order_volume_scale", "1.2"),
            ("asset", "ASMB"),
            ("alpaca_api_key", "key-id"),
            ("alpaca_api_secret", "very-secret"),
            ("user_id", "user-1"),
            ("exchange_id", "alpaca"),
            ("deal_id", "deal-1"),
            ("strategy_id", "strat-1"),
            ("strategy_name", "dca"),
            ("STORE_URL", "https://store.example"),
            ("STORE_API_KEY", "store-secret"),
        ])
    }

    fn load(env: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn test_from_lookup() {
        let config = load(&base_env()).unwrap();
        assert_eq!(config.strategy.base_order_size, 15.0);
        assert_eq!(config.strategy.stop_loss_percent, 0.0);
        assert_eq!(config.strategy.max_active_safety_order_count, 3);
        assert_eq!(config.deal.asset, "ASMB");
        assert_eq!(config.runtime.poll_interval_ms, 2000);
        assert!(!config.runtime.simulation_mode);
        assert_eq!(config.brokerage.base_url, "https://paper-api.alpaca.markets");
    }

    #[test]
    fn test_missing_required_is_fatal() {
        let mut env = base_env();
        env.remove("price_deviation");
        let err = load(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref k) if k == "price_deviation"));
    }

    #[test]
    fn test_unparsable_value_is_fatal() {
        let mut env = base_env();
        env.insert("max_safety_order_count", "five");
        assert!(matches!(load(&env).unwrap_err(), ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_active_above_total_rejected() {
        let mut env = base_env();
        env.insert("max_active_safety_order_count", "6");
        assert!(matches!(load(&env).unwrap_err(), ConfigError::Validation(_)));
    }

    #[test]
    fn test_simulation_mode_skips_credentials() {
        let mut env = base_env();
        env.remove("alpaca_api_key");
        env.remove("STORE_URL");
        assert!(load(&env).is_err());

        env.insert("SIMULATION_MODE", "true");
        let config = load(&env).unwrap();
        assert!(config.runtime.simulation_mode);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let config = load(&base_env()).unwrap();
        let safe = config.redacted();
        let rendered = format!("{:?}", safe);
        assert!(!rendered.contains("very-secret"));
        assert!(!rendered.contains("store-secret"));
        assert_eq!(safe.deal, config.deal);
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(
            file,
            r#"
[deal]
deal_id = "deal-1"
strategy_id = "strat-1"
user_id = "user-1"
asset = "ASMB"

[strategy]
base_order_size = 15.0
safety_order_size = 10.0
target_profit_percent = 1.0
max_safety_order_count = 5
max_active_safety_order_count = 3
price_deviation = 1.0
safety_order_step_scale = 1.5
safety_order_volume_scale = 1.2

[brokerage]
api_key = "k"
api_secret = "s"

[store]
url = "https://store.example"

[runtime]
poll_interval_ms = 250
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.runtime.poll_interval_ms, 250);
        assert_eq!(config.runtime.retry_stuck_after, 20);
        assert_eq!(config.brokerage.data_url, "https://data.alpaca.markets");
        assert_eq!(config.ladder_params().step_scale, 1.5);
    }

    #[test]
    fn test_from_yaml_file_validates() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
deal: {{deal_id: d, strategy_id: s, user_id: u, asset: ASMB}}
strategy:
  base_order_size: 15
  safety_order_size: 10
  target_profit_percent: 1
  max_safety_order_count: 2
  max_active_safety_order_count: 0
  price_deviation: 1
  safety_order_step_scale: 1
  safety_order_volume_scale: 1
brokerage: {{api_key: k, api_secret: s}}
runtime: {{simulation_mode: true}}
"#
        )
        .unwrap();

        assert!(matches!(
            Config::from_file(file.path()).unwrap_err(),
            ConfigError::Validation(_)
        ));
    }
}
