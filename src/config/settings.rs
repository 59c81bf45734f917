/// Bot configuration structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::WatchedAddressSet;

/// Startup configuration failures. These are fatal; nothing here is retried at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Required credential missing: {0}")]
    MissingCredential(String),

    #[error("Invalid config value: {field} = {value}")]
    Invalid { field: String, value: String },
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub provider: Provider,
    pub wallets: Wallets,
    pub detection: Detection,
    pub execution: Execution,
    pub limits: Limits,
    pub ingest: Ingest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Provider {
    pub websocket_scheme: String,
    pub websocket_host: String,
    pub transactions_api_url: String,
    pub rpc_url: String,
    pub api_key_env: String,
    /// Filled from `api_key_env` at load time, never written to disk
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for Provider {
    fn default() -> Self {
        Self {
            websocket_scheme: "wss".to_string(),
            websocket_host: "mainnet.helius-rpc.com".to_string(),
            transactions_api_url: "https://api.helius.xyz/v0/transactions".to_string(),
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            api_key_env: "API_KEY".to_string(),
            api_key: None,
        }
    }
}

impl Provider {
    /// Websocket endpoint with the API key attached
    pub fn websocket_url(&self) -> String {
        format!(
            "{}://{}?api-key={}",
            self.websocket_scheme,
            self.websocket_host,
            self.api_key.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Wallets {
    /// Role name -> address, e.g. SELLER and DISTRIB
    pub roles: BTreeMap<String, String>,
    /// Destination for surplus SOL after a sell
    pub profit_wallet: Option<String>,
    pub private_key_env: String,
    pub keypair_path: Option<String>,
}

impl Default for Wallets {
    fn default() -> Self {
        let mut roles = BTreeMap::new();
        roles.insert("SELLER".to_string(), String::new());
        roles.insert("DISTRIB".to_string(), String::new());
        Self {
            roles,
            profit_wallet: None,
            private_key_env: "PRIVATE_KEY".to_string(),
            keypair_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Detection {
    pub seed_target_sol: f64,
    pub seed_tolerance_sol: f64,
    pub sell_after_received: u32,
    pub buy_jitter_min_secs: u64,
    pub buy_jitter_max_secs: u64,
    /// Native transfer size that marks a new wallet worth watching
    pub discovery_amount_sol: Option<f64>,
}

impl Default for Detection {
    fn default() -> Self {
        Self {
            seed_target_sol: 150.0,
            seed_tolerance_sol: 0.5,
            sell_after_received: 2,
            buy_jitter_min_secs: 30,
            buy_jitter_max_secs: 50,
            discovery_amount_sol: Some(105.0),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Execution {
    pub buy_size_percent: f64,
    pub sell_size_percent: f64,
    pub slippage_bps: u16,
    pub fee_reserve_sol: f64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub confirmation_timeout_secs: u64,
    pub priority_fee_lamports: u64,
    pub jupiter_api_url: String,
    pub price_api_url: String,
    /// SOL kept in the trading wallet when sweeping profit
    pub sweep_reserve_sol: f64,
    pub dry_run: bool,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            buy_size_percent: 90.0,
            sell_size_percent: 100.0,
            slippage_bps: 500,
            fee_reserve_sol: 0.01,
            max_attempts: 3,
            retry_delay_ms: 5_000,
            confirmation_timeout_secs: 120,
            priority_fee_lamports: 10_000,
            jupiter_api_url: "https://quote-api.jup.ag/v6".to_string(),
            price_api_url: "https://price.jup.ag/v6/price".to_string(),
            sweep_reserve_sol: 1.0,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    pub detail_lookups_per_sec: u32,
    pub rpc_calls_per_sec: u32,
    pub aggregator_calls_per_sec: u32,
    pub max_concurrent_normalizations: usize,
    pub dedup_retention_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            detail_lookups_per_sec: 2,
            rpc_calls_per_sec: 10,
            aggregator_calls_per_sec: 2,
            max_concurrent_normalizations: 5,
            dedup_retention_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Ingest {
    pub websocket_enabled: bool,
    pub ping_interval_secs: u64,
    pub max_backoff_secs: u64,
    pub webhook_enabled: bool,
    pub webhook_port: u16,
    pub audit_dir: String,
}

impl Default for Ingest {
    fn default() -> Self {
        Self {
            websocket_enabled: true,
            ping_interval_secs: 25,
            max_backoff_secs: 60,
            webhook_enabled: true,
            webhook_port: 3000,
            audit_dir: "logs".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Loads `path` when it exists, otherwise defaults, then applies environment overrides
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            info!("📄 Loading configuration from {}", path);
            Self::load_from_file(path)?
        } else {
            warn!("⚠️ Config file {} not found, using defaults", path);
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlays credentials and role addresses from the environment
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(&self.provider.api_key_env).filter(|k| !k.is_empty()) {
            self.provider.api_key = Some(key);
        }
        for role in ["SELLER", "DISTRIB"] {
            if let Some(address) = lookup(role).filter(|a| !a.is_empty()) {
                self.wallets.roles.insert(role.to_string(), address);
            }
        }
        if let Some(profit) = lookup("PROFIT_WALLET").filter(|a| !a.is_empty()) {
            self.wallets.profit_wallet = Some(profit);
        }
    }

    /// Checks everything the bot cannot run without
    pub fn validate(&self, private_key_present: bool) -> Result<(), ConfigError> {
        if self.provider.api_key.is_none() {
            return Err(ConfigError::MissingCredential(self.provider.api_key_env.clone()));
        }
        if !private_key_present && self.wallets.keypair_path.is_none() {
            return Err(ConfigError::MissingCredential(self.wallets.private_key_env.clone()));
        }
        let d = &self.detection;
        if d.buy_jitter_min_secs > d.buy_jitter_max_secs {
            return Err(ConfigError::Invalid {
                field: "detection.buy_jitter_min_secs".to_string(),
                value: d.buy_jitter_min_secs.to_string(),
            });
        }
        if d.seed_tolerance_sol < 0.0 {
            return Err(ConfigError::Invalid {
                field: "detection.seed_tolerance_sol".to_string(),
                value: d.seed_tolerance_sol.to_string(),
            });
        }
        let e = &self.execution;
        for (field, pct) in [
            ("execution.buy_size_percent", e.buy_size_percent),
            ("execution.sell_size_percent", e.sell_size_percent),
        ] {
            if !(pct > 0.0 && pct <= 100.0) {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    value: pct.to_string(),
                });
            }
        }
        if e.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "execution.max_attempts".to_string(),
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn watched_addresses(&self) -> WatchedAddressSet {
        WatchedAddressSet::from_roles(self.wallets.roles.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = Config::from_toml(
            r#"
            [detection]
            seed_target_sol = 200.0

            [wallets.roles]
            SELLER = "Seller111"
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.seed_target_sol, 200.0);
        assert_eq!(config.detection.seed_tolerance_sol, 0.5);
        assert_eq!(config.limits.detail_lookups_per_sec, 2);
        assert_eq!(config.execution.max_attempts, 3);
        assert!(config.watched_addresses().is("SELLER", "Seller111"));
    }

    #[test]
    fn test_env_overrides_and_validation() {
        let mut config = Config::default();
        assert!(matches!(
            config.validate(true),
            Err(ConfigError::MissingCredential(ref k)) if k == "API_KEY"
        ));

        config.apply_env(|key| match key {
            "API_KEY" => Some("secret".to_string()),
            "DISTRIB" => Some("Distrib111".to_string()),
            _ => None,
        });
        assert_eq!(config.provider.api_key.as_deref(), Some("secret"));
        assert!(config.watched_addresses().is("DISTRIB", "Distrib111"));
        assert!(config.provider.websocket_url().ends_with("api-key=secret"));

        assert!(matches!(config.validate(false), Err(ConfigError::MissingCredential(_))));
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_rejects_inverted_jitter_window() {
        let mut config = Config::default();
        config.provider.api_key = Some("k".to_string());
        config.detection.buy_jitter_min_secs = 60;
        assert!(matches!(config.validate(true), Err(ConfigError::Invalid { .. })));
    }
}
