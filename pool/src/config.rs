use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::coin::{CoinFamily, Network};
use crate::error::ConfigError;

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct CoinConfig {
    /// Lowercase coin name, e.g. "litecoin", "zcash", "bitcoin-gold"
    pub name: String,
    pub family: CoinFamily,
    /// Proof-of-work algorithm id, e.g. "sha256d", "keccak", "equihash", "zhash"
    pub algorithm: String,
    pub network: Network,
    pub pool_address: String,
    /// Shielded (z-) address used for coinbase shielding on zcash-family coins
    #[serde(default)]
    pub shield_address: Option<String>,
    /// 64-hex network POW limit; family default when absent
    #[serde(default)]
    pub pow_limit: Option<String>,
    /// Version bytes stripped when decoding addresses (1 bitcoin family, 2 zcash family)
    #[serde(default)]
    pub address_version_len: Option<usize>,
    #[serde(default)]
    pub founders: Vec<String>,
    #[serde(default)]
    pub difficulty_multiplier: Option<f64>,
}

impl Default for CoinConfig {
    fn default() -> Self {
        Self {
            name: "bitcoin".to_string(),
            family: CoinFamily::Bitcoin,
            algorithm: "sha256d".to_string(),
            network: Network::Mainnet,
            pool_address: String::new(),
            shield_address: None,
            pow_limit: None,
            address_version_len: None,
            founders: Vec::new(),
            difficulty_multiplier: None,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct DaemonConfig {
    pub url: String,
    pub user: String,
    pub password: String,
    pub timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332/".to_string(),
            user: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub api_listen: String,
    /// Empty selects the in-memory store
    pub redis_url: String,
    pub daemon: DaemonConfig,
    pub block_update_ms: u64,
    pub merkle_update_ms: u64,
    /// Starting difficulty when the password carries no `d=` suffix
    pub pool_difficulty: f64,
    /// PPLNS window length in blocks
    pub pplns_length: u64,
    pub pool_fee_percent: Decimal,
    pub confirmation_count: i64,
    /// Shared secret for `web.payout`; empty disables manual payouts
    pub payout_secret: String,
    /// Per-transaction fee charged to manual payouts
    pub tx_fee: Decimal,
    pub unconfirmed_tx_confirmations: i64,
    /// Longest accepted stratum line in bytes
    pub max_line_bytes: usize,
    pub coin: CoinConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3333".to_string(),
            api_listen: "0.0.0.0:8080".to_string(),
            redis_url: "redis://127.0.0.1/".to_string(),
            daemon: DaemonConfig::default(),
            block_update_ms: 1_000,
            merkle_update_ms: 30_000,
            pool_difficulty: 1.0,
            pplns_length: 100,
            pool_fee_percent: dec!(2.0),
            confirmation_count: 100,
            payout_secret: String::new(),
            tx_fee: dec!(0.0001),
            unconfirmed_tx_confirmations: 10,
            max_line_bytes: 16 * 1024,
            coin: CoinConfig::default(),
        }
    }
}

impl Config {
    /// Defaults, then the JSON file named by `MINEPOOL_CONFIG` (default
    /// `pool_config.json`, optional), then `MINEPOOL_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("MINEPOOL_CONFIG").unwrap_or_else(|_| "pool_config.json".to_string());
        let mut cfg = match std::fs::read_to_string(&path) {
            Ok(txt) => serde_json::from_str::<Config>(&txt).map_err(|e| ConfigError::File {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(ConfigError::File { path, reason: e.to_string() });
            }
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            })
        }

        if let Some(v) = lookup("MINEPOOL_LISTEN") { self.listen = v; }
        if let Some(v) = lookup("MINEPOOL_API_LISTEN") { self.api_listen = v; }
        if let Some(v) = lookup("MINEPOOL_REDIS_URL") { self.redis_url = v; }
        if let Some(v) = lookup("MINEPOOL_DAEMON_URL") { self.daemon.url = v; }
        if let Some(v) = lookup("MINEPOOL_DAEMON_USER") { self.daemon.user = v; }
        if let Some(v) = lookup("MINEPOOL_DAEMON_PASSWORD") { self.daemon.password = v; }
        if let Some(v) = lookup("MINEPOOL_DAEMON_TIMEOUT") { self.daemon.timeout_secs = parse("MINEPOOL_DAEMON_TIMEOUT", v)?; }
        if let Some(v) = lookup("MINEPOOL_BLOCK_UPDATE_MS") { self.block_update_ms = parse("MINEPOOL_BLOCK_UPDATE_MS", v)?; }
        if let Some(v) = lookup("MINEPOOL_MERKLE_UPDATE_MS") { self.merkle_update_ms = parse("MINEPOOL_MERKLE_UPDATE_MS", v)?; }
        if let Some(v) = lookup("MINEPOOL_POOL_DIFF") { self.pool_difficulty = parse("MINEPOOL_POOL_DIFF", v)?; }
        if let Some(v) = lookup("MINEPOOL_PPLNS_LENGTH") { self.pplns_length = parse("MINEPOOL_PPLNS_LENGTH", v)?; }
        if let Some(v) = lookup("MINEPOOL_POOL_FEE") { self.pool_fee_percent = parse("MINEPOOL_POOL_FEE", v)?; }
        if let Some(v) = lookup("MINEPOOL_CONFIRMATIONS") { self.confirmation_count = parse("MINEPOOL_CONFIRMATIONS", v)?; }
        if let Some(v) = lookup("MINEPOOL_PAYOUT_SECRET") { self.payout_secret = v; }
        if let Some(v) = lookup("MINEPOOL_TX_FEE") { self.tx_fee = parse("MINEPOOL_TX_FEE", v)?; }

        if let Some(v) = lookup("MINEPOOL_COIN") { self.coin.name = v; }
        if let Some(v) = lookup("MINEPOOL_COIN_FAMILY") { self.coin.family = CoinFamily::parse(&v)?; }
        if let Some(v) = lookup("MINEPOOL_ALGORITHM") { self.coin.algorithm = v; }
        if let Some(v) = lookup("MINEPOOL_NETWORK") {
            self.coin.network = match v.to_ascii_lowercase().as_str() {
                "mainnet" => Network::Mainnet,
                "testnet" => Network::Testnet,
                _ => return Err(ConfigError::InvalidValue { key: "MINEPOOL_NETWORK".into(), value: v }),
            };
        }
        if let Some(v) = lookup("MINEPOOL_POOL_ADDRESS") { self.coin.pool_address = v; }
        if let Some(v) = lookup("MINEPOOL_SHIELD_ADDRESS") { self.coin.shield_address = Some(v); }
        if let Some(v) = lookup("MINEPOOL_POW_LIMIT") { self.coin.pow_limit = Some(v); }
        if let Some(v) = lookup("MINEPOOL_ADDRESS_VERSION_LEN") {
            self.coin.address_version_len = Some(parse("MINEPOOL_ADDRESS_VERSION_LEN", v)?);
        }
        if let Some(v) = lookup("MINEPOOL_FOUNDERS") {
            self.coin.founders = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("MINEPOOL_DIFF_MULTIPLIER") {
            self.coin.difficulty_multiplier = Some(parse("MINEPOOL_DIFF_MULTIPLIER", v)?);
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.coin.pool_address.trim().is_empty() {
            return Err(ConfigError::MissingPoolAddress);
        }
        if !(self.pool_difficulty > 0.0) {
            return Err(ConfigError::InvalidValue {
                key: "pool_difficulty".into(),
                value: self.pool_difficulty.to_string(),
            });
        }
        if self.pool_fee_percent < Decimal::ZERO || self.pool_fee_percent >= dec!(100) {
            return Err(ConfigError::InvalidValue {
                key: "pool_fee_percent".into(),
                value: self.pool_fee_percent.to_string(),
            });
        }
        if self.block_update_ms == 0 {
            self.block_update_ms = 1_000;
        }
        if self.max_line_bytes == 0 {
            self.max_line_bytes = 16 * 1024;
        }
        Ok(())
    }

    pub fn block_update_interval(&self) -> Duration {
        Duration::from_millis(self.block_update_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("MINEPOOL_COIN", "zcash"),
            ("MINEPOOL_COIN_FAMILY", "Zcash"),
            ("MINEPOOL_NETWORK", "testnet"),
            ("MINEPOOL_POOL_DIFF", "8"),
            ("MINEPOOL_POOL_FEE", "1.5"),
            ("MINEPOOL_FOUNDERS", "a, b,,c"),
            ("MINEPOOL_REDIS_URL", ""),
        ]))
        .unwrap();

        assert_eq!(cfg.coin.name, "zcash");
        assert_eq!(cfg.coin.family, CoinFamily::Zcash);
        assert_eq!(cfg.coin.network, Network::Testnet);
        assert_eq!(cfg.pool_difficulty, 8.0);
        assert_eq!(cfg.pool_fee_percent, dec!(1.5));
        assert_eq!(cfg.coin.founders, vec!["a", "b", "c"]);
        assert!(cfg.redis_url.is_empty());
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut cfg = Config::default();
        assert!(matches!(
            cfg.apply_env(env(&[("MINEPOOL_POOL_DIFF", "lots")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            cfg.apply_env(env(&[("MINEPOOL_COIN_FAMILY", "ethereum")])),
            Err(ConfigError::UnknownFamily(_))
        ));
    }

    #[test]
    fn test_validate_requires_pool_address() {
        let mut cfg = Config::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingPoolAddress)));

        cfg.coin.pool_address = "addr".into();
        cfg.block_update_ms = 0;
        cfg.validate().unwrap();
        assert_eq!(cfg.block_update_ms, 1_000);
    }

    #[test]
    fn test_file_shape() {
        let cfg: Config = serde_json::from_str(
            r#"{"listen":"0.0.0.0:4444","pool_fee_percent":"3","coin":{"name":"zcash","family":"zcash","algorithm":"equihash","pool_address":"t1x"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:4444");
        assert_eq!(cfg.pool_fee_percent, dec!(3));
        assert_eq!(cfg.coin.family, CoinFamily::Zcash);
        assert_eq!(cfg.pplns_length, 100);
    }
}
