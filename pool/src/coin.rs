/// Coin profiles
///
/// Every coin-specific rule (address decoding, output scripts, reward splits,
/// masternode payees, transaction version, notify persona) is resolved once
/// from configuration into an immutable `CoinProfile` shared by `Arc`.

use std::fmt;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::codec::{address_to_pubkey_hash, ChecksumKind};
use crate::coinbase::TxOut;
use crate::config::CoinConfig;
use crate::error::ConfigError;

const BITCOIN_POW_LIMIT: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";
const ZCASH_POW_LIMIT: &str = "0007ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Fixed donation address paid by bitcoinz coinbases.
const BITCOINZ_DONATION_ADDRESS: &str = "t1fHHnAXxoPWGY77sG5Zw2sFfGUTpW6BcSZ";

/// Blocks per zcash founders address.
const ZCASH_FOUNDERS_PERIOD: u64 = 17_709;

/// Coins whose block id is sha256d(header) rather than the PoW digest.
const SHA256D_BLOCK_ID_COINS: &[&str] = &["monacoin", "feathercoin", "phoenixcoin", "vertcoin", "shield"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinFamily {
    Bitcoin,
    Zcash,
}

impl CoinFamily {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "bitcoin" => Ok(CoinFamily::Bitcoin),
            "zcash" => Ok(CoinFamily::Zcash),
            other => Err(ConfigError::UnknownFamily(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

/// Script template used for a payout output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputScript {
    P2pkh,
    P2sh,
}

impl OutputScript {
    pub fn script(self, hash: &[u8; 20]) -> Vec<u8> {
        match self {
            OutputScript::P2pkh => {
                let mut s = vec![0x76, 0xa9, 0x14];
                s.extend_from_slice(hash);
                s.extend_from_slice(&[0x88, 0xac]);
                s
            }
            OutputScript::P2sh => {
                let mut s = vec![0xa9, 0x14];
                s.extend_from_slice(hash);
                s.push(0x87);
                s
            }
        }
    }

    pub fn output(self, hash: &[u8; 20], value: u64) -> TxOut {
        TxOut { value, script: self.script(hash) }
    }
}

/// Where the template carries a masternode / proof-of-stake payee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayeeSource {
    None,
    /// `smartnode.payee` / `smartnode.amount`, not subtracted from the reward
    Smartnode,
    /// `masternode.payee` / `masternode.amount`
    Masternode { subtract: bool },
    /// top-level `payee` / `payee_amount`, subtracted; `treasury` also subtracts
    /// `coinbasetxn.treasuryreward`
    Payee { treasury: bool },
}

/// Coinbase transaction layout variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxVersion {
    /// version 1
    Standard,
    /// version 2, input sequence forced to 0
    SequenceZero,
    /// zcash testnet: version 3 with the overwinter flag, version group id
    /// and five trailing zero bytes
    Overwinter,
}

impl TxVersion {
    pub const OVERWINTER_GROUP_ID: u32 = 0x03c4_8270;

    pub fn header_version(self) -> u32 {
        match self {
            TxVersion::Standard => 1,
            TxVersion::SequenceZero => 2,
            TxVersion::Overwinter => 3 | (1 << 31),
        }
    }
}

/// Splits the block reward between the pool output and any extra outputs
/// the chain's consensus rules require.
pub trait RewardSplit: Send + Sync + fmt::Debug {
    /// Amount paid to the pool output, before the zcash-family fee top-up.
    fn pool_reward(&self, reward: u64) -> u64 {
        reward
    }

    /// Outputs appended after the pool output.
    fn extra_outputs(&self, height: u64, reward: u64, treasury: u64) -> Vec<TxOut>;
}

#[derive(Debug, Default)]
pub struct NoSplit;

impl RewardSplit for NoSplit {
    fn extra_outputs(&self, _height: u64, _reward: u64, _treasury: u64) -> Vec<TxOut> {
        Vec::new()
    }
}

/// 20% to a P2SH founders address rotating every 17709 blocks.
#[derive(Debug)]
pub struct ZcashFounders {
    addresses: Vec<[u8; 20]>,
}

impl RewardSplit for ZcashFounders {
    fn pool_reward(&self, reward: u64) -> u64 {
        (reward as f64 * 0.8).round() as u64
    }

    fn extra_outputs(&self, height: u64, reward: u64, _treasury: u64) -> Vec<TxOut> {
        let index = (height / ZCASH_FOUNDERS_PERIOD) as usize;
        match self.addresses.get(index) {
            Some(hash) => vec![OutputScript::P2sh.output(hash, (reward as f64 * 0.2).round() as u64)],
            None => {
                tracing::warn!("No founders address for height {} (index {})", height, index);
                Vec::new()
            }
        }
    }
}

/// Smart-hive payment rotating through five addresses by `height % 85`.
#[derive(Debug)]
pub struct SmartHive {
    addresses: Vec<[u8; 20]>,
}

impl SmartHive {
    fn bucket(height: u64) -> usize {
        match height % 85 {
            0..=7 => 0,
            8..=15 => 1,
            16..=23 => 2,
            24..=38 => 3,
            _ => 4,
        }
    }

    fn amount(height: u64) -> u64 {
        let base = (0.5 + (5000.0 * 143_500.0) / (height as f64 + 1.0)).floor();
        (base * 100_000_000.0 * 0.85) as u64
    }
}

impl RewardSplit for SmartHive {
    fn extra_outputs(&self, height: u64, _reward: u64, _treasury: u64) -> Vec<TxOut> {
        match self.addresses.get(Self::bucket(height)) {
            Some(hash) => vec![OutputScript::P2pkh.output(hash, Self::amount(height))],
            None => Vec::new(),
        }
    }
}

/// Treasury P2SH output rotating by `height % 4`, paying `treasuryreward`.
#[derive(Debug)]
pub struct StraksTreasury {
    addresses: Vec<[u8; 20]>,
}

impl RewardSplit for StraksTreasury {
    fn extra_outputs(&self, height: u64, _reward: u64, treasury: u64) -> Vec<TxOut> {
        match self.addresses.get((height % 4) as usize) {
            Some(hash) => vec![OutputScript::P2sh.output(hash, treasury)],
            None => Vec::new(),
        }
    }
}

/// 0.1% donation to a fixed address.
#[derive(Debug)]
pub struct BitcoinzDonation {
    address: [u8; 20],
}

impl RewardSplit for BitcoinzDonation {
    fn pool_reward(&self, reward: u64) -> u64 {
        (reward as f64 * 0.999).round() as u64
    }

    fn extra_outputs(&self, _height: u64, reward: u64, _treasury: u64) -> Vec<TxOut> {
        vec![OutputScript::P2pkh.output(&self.address, (reward as f64 * 0.001).round() as u64)]
    }
}

/// Everything coin-specific, resolved once at startup.
#[derive(Debug)]
pub struct CoinProfile {
    pub name: String,
    pub family: CoinFamily,
    pub algorithm: String,
    pub network: Network,
    pub pow_limit: BigUint,
    pub checksum: ChecksumKind,
    /// Leading version bytes stripped from decoded addresses
    pub version_len: usize,
    pub pool_address: String,
    pub pool_pubkey_hash: [u8; 20],
    pub pool_script: OutputScript,
    pub payee: PayeeSource,
    pub split: Box<dyn RewardSplit>,
    pub tx_version: TxVersion,
    /// Equihash personalization string sent with zhash notifies
    pub persona: Option<&'static str>,
    /// Factor applied to the pool difficulty in `mining.set_difficulty`
    pub difficulty_multiplier: f64,
    /// `getblocksubsidy` already reports base units
    pub subsidy_in_base_units: bool,
    /// Block id is sha256d(header) instead of the PoW digest
    pub sha256d_block_id: bool,
    /// Coinbase txid in the submit path is a single sha256
    pub single_sha_coinbase: bool,
    pub shield_address: Option<String>,
}

impl CoinProfile {
    pub fn resolve(cfg: &CoinConfig) -> Result<Self, ConfigError> {
        let name = cfg.name.to_ascii_lowercase();
        let family = cfg.family;
        let algorithm = cfg.algorithm.to_ascii_lowercase();

        if cfg.pool_address.trim().is_empty() {
            return Err(ConfigError::MissingPoolAddress);
        }

        let checksum = if algorithm == "keccak" {
            ChecksumKind::Keccak256
        } else {
            ChecksumKind::DoubleSha256
        };
        let version_len = cfg.address_version_len.unwrap_or(match family {
            CoinFamily::Bitcoin => 1,
            CoinFamily::Zcash => 2,
        });
        let decode = |field: &'static str, address: &str| {
            address_to_pubkey_hash(address, checksum, version_len)
                .map_err(|source| ConfigError::InvalidAddress { field, source })
        };

        let pool_pubkey_hash = decode("pool address", &cfg.pool_address)?;

        let pow_limit_hex = cfg.pow_limit.clone().unwrap_or_else(|| {
            match family {
                CoinFamily::Bitcoin => BITCOIN_POW_LIMIT,
                CoinFamily::Zcash => ZCASH_POW_LIMIT,
            }
            .to_string()
        });
        let pow_limit = BigUint::parse_bytes(pow_limit_hex.trim_start_matches("0x").as_bytes(), 16)
            .ok_or_else(|| ConfigError::InvalidPowLimit(pow_limit_hex.clone()))?;

        let founders = |coin: &str| -> Result<Vec<[u8; 20]>, ConfigError> {
            if cfg.founders.is_empty() {
                return Err(ConfigError::MissingFounders { coin: coin.to_string() });
            }
            cfg.founders.iter().map(|a| decode("founders address", a)).collect()
        };

        let split: Box<dyn RewardSplit> = match name.as_str() {
            "zcash" => Box::new(ZcashFounders { addresses: founders("zcash")? }),
            "smartcash" => Box::new(SmartHive { addresses: founders("smartcash")? }),
            "straks" => Box::new(StraksTreasury { addresses: founders("straks")? }),
            "bitcoinz" => Box::new(BitcoinzDonation {
                address: decode("donation address", BITCOINZ_DONATION_ADDRESS)?,
            }),
            _ => Box::new(NoSplit),
        };

        let payee = match name.as_str() {
            "smartcash" => PayeeSource::Smartnode,
            "lux" | "xchange" | "absolute" => PayeeSource::Masternode { subtract: true },
            "galactrum" => PayeeSource::Masternode { subtract: false },
            "straks" => PayeeSource::Payee { treasury: true },
            "bitsend" | "methuselah" => PayeeSource::Payee { treasury: false },
            _ => PayeeSource::None,
        };

        let pool_script = match name.as_str() {
            "vertcoin" | "shield" | "feathercoin" => OutputScript::P2sh,
            _ => OutputScript::P2pkh,
        };

        let tx_version = match (name.as_str(), cfg.network) {
            ("zcash", Network::Testnet) => TxVersion::Overwinter,
            ("xchange", _) => TxVersion::SequenceZero,
            _ => TxVersion::Standard,
        };

        let persona = if algorithm == "zhash" {
            Some(match name.as_str() {
                "bitcoin-gold" => "BgoldPoW",
                "bitcoinz" => "BitcoinZ",
                "classic-bitcoin" => "CbtcPoW",
                "zelcash" => "ZelProof",
                _ => return Err(ConfigError::MissingPersona { coin: name.clone() }),
            })
        } else {
            None
        };

        let difficulty_multiplier = cfg.difficulty_multiplier.unwrap_or(
            if matches!(algorithm.as_str(), "yescrypt" | "neoscrypt") {
                65536.0
            } else if name == "bitcoin" {
                1.0
            } else {
                256.0
            },
        );

        Ok(Self {
            subsidy_in_base_units: matches!(name.as_str(), "bitcoin-interest" | "bitcoin-gold"),
            sha256d_block_id: SHA256D_BLOCK_ID_COINS.contains(&name.as_str()),
            single_sha_coinbase: algorithm == "keccak",
            shield_address: cfg.shield_address.clone().filter(|s| !s.is_empty()),
            pool_address: cfg.pool_address.clone(),
            network: cfg.network,
            name,
            family,
            algorithm,
            pow_limit,
            checksum,
            version_len,
            pool_pubkey_hash,
            pool_script,
            payee,
            split,
            tx_version,
            persona,
            difficulty_multiplier,
        })
    }

    pub fn is_zcash(&self) -> bool {
        self.family == CoinFamily::Zcash
    }

    /// Decode any address with this coin's checksum and version width.
    pub fn decode_address(&self, address: &str) -> Result<[u8; 20], crate::codec::CodecError> {
        address_to_pubkey_hash(address, self.checksum, self.version_len)
    }

    /// Payee outputs always use P2PKH.
    pub fn payee_script(&self, address: &str) -> Result<Vec<u8>, crate::codec::CodecError> {
        Ok(OutputScript::P2pkh.script(&self.decode_address(address)?))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Base58Check (double sha256) address for the given version bytes and hash.
    pub(crate) fn test_address(version: &[u8], hash: [u8; 20]) -> String {
        let mut payload = version.to_vec();
        payload.extend_from_slice(&hash);
        let check = crate::codec::sha256d(&payload);
        payload.extend_from_slice(&check[..4]);
        bs58::encode(payload).into_string()
    }

    pub(crate) fn bitcoin_config() -> CoinConfig {
        CoinConfig {
            name: "litecoin".into(),
            family: CoinFamily::Bitcoin,
            algorithm: "sha256d".into(),
            network: Network::Mainnet,
            pool_address: test_address(&[0x30], [0x11; 20]),
            ..CoinConfig::default()
        }
    }

    #[test]
    fn test_resolve_bitcoin_defaults() {
        let profile = CoinProfile::resolve(&bitcoin_config()).unwrap();
        assert_eq!(profile.pool_pubkey_hash, [0x11; 20]);
        assert_eq!(profile.pool_script, OutputScript::P2pkh);
        assert_eq!(profile.payee, PayeeSource::None);
        assert_eq!(profile.tx_version, TxVersion::Standard);
        assert_eq!(profile.difficulty_multiplier, 256.0);
        assert_eq!(profile.version_len, 1);
        assert_eq!(profile.split.pool_reward(1000), 1000);
    }

    #[test]
    fn test_resolve_rejects_missing_pool_address() {
        let cfg = CoinConfig { pool_address: String::new(), ..bitcoin_config() };
        assert!(matches!(CoinProfile::resolve(&cfg), Err(ConfigError::MissingPoolAddress)));
    }

    #[test]
    fn test_resolve_rejects_bad_pool_address() {
        let cfg = CoinConfig { pool_address: "notanaddress".into(), ..bitcoin_config() };
        assert!(matches!(
            CoinProfile::resolve(&cfg),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_zcash_requires_founders() {
        let cfg = CoinConfig {
            name: "zcash".into(),
            family: CoinFamily::Zcash,
            algorithm: "equihash".into(),
            pool_address: test_address(&[0x1c, 0xb8], [0x22; 20]),
            ..CoinConfig::default()
        };
        assert!(matches!(
            CoinProfile::resolve(&cfg),
            Err(ConfigError::MissingFounders { .. })
        ));

        let cfg = CoinConfig {
            founders: vec![test_address(&[0x1c, 0xbd], [0x33; 20])],
            network: Network::Testnet,
            ..cfg
        };
        let profile = CoinProfile::resolve(&cfg).unwrap();
        assert_eq!(profile.tx_version, TxVersion::Overwinter);
        assert_eq!(profile.pool_pubkey_hash, [0x22; 20]);
        assert_eq!(profile.split.pool_reward(1000), 800);

        let outs = profile.split.extra_outputs(100, 1000, 0);
        assert_eq!(outs.len(), 1);
        assert_eq!(outs[0].value, 200);
        assert_eq!(outs[0].script, OutputScript::P2sh.script(&[0x33; 20]));

        // past the end of the founders table
        assert!(profile.split.extra_outputs(ZCASH_FOUNDERS_PERIOD, 1000, 0).is_empty());
    }

    #[test]
    fn test_zhash_persona() {
        let cfg = CoinConfig {
            name: "bitcoin-gold".into(),
            family: CoinFamily::Zcash,
            algorithm: "zhash".into(),
            pool_address: test_address(&[0x1c, 0xb8], [0x22; 20]),
            ..CoinConfig::default()
        };
        let profile = CoinProfile::resolve(&cfg).unwrap();
        assert_eq!(profile.persona, Some("BgoldPoW"));
        assert!(profile.subsidy_in_base_units);

        let cfg = CoinConfig { name: "unknowncoin".into(), ..cfg };
        assert!(matches!(
            CoinProfile::resolve(&cfg),
            Err(ConfigError::MissingPersona { .. })
        ));
    }

    #[test]
    fn test_smart_hive_rotation() {
        assert_eq!(SmartHive::bucket(85), 0);
        assert_eq!(SmartHive::bucket(85 + 8), 1);
        assert_eq!(SmartHive::bucket(85 + 23), 2);
        assert_eq!(SmartHive::bucket(85 + 38), 3);
        assert_eq!(SmartHive::bucket(85 + 39), 4);
        assert_eq!(SmartHive::bucket(84), 4);

        // floor(0.5 + 717_500_000 / 1_000_000) = 718
        assert_eq!(SmartHive::amount(999_999), 718 * 85_000_000);
    }

    #[test]
    fn test_per_coin_rules() {
        let resolve = |name: &str| {
            CoinProfile::resolve(&CoinConfig { name: name.into(), ..bitcoin_config() }).unwrap()
        };
        assert_eq!(resolve("vertcoin").pool_script, OutputScript::P2sh);
        assert!(resolve("vertcoin").sha256d_block_id);
        assert_eq!(resolve("xchange").tx_version, TxVersion::SequenceZero);
        assert_eq!(resolve("lux").payee, PayeeSource::Masternode { subtract: true });
        assert_eq!(resolve("galactrum").payee, PayeeSource::Masternode { subtract: false });
        assert_eq!(resolve("bitcoin").difficulty_multiplier, 1.0);
    }
}
