/// Block Template - the pool's current candidate block
///
/// Rebuilt in full when the daemon reports a new previous hash
/// (`block_update` + `merkle_update`), and Merkle-only on refresh ticks.
/// Jobs hold `Arc` snapshots of it, so a submission is always judged against
/// the exact template it was issued for.

use std::sync::Arc;

use num_bigint::BigUint;
use num_traits::Zero;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::codec::{
    decode_hash, decode_hex, difficulty_from_target, merkle_root, swap_hash_words, var_int,
    CodecError, MerkleBranch,
};
use crate::coin::{CoinFamily, CoinProfile, PayeeSource};
use crate::coinbase::{build_coinbase, Coinbase, CoinbaseParams, Payee, DEFAULT_COINBASE_AUX};

/// Reserved header field of the zcash family, always zero.
pub const ZCASH_RESERVED: [u8; 32] = [0u8; 32];

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTransaction {
    pub data: String,
    #[serde(default)]
    pub txid: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub fee: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayeeInfo {
    #[serde(default)]
    pub payee: String,
    #[serde(default)]
    pub amount: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseAux {
    #[serde(default)]
    pub flags: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CoinbaseTxn {
    #[serde(default)]
    pub treasuryreward: Option<u64>,
}

/// `getblocktemplate` response, restricted to what the pool consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateResponse {
    pub version: u32,
    pub previousblockhash: String,
    pub target: String,
    pub curtime: u32,
    pub bits: String,
    pub height: u64,
    #[serde(default)]
    pub coinbasevalue: u64,
    #[serde(default)]
    pub transactions: Vec<TemplateTransaction>,
    #[serde(default)]
    pub coinbaseaux: Option<CoinbaseAux>,
    #[serde(default)]
    pub masternode: Option<PayeeInfo>,
    #[serde(default)]
    pub smartnode: Option<PayeeInfo>,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub payee_amount: Option<u64>,
    #[serde(default)]
    pub coinbasetxn: Option<CoinbaseTxn>,
}

/// A template transaction decoded once per refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateTx {
    /// txid in internal byte order
    pub hash: [u8; 32],
    pub fee: i64,
    pub data: Vec<u8>,
}

impl TemplateTx {
    fn decode(tx: &TemplateTransaction) -> Result<Self, CodecError> {
        let id = tx
            .txid
            .as_deref()
            .or(tx.hash.as_deref())
            .ok_or(CodecError::BadLength { expected: 32, actual: 0 })?;
        let mut hash = decode_hash(id)?;
        hash.reverse();
        Ok(Self { hash, fee: tx.fee, data: decode_hex(&tx.data)? })
    }
}

#[derive(Debug, Clone)]
pub struct BlockTemplate {
    profile: Arc<CoinProfile>,
    pub height: u64,
    /// Display-order previous block hash, as the daemon reports it
    pub prev_hash: String,
    prev_hash_le: [u8; 32],
    pub version: u32,
    pub bits: String,
    bits_le: [u8; 4],
    pub curtime: u32,
    pub target: BigUint,
    pub difficulty: f64,
    /// Reward reported by `getblocksubsidy`, overriding `coinbasevalue`
    pub subsidy: Option<u64>,
    pub block_reward: u64,
    pub treasury: u64,
    pub payee: Option<Payee>,
    pub aux: Vec<u8>,
    pub fees: u64,
    pub transactions: Arc<Vec<TemplateTx>>,
    pub coinbase: Coinbase,
    pub merkle_branch: MerkleBranch,
    /// Full root in internal byte order (zcash family)
    pub merkle_root: Option<[u8; 32]>,
}

impl BlockTemplate {
    pub fn new(profile: Arc<CoinProfile>) -> Self {
        Self {
            profile,
            height: 0,
            prev_hash: String::new(),
            prev_hash_le: [0u8; 32],
            version: 1,
            bits: String::new(),
            bits_le: [0u8; 4],
            curtime: 0,
            target: BigUint::zero(),
            difficulty: 0.0,
            subsidy: None,
            block_reward: 0,
            treasury: 0,
            payee: None,
            aux: DEFAULT_COINBASE_AUX.to_vec(),
            fees: 0,
            transactions: Arc::new(Vec::new()),
            coinbase: Coinbase::default(),
            merkle_branch: MerkleBranch::default(),
            merkle_root: None,
        }
    }

    pub fn profile(&self) -> &Arc<CoinProfile> {
        &self.profile
    }

    /// Replace every chain-derived field from a new template.
    pub fn block_update(&mut self, data: &TemplateResponse) -> Result<(), CodecError> {
        let mut prev = decode_hash(&data.previousblockhash)?;
        prev.reverse();
        let bits = decode_hex(&data.bits)?;
        let bits_le: [u8; 4] = bits
            .iter()
            .rev()
            .copied()
            .collect::<Vec<u8>>()
            .try_into()
            .map_err(|_| CodecError::BadLength { expected: 4, actual: bits.len() })?;

        let mut target = BigUint::parse_bytes(data.target.as_bytes(), 16)
            .ok_or_else(|| CodecError::InvalidHex(data.target.clone()))?;
        if target.is_zero() {
            tracing::error!("Template target is zero, using pow limit");
            target = self.profile.pow_limit.clone();
        }

        self.version = data.version;
        self.difficulty = difficulty_from_target(&self.profile.pow_limit, &target);
        self.target = target;
        self.curtime = data.curtime;
        self.bits = data.bits.clone();
        self.bits_le = bits_le;
        self.prev_hash = data.previousblockhash.clone();
        self.prev_hash_le = prev;
        self.height = data.height;

        self.block_reward = self.subsidy.unwrap_or(data.coinbasevalue);
        self.treasury = 0;
        self.payee = None;
        match self.profile.payee {
            PayeeSource::None => {}
            PayeeSource::Smartnode => {
                self.payee = data.smartnode.as_ref().map(Self::payee_of);
            }
            PayeeSource::Masternode { subtract } => {
                if let Some(mn) = &data.masternode {
                    if subtract {
                        self.block_reward = self.block_reward.saturating_sub(mn.amount);
                    }
                    self.payee = Some(Self::payee_of(mn));
                }
            }
            PayeeSource::Payee { treasury } => {
                if let Some(payee) = &data.payee {
                    let amount = data.payee_amount.unwrap_or(0);
                    self.block_reward = self.block_reward.saturating_sub(amount);
                    self.payee = Some(Payee { address: payee.clone(), amount });
                }
                if treasury {
                    self.treasury = data
                        .coinbasetxn
                        .as_ref()
                        .and_then(|c| c.treasuryreward)
                        .unwrap_or(0);
                    self.block_reward = self.block_reward.saturating_sub(self.treasury);
                }
            }
        }

        if let Some(flags) = data.coinbaseaux.as_ref().and_then(|a| a.flags.as_deref()) {
            if !flags.is_empty() {
                self.aux = decode_hex(flags)?;
            }
        }

        tracing::info!(
            "Template height {} difficulty {:.4} reward {}",
            self.height,
            self.difficulty,
            self.block_reward
        );
        Ok(())
    }

    fn payee_of(info: &PayeeInfo) -> Payee {
        Payee { address: info.payee.clone(), amount: info.amount }
    }

    /// Refresh the transaction set, rebuild the coinbase and the Merkle
    /// structure. Returns whether the branch (or root) changed.
    pub fn merkle_update(&mut self, data: &TemplateResponse) -> Result<bool, CodecError> {
        let txs = data
            .transactions
            .iter()
            .map(TemplateTx::decode)
            .collect::<Result<Vec<_>, _>>()?;
        self.fees = txs.iter().map(|t| t.fee).sum::<i64>().max(0) as u64;

        let params = CoinbaseParams {
            height: self.height,
            block_reward: self.block_reward,
            fees: self.fees,
            treasury: self.treasury,
            payee: self.payee.as_ref(),
            aux: &self.aux,
        };
        self.coinbase = build_coinbase(&self.profile, &params)?;

        let changed = match self.profile.family {
            CoinFamily::Bitcoin => {
                let hashes: Vec<[u8; 32]> = txs.iter().map(|t| t.hash).collect();
                let branch = MerkleBranch::from_hashes(&hashes);
                let changed = branch != self.merkle_branch;
                self.merkle_branch = branch;
                changed
            }
            CoinFamily::Zcash => {
                let mut leaves = Vec::with_capacity(txs.len() + 1);
                leaves.push(self.coinbase.hash);
                leaves.extend(txs.iter().map(|t| t.hash));
                let root = merkle_root(&leaves);
                let changed = root != self.merkle_root;
                self.merkle_root = root;
                changed
            }
        };

        self.transactions = Arc::new(txs);
        Ok(changed)
    }

    /// Coinbase plus template transactions.
    pub fn tx_count(&self) -> u64 {
        self.transactions.len() as u64 + 1
    }

    /// Header bytes hashed by the miner. `time` is already in wire order.
    pub fn serialize_header(&self, merkle_root: &[u8; 32], time: &[u8], nonce: &[u8]) -> Vec<u8> {
        let mut header = Vec::with_capacity(140);
        header.extend_from_slice(&self.version.to_le_bytes());
        header.extend_from_slice(&self.prev_hash_le);
        header.extend_from_slice(merkle_root);
        if self.profile.is_zcash() {
            header.extend_from_slice(&ZCASH_RESERVED);
        }
        header.extend_from_slice(time);
        header.extend_from_slice(&self.bits_le);
        header.extend_from_slice(nonce);
        header
    }

    /// Full block ready for `submitblock`.
    pub fn serialize_block(&self, header: &[u8], solution: Option<&[u8]>, coinbase: &[u8]) -> Vec<u8> {
        let body: usize = self.transactions.iter().map(|t| t.data.len()).sum();
        let mut block = Vec::with_capacity(header.len() + coinbase.len() + body + 1400);
        block.extend_from_slice(header);
        if let Some(solution) = solution {
            block.extend_from_slice(solution);
        }
        block.extend(var_int(self.tx_count()));
        block.extend_from_slice(coinbase);
        for tx in self.transactions.iter() {
            block.extend_from_slice(&tx.data);
        }
        block
    }

    /// `mining.notify` params for a job on this template.
    pub fn notify_params(&self, job_id: &str) -> Result<Vec<Value>, CodecError> {
        match self.profile.family {
            CoinFamily::Bitcoin => {
                let (coinb1, coinb2) = self.coinbase.halves().ok_or(CodecError::Truncated)?;
                Ok(vec![
                    json!(job_id),
                    json!(swap_hash_words(&self.prev_hash)?),
                    json!(coinb1),
                    json!(coinb2),
                    json!(self.merkle_branch.to_hex()),
                    json!(format!("{:08x}", self.version)),
                    json!(self.bits),
                    json!(format!("{:08x}", self.curtime)),
                    json!(true),
                ])
            }
            CoinFamily::Zcash => {
                let root = self.merkle_root.ok_or(CodecError::Truncated)?;
                let mut params = vec![
                    json!(job_id),
                    json!(hex::encode(self.version.to_le_bytes())),
                    json!(hex::encode(self.prev_hash_le)),
                    json!(hex::encode(root)),
                    json!(hex::encode(ZCASH_RESERVED)),
                    json!(hex::encode(self.curtime.to_le_bytes())),
                    json!(hex::encode(self.bits_le)),
                    json!(true),
                ];
                if let Some(persona) = self.profile.persona {
                    params.push(json!(false));
                    params.push(json!(persona));
                }
                Ok(params)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::codec::sha256d;
    use crate::coin::tests::{bitcoin_config, test_address};
    use crate::config::CoinConfig;

    pub(crate) const PREV: &str = "00000000000000000001111111111111111111111111111111111111111111aa";

    pub(crate) fn response(txs: Vec<TemplateTransaction>) -> TemplateResponse {
        serde_json::from_value(json!({
            "version": 0x2000_0000u32,
            "previousblockhash": PREV,
            "target": "00000000ffff0000000000000000000000000000000000000000000000000000",
            "curtime": 1_600_000_000u32,
            "bits": "1d00ffff",
            "height": 500_000,
            "coinbasevalue": 5_000_000_000u64,
        }))
        .map(|mut r: TemplateResponse| {
            r.transactions = txs;
            r
        })
        .unwrap()
    }

    pub(crate) fn tx(n: u8, fee: i64) -> TemplateTransaction {
        TemplateTransaction {
            data: hex::encode([n; 10]),
            txid: Some(hex::encode([n; 32])),
            hash: Some(hex::encode([0xee; 32])),
            fee,
        }
    }

    pub(crate) fn bitcoin_template(txs: Vec<TemplateTransaction>) -> BlockTemplate {
        let profile = Arc::new(CoinProfile::resolve(&bitcoin_config()).unwrap());
        let mut template = BlockTemplate::new(profile);
        let data = response(txs);
        template.block_update(&data).unwrap();
        template.merkle_update(&data).unwrap();
        template
    }

    #[test]
    fn test_block_update_fields() {
        let t = bitcoin_template(vec![]);
        assert_eq!(t.height, 500_000);
        assert_eq!(t.difficulty, 1.0);
        assert_eq!(t.block_reward, 5_000_000_000);
        assert_eq!(t.bits_le, [0xff, 0xff, 0x00, 0x1d]);
        assert_eq!(t.prev_hash_le[0], 0xaa);
        assert_eq!(t.aux, DEFAULT_COINBASE_AUX);
        assert_eq!(t.tx_count(), 1);
    }

    #[test]
    fn test_zero_target_uses_pow_limit() {
        let profile = Arc::new(CoinProfile::resolve(&bitcoin_config()).unwrap());
        let mut t = BlockTemplate::new(profile.clone());
        let mut data = response(vec![]);
        data.target = "0".repeat(64);
        t.block_update(&data).unwrap();
        assert_eq!(t.target, profile.pow_limit);
        assert_eq!(t.difficulty, 1.0);
    }

    #[test]
    fn test_merkle_update_reports_changes() {
        let mut t = bitcoin_template(vec![tx(1, 10)]);
        assert_eq!(t.merkle_branch.steps(), &[[1u8; 32]]);

        // same transaction set: no change
        assert!(!t.merkle_update(&response(vec![tx(1, 10)])).unwrap());
        // new transaction: branch changes
        assert!(t.merkle_update(&response(vec![tx(1, 10), tx(2, 5)])).unwrap());
        assert_eq!(t.tx_count(), 3);
        assert_eq!(t.fees, 15);
    }

    #[test]
    fn test_txid_preferred_over_hash() {
        let mut only_hash = tx(3, 0);
        only_hash.txid = None;
        let t = bitcoin_template(vec![tx(1, 0), only_hash]);
        assert_eq!(t.merkle_branch.steps()[0], [1u8; 32]);
        assert_eq!(t.transactions[1].hash, [0xee; 32]);
    }

    #[test]
    fn test_coinbase_aux_flags_override() {
        let profile = Arc::new(CoinProfile::resolve(&bitcoin_config()).unwrap());
        let mut t = BlockTemplate::new(profile);
        let mut data = response(vec![]);
        data.coinbaseaux = Some(CoinbaseAux { flags: Some("abcd".into()) });
        t.block_update(&data).unwrap();
        assert_eq!(t.aux, vec![0xab, 0xcd]);
    }

    #[test]
    fn test_masternode_subtracted() {
        let cfg = CoinConfig { name: "lux".into(), ..bitcoin_config() };
        let profile = Arc::new(CoinProfile::resolve(&cfg).unwrap());
        let mut t = BlockTemplate::new(profile);
        let mut data = response(vec![]);
        data.masternode = Some(PayeeInfo { payee: test_address(&[0x30], [9; 20]), amount: 1_000 });
        t.block_update(&data).unwrap();
        t.merkle_update(&data).unwrap();
        assert_eq!(t.block_reward, 4_999_999_000);
        assert_eq!(t.coinbase.pool_reward, 4_999_999_000);

        // a second update starts again from the template value
        t.block_update(&data).unwrap();
        assert_eq!(t.block_reward, 4_999_999_000);
    }

    #[test]
    fn test_header_and_block_layout() {
        let t = bitcoin_template(vec![tx(1, 0)]);
        let root = t.merkle_branch.with_first(t.coinbase.hash);
        let header = t.serialize_header(&root, &[1, 2, 3, 4], &[5, 6, 7, 8]);
        assert_eq!(header.len(), 80);
        assert_eq!(&header[..4], &0x2000_0000u32.to_le_bytes());
        assert_eq!(&header[36..68], &root);
        assert_eq!(&header[72..76], &[0xff, 0xff, 0x00, 0x1d]);

        let block = t.serialize_block(&header, None, &t.coinbase.bytes);
        assert_eq!(block[80], 2);
        assert!(block.ends_with(&[1u8; 10]));
        assert_eq!(block.len(), 80 + 1 + t.coinbase.bytes.len() + 10);
    }

    #[test]
    fn test_bitcoin_notify_params() {
        let t = bitcoin_template(vec![tx(1, 0)]);
        let params = t.notify_params("1f").unwrap();
        assert_eq!(params.len(), 9);
        assert_eq!(params[0], json!("1f"));
        assert_eq!(params[1], json!(swap_hash_words(PREV).unwrap()));
        assert_eq!(params[4], json!([hex::encode([1u8; 32])]));
        assert_eq!(params[5], json!("20000000"));
        assert_eq!(params[6], json!("1d00ffff"));
        assert_eq!(params[7], json!(format!("{:08x}", 1_600_000_000u32)));
        assert_eq!(params[8], json!(true));
    }

    #[test]
    fn test_zcash_root_and_notify() {
        let cfg = CoinConfig {
            name: "bitcoin-gold".into(),
            family: CoinFamily::Zcash,
            algorithm: "zhash".into(),
            pool_address: test_address(&[0x1c, 0xb8], [0x22; 20]),
            ..CoinConfig::default()
        };
        let profile = Arc::new(CoinProfile::resolve(&cfg).unwrap());
        let mut t = BlockTemplate::new(profile);
        let data = response(vec![tx(1, 7)]);
        t.block_update(&data).unwrap();
        t.merkle_update(&data).unwrap();

        let expected = sha256d(&[t.coinbase.hash, [1u8; 32]].concat());
        assert_eq!(t.merkle_root, Some(expected));
        assert_eq!(t.coinbase.pool_reward, 5_000_000_007);

        let params = t.notify_params("2").unwrap();
        assert_eq!(params.len(), 10);
        assert_eq!(params[3], json!(hex::encode(expected)));
        assert_eq!(params[4], json!("0".repeat(64)));
        assert_eq!(params[6], json!("ffff001d"));
        assert_eq!(params[8], json!(false));
        assert_eq!(params[9], json!("BgoldPoW"));

        let header = t.serialize_header(&expected, &[0; 4], &[0; 32]);
        assert_eq!(header.len(), 140);
    }
}
