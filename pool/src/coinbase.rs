/// Coinbase transaction builder
///
/// Builds the pool's generation transaction for the current template:
/// one null input whose script carries the height, the extranonce
/// placeholder (bitcoin family) and the aux flags; then the payee, pool and
/// reward-split outputs in that order.

use crate::codec::{reverse_bytes, ser_number, sha256d, var_int, CodecError};
use crate::coin::{CoinFamily, CoinProfile, TxVersion};

/// Spliced out of the coinbase and replaced by extranonce1 + extranonce2.
pub const EXTRANONCE_PLACEHOLDER: [u8; 8] = [0xf0, 0x00, 0x00, 0x0f, 0xf1, 0x11, 0x11, 0x1f];

/// Miner-chosen extranonce2 width in bytes, announced in the subscribe reply.
pub const EXTRANONCE2_SIZE: usize = 4;

pub const DEFAULT_COINBASE_AUX: &[u8] = b"https://acpool.me";

const DEFAULT_SEQUENCE: u32 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CoinbaseTransaction {
    pub version: TxVersion,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl CoinbaseTransaction {
    pub fn new(version: TxVersion) -> Self {
        Self { version, inputs: Vec::new(), outputs: Vec::new(), lock_time: 0 }
    }

    pub fn add_input(&mut self, prev_hash: [u8; 32], prev_index: u32, script: Vec<u8>) {
        let sequence = match self.version {
            TxVersion::SequenceZero => 0,
            _ => DEFAULT_SEQUENCE,
        };
        self.inputs.push(TxIn { prev_hash, prev_index, script, sequence });
    }

    pub fn add_output(&mut self, out: TxOut) {
        self.outputs.push(out);
    }

    /// Serialize to wire bytes. Returns the bytes and the offset of the
    /// first input script inside them.
    pub fn serialize(&self) -> (Vec<u8>, usize) {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&self.version.header_version().to_le_bytes());
        if self.version == TxVersion::Overwinter {
            buf.extend_from_slice(&TxVersion::OVERWINTER_GROUP_ID.to_le_bytes());
        }

        let mut script_offset = 0;
        buf.extend(var_int(self.inputs.len() as u64));
        for (i, input) in self.inputs.iter().enumerate() {
            buf.extend_from_slice(&input.prev_hash);
            buf.extend_from_slice(&input.prev_index.to_le_bytes());
            buf.extend(var_int(input.script.len() as u64));
            if i == 0 {
                script_offset = buf.len();
            }
            buf.extend_from_slice(&input.script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        buf.extend(var_int(self.outputs.len() as u64));
        for out in &self.outputs {
            buf.extend_from_slice(&out.value.to_le_bytes());
            buf.extend(var_int(out.script.len() as u64));
            buf.extend_from_slice(&out.script);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        if self.version == TxVersion::Overwinter {
            buf.extend_from_slice(&[0u8; 5]);
        }
        (buf, script_offset)
    }
}

/// Masternode / proof-of-stake payee taken from the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payee {
    pub address: String,
    pub amount: u64,
}

/// Inputs to [`build_coinbase`] that come from the current template.
#[derive(Debug, Clone)]
pub struct CoinbaseParams<'a> {
    pub height: u64,
    /// Block reward after any payee / treasury subtraction
    pub block_reward: u64,
    /// Sum of template transaction fees
    pub fees: u64,
    pub treasury: u64,
    pub payee: Option<&'a Payee>,
    pub aux: &'a [u8],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Coinbase {
    pub bytes: Vec<u8>,
    /// sha256d in internal byte order
    pub hash: [u8; 32],
    pub pool_reward: u64,
    /// Offset of the extranonce placeholder (bitcoin family only)
    pub placeholder_offset: Option<usize>,
}

impl Coinbase {
    /// Display-order (RPC style) hash.
    pub fn hash_hex(&self) -> String {
        hex::encode(reverse_bytes(&self.hash))
    }

    /// Hex halves around the extranonce placeholder, as sent in `mining.notify`.
    pub fn halves(&self) -> Option<(String, String)> {
        let off = self.placeholder_offset?;
        Some((
            hex::encode(&self.bytes[..off]),
            hex::encode(&self.bytes[off + EXTRANONCE_PLACEHOLDER.len()..]),
        ))
    }

    /// Rebuild the coinbase a miner hashed by splicing both extranonces over
    /// the placeholder.
    pub fn splice(&self, extranonce1: &[u8], extranonce2: &[u8]) -> Option<Vec<u8>> {
        let off = self.placeholder_offset?;
        let mut out = Vec::with_capacity(self.bytes.len() + extranonce1.len() + extranonce2.len());
        out.extend_from_slice(&self.bytes[..off]);
        out.extend_from_slice(extranonce1);
        out.extend_from_slice(extranonce2);
        out.extend_from_slice(&self.bytes[off + EXTRANONCE_PLACEHOLDER.len()..]);
        Some(out)
    }
}

/// Height, separator, placeholder and aux flags carried by the coinbase input.
pub fn coinbase_script(family: CoinFamily, height: u64, aux: &[u8]) -> (Vec<u8>, Option<usize>) {
    let mut script = ser_number(height);
    script.push(0x00);
    let mut placeholder = None;
    if family == CoinFamily::Bitcoin {
        placeholder = Some(script.len());
        script.extend_from_slice(&EXTRANONCE_PLACEHOLDER);
    }
    script.extend_from_slice(aux);
    (script, placeholder)
}

pub fn build_coinbase(profile: &CoinProfile, params: &CoinbaseParams<'_>) -> Result<Coinbase, CodecError> {
    let mut tx = CoinbaseTransaction::new(profile.tx_version);

    let (script, placeholder) = coinbase_script(profile.family, params.height, params.aux);
    tx.add_input([0u8; 32], 0xffff_ffff, script);

    let mut pool_reward = profile.split.pool_reward(params.block_reward);
    if profile.is_zcash() {
        pool_reward += params.fees;
    }

    if let Some(payee) = params.payee {
        tx.add_output(TxOut { value: payee.amount, script: profile.payee_script(&payee.address)? });
    }
    tx.add_output(profile.pool_script.output(&profile.pool_pubkey_hash, pool_reward));
    for out in profile.split.extra_outputs(params.height, params.block_reward, params.treasury) {
        tx.add_output(out);
    }

    let (bytes, script_offset) = tx.serialize();
    let hash = sha256d(&bytes);
    Ok(Coinbase {
        bytes,
        hash,
        pool_reward,
        placeholder_offset: placeholder.map(|p| script_offset + p),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::tests::{bitcoin_config, test_address};
    use crate::coin::{CoinProfile, OutputScript};
    use crate::config::CoinConfig;

    fn params(aux: &[u8]) -> CoinbaseParams<'_> {
        CoinbaseParams { height: 500_000, block_reward: 5_000_000_000, fees: 1_000, treasury: 0, payee: None, aux }
    }

    #[test]
    fn test_bitcoin_coinbase_layout() {
        let profile = CoinProfile::resolve(&bitcoin_config()).unwrap();
        let cb = build_coinbase(&profile, &params(b"aux")).unwrap();
        let b = &cb.bytes;

        assert_eq!(&b[..4], &1u32.to_le_bytes());
        assert_eq!(b[4], 1); // one input
        assert_eq!(&b[5..37], &[0u8; 32]);
        assert_eq!(&b[37..41], &[0xff; 4]);
        // height(4) + 0x00 + placeholder(8) + "aux"(3)
        assert_eq!(b[41], 16);
        assert_eq!(&b[42..47], &[0x03, 0x20, 0xa1, 0x07, 0x00]);
        assert_eq!(cb.placeholder_offset, Some(47));
        assert_eq!(&b[47..55], &EXTRANONCE_PLACEHOLDER);
        assert_eq!(&b[55..58], b"aux");
        assert_eq!(&b[58..62], &[0xff; 4]);

        // bitcoin family ignores the fee total
        assert_eq!(cb.pool_reward, 5_000_000_000);
        assert_eq!(b[62], 1); // one output
        assert_eq!(&b[63..71], &5_000_000_000u64.to_le_bytes());
        let mut expected = vec![25u8];
        expected.extend(OutputScript::P2pkh.script(&[0x11; 20]));
        expected.extend([0u8; 4]);
        assert_eq!(&b[71..], &expected[..]);
        assert_eq!(cb.hash, sha256d(b));
    }

    #[test]
    fn test_splice_replaces_placeholder() {
        let profile = CoinProfile::resolve(&bitcoin_config()).unwrap();
        let cb = build_coinbase(&profile, &params(DEFAULT_COINBASE_AUX)).unwrap();

        let (c1, c2) = cb.halves().unwrap();
        assert_eq!(format!("{}{}{}", c1, hex::encode(EXTRANONCE_PLACEHOLDER), c2), hex::encode(&cb.bytes));

        let spliced = cb.splice(&[1, 2, 3, 4], &[5, 6, 7, 8]).unwrap();
        assert_eq!(spliced.len(), cb.bytes.len());
        assert_eq!(hex::encode(&spliced), format!("{}0102030405060708{}", c1, c2));
    }

    #[test]
    fn test_payee_output_first_and_sequence_zero() {
        let cfg = CoinConfig { name: "xchange".into(), ..bitcoin_config() };
        let profile = CoinProfile::resolve(&cfg).unwrap();
        let payee = Payee { address: test_address(&[0x30], [0x44; 20]), amount: 777 };
        let p = CoinbaseParams { payee: Some(&payee), ..params(b"") };
        let cb = build_coinbase(&profile, &p).unwrap();

        assert_eq!(&cb.bytes[..4], &2u32.to_le_bytes());
        // sequence follows the script: placeholder offset + 8 + empty aux
        let seq_at = cb.placeholder_offset.unwrap() + 8;
        assert_eq!(&cb.bytes[seq_at..seq_at + 4], &[0, 0, 0, 0]);
        // two outputs, payee first
        assert_eq!(cb.bytes[seq_at + 4], 2);
        assert_eq!(&cb.bytes[seq_at + 5..seq_at + 13], &777u64.to_le_bytes());
    }

    #[test]
    fn test_zcash_testnet_overwinter_and_founders() {
        let cfg = CoinConfig {
            name: "zcash".into(),
            family: CoinFamily::Zcash,
            algorithm: "equihash".into(),
            network: crate::coin::Network::Testnet,
            pool_address: test_address(&[0x1d, 0x25], [0x22; 20]),
            founders: vec![test_address(&[0x1c, 0xba], [0x33; 20])],
            ..CoinConfig::default()
        };
        let profile = CoinProfile::resolve(&cfg).unwrap();
        let p = CoinbaseParams { height: 10, block_reward: 1_000, fees: 50, ..params(b"") };
        let cb = build_coinbase(&profile, &p).unwrap();

        assert_eq!(&cb.bytes[..4], &(3u32 | 1 << 31).to_le_bytes());
        assert_eq!(&cb.bytes[4..8], &0x03c4_8270u32.to_le_bytes());
        assert!(cb.bytes.ends_with(&[0u8; 9])); // locktime + 5 trailing zeros
        assert_eq!(cb.placeholder_offset, None);
        // 80% plus the fee total
        assert_eq!(cb.pool_reward, 850);
        let founders = OutputScript::P2sh.script(&[0x33; 20]);
        let tail = &cb.bytes[cb.bytes.len() - 9 - founders.len() - 1 - 8..];
        assert_eq!(&tail[..8], &200u64.to_le_bytes());
    }
}
