/// Share Validator
///
/// Rebuilds the exact header a miner hashed from the job's template
/// snapshot plus the submitted fields, runs the proof-of-work hasher and
/// derives the share difficulty. Pool and network difficulty decisions
/// are made by the processor.

use serde_json::Value;

use crate::blockchain::template::BlockTemplate;
use crate::codec::{decode_hex, reverse_bytes, sha256, sha256d, uint256_from_bytes, CodecError};
use crate::coin::CoinFamily;
use crate::coinbase::EXTRANONCE2_SIZE;
use crate::stratum::protocol::StratumResponse;
use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

use super::hasher::ProofOfWorkHasher;

/// Bitcoin-family nonce, hex chars
pub const NONCE_HEX_LEN: usize = 8;
/// Zcash-family extranonce1 + extranonce2, hex chars
pub const ZCASH_NONCE_HEX_LEN: usize = 64;
/// Equihash 200,9 solution with its compact-size prefix, hex chars
pub const EQUIHASH_SOLUTION_HEX_LEN: usize = 2694;
/// Equihash 144,5 (zhash) solution with its prefix, hex chars
pub const ZHASH_SOLUTION_HEX_LEN: usize = 202;

/// Fraction of the network difficulty at which a share is tried as a block.
pub const BLOCK_CANDIDATE_RATIO: f64 = 0.99;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShareRejection {
    #[error("job not found")]
    JobNotFound,
    #[error("incorrect size of nonce")]
    BadNonceSize,
    #[error("incorrect size of solution")]
    BadSolutionSize,
    #[error("ntime out of range")]
    NtimeOutOfRange,
    #[error("duplicate share")]
    Duplicate,
    #[error("low difficulty share of {0}")]
    LowDifficulty(f64),
    #[error("invalid solution")]
    InvalidSolution,
    #[error("unauthorized worker")]
    Unauthorized,
    #[error("not subscribed")]
    NotSubscribed,
    #[error("invalid params: {0}")]
    InvalidParams(String),
}

impl ShareRejection {
    pub fn code(&self) -> i64 {
        match self {
            ShareRejection::JobNotFound => 21,
            ShareRejection::Duplicate => 22,
            ShareRejection::LowDifficulty(_) => 23,
            ShareRejection::Unauthorized => 24,
            ShareRejection::NotSubscribed => 25,
            ShareRejection::BadNonceSize
            | ShareRejection::BadSolutionSize
            | ShareRejection::NtimeOutOfRange
            | ShareRejection::InvalidSolution
            | ShareRejection::InvalidParams(_) => 20,
        }
    }

    /// Rejections raised before any hashing reply `false`; the rest `null`.
    fn result(&self) -> Value {
        match self {
            ShareRejection::LowDifficulty(_) | ShareRejection::Duplicate | ShareRejection::InvalidSolution => Value::Null,
            _ => Value::Bool(false),
        }
    }

    pub fn to_response(&self, id: Value) -> StratumResponse {
        StratumResponse::error(id, self.result(), StratumResponse::error_array(self.code(), &self.to_string()))
    }
}

impl From<CodecError> for ShareRejection {
    fn from(e: CodecError) -> Self {
        ShareRejection::InvalidParams(e.to_string())
    }
}

/// `mining.submit` params in family order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    /// Header nonce (bitcoin family) or equihash solution (zcash family)
    pub nonce: String,
}

impl Submission {
    /// bitcoin: `[worker, job_id, extranonce2, ntime, nonce]`
    /// zcash: `[worker, job_id, ntime, extranonce2, solution]`
    pub fn parse(family: CoinFamily, params: &[Value]) -> Result<Self, ShareRejection> {
        let field = |i: usize| -> Result<String, ShareRejection> {
            params
                .get(i)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .ok_or_else(|| ShareRejection::InvalidParams(format!("missing param {}", i)))
        };
        let (worker, job_id) = (field(0)?, field(1)?);
        Ok(match family {
            CoinFamily::Bitcoin => Self { worker, job_id, extranonce2: field(2)?, ntime: field(3)?, nonce: field(4)? },
            CoinFamily::Zcash => Self { worker, job_id, ntime: field(2)?, extranonce2: field(3)?, nonce: field(4)? },
        })
    }

    /// Worker part of `user.worker`, if any.
    pub fn worker_name(&self) -> Option<&str> {
        self.worker.split_once('.').map(|(_, w)| w).filter(|w| !w.is_empty())
    }
}

/// A fully reassembled submission.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub header: Vec<u8>,
    /// Bytes fed to the hasher: the header, plus the solution for zcash
    pub pow_input: Vec<u8>,
    pub digest: [u8; 32],
    pub share_difficulty: f64,
    /// Serialized block, ready for `submitblock`
    pub block: Vec<u8>,
    /// Nonce as registered for duplicate detection
    pub nonce: String,
}

impl Candidate {
    /// Display-order block hash.
    pub fn block_hash(&self, sha256d_block_id: bool) -> String {
        let id = if sha256d_block_id { sha256d(&self.header) } else { self.digest };
        hex::encode(reverse_bytes(&id))
    }
}

/// `pow_limit / digest`, with the digest read as a little-endian 256-bit integer.
pub fn share_difficulty(pow_limit: &BigUint, digest: &[u8; 32]) -> f64 {
    let value = uint256_from_bytes(digest);
    if value.is_zero() {
        return f64::MAX;
    }
    let bits = pow_limit.bits().max(value.bits());
    let shift = bits.saturating_sub(1000);
    let num = (pow_limit >> shift).to_f64().unwrap_or(f64::MAX);
    let den = (&value >> shift).to_f64().unwrap_or(f64::MAX);
    num / den
}

pub fn build_candidate(
    template: &BlockTemplate,
    hasher: &dyn ProofOfWorkHasher,
    extranonce1: &str,
    sub: &Submission,
) -> Result<Candidate, ShareRejection> {
    let profile = template.profile();
    let candidate = match profile.family {
        CoinFamily::Bitcoin => {
            if sub.nonce.len() != NONCE_HEX_LEN {
                return Err(ShareRejection::BadNonceSize);
            }
            let extranonce2 = decode_hex(&sub.extranonce2)?;
            if extranonce2.len() != EXTRANONCE2_SIZE {
                return Err(ShareRejection::InvalidParams(format!("bad extranonce2 {}", sub.extranonce2)));
            }
            let time = decode_hex(&sub.ntime)?;
            if time.len() != 4 {
                return Err(ShareRejection::InvalidParams(format!("bad ntime {}", sub.ntime)));
            }

            let coinbase = template
                .coinbase
                .splice(&decode_hex(extranonce1)?, &extranonce2)
                .ok_or_else(|| ShareRejection::InvalidParams("template has no extranonce slot".into()))?;
            let coinbase_hash = if profile.single_sha_coinbase { sha256(&coinbase) } else { sha256d(&coinbase) };
            let root = template.merkle_branch.with_first(coinbase_hash);

            let time = reverse_bytes(&time);
            let nonce = reverse_bytes(&decode_hex(&sub.nonce)?);
            let header = template.serialize_header(&root, &time, &nonce);
            let digest = hasher.hash(&header);
            Candidate {
                block: template.serialize_block(&header, None, &coinbase),
                share_difficulty: share_difficulty(&profile.pow_limit, &digest),
                pow_input: header.clone(),
                header,
                digest,
                nonce: sub.nonce.clone(),
            }
        }
        CoinFamily::Zcash => {
            let nonce_hex = format!("{}{}", extranonce1, sub.extranonce2);
            if nonce_hex.len() != ZCASH_NONCE_HEX_LEN {
                return Err(ShareRejection::BadNonceSize);
            }
            let expected = if profile.algorithm == "zhash" {
                ZHASH_SOLUTION_HEX_LEN
            } else {
                EQUIHASH_SOLUTION_HEX_LEN
            };
            if sub.nonce.len() != expected {
                return Err(ShareRejection::BadSolutionSize);
            }

            let time = decode_hex(&sub.ntime)?;
            let ntime: [u8; 4] = time
                .as_slice()
                .try_into()
                .map_err(|_| ShareRejection::InvalidParams(format!("bad ntime {}", sub.ntime)))?;
            if u32::from_le_bytes(ntime) < template.curtime {
                return Err(ShareRejection::NtimeOutOfRange);
            }

            let root = template
                .merkle_root
                .ok_or_else(|| ShareRejection::InvalidParams("template has no merkle root".into()))?;
            let header = template.serialize_header(&root, &time, &decode_hex(&nonce_hex)?);
            let solution = decode_hex(&sub.nonce)?;
            let mut pow_input = header.clone();
            pow_input.extend_from_slice(&solution);
            let digest = hasher.hash(&pow_input);
            Candidate {
                block: template.serialize_block(&header, Some(&solution), &template.coinbase.bytes),
                share_difficulty: share_difficulty(&profile.pow_limit, &digest),
                pow_input,
                header,
                digest,
                nonce: nonce_hex,
            }
        }
    };
    Ok(candidate)
}
