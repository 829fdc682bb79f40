/// Wire-level codecs shared by the template, coinbase and share paths
///
/// Everything in here is pure: byte layouts, hashing, Merkle folding,
/// address decoding and target/difficulty arithmetic.

pub mod address;
pub mod hashing;
pub mod merkle;
pub mod serialize;
pub mod target;

pub use address::{address_to_pubkey_hash, ChecksumKind};
pub use hashing::{keccak256, sha256, sha256d};
pub use merkle::{merkle_root, MerkleBranch};
pub use serialize::{
    read_var_int, reverse_bytes, reverse_hex, ser_number, ser_uint256, ser_uint256_be,
    swap_hash_words, uint256_from_bytes, uint256_from_bytes_be, var_int,
};
pub use target::{bits_to_target, difficulty_from_target, target_for_difficulty, target_hex64};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("invalid hex: {0}")]
    InvalidHex(String),

    #[error("invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: &'static str },

    #[error("expected {expected} bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("truncated input")]
    Truncated,
}

/// Decode a hex string, mapping failures into [`CodecError::InvalidHex`].
pub fn decode_hex(s: &str) -> Result<Vec<u8>, CodecError> {
    hex::decode(s).map_err(|_| CodecError::InvalidHex(s.to_string()))
}

/// Decode exactly 32 bytes of hex.
pub fn decode_hash(s: &str) -> Result<[u8; 32], CodecError> {
    let bytes = decode_hex(s)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CodecError::BadLength { expected: 32, actual: bytes.len() })
}
