/// Base58Check address decoding

use serde::{Deserialize, Serialize};

use super::{keccak256, sha256d, CodecError};

/// Checksum function appended to Base58 payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumKind {
    #[default]
    #[serde(alias = "sha256d")]
    DoubleSha256,
    Keccak256,
}

impl ChecksumKind {
    fn checksum(self, payload: &[u8]) -> [u8; 4] {
        let digest = match self {
            ChecksumKind::DoubleSha256 => sha256d(payload),
            ChecksumKind::Keccak256 => keccak256(payload),
        };
        [digest[0], digest[1], digest[2], digest[3]]
    }
}

/// Decode a Base58Check address into its 20-byte public key hash.
///
/// `version_len` is the number of leading version bytes (1 for Bitcoin,
/// 2 for Zcash transparent addresses).
pub fn address_to_pubkey_hash(
    address: &str,
    checksum: ChecksumKind,
    version_len: usize,
) -> Result<[u8; 20], CodecError> {
    let invalid = |reason| CodecError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let raw = bs58::decode(address)
        .into_vec()
        .map_err(|_| invalid("not base58"))?;
    if raw.len() != version_len + 20 + 4 {
        return Err(invalid("unexpected length"));
    }

    let (payload, check) = raw.split_at(raw.len() - 4);
    if checksum.checksum(payload) != check {
        return Err(invalid("checksum mismatch"));
    }

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[version_len..]);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(version: &[u8], hash: &[u8; 20], kind: ChecksumKind) -> String {
        let mut payload = version.to_vec();
        payload.extend_from_slice(hash);
        let check = kind.checksum(&payload);
        payload.extend_from_slice(&check);
        bs58::encode(payload).into_string()
    }

    #[test]
    fn test_decodes_genesis_address() {
        let hash = address_to_pubkey_hash(
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            ChecksumKind::DoubleSha256,
            1,
        )
        .unwrap();
        assert_eq!(hex::encode(hash), "62e907b15cbf27d5425399ebf6f0fb50ebb88f18");
    }

    #[test]
    fn test_two_byte_version_and_keccak() {
        let hash = [0xABu8; 20];
        let addr = encode(&[0x1C, 0xB8], &hash, ChecksumKind::Keccak256);
        assert_eq!(
            address_to_pubkey_hash(&addr, ChecksumKind::Keccak256, 2).unwrap(),
            hash
        );
        // wrong checksum function
        assert!(address_to_pubkey_hash(&addr, ChecksumKind::DoubleSha256, 2).is_err());
        // wrong version width
        assert!(address_to_pubkey_hash(&addr, ChecksumKind::Keccak256, 1).is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(address_to_pubkey_hash("0OIl", ChecksumKind::DoubleSha256, 1).is_err());
        assert!(address_to_pubkey_hash("", ChecksumKind::DoubleSha256, 1).is_err());
    }
}
