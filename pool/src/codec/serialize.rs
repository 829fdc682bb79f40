/// Integer and byte-order encodings used by block headers and transactions

use num_bigint::BigUint;

use super::CodecError;

/// Encode a compact-size integer (1, 3, 5 or 9 bytes, little-endian payload).
pub fn var_int(n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_var_int(&mut out, n);
    out
}

pub fn write_var_int(out: &mut Vec<u8>, n: u64) {
    if n < 0xFD {
        out.push(n as u8);
    } else if n <= 0xFFFF {
        out.push(0xFD);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xFFFF_FFFF {
        out.push(0xFE);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// Decode a compact-size integer. Returns the value and the number of bytes consumed.
pub fn read_var_int(bytes: &[u8]) -> Result<(u64, usize), CodecError> {
    let (&prefix, rest) = bytes.split_first().ok_or(CodecError::Truncated)?;
    let width = match prefix {
        0xFD => 2,
        0xFE => 4,
        0xFF => 8,
        n => return Ok((n as u64, 1)),
    };
    if rest.len() < width {
        return Err(CodecError::Truncated);
    }
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&rest[..width]);
    Ok((u64::from_le_bytes(buf), 1 + width))
}

/// Serialize a 256-bit integer as eight little-endian 32-bit words, low word first.
pub fn ser_uint256(value: &BigUint) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = value.to_bytes_le();
    let len = bytes.len().min(32);
    out[..len].copy_from_slice(&bytes[..len]);
    out
}

/// Same word order as [`ser_uint256`], but each word is written big-endian.
pub fn ser_uint256_be(value: &BigUint) -> [u8; 32] {
    let le = ser_uint256(value);
    let mut out = [0u8; 32];
    for (dst, src) in out.chunks_exact_mut(4).zip(le.chunks_exact(4)) {
        dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
    }
    out
}

/// Interpret the first 32 bytes as eight little-endian words, low word first.
pub fn uint256_from_bytes(bytes: &[u8]) -> BigUint {
    let len = bytes.len().min(32);
    BigUint::from_bytes_le(&bytes[..len])
}

/// Inverse of [`ser_uint256_be`].
pub fn uint256_from_bytes_be(bytes: &[u8]) -> BigUint {
    let mut le = [0u8; 32];
    for (dst, src) in le.chunks_exact_mut(4).zip(bytes.chunks_exact(4).take(8)) {
        dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
    }
    BigUint::from_bytes_le(&le)
}

/// Script-number encoding of the block height: length byte followed by the
/// minimal little-endian representation (sign bit kept clear).
pub fn ser_number(mut n: u64) -> Vec<u8> {
    let mut out = vec![1u8];
    while n > 127 {
        out[0] += 1;
        out.push((n % 256) as u8);
        n /= 256;
    }
    out.push(n as u8);
    out
}

pub fn reverse_bytes(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// Reverse the byte order of a hex string.
pub fn reverse_hex(s: &str) -> Result<String, CodecError> {
    let bytes = super::decode_hex(s)?;
    Ok(hex::encode(reverse_bytes(&bytes)))
}

/// Reverse the order of the eight 4-byte words of a 64-char hash, keeping the
/// bytes inside each word. This is the prevhash layout of `mining.notify`.
pub fn swap_hash_words(s: &str) -> Result<String, CodecError> {
    if s.len() != 64 || !s.is_ascii() {
        return Err(CodecError::BadLength { expected: 64, actual: s.len() });
    }
    Ok((0..8).rev().map(|i| &s[i * 8..i * 8 + 8]).collect())
}
