/// Target and difficulty arithmetic

use num_bigint::BigUint;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

use super::{decode_hex, CodecError};

/// Expand compact `bits` (hex, e.g. "1d00ffff") into a full target.
pub fn bits_to_target(bits: &str) -> Result<BigUint, CodecError> {
    let raw = decode_hex(bits)?;
    if raw.len() != 4 {
        return Err(CodecError::BadLength { expected: 4, actual: raw.len() });
    }
    let exponent = raw[0] as u32;
    let mantissa = BigUint::from(u32::from_be_bytes([0, raw[1], raw[2], raw[3]]));
    Ok(if exponent <= 3 {
        mantissa >> (8 * (3 - exponent))
    } else {
        mantissa << (8 * (exponent - 3))
    })
}

/// `pow_limit / target` as a float. A zero target is treated as `pow_limit`.
pub fn difficulty_from_target(pow_limit: &BigUint, target: &BigUint) -> f64 {
    if target.is_zero() {
        return 1.0;
    }
    ratio(pow_limit, target)
}

/// Target a share must meet at the given difficulty.
pub fn target_for_difficulty(pow_limit: &BigUint, difficulty: f64) -> BigUint {
    if !(difficulty > 0.0) {
        return pow_limit.clone();
    }
    let limit = pow_limit.to_f64().unwrap_or(f64::MAX);
    BigUint::from_f64((limit / difficulty).floor()).unwrap_or_else(|| pow_limit.clone())
}

/// Zero-padded 64-char hex rendering of a 256-bit value.
pub fn target_hex64(value: &BigUint) -> String {
    format!("{:064x}", value)
}

fn ratio(num: &BigUint, den: &BigUint) -> f64 {
    // keep precision for values far beyond f64's integer range
    let shift = num.bits().max(den.bits()).saturating_sub(1000);
    let n = (num >> shift).to_f64().unwrap_or(f64::MAX);
    let d = (den >> shift).to_f64().unwrap_or(f64::MAX);
    if d == 0.0 {
        return f64::MAX;
    }
    n / d
}
