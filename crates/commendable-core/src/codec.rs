//! Fixed-width, order-preserving encodings for stored values.
//!
//! Byte-wise comparison of two encoded values matches numeric comparison of
//! the originals, which is what lets value-ordered (mirror) scans double as
//! age and weight indexes.

use crate::CoreError;

pub const ENCODED_LEN: usize = 8;

const SIGN_BIT: u64 = 1 << 63;

#[must_use]
pub fn encode_i64(value: i64) -> [u8; ENCODED_LEN] {
    let raw = u64::from_be_bytes(value.to_be_bytes());
    (raw ^ SIGN_BIT).to_be_bytes()
}

/// Decode a value written by [`encode_i64`].
///
/// # Errors
/// Returns [`CoreError::Decode`] when `bytes` is not exactly eight bytes long.
pub fn decode_i64(bytes: &[u8]) -> Result<i64, CoreError> {
    let raw = u64::from_be_bytes(fixed_width(bytes, "integer")?) ^ SIGN_BIT;
    Ok(i64::from_be_bytes(raw.to_be_bytes()))
}

#[must_use]
pub fn encode_f64(value: f64) -> [u8; ENCODED_LEN] {
    let bits = value.to_bits();
    let ordered = if bits & SIGN_BIT == 0 { bits ^ SIGN_BIT } else { !bits };
    ordered.to_be_bytes()
}

/// Decode a value written by [`encode_f64`].
///
/// # Errors
/// Returns [`CoreError::Decode`] when `bytes` is not exactly eight bytes long.
pub fn decode_f64(bytes: &[u8]) -> Result<f64, CoreError> {
    let ordered = u64::from_be_bytes(fixed_width(bytes, "float")?);
    let bits = if ordered & SIGN_BIT == 0 { !ordered } else { ordered ^ SIGN_BIT };
    Ok(f64::from_bits(bits))
}

fn fixed_width(bytes: &[u8], what: &str) -> Result<[u8; ENCODED_LEN], CoreError> {
    <[u8; ENCODED_LEN]>::try_from(bytes).map_err(|_| {
        CoreError::Decode(format!(
            "expected {ENCODED_LEN}-byte encoded {what}, found {} bytes",
            bytes.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    // Test IDs: TCOD-001
    #[test]
    fn decode_rejects_wrong_width() {
        assert!(matches!(decode_f64(&[]), Err(CoreError::Decode(_))));
        assert!(matches!(decode_i64(b"123"), Err(CoreError::Decode(_))));
    }

    // Test IDs: TCOD-002
    #[test]
    fn negative_zero_sorts_below_positive_zero() {
        assert!(encode_f64(-0.0) < encode_f64(0.0));
        assert!(encode_f64(-1.5) < encode_f64(-0.0));
    }

    // Test IDs: TCOD-003
    proptest! {
        #[test]
        fn property_i64_encoding_preserves_order(a in any::<i64>(), b in any::<i64>()) {
            prop_assert_eq!(a.cmp(&b), encode_i64(a).cmp(&encode_i64(b)));
            prop_assert_eq!(decode_i64(&encode_i64(a)), Ok(a));
        }
    }

    // Test IDs: TCOD-004
    proptest! {
        #[test]
        fn property_f64_encoding_preserves_order(
            a in -1.0e12_f64..1.0e12,
            b in -1.0e12_f64..1.0e12
        ) {
            prop_assert_eq!(a.partial_cmp(&b), Some(encode_f64(a).cmp(&encode_f64(b))));
            prop_assert_eq!(decode_f64(&encode_f64(a)), Ok(a));
        }
    }
}
