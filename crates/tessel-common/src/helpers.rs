//! Hex helpers for key material.

use tessel_core::KEY_LEN;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Decode a 32-byte key from hex, ignoring surrounding whitespace.
pub fn decode_key_hex(hex_key: &str) -> Result<[u8; KEY_LEN]> {
    let mut bytes = hex::decode(hex_key.trim()).map_err(Error::invalid_key)?;
    if bytes.len() != KEY_LEN {
        let len = bytes.len();
        bytes.zeroize();
        return Err(Error::invalid_key(format!(
            "expected {KEY_LEN} bytes, got {len}"
        )));
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    bytes.zeroize();
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_key_hex_roundtrip() {
        let key = [0xABu8; KEY_LEN];
        let encoded = hex::encode(key);
        assert_eq!(encoded.len(), 64);
        assert_eq!(decode_key_hex(&format!("  {encoded}\n")).unwrap(), key);
    }

    #[test]
    fn test_decode_key_hex_wrong_length() {
        assert!(matches!(decode_key_hex("abcd"), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_decode_key_hex_not_hex() {
        assert!(matches!(
            decode_key_hex(&"zz".repeat(32)),
            Err(Error::InvalidKey(_))
        ));
    }
}
