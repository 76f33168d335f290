//! Unguessable session tokens
//!
//! Tokens serialize to exactly 16 bytes: the high half followed by the
//! low half, both little-endian. An all-zero serialization is invalid
//! and is rejected on parse; `create` never produces it.

use rand::{rngs::OsRng, RngCore};

/// Size of a serialized token.
pub const SERIALIZED_TOKEN_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnguessableToken {
    high: u64,
    low: u64,
}

impl UnguessableToken {
    /// Random non-null token.
    pub fn create() -> Self {
        loop {
            let high = OsRng.next_u64();
            let low = OsRng.next_u64();
            if high != 0 || low != 0 {
                return Self { high, low };
            }
        }
    }

    pub fn to_serialized(self) -> [u8; SERIALIZED_TOKEN_SIZE] {
        let mut out = [0u8; SERIALIZED_TOKEN_SIZE];
        out[..8].copy_from_slice(&self.high.to_le_bytes());
        out[8..].copy_from_slice(&self.low.to_le_bytes());
        out
    }

    /// Parse a serialized token; wrong length or all-zeroes is `None`.
    pub fn from_serialized(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SERIALIZED_TOKEN_SIZE {
            tracing::error!(len = bytes.len(), "incorrect serialized token size");
            return None;
        }
        let mut high_bytes = [0u8; 8];
        let mut low_bytes = [0u8; 8];
        high_bytes.copy_from_slice(&bytes[..8]);
        low_bytes.copy_from_slice(&bytes[8..]);
        let high = u64::from_le_bytes(high_bytes);
        let low = u64::from_le_bytes(low_bytes);
        if high == 0 && low == 0 {
            tracing::error!("all-zeroes serialized token is invalid");
            return None;
        }
        Some(Self { high, low })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let token = UnguessableToken::create();
        let serialized = token.to_serialized();
        assert_eq!(UnguessableToken::from_serialized(&serialized), Some(token));
    }

    #[test]
    fn rejects_all_zeroes() {
        assert_eq!(
            UnguessableToken::from_serialized(&[0u8; SERIALIZED_TOKEN_SIZE]),
            None
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(UnguessableToken::from_serialized(&[1u8; 15]), None);
        assert_eq!(UnguessableToken::from_serialized(&[1u8; 17]), None);
    }

    #[test]
    fn serialization_is_little_endian_high_then_low() {
        let token = UnguessableToken { high: 1, low: 2 };
        let serialized = token.to_serialized();
        assert_eq!(serialized[0], 1);
        assert_eq!(serialized[8], 2);
    }
}
