//! Account identifiers
//!
//! `Username` is the case-normalized account id supplied by clients.
//! `ObfuscatedUsername` is its deterministic one-way hash, used as the
//! on-disk directory name for the user's data.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::sha256;

// Domain separator for the obfuscated name derivation.
const OBFUSCATION_PREFIX: &[u8] = b"homevault-user:";

/// Case-normalized account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Username(String);

impl Username {
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Deterministic one-way hash of this username.
    pub fn obfuscate(&self) -> ObfuscatedUsername {
        let mut input = Vec::with_capacity(OBFUSCATION_PREFIX.len() + self.0.len());
        input.extend_from_slice(OBFUSCATION_PREFIX);
        input.extend_from_slice(self.0.as_bytes());
        ObfuscatedUsername(hex::encode(sha256(&input)))
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash of a `Username`, safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObfuscatedUsername(String);

impl ObfuscatedUsername {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObfuscatedUsername {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_case_insensitive() {
        assert_eq!(Username::new("Alice@X"), Username::new("alice@x "));
    }

    #[test]
    fn obfuscation_is_deterministic_and_one_way() {
        let alice = Username::new("alice@x");
        assert_eq!(alice.obfuscate(), alice.obfuscate());
        assert_ne!(alice.obfuscate(), Username::new("bob@x").obfuscate());
        assert_eq!(alice.obfuscate().as_str().len(), 64);
    }
}
