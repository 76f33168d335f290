//! Key material objects: the per-user filesystem keyset and the
//! transient wrapping material produced by auth blocks.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, DEFAULT_KEY_SIZE};
use crate::error::{Error, ErrorKind, Result};
use crate::secret::SecretBytes;

const FEK_SIZE: usize = 64;
const FNEK_SIZE: usize = 64;
const SIGNATURE_SIZE: usize = 8;
const CHAPS_KEY_SIZE: usize = 16;

// HKDF info for deriving the USS credential secret out of KeyBlobs.
const USS_CREDENTIAL_SECRET_INFO: &[u8] = b"uss_credential_secret";

/// The symmetric keys that actually encrypt a user's files. Created once
/// at user creation and stable for the user's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSystemKeyset {
    pub fek: SecretBytes,
    pub fnek: SecretBytes,
    pub fek_sig: Vec<u8>,
    pub fnek_sig: Vec<u8>,
    pub chaps_key: SecretBytes,
}

impl FileSystemKeyset {
    pub fn create_random() -> Self {
        Self {
            fek: crypto::random_secret(FEK_SIZE),
            fnek: crypto::random_secret(FNEK_SIZE),
            fek_sig: crypto::random_bytes(SIGNATURE_SIZE),
            fnek_sig: crypto::random_bytes(SIGNATURE_SIZE),
            chaps_key: crypto::random_secret(CHAPS_KEY_SIZE),
        }
    }

    /// Serialized form used inside encrypted containers. Never hits disk
    /// in the clear.
    pub fn to_payload(&self) -> SerializedFileSystemKeyset {
        SerializedFileSystemKeyset {
            fek: self.fek.as_slice().to_vec(),
            fnek: self.fnek.as_slice().to_vec(),
            fek_sig: self.fek_sig.clone(),
            fnek_sig: self.fnek_sig.clone(),
            chaps_key: self.chaps_key.as_slice().to_vec(),
        }
    }

    pub fn from_payload(payload: SerializedFileSystemKeyset) -> Self {
        Self {
            fek: SecretBytes::new(payload.fek),
            fnek: SecretBytes::new(payload.fnek),
            fek_sig: payload.fek_sig,
            fnek_sig: payload.fnek_sig,
            chaps_key: SecretBytes::new(payload.chaps_key),
        }
    }
}

/// On-the-wire form of the filesystem keyset, only ever embedded inside
/// an authenticated encrypted container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedFileSystemKeyset {
    #[serde(with = "crate::hexutil::hex_bytes")]
    pub fek: Vec<u8>,
    #[serde(with = "crate::hexutil::hex_bytes")]
    pub fnek: Vec<u8>,
    #[serde(with = "crate::hexutil::hex_bytes")]
    pub fek_sig: Vec<u8>,
    #[serde(with = "crate::hexutil::hex_bytes")]
    pub fnek_sig: Vec<u8>,
    #[serde(with = "crate::hexutil::hex_bytes")]
    pub chaps_key: Vec<u8>,
}

/// Transient output of an auth block derivation. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct KeyBlobs {
    /// Vault-keyset wrapping key, 32 bytes.
    pub vkk_key: Option<SecretBytes>,
    /// IV for wrapping the keyset, 16 bytes.
    pub vkk_iv: Option<Vec<u8>>,
    /// IV for wrapping the chaps key, 16 bytes.
    pub chaps_iv: Option<Vec<u8>>,
    /// Reset secret for rate-limited factors.
    pub reset_secret: Option<SecretBytes>,
    /// Rate-limiter credential allocated during Create, if any.
    pub rate_limiter_label: Option<u64>,
}

impl KeyBlobs {
    /// The per-label secret that wraps the USS main key.
    pub fn derive_uss_credential_secret(&self) -> Result<SecretBytes> {
        let vkk_key = self.vkk_key.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "key blobs carry no wrapping key",
            )
        })?;
        crypto::hkdf_sha256(
            vkk_key.as_slice(),
            USS_CREDENTIAL_SECRET_INFO,
            &[],
            DEFAULT_KEY_SIZE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyset_payload_round_trip() {
        let keyset = FileSystemKeyset::create_random();
        let payload = keyset.to_payload();
        let back = FileSystemKeyset::from_payload(payload);
        assert_eq!(back, keyset);
    }

    #[test]
    fn uss_credential_secret_is_stable_per_vkk_key() {
        let blobs = KeyBlobs {
            vkk_key: Some(crypto::random_secret(32)),
            ..Default::default()
        };
        let a = blobs.derive_uss_credential_secret().unwrap();
        let b = blobs.derive_uss_credential_secret().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn uss_credential_secret_requires_vkk_key() {
        let blobs = KeyBlobs::default();
        assert!(blobs.derive_uss_credential_secret().is_err());
    }
}
