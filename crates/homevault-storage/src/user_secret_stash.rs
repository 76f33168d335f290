//! User secret stash
//!
//! One random filesystem master key per user, wrapped once per auth
//! factor: any factor's derived credential secret unwraps the same main
//! key. The on-disk container is a versioned envelope whose payload is
//! authenticated-encrypted under the main key; readers reject unknown
//! versions.

use std::collections::BTreeMap;
use std::sync::Arc;

use homevault_core::crypto::{self, DEFAULT_KEY_SIZE};
use homevault_core::key_objects::SerializedFileSystemKeyset;
use homevault_core::{
    AuthFactorType, Error, ErrorKind, FileSystemKeyset, ObfuscatedUsername, Result, SecretBytes,
};
use serde::{Deserialize, Serialize};

use crate::layout::{atomic_write, StorageLayout};

/// Size of the stash main key.
pub const MAIN_KEY_SIZE: usize = DEFAULT_KEY_SIZE;

const CONTAINER_VERSION: u32 = 1;
const PAYLOAD_AAD: &[u8] = b"uss-payload-v1";

/// In-memory stash; exactly one per persistent user, owned by the
/// session that created or decrypted it.
#[derive(Debug, Clone)]
pub struct UserSecretStash {
    file_system_keyset: FileSystemKeyset,
    created_on: i64,
    // label -> AES-GCM blob of the main key under that factor's
    // credential secret.
    wrapped_main_keys: BTreeMap<String, Vec<u8>>,
    reset_secrets_by_label: BTreeMap<String, SecretBytes>,
    rate_limiter_reset_secrets: BTreeMap<AuthFactorType, SecretBytes>,
    fingerprint_rate_limiter_label: Option<u64>,
}

impl UserSecretStash {
    /// Fresh stash around the given filesystem keyset, with an empty
    /// wrapping table.
    pub fn create_random(file_system_keyset: FileSystemKeyset) -> Self {
        Self {
            file_system_keyset,
            created_on: chrono::Utc::now().timestamp(),
            wrapped_main_keys: BTreeMap::new(),
            reset_secrets_by_label: BTreeMap::new(),
            rate_limiter_reset_secrets: BTreeMap::new(),
            fingerprint_rate_limiter_label: None,
        }
    }

    pub fn create_random_main_key() -> SecretBytes {
        crypto::random_secret(MAIN_KEY_SIZE)
    }

    pub fn file_system_keyset(&self) -> &FileSystemKeyset {
        &self.file_system_keyset
    }

    pub fn created_on(&self) -> i64 {
        self.created_on
    }

    pub fn wrapped_key_count(&self) -> usize {
        self.wrapped_main_keys.len()
    }

    pub fn has_wrapped_main_key(&self, wrapping_id: &str) -> bool {
        self.wrapped_main_keys.contains_key(wrapping_id)
    }

    /// Wrap the main key under a per-label credential secret. The
    /// wrapping id is the factor's label; duplicates are refused.
    pub fn add_wrapped_main_key(
        &mut self,
        main_key: &SecretBytes,
        wrapping_id: &str,
        wrapping_key: &SecretBytes,
    ) -> Result<()> {
        if main_key.len() != MAIN_KEY_SIZE {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                "main key has the wrong size",
            ));
        }
        if self.wrapped_main_keys.contains_key(wrapping_id) {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                format!("duplicate wrapping id {wrapping_id}"),
            ));
        }
        let blob = crypto::aes_gcm_seal(
            wrapping_key.as_slice(),
            wrapping_id.as_bytes(),
            main_key.as_slice(),
        )?;
        self.wrapped_main_keys.insert(wrapping_id.to_string(), blob);
        Ok(())
    }

    pub fn remove_wrapped_main_key(&mut self, wrapping_id: &str) -> Result<()> {
        self.wrapped_main_keys.remove(wrapping_id).ok_or_else(|| {
            Error::new(
                ErrorKind::KeyNotFound,
                format!("no wrapping with id {wrapping_id}"),
            )
        })?;
        Ok(())
    }

    pub fn set_reset_secret_for_label(&mut self, label: &str, secret: SecretBytes) -> Result<()> {
        if self.reset_secrets_by_label.contains_key(label) {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                format!("reset secret already present for label {label}"),
            ));
        }
        self.reset_secrets_by_label.insert(label.to_string(), secret);
        Ok(())
    }

    /// Removing a missing entry is fine; not every factor has one.
    pub fn remove_reset_secret_for_label(&mut self, label: &str) {
        self.reset_secrets_by_label.remove(label);
    }

    pub fn reset_secret_for_label(&self, label: &str) -> Option<&SecretBytes> {
        self.reset_secrets_by_label.get(label)
    }

    /// Write-once: the rate-limiter id survives for the user's lifetime.
    pub fn initialize_fingerprint_rate_limiter_id(&mut self, label: u64) -> Result<()> {
        if self.fingerprint_rate_limiter_label.is_some() {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                "fingerprint rate-limiter id is already set",
            ));
        }
        self.fingerprint_rate_limiter_label = Some(label);
        Ok(())
    }

    pub fn fingerprint_rate_limiter_id(&self) -> Option<u64> {
        self.fingerprint_rate_limiter_label
    }

    /// Write-once per factor type.
    pub fn set_rate_limiter_reset_secret(
        &mut self,
        factor_type: AuthFactorType,
        secret: SecretBytes,
    ) -> Result<()> {
        if self.rate_limiter_reset_secrets.contains_key(&factor_type) {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                format!("rate-limiter reset secret already set for {factor_type}"),
            ));
        }
        self.rate_limiter_reset_secrets.insert(factor_type, secret);
        Ok(())
    }

    pub fn rate_limiter_reset_secret(&self, factor_type: AuthFactorType) -> Option<&SecretBytes> {
        self.rate_limiter_reset_secrets.get(&factor_type)
    }

    /// Serialize to the versioned authenticated container keyed by the
    /// main key.
    pub fn to_encrypted_container(&self, main_key: &SecretBytes) -> Result<Vec<u8>> {
        let payload = UssPayload {
            file_system_keyset: self.file_system_keyset.to_payload(),
            created_on: self.created_on,
            reset_secrets_by_label: self
                .reset_secrets_by_label
                .iter()
                .map(|(label, secret)| (label.clone(), hex::encode(secret.as_slice())))
                .collect(),
            rate_limiter_reset_secrets: self
                .rate_limiter_reset_secrets
                .iter()
                .map(|(factor_type, secret)| (*factor_type, hex::encode(secret.as_slice())))
                .collect(),
            fingerprint_rate_limiter_label: self.fingerprint_rate_limiter_label,
        };
        let payload_bytes = serde_json::to_vec(&payload)?;
        let payload_ciphertext =
            crypto::aes_gcm_seal(main_key.as_slice(), PAYLOAD_AAD, &payload_bytes)?;

        let container = UssContainer {
            version: CONTAINER_VERSION,
            wrapped_main_keys: self
                .wrapped_main_keys
                .iter()
                .map(|(id, blob)| (id.clone(), hex::encode(blob)))
                .collect(),
            payload: hex::encode(payload_ciphertext),
        };
        Ok(serde_json::to_vec(&container)?)
    }

    /// Unwrap the main key via the named wrapping, authenticate the
    /// container, and return both the stash and the main key.
    pub fn from_encrypted_container_with_wrapping_key(
        container_bytes: &[u8],
        wrapping_id: &str,
        wrapping_key: &SecretBytes,
    ) -> Result<(Self, SecretBytes)> {
        let container: UssContainer = serde_json::from_slice(container_bytes)?;
        if container.version != CONTAINER_VERSION {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                format!("unknown stash container version {}", container.version),
            ));
        }

        let mut wrapped_main_keys = BTreeMap::new();
        for (id, blob_hex) in &container.wrapped_main_keys {
            let blob = hex::decode(blob_hex).map_err(|e| {
                Error::new(
                    ErrorKind::BackingStoreFailure,
                    format!("corrupt wrapping entry {id}: {e}"),
                )
            })?;
            wrapped_main_keys.insert(id.clone(), blob);
        }

        let wrapped = wrapped_main_keys.get(wrapping_id).ok_or_else(|| {
            Error::new(
                ErrorKind::KeyNotFound,
                format!("no wrapping with id {wrapping_id}"),
            )
        })?;
        let main_key =
            crypto::aes_gcm_open(wrapping_key.as_slice(), wrapping_id.as_bytes(), wrapped)?;

        let payload_ciphertext = hex::decode(&container.payload).map_err(|e| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                format!("corrupt stash payload: {e}"),
            )
        })?;
        let payload_bytes =
            crypto::aes_gcm_open(main_key.as_slice(), PAYLOAD_AAD, &payload_ciphertext)?;
        let payload: UssPayload = serde_json::from_slice(payload_bytes.as_slice())?;

        let mut reset_secrets_by_label = BTreeMap::new();
        for (label, secret_hex) in payload.reset_secrets_by_label {
            let secret = hex::decode(&secret_hex).map_err(|e| {
                Error::new(
                    ErrorKind::BackingStoreFailure,
                    format!("corrupt reset secret for {label}: {e}"),
                )
            })?;
            reset_secrets_by_label.insert(label, SecretBytes::new(secret));
        }
        let mut rate_limiter_reset_secrets = BTreeMap::new();
        for (factor_type, secret_hex) in payload.rate_limiter_reset_secrets {
            let secret = hex::decode(&secret_hex).map_err(|e| {
                Error::new(
                    ErrorKind::BackingStoreFailure,
                    format!("corrupt rate-limiter secret for {factor_type}: {e}"),
                )
            })?;
            rate_limiter_reset_secrets.insert(factor_type, SecretBytes::new(secret));
        }

        let stash = Self {
            file_system_keyset: FileSystemKeyset::from_payload(payload.file_system_keyset),
            created_on: payload.created_on,
            wrapped_main_keys,
            reset_secrets_by_label,
            rate_limiter_reset_secrets,
            fingerprint_rate_limiter_label: payload.fingerprint_rate_limiter_label,
        };
        Ok((stash, main_key))
    }
}

#[derive(Serialize, Deserialize)]
struct UssContainer {
    version: u32,
    wrapped_main_keys: BTreeMap<String, String>,
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct UssPayload {
    file_system_keyset: SerializedFileSystemKeyset,
    created_on: i64,
    reset_secrets_by_label: BTreeMap<String, String>,
    rate_limiter_reset_secrets: BTreeMap<AuthFactorType, String>,
    fingerprint_rate_limiter_label: Option<u64>,
}

/// One encrypted container file per user.
pub struct UssStorage {
    layout: Arc<StorageLayout>,
}

impl UssStorage {
    pub fn new(layout: Arc<StorageLayout>) -> Self {
        Self { layout }
    }

    pub fn persist(&self, container: &[u8], user: &ObfuscatedUsername) -> Result<()> {
        atomic_write(&self.layout.uss_path(user), container)
    }

    pub fn load_persisted(&self, user: &ObfuscatedUsername) -> Result<Vec<u8>> {
        let path = self.layout.uss_path(user);
        std::fs::read(&path).map_err(|e| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                format!("cannot read stash container {}: {e}", path.display()),
            )
        })
    }

    pub fn exists(&self, user: &ObfuscatedUsername) -> bool {
        self.layout.uss_path(user).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stash() -> UserSecretStash {
        UserSecretStash::create_random(FileSystemKeyset::create_random())
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        let wrapping_key = crypto::random_secret(32);
        stash
            .add_wrapped_main_key(&main_key, "legacy-0", &wrapping_key)
            .unwrap();

        let container = stash.to_encrypted_container(&main_key).unwrap();
        let (loaded, unwrapped_key) = UserSecretStash::from_encrypted_container_with_wrapping_key(
            &container,
            "legacy-0",
            &wrapping_key,
        )
        .unwrap();
        assert_eq!(unwrapped_key, main_key);
        assert_eq!(loaded.file_system_keyset(), stash.file_system_keyset());
    }

    #[test]
    fn wrong_wrapping_key_fails_authorization() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        stash
            .add_wrapped_main_key(&main_key, "legacy-0", &crypto::random_secret(32))
            .unwrap();
        let container = stash.to_encrypted_container(&main_key).unwrap();

        let err = UserSecretStash::from_encrypted_container_with_wrapping_key(
            &container,
            "legacy-0",
            &crypto::random_secret(32),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
    }

    #[test]
    fn duplicate_wrapping_id_is_refused() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        let wrapping_key = crypto::random_secret(32);
        stash
            .add_wrapped_main_key(&main_key, "legacy-0", &wrapping_key)
            .unwrap();
        let err = stash
            .add_wrapped_main_key(&main_key, "legacy-0", &wrapping_key)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddCredentialsFailed);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        let wrapping_key = crypto::random_secret(32);
        stash
            .add_wrapped_main_key(&main_key, "a", &wrapping_key)
            .unwrap();
        let container = stash.to_encrypted_container(&main_key).unwrap();

        let mut parsed: serde_json::Value = serde_json::from_slice(&container).unwrap();
        parsed["version"] = serde_json::json!(99);
        let tampered = serde_json::to_vec(&parsed).unwrap();

        let err = UserSecretStash::from_encrypted_container_with_wrapping_key(
            &tampered,
            "a",
            &wrapping_key,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStoreFailure);
    }

    #[test]
    fn write_once_fields_stay_written() {
        let mut stash = stash();
        stash.initialize_fingerprint_rate_limiter_id(7).unwrap();
        assert!(stash.initialize_fingerprint_rate_limiter_id(8).is_err());
        assert_eq!(stash.fingerprint_rate_limiter_id(), Some(7));

        stash
            .set_rate_limiter_reset_secret(AuthFactorType::Fingerprint, crypto::random_secret(32))
            .unwrap();
        assert!(stash
            .set_rate_limiter_reset_secret(AuthFactorType::Fingerprint, crypto::random_secret(32))
            .is_err());
    }

    #[test]
    fn reset_secrets_survive_the_container() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        let wrapping_key = crypto::random_secret(32);
        let reset_secret = crypto::random_secret(32);
        stash
            .add_wrapped_main_key(&main_key, "pin1", &wrapping_key)
            .unwrap();
        stash
            .set_reset_secret_for_label("pin1", reset_secret.clone())
            .unwrap();

        let container = stash.to_encrypted_container(&main_key).unwrap();
        let (loaded, _) = UserSecretStash::from_encrypted_container_with_wrapping_key(
            &container,
            "pin1",
            &wrapping_key,
        )
        .unwrap();
        assert_eq!(loaded.reset_secret_for_label("pin1"), Some(&reset_secret));
    }

    #[test]
    fn removing_last_wrapping_is_callers_concern() {
        let mut stash = stash();
        let main_key = UserSecretStash::create_random_main_key();
        stash
            .add_wrapped_main_key(&main_key, "only", &crypto::random_secret(32))
            .unwrap();
        // The last-factor check lives a layer above; the stash itself
        // allows going to zero wrappings.
        stash.remove_wrapped_main_key("only").unwrap();
        assert_eq!(stash.wrapped_key_count(), 0);
        assert!(stash.remove_wrapped_main_key("only").is_err());
    }
}
