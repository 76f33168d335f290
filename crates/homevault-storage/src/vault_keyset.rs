//! Legacy vault keysets
//!
//! A vault keyset is the pre-stash storage model: one full wrapped copy
//! of the filesystem keyset per factor, AES-CBC wrapped under the
//! factor's derived vault-keyset key. A user's keysets share a reset
//! seed; the PIN keyset stores `reset_secret = HMAC(reset_salt,
//! reset_seed)`. Keysets can be marked `backup` (shadowing a stash
//! factor during migration) and `migrated`.

use homevault_core::crypto::{self, AES_BLOCK_SIZE};
use homevault_core::hexutil::{hex_bytes, hex_bytes_opt};
use homevault_core::key_objects::SerializedFileSystemKeyset;
use homevault_core::{
    AuthBlockState, Error, ErrorAction, ErrorKind, FileSystemKeyset, KeyBlobs, Result,
    SecretBytes,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultKeyset {
    index: u32,
    label: String,

    backup: bool,
    migrated: bool,
    /// Set when the backing low-entropy credential locked out, so loads
    /// can short-circuit without a hardware call.
    auth_locked: bool,

    #[serde(with = "hex_bytes")]
    wrapped_keyset: Vec<u8>,
    #[serde(default, with = "hex_bytes_opt")]
    wrapped_chaps_key: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes_opt")]
    wrapped_reset_seed: Option<Vec<u8>>,
    #[serde(with = "hex_bytes")]
    fek_iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    chaps_iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    reset_seed_iv: Vec<u8>,
    #[serde(with = "hex_bytes")]
    reset_secret_iv: Vec<u8>,

    #[serde(default, with = "hex_bytes_opt")]
    reset_salt: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes_opt")]
    wrapped_reset_secret: Option<Vec<u8>>,

    block_state: AuthBlockState,

    // Plaintext state, populated by decrypt; never serialized.
    #[serde(skip)]
    file_system_keyset: Option<FileSystemKeyset>,
    #[serde(skip)]
    reset_seed: Option<SecretBytes>,
    #[serde(skip)]
    reset_secret: Option<SecretBytes>,
}

impl VaultKeyset {
    /// Build and encrypt a fresh keyset in one step.
    #[allow(clippy::too_many_arguments)]
    pub fn encrypt_new(
        index: u32,
        label: impl Into<String>,
        file_system_keyset: &FileSystemKeyset,
        reset_seed: Option<&SecretBytes>,
        reset_salt: Option<Vec<u8>>,
        reset_secret: Option<&SecretBytes>,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
        backup: bool,
    ) -> Result<Self> {
        let vkk_key = required_vkk_key(key_blobs)?;
        let fek_iv = key_blobs
            .vkk_iv
            .clone()
            .unwrap_or_else(|| crypto::random_bytes(AES_BLOCK_SIZE));
        let chaps_iv = key_blobs
            .chaps_iv
            .clone()
            .unwrap_or_else(|| crypto::random_bytes(AES_BLOCK_SIZE));
        let reset_seed_iv = crypto::random_bytes(AES_BLOCK_SIZE);
        let reset_secret_iv = crypto::random_bytes(AES_BLOCK_SIZE);

        let keyset_payload = serde_json::to_vec(&file_system_keyset.to_payload())?;
        let wrapped_keyset = crypto::aes_cbc_encrypt(vkk_key.as_slice(), &fek_iv, &keyset_payload)?;
        let wrapped_chaps_key = Some(crypto::aes_cbc_encrypt(
            vkk_key.as_slice(),
            &chaps_iv,
            file_system_keyset.chaps_key.as_slice(),
        )?);
        let wrapped_reset_seed = match reset_seed {
            Some(seed) => Some(crypto::aes_cbc_encrypt(
                vkk_key.as_slice(),
                &reset_seed_iv,
                seed.as_slice(),
            )?),
            None => None,
        };
        let wrapped_reset_secret = match reset_secret {
            Some(secret) => Some(crypto::aes_cbc_encrypt(
                vkk_key.as_slice(),
                &reset_secret_iv,
                secret.as_slice(),
            )?),
            None => None,
        };

        Ok(Self {
            index,
            label: label.into(),
            backup,
            migrated: false,
            auth_locked: false,
            wrapped_keyset,
            wrapped_chaps_key,
            wrapped_reset_seed,
            fek_iv,
            chaps_iv,
            reset_seed_iv,
            reset_secret_iv,
            reset_salt,
            wrapped_reset_secret,
            block_state,
            file_system_keyset: Some(file_system_keyset.clone()),
            reset_seed: reset_seed.cloned(),
            reset_secret: reset_secret.cloned(),
        })
    }

    /// Unwrap the keyset with the given key blobs, populating the
    /// plaintext fields.
    pub fn decrypt(&mut self, key_blobs: &KeyBlobs) -> Result<()> {
        let vkk_key = required_vkk_key(key_blobs)?;
        let keyset_payload = crypto::aes_cbc_decrypt(
            vkk_key.as_slice(),
            &self.fek_iv,
            &self.wrapped_keyset,
        )
        .map_err(|e| {
            Error::new(
                ErrorKind::AuthorizationKeyFailed,
                format!("keyset {} did not unwrap", self.label),
            )
            .with_action(ErrorAction::Auth)
            .wrap(e)
        })?;
        let serialized: SerializedFileSystemKeyset =
            serde_json::from_slice(keyset_payload.as_slice()).map_err(|_| {
                Error::new(
                    ErrorKind::AuthorizationKeyFailed,
                    format!("keyset {} unwrapped to garbage", self.label),
                )
                .with_action(ErrorAction::Auth)
            })?;
        self.file_system_keyset = Some(FileSystemKeyset::from_payload(serialized));

        if let Some(wrapped) = &self.wrapped_reset_seed {
            self.reset_seed = Some(crypto::aes_cbc_decrypt(
                vkk_key.as_slice(),
                &self.reset_seed_iv,
                wrapped,
            )?);
        }
        if let Some(wrapped) = &self.wrapped_reset_secret {
            self.reset_secret = Some(crypto::aes_cbc_decrypt(
                vkk_key.as_slice(),
                &self.reset_secret_iv,
                wrapped,
            )?);
        }
        Ok(())
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn block_state(&self) -> &AuthBlockState {
        &self.block_state
    }

    pub fn is_backup(&self) -> bool {
        self.backup
    }

    pub fn mark_backup(&mut self) {
        self.backup = true;
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated
    }

    pub fn mark_migrated(&mut self) {
        self.migrated = true;
        self.backup = true;
    }

    pub fn is_auth_locked(&self) -> bool {
        self.auth_locked
    }

    pub fn set_auth_locked(&mut self, locked: bool) {
        self.auth_locked = locked;
    }

    pub fn has_wrapped_reset_seed(&self) -> bool {
        self.wrapped_reset_seed.is_some()
    }

    pub fn reset_salt(&self) -> Option<&[u8]> {
        self.reset_salt.as_deref()
    }

    /// Plaintext filesystem keyset; present only after `decrypt`.
    pub fn file_system_keyset(&self) -> Option<&FileSystemKeyset> {
        self.file_system_keyset.as_ref()
    }

    pub fn reset_seed(&self) -> Option<&SecretBytes> {
        self.reset_seed.as_ref()
    }

    pub fn reset_secret(&self) -> Option<&SecretBytes> {
        self.reset_secret.as_ref()
    }
}

fn required_vkk_key(key_blobs: &KeyBlobs) -> Result<&SecretBytes> {
    key_blobs.vkk_key.as_ref().ok_or_else(|| {
        Error::new(
            ErrorKind::AuthorizationKeyFailed,
            "key blobs carry no wrapping key",
        )
        .with_action(ErrorAction::DevCheckUnexpectedState)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use homevault_core::{AuthBlockState, PasswordScryptState};

    fn blobs() -> KeyBlobs {
        KeyBlobs {
            vkk_key: Some(crypto::random_secret(32)),
            vkk_iv: Some(crypto::random_bytes(16)),
            chaps_iv: Some(crypto::random_bytes(16)),
            reset_secret: None,
            rate_limiter_label: None,
        }
    }

    fn scrypt_state() -> AuthBlockState {
        AuthBlockState::PasswordScrypt(PasswordScryptState {
            salt: vec![1; 16],
            chaps_salt: vec![2; 16],
            reset_seed_salt: vec![3; 16],
        })
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let fs_keyset = FileSystemKeyset::create_random();
        let reset_seed = crypto::random_secret(32);
        let key_blobs = blobs();
        let vk = VaultKeyset::encrypt_new(
            0,
            "legacy-0",
            &fs_keyset,
            Some(&reset_seed),
            None,
            None,
            &key_blobs,
            scrypt_state(),
            false,
        )
        .unwrap();

        // Simulate a reload from disk: plaintext fields are gone.
        let json = serde_json::to_vec(&vk).unwrap();
        let mut loaded: VaultKeyset = serde_json::from_slice(&json).unwrap();
        assert!(loaded.file_system_keyset().is_none());

        loaded.decrypt(&key_blobs).unwrap();
        assert_eq!(loaded.file_system_keyset(), Some(&fs_keyset));
        assert_eq!(loaded.reset_seed(), Some(&reset_seed));
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let fs_keyset = FileSystemKeyset::create_random();
        let vk = VaultKeyset::encrypt_new(
            0,
            "legacy-0",
            &fs_keyset,
            None,
            None,
            None,
            &blobs(),
            scrypt_state(),
            false,
        )
        .unwrap();
        let json = serde_json::to_vec(&vk).unwrap();
        let mut loaded: VaultKeyset = serde_json::from_slice(&json).unwrap();

        let err = loaded.decrypt(&blobs()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
    }

    #[test]
    fn flags_round_trip() {
        let vk = {
            let mut vk = VaultKeyset::encrypt_new(
                3,
                "pin1",
                &FileSystemKeyset::create_random(),
                None,
                Some(vec![9; 16]),
                Some(&crypto::random_secret(32)),
                &blobs(),
                scrypt_state(),
                true,
            )
            .unwrap();
            vk.mark_migrated();
            vk.set_auth_locked(true);
            vk
        };
        let json = serde_json::to_vec(&vk).unwrap();
        let loaded: VaultKeyset = serde_json::from_slice(&json).unwrap();
        assert!(loaded.is_backup());
        assert!(loaded.is_migrated());
        assert!(loaded.is_auth_locked());
        assert_eq!(loaded.index(), 3);
        assert_eq!(loaded.reset_salt(), Some(&[9u8; 16][..]));
    }
}
