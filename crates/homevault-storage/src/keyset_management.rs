//! Legacy keyset management
//!
//! Indexed vault keyset files per user, looked up by label. Adding the
//! initial keyset seeds the user's reset seed; additional keysets copy
//! the filesystem keyset and reset seed out of an already-decrypted one.

use std::sync::Arc;

use homevault_core::crypto;
use homevault_core::{
    AuthBlockState, Error, ErrorKind, FileSystemKeyset, KeyBlobs, ObfuscatedUsername, Result,
    SecretBytes,
};

use crate::layout::{atomic_write, StorageLayout};
use crate::vault_keyset::VaultKeyset;

const RESET_SEED_SIZE: usize = 32;

pub struct KeysetManagement {
    layout: Arc<StorageLayout>,
}

impl KeysetManagement {
    pub fn new(layout: Arc<StorageLayout>) -> Self {
        Self { layout }
    }

    pub fn user_exists(&self, user: &ObfuscatedUsername) -> bool {
        self.layout.user_exists(user)
    }

    /// Keyset indices present on disk, ascending.
    pub fn list_indices(&self, user: &ObfuscatedUsername) -> Vec<u32> {
        let dir = self.layout.keysets_dir(user);
        let mut indices = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return indices,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(index) = stem.parse::<u32>() {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();
        indices
    }

    pub fn load(&self, user: &ObfuscatedUsername, index: u32) -> Result<VaultKeyset> {
        let path = self.layout.keyset_path(user, index);
        let bytes = std::fs::read(&path).map_err(|e| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                format!("cannot read keyset {}: {e}", path.display()),
            )
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Find a keyset by label.
    pub fn get_vault_keyset(&self, user: &ObfuscatedUsername, label: &str) -> Option<VaultKeyset> {
        for index in self.list_indices(user) {
            match self.load(user, index) {
                Ok(keyset) if keyset.label() == label => return Some(keyset),
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(index, %err, "skipping unreadable keyset");
                }
            }
        }
        None
    }

    pub fn save(&self, user: &ObfuscatedUsername, keyset: &VaultKeyset) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(keyset)?;
        atomic_write(&self.layout.keyset_path(user, keyset.index()), &bytes)
    }

    fn next_index(&self, user: &ObfuscatedUsername) -> u32 {
        self.list_indices(user)
            .last()
            .map(|last| last + 1)
            .unwrap_or(0)
    }

    /// First keyset of a fresh user; mints the shared reset seed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_initial_keyset(
        &self,
        user: &ObfuscatedUsername,
        label: &str,
        file_system_keyset: &FileSystemKeyset,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
        backup: bool,
    ) -> Result<VaultKeyset> {
        let reset_seed = crypto::random_secret(RESET_SEED_SIZE);
        let keyset = VaultKeyset::encrypt_new(
            0,
            label,
            file_system_keyset,
            Some(&reset_seed),
            None,
            None,
            key_blobs,
            block_state,
            backup,
        )?;
        self.layout.create_user_dir(user)?;
        self.save(user, &keyset)?;
        tracing::info!(%user, label, "added initial keyset");
        Ok(keyset)
    }

    /// Additional keyset, copying the filesystem keyset and reset seed
    /// out of an authenticated (decrypted) keyset. An existing keyset
    /// under the same label is clobbered in place.
    #[allow(clippy::too_many_arguments)]
    pub fn add_keyset(
        &self,
        user: &ObfuscatedUsername,
        label: &str,
        source: &VaultKeyset,
        reset_salt: Option<Vec<u8>>,
        reset_secret: Option<&SecretBytes>,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
        backup: bool,
    ) -> Result<VaultKeyset> {
        let file_system_keyset = source.file_system_keyset().ok_or_else(|| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                "source keyset is not decrypted",
            )
        })?;
        let index = match self.get_vault_keyset(user, label) {
            Some(existing) => existing.index(),
            None => self.next_index(user),
        };
        let keyset = VaultKeyset::encrypt_new(
            index,
            label,
            file_system_keyset,
            source.reset_seed(),
            reset_salt,
            reset_secret,
            key_blobs,
            block_state,
            backup,
        )?;
        self.save(user, &keyset)?;
        tracing::info!(%user, label, index, "added keyset");
        Ok(keyset)
    }

    /// Re-encrypt an existing keyset in place with fresh key blobs.
    pub fn update_keyset(
        &self,
        user: &ObfuscatedUsername,
        source: &VaultKeyset,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
        backup: bool,
    ) -> Result<VaultKeyset> {
        let file_system_keyset = source.file_system_keyset().ok_or_else(|| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                "source keyset is not decrypted",
            )
        })?;
        let keyset = VaultKeyset::encrypt_new(
            source.index(),
            source.label(),
            file_system_keyset,
            source.reset_seed(),
            source.reset_salt().map(|salt| salt.to_vec()),
            source.reset_secret(),
            key_blobs,
            block_state,
            backup,
        )?;
        self.save(user, &keyset)?;
        Ok(keyset)
    }

    /// Load the keyset with this label and decrypt it with the blobs.
    pub fn get_valid_keyset(
        &self,
        user: &ObfuscatedUsername,
        label: &str,
        key_blobs: &KeyBlobs,
    ) -> Result<VaultKeyset> {
        let mut keyset = self.get_vault_keyset(user, label).ok_or_else(|| {
            Error::new(ErrorKind::KeyNotFound, format!("no keyset with label {label}"))
        })?;
        keyset.decrypt(key_blobs)?;
        Ok(keyset)
    }

    pub fn remove_keyset_file(&self, user: &ObfuscatedUsername, keyset: &VaultKeyset) -> Result<()> {
        let path = self.layout.keyset_path(user, keyset.index());
        std::fs::remove_file(&path).map_err(|e| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                format!("cannot remove keyset {}: {e}", path.display()),
            )
        })
    }

    /// Force-remove the keyset with the given label.
    pub fn force_remove_keyset(&self, user: &ObfuscatedUsername, label: &str) -> Result<()> {
        let keyset = self.get_vault_keyset(user, label).ok_or_else(|| {
            Error::new(ErrorKind::KeyNotFound, format!("no keyset with label {label}"))
        })?;
        self.remove_keyset_file(user, &keyset)
    }
}
