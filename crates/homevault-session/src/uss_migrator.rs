//! Vault keyset to user secret stash migration
//!
//! After a successful legacy authentication, each vault keyset can be
//! migrated independently: a stash entry with the same label is created
//! from freshly minted key blobs, and the keyset is kept as a backup
//! marked `migrated`. The stash is shared across migrations through a
//! dedicated migration wrapping derived from the filesystem keyset, so
//! any keyset's migration can unwrap it. Migration failures are logged
//! and reported through `MigrationStatus`, never to the user.

use homevault_blocks::AuthBlockDispatcher;
use homevault_core::crypto;
use homevault_core::{
    AuthFactor, AuthFactorMetadata, AuthFactorType, AuthInput, FileSystemKeyset,
    ObfuscatedUsername, Result, SecretBytes,
};
use homevault_storage::{
    AuthFactorManager, KeysetManagement, UserSecretStash, UssStorage, VaultKeyset,
};

/// Wrapping id reserved for the migration secret.
pub const MIGRATION_WRAPPING_ID: &str = "migration_secret";

const MIGRATION_SECRET_HMAC_MESSAGE: &[u8] = b"uss_migration_secret";

/// Outcome taxonomy, recorded per attempted keyset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    Success,
    /// Could not assemble the inputs (undecrypted keyset, no block).
    FailedInput,
    /// Could not persist the factor or the stash container.
    FailedPersist,
    /// Everything persisted but the keyset could not be marked
    /// migrated; the migrator will retry it next time.
    FailedRecordingMigrated,
}

/// Everything a completed migration hands back to the session.
pub struct MigrationOutcome {
    pub stash: UserSecretStash,
    pub main_key: SecretBytes,
    pub factor: AuthFactor,
}

pub struct UssMigrator<'a> {
    pub user: &'a ObfuscatedUsername,
    pub keyset_management: &'a KeysetManagement,
    pub uss_storage: &'a UssStorage,
    pub auth_factor_manager: &'a AuthFactorManager,
    pub dispatcher: &'a AuthBlockDispatcher,
}

/// The migration wrapping key, derived from the filesystem keyset so
/// that every keyset-authenticated session can compute it.
fn migration_secret(fs_keyset: &FileSystemKeyset) -> SecretBytes {
    crypto::hmac_sha256(
        SecretBytes::combine(&fs_keyset.fek, &fs_keyset.fnek).as_slice(),
        MIGRATION_SECRET_HMAC_MESSAGE,
    )
}

impl UssMigrator<'_> {
    /// Load the user's stash through the migration wrapping, or create
    /// a fresh one seeded with this keyset's filesystem keys.
    fn load_or_create_stash(
        &self,
        fs_keyset: &FileSystemKeyset,
    ) -> Result<(UserSecretStash, SecretBytes)> {
        let wrapping_key = migration_secret(fs_keyset);
        if self.uss_storage.exists(self.user) {
            let container = self.uss_storage.load_persisted(self.user)?;
            return UserSecretStash::from_encrypted_container_with_wrapping_key(
                &container,
                MIGRATION_WRAPPING_ID,
                &wrapping_key,
            );
        }
        let mut stash = UserSecretStash::create_random(fs_keyset.clone());
        let main_key = UserSecretStash::create_random_main_key();
        stash.add_wrapped_main_key(&main_key, MIGRATION_WRAPPING_ID, &wrapping_key)?;
        Ok((stash, main_key))
    }

    /// Migrate one authenticated (decrypted) keyset. Returns the status
    /// plus, on success-like outcomes, the stash and the new factor.
    pub async fn migrate_vault_keyset_to_uss(
        &self,
        vault_keyset: &VaultKeyset,
        factor_type: AuthFactorType,
        metadata: AuthFactorMetadata,
        migration_input: &AuthInput,
    ) -> (MigrationStatus, Option<MigrationOutcome>) {
        let label = vault_keyset.label().to_string();
        let Some(fs_keyset) = vault_keyset.file_system_keyset() else {
            tracing::error!(label, "migration needs a decrypted keyset");
            return (MigrationStatus::FailedInput, None);
        };

        let (mut stash, main_key) = match self.load_or_create_stash(fs_keyset) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(label, %err, "cannot load stash for migration");
                return (MigrationStatus::FailedInput, None);
            }
        };

        let kind = match self.dispatcher.kind_for_creation(factor_type) {
            Ok(kind) => kind,
            Err(err) => {
                tracing::error!(label, %err, "no auth block for migration");
                return (MigrationStatus::FailedInput, None);
            }
        };
        let (block_state, key_blobs) =
            match self.dispatcher.create_key_blobs(kind, migration_input).await {
                Ok(created) => created,
                Err(err) => {
                    tracing::error!(label, %err, "key blob creation failed in migration");
                    return (MigrationStatus::FailedInput, None);
                }
            };
        let credential_secret = match key_blobs.derive_uss_credential_secret() {
            Ok(secret) => secret,
            Err(err) => {
                tracing::error!(label, %err, "credential secret derivation failed");
                return (MigrationStatus::FailedInput, None);
            }
        };

        // A retried migration may have left a wrapping behind; replace it.
        if stash.has_wrapped_main_key(&label) {
            let _ = stash.remove_wrapped_main_key(&label);
        }
        if let Err(err) = stash.add_wrapped_main_key(&main_key, &label, &credential_secret) {
            tracing::error!(label, %err, "cannot wrap main key for migrated factor");
            return (MigrationStatus::FailedPersist, None);
        }
        if factor_type.needs_reset_secret() {
            if let Some(reset_secret) = &key_blobs.reset_secret {
                stash.remove_reset_secret_for_label(&label);
                if let Err(err) = stash.set_reset_secret_for_label(&label, reset_secret.clone()) {
                    tracing::error!(label, %err, "cannot record reset secret for migrated factor");
                    return (MigrationStatus::FailedPersist, None);
                }
            }
        }

        let factor = AuthFactor::new(factor_type, label.clone(), metadata, block_state);

        // Factor file before the stash container; a crash in between
        // leaves a dangling factor, not a stash naming a missing one.
        if let Err(err) = self.auth_factor_manager.save_auth_factor(self.user, &factor) {
            tracing::error!(label, %err, "cannot persist migrated auth factor");
            return (MigrationStatus::FailedPersist, None);
        }
        let container = match stash.to_encrypted_container(&main_key) {
            Ok(container) => container,
            Err(err) => {
                tracing::error!(label, %err, "cannot serialize stash after migration");
                return (MigrationStatus::FailedPersist, None);
            }
        };
        if let Err(err) = self.uss_storage.persist(&container, self.user) {
            tracing::error!(label, %err, "cannot persist stash after migration");
            return (MigrationStatus::FailedPersist, None);
        }

        let outcome = MigrationOutcome {
            stash,
            main_key,
            factor,
        };

        // The keyset becomes the factor's backup: re-wrap it with the
        // new key blobs and state so both stores open with the same
        // credential, then mark it migrated.
        let mut recorded = match self.keyset_management.update_keyset(
            self.user,
            vault_keyset,
            &key_blobs,
            outcome.factor.block_state.clone(),
            true,
        ) {
            Ok(keyset) => keyset,
            Err(err) => {
                // The stash entry is live; the keyset will just be
                // migrated again next time.
                tracing::error!(label, %err, "cannot rewrap keyset as a backup");
                return (MigrationStatus::FailedRecordingMigrated, Some(outcome));
            }
        };
        recorded.mark_migrated();
        if let Err(err) = self.keyset_management.save(self.user, &recorded) {
            tracing::error!(label, %err, "cannot mark keyset as migrated");
            return (MigrationStatus::FailedRecordingMigrated, Some(outcome));
        }

        tracing::info!(label, "migrated vault keyset to the user secret stash");
        (MigrationStatus::Success, Some(outcome))
    }
}
