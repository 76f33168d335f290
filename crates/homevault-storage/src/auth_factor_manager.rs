//! Auth factor persistence
//!
//! One file per `(user, label)`. The ordering rule for stash-backed
//! factors is enforced by the caller: factor file first, then the stash
//! container, so a crash leaves at worst a dangling factor file rather
//! than a stash referencing an absent factor.

use std::sync::Arc;

use homevault_blocks::AuthBlockDispatcher;
use homevault_core::factor::is_valid_label;
use homevault_core::{AuthFactor, Error, ErrorKind, ObfuscatedUsername, Result};

use crate::layout::{atomic_write, StorageLayout};

pub struct AuthFactorManager {
    layout: Arc<StorageLayout>,
}

impl AuthFactorManager {
    pub fn new(layout: Arc<StorageLayout>) -> Self {
        Self { layout }
    }

    pub fn save_auth_factor(&self, user: &ObfuscatedUsername, factor: &AuthFactor) -> Result<()> {
        if !is_valid_label(&factor.label) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid auth factor label {:?}", factor.label),
            ));
        }
        let bytes = serde_json::to_vec_pretty(factor)?;
        atomic_write(&self.layout.auth_factor_path(user, &factor.label), &bytes)?;
        tracing::info!(%user, label = factor.label, "saved auth factor");
        Ok(())
    }

    pub fn load_auth_factor(&self, user: &ObfuscatedUsername, label: &str) -> Result<AuthFactor> {
        let path = self.layout.auth_factor_path(user, label);
        let bytes = std::fs::read(&path).map_err(|_| {
            Error::new(
                ErrorKind::KeyNotFound,
                format!("no auth factor with label {label}"),
            )
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All factors persisted for the user. Unreadable files are skipped
    /// with a log line; one corrupt factor must not take down the rest.
    pub fn list_auth_factors(&self, user: &ObfuscatedUsername) -> Vec<AuthFactor> {
        let dir = self.layout.auth_factors_dir(user);
        let mut factors = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return factors,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path).map_err(Error::from).and_then(|bytes| {
                serde_json::from_slice::<AuthFactor>(&bytes).map_err(Error::from)
            }) {
                Ok(factor) => factors.push(factor),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable auth factor");
                }
            }
        }
        factors.sort_by(|a, b| a.label.cmp(&b.label));
        factors
    }

    /// Atomic replace: the temp-and-rename write means a failed update
    /// leaves the previous factor intact.
    pub fn update_auth_factor(
        &self,
        user: &ObfuscatedUsername,
        label: &str,
        factor: &AuthFactor,
    ) -> Result<()> {
        if factor.label != label {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "updated factor must keep its label",
            ));
        }
        if !self.layout.auth_factor_path(user, label).is_file() {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                format!("no auth factor with label {label}"),
            ));
        }
        self.save_auth_factor(user, factor)
    }

    /// Release the factor's hardware state, then delete its file. The
    /// hardware step runs first: a file we cannot delete is retryable, a
    /// leaked secure-element credential is not.
    pub async fn remove_auth_factor(
        &self,
        user: &ObfuscatedUsername,
        factor: &AuthFactor,
        dispatcher: &AuthBlockDispatcher,
    ) -> Result<()> {
        dispatcher.prepare_for_removal(&factor.block_state).await?;
        let path = self.layout.auth_factor_path(user, &factor.label);
        std::fs::remove_file(&path).map_err(|e| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                format!("cannot remove auth factor {}: {e}", path.display()),
            )
        })?;
        tracing::info!(%user, label = factor.label, "removed auth factor");
        Ok(())
    }
}
