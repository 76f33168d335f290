//! Shared credential verifier cache
//!
//! Holds, per user, the lightweight verifiers registered by sessions:
//! one per label plus optionally one label-less verifier per factor
//! type. Verify-only sessions consult this cache instead of doing a
//! secure-element round trip. Also parks the WebAuthn secret derived on
//! a successful decrypt authentication.

use std::collections::HashMap;
use std::sync::Arc;

use homevault_blocks::CredentialVerifier;
use homevault_core::crypto;
use homevault_core::{AuthFactorType, ObfuscatedUsername, SecretBytes};
use parking_lot::Mutex;

const WEBAUTHN_SECRET_HMAC_MESSAGE: &[u8] = b"AuthTimeWebAuthnSecret";

#[derive(Default)]
struct UserVerifiers {
    by_label: HashMap<String, Arc<dyn CredentialVerifier>>,
    by_type: HashMap<AuthFactorType, Arc<dyn CredentialVerifier>>,
    webauthn_secret: Option<SecretBytes>,
}

/// Process-wide cache, shared by all sessions.
#[derive(Default)]
pub struct VerifierCache {
    users: Mutex<HashMap<ObfuscatedUsername, UserVerifiers>>,
}

impl VerifierCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any verifier is registered for the user; used to treat a
    /// user with live verifiers as existing even without a home
    /// directory (ephemeral users).
    pub fn has_user(&self, user: &ObfuscatedUsername) -> bool {
        self.users.lock().contains_key(user)
    }

    pub fn add_verifier(&self, user: &ObfuscatedUsername, verifier: Arc<dyn CredentialVerifier>) {
        let mut users = self.users.lock();
        let entry = users.entry(user.clone()).or_default();
        match verifier.label() {
            Some(label) => {
                entry.by_label.insert(label.to_string(), verifier);
            }
            None => {
                entry.by_type.insert(verifier.factor_type(), verifier);
            }
        }
    }

    pub fn find_by_label(
        &self,
        user: &ObfuscatedUsername,
        label: &str,
    ) -> Option<Arc<dyn CredentialVerifier>> {
        self.users.lock().get(user)?.by_label.get(label).cloned()
    }

    pub fn find_by_type(
        &self,
        user: &ObfuscatedUsername,
        factor_type: AuthFactorType,
    ) -> Option<Arc<dyn CredentialVerifier>> {
        self.users.lock().get(user)?.by_type.get(&factor_type).cloned()
    }

    pub fn has_verifier_for_label(&self, user: &ObfuscatedUsername, label: &str) -> bool {
        self.find_by_label(user, label).is_some()
    }

    pub fn remove_verifier_for_label(&self, user: &ObfuscatedUsername, label: &str) {
        if let Some(entry) = self.users.lock().get_mut(user) {
            entry.by_label.remove(label);
        }
    }

    pub fn remove_verifier_for_type(&self, user: &ObfuscatedUsername, factor_type: AuthFactorType) {
        if let Some(entry) = self.users.lock().get_mut(user) {
            entry.by_type.remove(&factor_type);
        }
    }

    /// Derive and park the WebAuthn secret from the filesystem keys.
    pub fn prepare_webauthn_secret(
        &self,
        user: &ObfuscatedUsername,
        fek: &SecretBytes,
        fnek: &SecretBytes,
    ) {
        let secret = crypto::hmac_sha256(
            SecretBytes::combine(fnek, fek).as_slice(),
            WEBAUTHN_SECRET_HMAC_MESSAGE,
        );
        let mut users = self.users.lock();
        users.entry(user.clone()).or_default().webauthn_secret = Some(secret);
    }

    /// One-shot read of the parked WebAuthn secret.
    pub fn take_webauthn_secret(&self, user: &ObfuscatedUsername) -> Option<SecretBytes> {
        self.users.lock().get_mut(user)?.webauthn_secret.take()
    }

    pub fn drop_user(&self, user: &ObfuscatedUsername) {
        self.users.lock().remove(user);
    }
}
