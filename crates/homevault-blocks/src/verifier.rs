//! Credential verifiers
//!
//! Lightweight re-authentication for verify-only intents: a verifier
//! carries just enough derived material to compare a supplied secret
//! against the last known-good one. It has no access to the filesystem
//! keyset and never touches the secure element.

use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, DEFAULT_KEY_SIZE, DEFAULT_SALT_SIZE};
use homevault_core::{
    AuthFactorType, AuthInput, Error, ErrorAction, ErrorKind, Result, SecretBytes,
};
use subtle::ConstantTimeEq;

use crate::bio::BiometricsService;

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Label of the factor this verifier covers; `None` for the
    /// label-less per-type verifiers (legacy fingerprint).
    fn label(&self) -> Option<&str>;

    fn factor_type(&self) -> AuthFactorType;

    /// Contract: given the same `AuthInput` that last authenticated,
    /// return `Ok`.
    async fn verify(&self, input: &AuthInput) -> Result<()>;
}

/// Verifier for knowledge factors: stores a scrypt digest of the secret.
pub struct ScryptVerifier {
    label: String,
    factor_type: AuthFactorType,
    salt: Vec<u8>,
    digest: SecretBytes,
}

impl ScryptVerifier {
    pub fn new(
        label: impl Into<String>,
        factor_type: AuthFactorType,
        secret: &SecretBytes,
    ) -> Result<Self> {
        let salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let digest = Self::digest(secret, &salt)?;
        Ok(Self {
            label: label.into(),
            factor_type,
            salt,
            digest,
        })
    }

    fn digest(secret: &SecretBytes, salt: &[u8]) -> Result<SecretBytes> {
        let mut derived =
            crypto::derive_secrets_scrypt(secret.as_slice(), salt, &[DEFAULT_KEY_SIZE])?;
        Ok(derived.remove(0))
    }
}

#[async_trait]
impl CredentialVerifier for ScryptVerifier {
    fn label(&self) -> Option<&str> {
        Some(&self.label)
    }

    fn factor_type(&self) -> AuthFactorType {
        self.factor_type
    }

    async fn verify(&self, input: &AuthInput) -> Result<()> {
        let secret = input.user_input.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing user input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let candidate = Self::digest(secret, &self.salt)?;
        let matches: bool = candidate
            .as_slice()
            .ct_eq(self.digest.as_slice())
            .into();
        if !matches {
            return Err(Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "credential did not match the cached verifier",
            )
            .with_action(ErrorAction::Auth));
        }
        Ok(())
    }
}

/// Label-less verifier for legacy fingerprints: defers to an active
/// biometrics authenticate session.
pub struct LegacyFingerprintVerifier {
    bio_service: Arc<BiometricsService>,
}

impl LegacyFingerprintVerifier {
    pub fn new(bio_service: Arc<BiometricsService>) -> Self {
        Self { bio_service }
    }
}

#[async_trait]
impl CredentialVerifier for LegacyFingerprintVerifier {
    fn label(&self) -> Option<&str> {
        None
    }

    fn factor_type(&self) -> AuthFactorType {
        AuthFactorType::LegacyFingerprint
    }

    async fn verify(&self, _input: &AuthInput) -> Result<()> {
        self.bio_service.match_credential().await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn verifier_accepts_the_same_secret() {
        let secret = SecretBytes::from("hunter2");
        let verifier =
            ScryptVerifier::new("legacy-0", AuthFactorType::Password, &secret).unwrap();
        let input = AuthInput {
            user_input: Some(secret),
            ..Default::default()
        };
        verifier.verify(&input).await.unwrap();
    }

    #[tokio::test]
    async fn verifier_rejects_a_different_secret() {
        let verifier = ScryptVerifier::new(
            "legacy-0",
            AuthFactorType::Password,
            &SecretBytes::from("hunter2"),
        )
        .unwrap();
        let input = AuthInput {
            user_input: Some(SecretBytes::from("letmein")),
            ..Default::default()
        };
        let err = verifier.verify(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
    }
}
