//! Block selection and dispatch
//!
//! Chooses the auth block for a factor type (on create, by environment
//! capability) or for a stored state (on derive), and fronts the
//! prepare/terminate flows for factor types that need an out-of-band
//! hardware session.

use std::sync::Arc;

use homevault_core::{
    AuthBlockState, AuthFactorType, AuthInput, AuthIntent, Error, ErrorAction, ErrorKind,
    KeyBlobs, ObfuscatedUsername, RecoveryState, Result,
};
use homevault_hwsec::SecureElement;

use crate::bio::{BiometricsService, OperationInput};
use crate::block::{AuthBlock, AuthBlockKind};
use crate::challenge::{ChallengeCredentialBlock, KeyDelegate};
use crate::fingerprint::FingerprintBlock;
use crate::password::PasswordScryptBlock;
use crate::pin_weaver::PinWeaverBlock;
use crate::prepare::PreparedAuthFactorToken;
use crate::recovery::CryptohomeRecoveryBlock;
use crate::tpm::{DoubleWrappedCompatBlock, TpmBoundToPcrBlock, TpmNotBoundToPcrBlock};
use crate::verifier::{CredentialVerifier, LegacyFingerprintVerifier, ScryptVerifier};

/// Why a factor is being prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreparePurpose {
    AuthenticateAuthFactor,
    AddAuthFactor,
}

pub struct AuthBlockDispatcher {
    element: Arc<dyn SecureElement>,
    bio_service: Option<Arc<BiometricsService>>,
    key_delegate: Option<Arc<dyn KeyDelegate>>,
    locked_to_single_user: bool,
}

impl AuthBlockDispatcher {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self {
            element,
            bio_service: None,
            key_delegate: None,
            locked_to_single_user: false,
        }
    }

    pub fn with_bio_service(mut self, bio_service: Arc<BiometricsService>) -> Self {
        self.bio_service = Some(bio_service);
        self
    }

    pub fn with_key_delegate(mut self, key_delegate: Arc<dyn KeyDelegate>) -> Self {
        self.key_delegate = Some(key_delegate);
        self
    }

    pub fn with_locked_to_single_user(mut self, locked: bool) -> Self {
        self.locked_to_single_user = locked;
        self
    }

    pub fn locked_to_single_user(&self) -> bool {
        self.locked_to_single_user
    }

    pub fn element(&self) -> &Arc<dyn SecureElement> {
        &self.element
    }

    pub fn bio_service(&self) -> Option<&Arc<BiometricsService>> {
        self.bio_service.as_ref()
    }

    /// Preferred block for a new factor of the given type, by
    /// environment capability.
    pub fn kind_for_creation(&self, factor_type: AuthFactorType) -> Result<AuthBlockKind> {
        let candidates: &[AuthBlockKind] = match factor_type {
            AuthFactorType::Password | AuthFactorType::Kiosk => &[
                AuthBlockKind::TpmBoundToPcr,
                AuthBlockKind::TpmNotBoundToPcr,
                AuthBlockKind::PasswordScrypt,
            ],
            AuthFactorType::Pin => &[AuthBlockKind::PinWeaver],
            AuthFactorType::CryptohomeRecovery => &[AuthBlockKind::CryptohomeRecovery],
            AuthFactorType::SmartCard => &[AuthBlockKind::ChallengeCredential],
            AuthFactorType::Fingerprint => &[AuthBlockKind::Fingerprint],
            AuthFactorType::LegacyFingerprint => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "legacy fingerprints cannot be newly created",
                ));
            }
        };

        let mut last_error = None;
        for kind in candidates {
            match self.block_for_kind(*kind) {
                Ok(block) => match block.is_supported() {
                    Ok(()) => return Ok(*kind),
                    Err(err) => last_error = Some(err),
                },
                Err(err) => last_error = Some(err),
            }
        }
        Err(Error::new(
            ErrorKind::BackingStoreFailure,
            format!("no usable auth block for factor type {factor_type}"),
        )
        .with_action(ErrorAction::DevCheckUnexpectedState)
        .wrap(last_error.unwrap_or_else(|| {
            Error::new(ErrorKind::NotImplemented, "no candidate blocks")
        })))
    }

    pub fn block_for_kind(&self, kind: AuthBlockKind) -> Result<Box<dyn AuthBlock>> {
        match kind {
            AuthBlockKind::PasswordScrypt => Ok(Box::new(PasswordScryptBlock::new())),
            AuthBlockKind::TpmBoundToPcr => {
                Ok(Box::new(TpmBoundToPcrBlock::new(self.element.clone())))
            }
            AuthBlockKind::TpmNotBoundToPcr => {
                Ok(Box::new(TpmNotBoundToPcrBlock::new(self.element.clone())))
            }
            AuthBlockKind::DoubleWrappedCompat => {
                Ok(Box::new(DoubleWrappedCompatBlock::new(self.element.clone())))
            }
            AuthBlockKind::PinWeaver => Ok(Box::new(PinWeaverBlock::new(self.element.clone()))),
            AuthBlockKind::CryptohomeRecovery => {
                Ok(Box::new(CryptohomeRecoveryBlock::new(self.element.clone())))
            }
            AuthBlockKind::ChallengeCredential => {
                let delegate = self.key_delegate.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorKind::BackingStoreFailure,
                        "no key delegate configured for challenge credentials",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                })?;
                Ok(Box::new(ChallengeCredentialBlock::new(delegate.clone())))
            }
            AuthBlockKind::Fingerprint => {
                let bio_service = self.bio_service.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorKind::BackingStoreFailure,
                        "no biometrics service configured",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                })?;
                Ok(Box::new(FingerprintBlock::new(
                    self.element.clone(),
                    bio_service.clone(),
                )))
            }
        }
    }

    pub async fn create_key_blobs(
        &self,
        kind: AuthBlockKind,
        input: &AuthInput,
    ) -> Result<(AuthBlockState, KeyBlobs)> {
        self.block_for_kind(kind)?.create(input).await
    }

    pub async fn derive_key_blobs(
        &self,
        input: &AuthInput,
        state: &AuthBlockState,
    ) -> Result<KeyBlobs> {
        let kind = AuthBlockKind::from_state(state);
        self.block_for_kind(kind)?.derive(input, state).await
    }

    pub async fn prepare_for_removal(&self, state: &AuthBlockState) -> Result<()> {
        let kind = AuthBlockKind::from_state(state);
        self.block_for_kind(kind)?.prepare_for_removal(state).await
    }

    /// Whether this factor type needs `prepare_auth_factor` before use.
    pub fn is_prepare_required(&self, factor_type: AuthFactorType) -> bool {
        factor_type.requires_prepare()
    }

    /// Open the out-of-band session backing a prepared factor.
    pub async fn prepare_auth_factor(
        &self,
        factor_type: AuthFactorType,
        purpose: PreparePurpose,
        user: &ObfuscatedUsername,
    ) -> Result<Box<dyn PreparedAuthFactorToken>> {
        if !self.is_prepare_required(factor_type) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("factor type {factor_type} does not support prepare"),
            )
            .with_action(ErrorAction::Retry));
        }
        let bio_service = self.bio_service.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                "no biometrics service configured",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;

        let nonce = bio_service.get_nonce().await?;
        let input = OperationInput {
            nonce,
            ..Default::default()
        };
        match purpose {
            PreparePurpose::AddAuthFactor => {
                bio_service.start_enroll_session(factor_type, input).await
            }
            PreparePurpose::AuthenticateAuthFactor => {
                bio_service
                    .start_authenticate_session(factor_type, user, input)
                    .await
            }
        }
    }

    /// Lightweight verification support per intent and factor type.
    pub fn is_verify_supported(&self, intent: AuthIntent, factor_type: AuthFactorType) -> bool {
        match intent {
            AuthIntent::VerifyOnly => matches!(
                factor_type,
                AuthFactorType::Password
                    | AuthFactorType::Kiosk
                    | AuthFactorType::LegacyFingerprint
            ),
            AuthIntent::WebAuthn => matches!(factor_type, AuthFactorType::LegacyFingerprint),
            AuthIntent::Decrypt => false,
        }
    }

    /// Build the cached verifier for a factor, if its type supports one.
    pub fn create_credential_verifier(
        &self,
        factor_type: AuthFactorType,
        label: &str,
        input: &AuthInput,
    ) -> Option<Box<dyn CredentialVerifier>> {
        match factor_type {
            AuthFactorType::Password | AuthFactorType::Kiosk => {
                let secret = input.user_input.as_ref()?;
                match ScryptVerifier::new(label, factor_type, secret) {
                    Ok(verifier) => Some(Box::new(verifier)),
                    Err(err) => {
                        tracing::warn!(%err, label, "failed to build credential verifier");
                        None
                    }
                }
            }
            AuthFactorType::LegacyFingerprint => {
                let bio_service = self.bio_service.as_ref()?;
                Some(Box::new(LegacyFingerprintVerifier::new(bio_service.clone())))
            }
            _ => None,
        }
    }

    /// Build the byte blob shipped to the off-device recovery mediator.
    pub fn generate_recovery_request(
        &self,
        state: &RecoveryState,
        epoch_response: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let result = self
            .element
            .recovery_generate_request(&state.hsm_payload, &state.channel_pub_key, epoch_response)
            .map_err(|e| e.into_core("recovery request generation"))?;
        Ok((result.recovery_request, result.ephemeral_pub_key))
    }
}
