//! Fingerprint block
//!
//! Templates are enrolled and matched through the biometrics service;
//! lockout is enforced by a PinWeaver rate-limiter credential shared
//! across all of the user's fingerprint templates, with a per-factor-type
//! reset secret. The wrapping key derives from the one-shot secret the
//! biometrics stack releases on a successful match.

use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, AES_BLOCK_SIZE, DEFAULT_KEY_SIZE};
use homevault_core::{
    AuthBlockState, AuthInput, Error, ErrorAction, ErrorKind, FingerprintState, KeyBlobs, Result,
    SecretBytes,
};
use homevault_hwsec::{OperationPolicy, SecureElement};

use crate::bio::BiometricsService;
use crate::block::AuthBlock;
use crate::pin_weaver::default_delay_schedule;

const FINGERPRINT_VKK_INFO: &[u8] = b"fingerprint_vkk_key";
const FEK_IV_INFO: &[u8] = b"fingerprint_fek_iv";
const CHAPS_IV_INFO: &[u8] = b"fingerprint_chaps_iv";

pub struct FingerprintBlock {
    element: Arc<dyn SecureElement>,
    bio_service: Arc<BiometricsService>,
}

impl FingerprintBlock {
    pub fn new(element: Arc<dyn SecureElement>, bio_service: Arc<BiometricsService>) -> Self {
        Self {
            element,
            bio_service,
        }
    }

    fn blobs_from_match(
        auth_secret: &SecretBytes,
        auth_pin: &SecretBytes,
        record_id: &str,
    ) -> Result<KeyBlobs> {
        let vkk_key = crypto::hkdf_sha256(
            SecretBytes::combine(auth_secret, auth_pin).as_slice(),
            FINGERPRINT_VKK_INFO,
            record_id.as_bytes(),
            DEFAULT_KEY_SIZE,
        )?;
        let fek_iv = crypto::hkdf_sha256(vkk_key.as_slice(), FEK_IV_INFO, &[], AES_BLOCK_SIZE)?;
        let chaps_iv =
            crypto::hkdf_sha256(vkk_key.as_slice(), CHAPS_IV_INFO, &[], AES_BLOCK_SIZE)?;
        Ok(KeyBlobs {
            vkk_key: Some(vkk_key),
            vkk_iv: Some(fek_iv.as_slice().to_vec()),
            chaps_iv: Some(chaps_iv.as_slice().to_vec()),
            reset_secret: None,
            rate_limiter_label: None,
        })
    }
}

#[async_trait]
impl AuthBlock for FingerprintBlock {
    fn is_supported(&self) -> Result<()> {
        if !self.element.is_ready() || !self.element.is_pinweaver_enabled() {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                "secure element cannot back a fingerprint rate-limiter",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        if !self.bio_service.is_ready() {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                "biometrics service is not ready",
            )
            .with_action(ErrorAction::Retry));
        }
        Ok(())
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let obfuscated_username = input.obfuscated_username.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing obfuscated username")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;

        // Reuse the user's rate-limiter credential or mint one. The reset
        // secret travels with a freshly minted limiter so the caller can
        // record it next to the limiter id.
        let (rate_limiter_label, created_limiter, reset_secret) = match input.rate_limiter_label {
            Some(label) => {
                let reset_secret = input.reset_secret.clone().ok_or_else(|| {
                    Error::new(
                        ErrorKind::BackingStoreFailure,
                        "rate-limiter exists without its reset secret",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                })?;
                (label, false, reset_secret)
            }
            None => {
                let reset_secret = input
                    .reset_secret
                    .clone()
                    .unwrap_or_else(|| crypto::random_secret(DEFAULT_KEY_SIZE));
                let policies = [
                    OperationPolicy::default(),
                    OperationPolicy::for_user(obfuscated_username.as_str()),
                ];
                let label = self
                    .element
                    .pw_insert(
                        &policies,
                        &crypto::random_secret(DEFAULT_KEY_SIZE),
                        &crypto::random_secret(DEFAULT_KEY_SIZE),
                        &reset_secret,
                        &default_delay_schedule(),
                        None,
                    )
                    .map_err(|e| e.into_core("rate-limiter insert"))?;
                (label, true, reset_secret)
            }
        };

        let enrolled = self.bio_service.create_credential(obfuscated_username).await?;
        let mut blobs =
            Self::blobs_from_match(&enrolled.auth_secret, &enrolled.auth_pin, &enrolled.record_id)?;
        blobs.reset_secret = Some(reset_secret);
        blobs.rate_limiter_label = created_limiter.then_some(rate_limiter_label);

        let state = FingerprintState {
            template_id: enrolled.record_id,
            gsc_secret_label: Some(rate_limiter_label),
        };
        Ok((AuthBlockState::Fingerprint(state), blobs))
    }

    async fn derive(&self, _input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let AuthBlockState::Fingerprint(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not fingerprint",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        let matched = self.bio_service.match_credential().await?;
        if matched.record_id != state.template_id {
            return Err(Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "matched template belongs to a different factor",
            )
            .with_action(ErrorAction::Auth));
        }
        Self::blobs_from_match(&matched.auth_secret, &matched.auth_pin, &matched.record_id)
    }

    async fn prepare_for_removal(&self, state: &AuthBlockState) -> Result<()> {
        let AuthBlockState::Fingerprint(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not fingerprint",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        // The rate-limiter is shared across templates and stays. Only the
        // template itself is deleted.
        match self.bio_service.delete_credential(&state.template_id).await {
            crate::bio::DeleteResult::Deleted | crate::bio::DeleteResult::NotFound => Ok(()),
            crate::bio::DeleteResult::Failed => Err(Error::new(
                ErrorKind::RemoveCredentialsFailed,
                "deleting the fingerprint template failed",
            )
            .with_action(ErrorAction::Retry)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{OperationInput, SoftBiometricsProcessor};
    use homevault_core::Username;

    fn setup() -> (
        FingerprintBlock,
        Arc<BiometricsService>,
        Arc<homevault_hwsec::SoftSecureElement>,
    ) {
        let element = Arc::new(homevault_hwsec::SoftSecureElement::new());
        let bio_service = Arc::new(BiometricsService::new(Arc::new(
            SoftBiometricsProcessor::new(),
        )));
        (
            FingerprintBlock::new(element.clone(), bio_service.clone()),
            bio_service,
            element,
        )
    }

    fn create_input() -> AuthInput {
        AuthInput {
            obfuscated_username: Some(Username::new("alice@x").obfuscate()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn enroll_then_match_reproduces_key() {
        let (block, bio_service, _) = setup();
        let user = Username::new("alice@x").obfuscate();

        let mut enroll_token = bio_service
            .start_enroll_session(
                homevault_core::AuthFactorType::Fingerprint,
                OperationInput::default(),
            )
            .await
            .unwrap();
        let (state, created) = block.create(&create_input()).await.unwrap();
        enroll_token.terminate().unwrap();
        // A fresh limiter came back with its reset secret.
        assert!(created.rate_limiter_label.is_some());
        assert!(created.reset_secret.is_some());

        let mut auth_token = bio_service
            .start_authenticate_session(
                homevault_core::AuthFactorType::Fingerprint,
                &user,
                OperationInput::default(),
            )
            .await
            .unwrap();
        let derived = block.derive(&AuthInput::default(), &state).await.unwrap();
        auth_token.terminate().unwrap();
        assert_eq!(created.vkk_key, derived.vkk_key);
    }

    #[tokio::test]
    async fn existing_rate_limiter_requires_reset_secret() {
        let (block, bio_service, _) = setup();
        let mut input = create_input();
        input.rate_limiter_label = Some(77);

        let mut enroll_token = bio_service
            .start_enroll_session(
                homevault_core::AuthFactorType::Fingerprint,
                OperationInput::default(),
            )
            .await
            .unwrap();
        let err = block.create(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackingStoreFailure);
        enroll_token.terminate().unwrap();
    }

    #[tokio::test]
    async fn reused_rate_limiter_is_not_reallocated() {
        let (block, bio_service, _) = setup();
        let mut input = create_input();
        input.rate_limiter_label = Some(77);
        input.reset_secret = Some(crypto::random_secret(32));

        let mut enroll_token = bio_service
            .start_enroll_session(
                homevault_core::AuthFactorType::Fingerprint,
                OperationInput::default(),
            )
            .await
            .unwrap();
        let (state, blobs) = block.create(&input).await.unwrap();
        enroll_token.terminate().unwrap();

        assert_eq!(blobs.rate_limiter_label, None);
        let AuthBlockState::Fingerprint(fp_state) = &state else {
            unreachable!()
        };
        assert_eq!(fp_state.gsc_secret_label, Some(77));
    }
}
