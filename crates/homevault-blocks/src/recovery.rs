//! Cryptohome-recovery block
//!
//! Stateless compute around the off-device recovery mediator. `create`
//! mints the on-device pieces through the element's recovery frontend;
//! `derive` takes the mediator's decrypted response and recombines the
//! shares into the wrapping key. When the element supports it, the
//! derived key is additionally revocation-wrapped.

use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, AES_BLOCK_SIZE, DEFAULT_KEY_SIZE};
use homevault_core::{
    AuthBlockState, AuthInput, Error, ErrorAction, ErrorKind, KeyBlobs, RecoveryState, Result,
    SecretBytes,
};
use homevault_hwsec::{RecoveryRecoverInput, SecureElement};

use crate::block::AuthBlock;
use crate::revocation;

const RECOVERY_VKK_INFO: &[u8] = b"recovery_vkk_key";
const FEK_IV_INFO: &[u8] = b"recovery_fek_iv";
const CHAPS_IV_INFO: &[u8] = b"recovery_chaps_iv";

pub struct CryptohomeRecoveryBlock {
    element: Arc<dyn SecureElement>,
}

impl CryptohomeRecoveryBlock {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self { element }
    }

    fn blobs_from_recovery_key(&self, recovery_key: &SecretBytes) -> Result<KeyBlobs> {
        let vkk_key = crypto::hkdf_sha256(
            recovery_key.as_slice(),
            RECOVERY_VKK_INFO,
            &[],
            DEFAULT_KEY_SIZE,
        )?;
        let fek_iv =
            crypto::hkdf_sha256(vkk_key.as_slice(), FEK_IV_INFO, &[], AES_BLOCK_SIZE)?;
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
impl AuthBlock for CryptohomeRecoveryBlock {
    fn is_supported(&self) -> Result<()> {
        if !self.element.is_ready() {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                "secure element is not ready",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        Ok(())
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let recovery_input = input.recovery.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing recovery input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        if recovery_input.mediator_pub_key.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "missing mediator public key",
            ));
        }

        let created = self
            .element
            .recovery_create(&recovery_input.mediator_pub_key)
            .map_err(|e| e.into_core("recovery create"))?;
        let mut blobs = self.blobs_from_recovery_key(&created.recovery_key)?;

        let revocation_state = if revocation::is_revocation_supported(self.element.as_ref()) {
            Some(revocation::create(self.element.as_ref(), &mut blobs)?)
        } else {
            None
        };

        let state = RecoveryState {
            hsm_payload: created.hsm_payload,
            plaintext_destination_share: created.plaintext_destination_share,
            channel_pub_key: created.channel_pub_key,
            encrypted_channel_priv_key: created.encrypted_channel_priv_key,
            revocation_state,
        };
        Ok((AuthBlockState::CryptohomeRecovery(state), blobs))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let recovery_input = input.recovery.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing recovery input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let AuthBlockState::CryptohomeRecovery(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not cryptohome-recovery",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        if recovery_input.recovery_response.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "missing mediator response",
            ));
        }

        let recovery_key = self
            .element
            .recovery_recover(RecoveryRecoverInput {
                plaintext_destination_share: &state.plaintext_destination_share,
                encrypted_channel_priv_key: &state.encrypted_channel_priv_key,
                epoch_response: &recovery_input.epoch_response,
                recovery_response: &recovery_input.recovery_response,
                ephemeral_pub_key: &recovery_input.ephemeral_pub_key,
            })
            .map_err(|e| e.into_core("recovery recover"))?;
        let mut blobs = self.blobs_from_recovery_key(&recovery_key)?;

        if let Some(revocation_state) = &state.revocation_state {
            revocation::derive(self.element.as_ref(), revocation_state, &mut blobs)?;
        }
        Ok(blobs)
    }

    async fn prepare_for_removal(&self, state: &AuthBlockState) -> Result<()> {
        let AuthBlockState::CryptohomeRecovery(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not cryptohome-recovery",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        if let Some(revocation_state) = &state.revocation_state {
            revocation::revoke(self.element.as_ref(), revocation_state)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homevault_core::RecoveryAuthInput;
    use homevault_hwsec::SoftSecureElement;

    fn create_input(mediator_pub_key: &[u8]) -> AuthInput {
        AuthInput {
            recovery: Some(RecoveryAuthInput {
                mediator_pub_key: mediator_pub_key.to_vec(),
                user_gaia_id: "gaia-1".into(),
                device_user_id: "device-1".into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_mediated_round_trip() {
        let element = Arc::new(SoftSecureElement::new());
        let block = CryptohomeRecoveryBlock::new(element.clone());
        let mediator_pub_key = crypto::random_bytes(32);

        let (state, created) = block.create(&create_input(&mediator_pub_key)).await.unwrap();
        let AuthBlockState::CryptohomeRecovery(recovery_state) = &state else {
            unreachable!()
        };

        // Shuttle the request through the simulated mediator.
        let epoch_response = b"epoch-1".to_vec();
        let request = element
            .recovery_generate_request(
                &recovery_state.hsm_payload,
                &recovery_state.channel_pub_key,
                &epoch_response,
            )
            .unwrap();
        let response =
            SoftSecureElement::simulate_mediation(&mediator_pub_key, &request.recovery_request)
                .unwrap();

        let derive_input = AuthInput {
            recovery: Some(RecoveryAuthInput {
                epoch_response,
                recovery_response: response,
                ephemeral_pub_key: request.ephemeral_pub_key,
                ..Default::default()
            }),
            ..Default::default()
        };
        let derived = block.derive(&derive_input, &state).await.unwrap();
        assert_eq!(created.vkk_key, derived.vkk_key);
    }

    #[tokio::test]
    async fn revoked_factor_cannot_derive() {
        let element = Arc::new(SoftSecureElement::new());
        let block = CryptohomeRecoveryBlock::new(element.clone());
        let mediator_pub_key = crypto::random_bytes(32);
        let (state, _) = block.create(&create_input(&mediator_pub_key)).await.unwrap();
        let AuthBlockState::CryptohomeRecovery(recovery_state) = &state else {
            unreachable!()
        };
        assert!(recovery_state.revocation_state.is_some());

        block.prepare_for_removal(&state).await.unwrap();

        let epoch_response = b"epoch-1".to_vec();
        let request = element
            .recovery_generate_request(
                &recovery_state.hsm_payload,
                &recovery_state.channel_pub_key,
                &epoch_response,
            )
            .unwrap();
        let response =
            SoftSecureElement::simulate_mediation(&mediator_pub_key, &request.recovery_request)
                .unwrap();
        let derive_input = AuthInput {
            recovery: Some(RecoveryAuthInput {
                epoch_response,
                recovery_response: response,
                ephemeral_pub_key: request.ephemeral_pub_key,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(block.derive(&derive_input, &state).await.is_err());
    }

    #[tokio::test]
    async fn create_requires_mediator_key() {
        let element = Arc::new(SoftSecureElement::new());
        let block = CryptohomeRecoveryBlock::new(element);
        let err = block.create(&create_input(&[])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
