//! PinWeaver-backed PIN block
//!
//! The PIN is stretched into a low-entropy secret checked by the secure
//! element, which enforces the delay schedule and hands back the
//! high-entropy secret on a match. Five wrong attempts lock the
//! credential forever.

use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, AES_BLOCK_SIZE, DEFAULT_KEY_SIZE, DEFAULT_SALT_SIZE};
use homevault_core::{
    AuthBlockState, AuthInput, Error, ErrorAction, ErrorKind, KeyBlobs, PinWeaverState, Result,
};
#[cfg(test)]
use homevault_core::SecretBytes;
use homevault_hwsec::{
    DelaySchedule, HwsecError, OperationPolicy, SecureElement, INFINITE_DELAY,
};

use crate::block::AuthBlock;

// HMAC message for deriving the vkk seed from the high-entropy secret.
const HE_SECRET_HMAC_DATA: &[u8] = b"vkk_seed";

/// Wrong attempts allowed before the permanent lockout.
pub const ATTEMPTS_LIMIT: u32 = 5;

/// Default schedule: five failed attempts, then locked forever.
pub fn default_delay_schedule() -> DelaySchedule {
    let mut schedule = DelaySchedule::new();
    schedule.insert(ATTEMPTS_LIMIT, INFINITE_DELAY);
    schedule
}

pub struct PinWeaverBlock {
    element: Arc<dyn SecureElement>,
}

impl PinWeaverBlock {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self { element }
    }

    fn is_locked(&self, label: u64) -> bool {
        match self.element.pw_get_delay_seconds(label) {
            Ok(delay) => delay == INFINITE_DELAY,
            Err(err) => {
                tracing::error!(label, %err, "failed to read credential delay");
                false
            }
        }
    }
}

#[async_trait]
impl AuthBlock for PinWeaverBlock {
    fn is_supported(&self) -> Result<()> {
        if !self.element.is_ready() {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                "secure element is not ready",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        if !self.element.is_pinweaver_enabled() {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                "secure element has no pinweaver support",
            )
            .with_action(ErrorAction::Auth));
        }
        Ok(())
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let user_input = input.user_input.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing user input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let obfuscated_username = input.obfuscated_username.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing obfuscated username")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        if input.reset_secret.is_none() && input.reset_seed.is_none() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "missing reset secret or reset seed",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }

        let reset_salt = input
            .reset_salt
            .clone()
            .unwrap_or_else(|| crypto::random_bytes(AES_BLOCK_SIZE));
        let reset_secret = match &input.reset_secret {
            // The stash world supplies the reset secret directly.
            Some(secret) => secret.clone(),
            // The keyset world derives it from the shared reset seed.
            None => crypto::hmac_sha256(
                &reset_salt,
                input.reset_seed.as_ref().map(|s| s.as_slice()).unwrap_or(&[]),
            ),
        };

        let salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let sub_keys = crypto::derive_secrets_scrypt(
            user_input.as_slice(),
            &salt,
            &[DEFAULT_KEY_SIZE, DEFAULT_KEY_SIZE],
        )?;
        let le_secret = &sub_keys[0];
        let kdf_skey = &sub_keys[1];

        // The high-entropy secret lives in the element; only a matching
        // low-entropy secret gets it back out.
        let he_secret = crypto::random_secret(DEFAULT_KEY_SIZE);
        let vkk_seed = crypto::hmac_sha256(he_secret.as_slice(), HE_SECRET_HMAC_DATA);
        let vkk_key = crypto::hmac_sha256(kdf_skey.as_slice(), vkk_seed.as_slice());

        let fek_iv = crypto::random_bytes(AES_BLOCK_SIZE);
        let chaps_iv = crypto::random_bytes(AES_BLOCK_SIZE);

        let policies = [
            OperationPolicy::default(),
            OperationPolicy::for_user(obfuscated_username.as_str()),
        ];
        let label = self
            .element
            .pw_insert(
                &policies,
                le_secret,
                &he_secret,
                &reset_secret,
                &default_delay_schedule(),
                None,
            )
            .map_err(|e| e.into_core("pinweaver credential insert"))?;

        let state = PinWeaverState {
            le_label: label,
            salt,
            chaps_iv: Some(chaps_iv.clone()),
            fek_iv: Some(fek_iv.clone()),
        };
        let blobs = KeyBlobs {
            vkk_key: Some(vkk_key),
            vkk_iv: Some(fek_iv),
            chaps_iv: Some(chaps_iv),
            reset_secret: Some(reset_secret),
            rate_limiter_label: None,
        };
        Ok((AuthBlockState::PinWeaver(state), blobs))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let user_input = input.user_input.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing user input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let AuthBlockState::PinWeaver(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not pinweaver",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };

        let sub_keys = crypto::derive_secrets_scrypt(
            user_input.as_slice(),
            &state.salt,
            &[DEFAULT_KEY_SIZE, DEFAULT_KEY_SIZE],
        )?;
        let le_secret = &sub_keys[0];
        let kdf_skey = &sub_keys[1];

        let check = match self.element.pw_check(state.le_label, le_secret) {
            Ok(check) => check,
            Err(err @ HwsecError::InvalidLeSecret) if self.is_locked(state.le_label) => {
                // Wrong secret and the schedule has run out: surface the
                // lockout, not the mismatch.
                return Err(Error::new(
                    ErrorKind::CredentialLocked,
                    "pin is locked out after too many wrong attempts",
                )
                .with_actions([ErrorAction::Auth, ErrorAction::LeLockedOut])
                .wrap(err.into_core("pinweaver credential check")));
            }
            Err(err) => return Err(err.into_core("pinweaver credential check")),
        };

        let vkk_seed = crypto::hmac_sha256(check.he_secret.as_slice(), HE_SECRET_HMAC_DATA);
        let vkk_key = crypto::hmac_sha256(kdf_skey.as_slice(), vkk_seed.as_slice());

        Ok(KeyBlobs {
            vkk_key: Some(vkk_key),
            vkk_iv: state.fek_iv.clone(),
            chaps_iv: state.chaps_iv.clone(),
            reset_secret: Some(check.reset_secret),
            rate_limiter_label: None,
        })
    }

    async fn prepare_for_removal(&self, state: &AuthBlockState) -> Result<()> {
        let AuthBlockState::PinWeaver(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not pinweaver",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        match self.element.pw_remove(state.le_label) {
            Ok(()) => Ok(()),
            Err(err) if err.is_success_for_removal() => {
                tracing::warn!(label = state.le_label, %err, "treating removal as success");
                Ok(())
            }
            Err(err) => Err(err.into_core("pinweaver credential removal")),
        }
    }
}
