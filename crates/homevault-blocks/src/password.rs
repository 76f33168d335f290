//! Scrypt-only password block
//!
//! One scrypt pass over the stored salt stretches the password into
//! `(aes_skey, kdf_skey)`; the wrapping key and the two IVs are then
//! HMAC/HKDF-derived so that `derive` reproduces `create` bit for bit
//! whenever the password matches.

use async_trait::async_trait;
use homevault_core::crypto::{
    self, AES_BLOCK_SIZE, DEFAULT_KEY_SIZE, DEFAULT_SALT_SIZE,
};
use homevault_core::{
    AuthBlockState, AuthInput, Error, ErrorAction, ErrorKind, KeyBlobs, PasswordScryptState,
    Result, SecretBytes,
};

use crate::block::AuthBlock;

const VKK_KEY_INFO: &[u8] = b"vkk_key";
const CHAPS_IV_INFO: &[u8] = b"chaps_iv";
const FEK_IV_INFO: &[u8] = b"fek_iv";

pub struct PasswordScryptBlock;

impl PasswordScryptBlock {
    pub fn new() -> Self {
        Self
    }

    pub(crate) fn random_state() -> PasswordScryptState {
        PasswordScryptState {
            salt: crypto::random_bytes(DEFAULT_SALT_SIZE),
            chaps_salt: crypto::random_bytes(DEFAULT_SALT_SIZE),
            reset_seed_salt: crypto::random_bytes(DEFAULT_SALT_SIZE),
        }
    }

    /// Deterministic blob derivation shared with the challenge-credential
    /// and double-wrapped blocks.
    pub(crate) fn derive_blobs(
        secret: &SecretBytes,
        state: &PasswordScryptState,
    ) -> Result<KeyBlobs> {
        let sub_keys = crypto::derive_secrets_scrypt(
            secret.as_slice(),
            &state.salt,
            &[DEFAULT_KEY_SIZE, DEFAULT_KEY_SIZE],
        )?;
        let stretched = SecretBytes::combine(&sub_keys[0], &sub_keys[1]);
        let vkk_key = crypto::hkdf_sha256(
            stretched.as_slice(),
            VKK_KEY_INFO,
            &state.salt,
            DEFAULT_KEY_SIZE,
        )?;
        let chaps_iv = crypto::hkdf_sha256(
            stretched.as_slice(),
            CHAPS_IV_INFO,
            &state.chaps_salt,
            AES_BLOCK_SIZE,
        )?;
        let fek_iv = crypto::hkdf_sha256(
            stretched.as_slice(),
            FEK_IV_INFO,
            &state.reset_seed_salt,
            AES_BLOCK_SIZE,
        )?;

        Ok(KeyBlobs {
            vkk_key: Some(vkk_key),
            vkk_iv: Some(fek_iv.as_slice().to_vec()),
            chaps_iv: Some(chaps_iv.as_slice().to_vec()),
            reset_secret: None,
            rate_limiter_label: None,
        })
    }
}

impl Default for PasswordScryptBlock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthBlock for PasswordScryptBlock {
    fn is_supported(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let user_input = input.user_input.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing user input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let state = Self::random_state();
        let blobs = Self::derive_blobs(user_input, &state)?;
        Ok((AuthBlockState::PasswordScrypt(state), blobs))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let user_input = input.user_input.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing user input")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let AuthBlockState::PasswordScrypt(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not password-scrypt",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        Self::derive_blobs(user_input, state)
    }
}
