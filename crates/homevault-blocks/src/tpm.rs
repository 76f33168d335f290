//! TPM-sealed password blocks
//!
//! The password is stretched into a user key; a random HVKKM
//! (hardware-vault-keyset-key-material) is sealed to the element, either
//! bound to the current-user policy or not. The wrapping key is the HMAC
//! combination of the two, so neither the password alone nor the
//! element alone can reproduce it.

use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, AES_BLOCK_SIZE, DEFAULT_KEY_SIZE, DEFAULT_SALT_SIZE};
use homevault_core::{
    AuthBlockState, AuthInput, DoubleWrappedCompatState, Error, ErrorAction, ErrorKind, KeyBlobs,
    Result, SecretBytes, TpmBoundToPcrState, TpmNotBoundToPcrState,
};
use homevault_hwsec::{OperationPolicy, SecureElement};

use crate::block::AuthBlock;
use crate::password::PasswordScryptBlock;

const FEK_IV_INFO: &[u8] = b"tpm_fek_iv";
const CHAPS_IV_INFO: &[u8] = b"tpm_chaps_iv";

fn require_user_input(input: &AuthInput) -> Result<&SecretBytes> {
    input.user_input.as_ref().ok_or_else(|| {
        Error::new(ErrorKind::InvalidArgument, "missing user input")
            .with_action(ErrorAction::DevCheckUnexpectedState)
    })
}

fn scrypt_user_keys(secret: &SecretBytes, salt: &[u8]) -> Result<(SecretBytes, SecretBytes)> {
    let mut sub_keys = crypto::derive_secrets_scrypt(
        secret.as_slice(),
        salt,
        &[DEFAULT_KEY_SIZE, DEFAULT_KEY_SIZE],
    )?;
    let kdf_skey = sub_keys.remove(1);
    let aes_skey = sub_keys.remove(0);
    Ok((aes_skey, kdf_skey))
}

/// Wrapping key plus its deterministic IVs.
fn blobs_from_vkk(vkk_key: SecretBytes) -> Result<KeyBlobs> {
    let fek_iv = crypto::hkdf_sha256(vkk_key.as_slice(), FEK_IV_INFO, &[], AES_BLOCK_SIZE)?;
    let chaps_iv = crypto::hkdf_sha256(vkk_key.as_slice(), CHAPS_IV_INFO, &[], AES_BLOCK_SIZE)?;
    Ok(KeyBlobs {
        vkk_key: Some(vkk_key),
        vkk_iv: Some(fek_iv.as_slice().to_vec()),
        chaps_iv: Some(chaps_iv.as_slice().to_vec()),
        reset_secret: None,
        rate_limiter_label: None,
    })
}

pub struct TpmBoundToPcrBlock {
    element: Arc<dyn SecureElement>,
}

impl TpmBoundToPcrBlock {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self { element }
    }
}

#[async_trait]
impl AuthBlock for TpmBoundToPcrBlock {
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
        let user_input = require_user_input(input)?;
        let obfuscated_username = input.obfuscated_username.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "missing obfuscated username")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;

        let salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &salt)?;

        let hvkkm = crypto::random_secret(DEFAULT_KEY_SIZE);
        let user_policy = OperationPolicy::for_user(obfuscated_username.as_str());
        let sealed_hvkkm = self
            .element
            .seal(&user_policy, &hvkkm)
            .map_err(|e| e.into_core("sealing hvkkm"))?;
        // Second copy sealed without the user binding, for pre-auth login.
        let extended_sealed_hvkkm = self
            .element
            .seal(&OperationPolicy::default(), &hvkkm)
            .map_err(|e| e.into_core("sealing extended hvkkm"))?;

        let vkk_key = crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice());
        let state = TpmBoundToPcrState {
            salt,
            sealed_hvkkm,
            extended_sealed_hvkkm,
        };
        Ok((
            AuthBlockState::TpmBoundToPcr(state),
            blobs_from_vkk(vkk_key)?,
        ))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let user_input = require_user_input(input)?;
        let AuthBlockState::TpmBoundToPcr(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not tpm-bound-to-pcr",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &state.salt)?;

        let hvkkm = match input.obfuscated_username.as_ref() {
            Some(user) => self
                .element
                .unseal(&OperationPolicy::for_user(user.as_str()), &state.sealed_hvkkm),
            None => self
                .element
                .unseal(&OperationPolicy::default(), &state.extended_sealed_hvkkm),
        }
        .map_err(|e| e.into_core("unsealing hvkkm"))?;

        blobs_from_vkk(crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice()))
    }
}

pub struct TpmNotBoundToPcrBlock {
    element: Arc<dyn SecureElement>,
}

impl TpmNotBoundToPcrBlock {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self { element }
    }

    pub(crate) fn derive_from_state(
        &self,
        user_input: &SecretBytes,
        state: &TpmNotBoundToPcrState,
    ) -> Result<KeyBlobs> {
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &state.salt)?;
        let hvkkm = self
            .element
            .unseal(&OperationPolicy::default(), &state.sealed_hvkkm)
            .map_err(|e| e.into_core("unsealing hvkkm"))?;
        blobs_from_vkk(crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice()))
    }

    pub(crate) fn create_state(
        &self,
        user_input: &SecretBytes,
    ) -> Result<(TpmNotBoundToPcrState, KeyBlobs)> {
        let salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &salt)?;
        let hvkkm = crypto::random_secret(DEFAULT_KEY_SIZE);
        let sealed_hvkkm = self
            .element
            .seal(&OperationPolicy::default(), &hvkkm)
            .map_err(|e| e.into_core("sealing hvkkm"))?;
        let blobs = blobs_from_vkk(crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice()))?;
        Ok((TpmNotBoundToPcrState { salt, sealed_hvkkm }, blobs))
    }
}

#[async_trait]
impl AuthBlock for TpmNotBoundToPcrBlock {
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
        let user_input = require_user_input(input)?;
        let (state, blobs) = self.create_state(user_input)?;
        Ok((AuthBlockState::TpmNotBoundToPcr(state), blobs))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let user_input = require_user_input(input)?;
        let AuthBlockState::TpmNotBoundToPcr(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not tpm-not-bound-to-pcr",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        self.derive_from_state(user_input, state)
    }
}

/// Compatibility block for keysets wrapped both ways during an old
/// migration: try the TPM derivation first, fall back to scrypt-only.
/// The same HVKKM sits sealed in the element and wrapped under the
/// scrypt-derived key, so both paths reproduce the same wrapping key.
pub struct DoubleWrappedCompatBlock {
    element: Arc<dyn SecureElement>,
}

const DOUBLE_WRAP_AAD: &[u8] = b"double-wrapped-hvkkm";

impl DoubleWrappedCompatBlock {
    pub fn new(element: Arc<dyn SecureElement>) -> Self {
        Self { element }
    }
}

#[async_trait]
impl AuthBlock for DoubleWrappedCompatBlock {
    fn is_supported(&self) -> Result<()> {
        TpmNotBoundToPcrBlock::new(self.element.clone()).is_supported()
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let user_input = require_user_input(input)?;
        let hvkkm = crypto::random_secret(DEFAULT_KEY_SIZE);

        // Element copy.
        let tpm_salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &tpm_salt)?;
        let sealed_hvkkm = self
            .element
            .seal(&OperationPolicy::default(), &hvkkm)
            .map_err(|e| e.into_core("sealing hvkkm"))?;
        let tpm_state = TpmNotBoundToPcrState {
            salt: tpm_salt,
            sealed_hvkkm,
        };

        // Software copy, wrapped under the scrypt-derived key.
        let scrypt_state = PasswordScryptBlock::random_state();
        let scrypt_blobs = PasswordScryptBlock::derive_blobs(user_input, &scrypt_state)?;
        let kek = scrypt_blobs.vkk_key.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::InvalidArgument, "scrypt derivation yielded no key")
        })?;
        let wrapped_hvkkm = crypto::aes_gcm_seal(kek.as_slice(), DOUBLE_WRAP_AAD, hvkkm.as_slice())?;

        let blobs = blobs_from_vkk(crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice()))?;
        Ok((
            AuthBlockState::DoubleWrappedCompat(DoubleWrappedCompatState {
                scrypt_state,
                tpm_state,
                wrapped_hvkkm,
            }),
            blobs,
        ))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let user_input = require_user_input(input)?;
        let AuthBlockState::DoubleWrappedCompat(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not double-wrapped-compat",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        let (_aes_skey, kdf_skey) = scrypt_user_keys(user_input, &state.tpm_state.salt)?;

        let hvkkm = match self
            .element
            .unseal(&OperationPolicy::default(), &state.tpm_state.sealed_hvkkm)
        {
            Ok(hvkkm) => hvkkm,
            Err(err) => {
                tracing::warn!(%err, "element unseal failed, falling back to scrypt copy");
                let scrypt_blobs =
                    PasswordScryptBlock::derive_blobs(user_input, &state.scrypt_state)?;
                let kek = scrypt_blobs.vkk_key.as_ref().ok_or_else(|| {
                    Error::new(ErrorKind::InvalidArgument, "scrypt derivation yielded no key")
                })?;
                crypto::aes_gcm_open(kek.as_slice(), DOUBLE_WRAP_AAD, &state.wrapped_hvkkm)?
            }
        };

        blobs_from_vkk(crypto::hmac_sha256(kdf_skey.as_slice(), hvkkm.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homevault_core::Username;
    use homevault_hwsec::SoftSecureElement;

    fn input(password: &str) -> AuthInput {
        AuthInput {
            user_input: Some(SecretBytes::from(password)),
            obfuscated_username: Some(Username::new("alice@x").obfuscate()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bound_to_pcr_round_trip() {
        let element = Arc::new(SoftSecureElement::new());
        let block = TpmBoundToPcrBlock::new(element);
        let (state, created) = block.create(&input("hunter2")).await.unwrap();
        let derived = block.derive(&input("hunter2"), &state).await.unwrap();
        assert_eq!(created.vkk_key, derived.vkk_key);
        assert_eq!(created.vkk_iv, derived.vkk_iv);
    }

    #[tokio::test]
    async fn bound_to_pcr_pre_auth_path_uses_extended_seal() {
        let element = Arc::new(SoftSecureElement::new());
        let block = TpmBoundToPcrBlock::new(element);
        let (state, created) = block.create(&input("hunter2")).await.unwrap();
        // No username in the input: the extended (unbound) copy unseals.
        let pre_auth = AuthInput {
            user_input: Some(SecretBytes::from("hunter2")),
            ..Default::default()
        };
        let derived = block.derive(&pre_auth, &state).await.unwrap();
        assert_eq!(created.vkk_key, derived.vkk_key);
    }

    #[tokio::test]
    async fn wrong_password_changes_the_key() {
        let element = Arc::new(SoftSecureElement::new());
        let block = TpmNotBoundToPcrBlock::new(element);
        let (state, created) = block.create(&input("hunter2")).await.unwrap();
        let derived = block.derive(&input("wrong"), &state).await.unwrap();
        assert_ne!(created.vkk_key, derived.vkk_key);
    }

    #[tokio::test]
    async fn double_wrapped_both_paths_agree() {
        let element = Arc::new(SoftSecureElement::new());
        let block = DoubleWrappedCompatBlock::new(element);
        let (state, created) = block.create(&input("hunter2")).await.unwrap();

        let via_tpm = block.derive(&input("hunter2"), &state).await.unwrap();
        assert_eq!(created.vkk_key, via_tpm.vkk_key);

        // A different element cannot unseal the TPM copy; the scrypt
        // fallback still reproduces the same key.
        let other_element = Arc::new(SoftSecureElement::new());
        let fallback_block = DoubleWrappedCompatBlock::new(other_element);
        let via_scrypt = fallback_block
            .derive(&input("hunter2"), &state)
            .await
            .unwrap();
        assert_eq!(created.vkk_key, via_scrypt.vkk_key);
    }

    #[tokio::test]
    async fn double_wrapped_fallback_rejects_wrong_password() {
        let element = Arc::new(SoftSecureElement::new());
        let block = DoubleWrappedCompatBlock::new(element);
        let (state, _) = block.create(&input("hunter2")).await.unwrap();

        let other_element = Arc::new(SoftSecureElement::new());
        let fallback_block = DoubleWrappedCompatBlock::new(other_element);
        let err = fallback_block
            .derive(&input("wrong"), &state)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
    }
}
