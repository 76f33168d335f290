//! Challenge-credential (smart card) block
//!
//! The user-secret derivation is delegated to an out-of-process signing
//! service. The block owns the protocol: it issues a fresh liveness
//! challenge, verifies the returned signature, then obtains a
//! deterministic signature over the stored salt whose digest feeds the
//! scrypt pipeline. Key blobs are emitted only after the liveness
//! signature checks out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto::{self, DEFAULT_SALT_SIZE};
use homevault_core::{
    AuthBlockState, AuthInput, ChallengeCredentialAuthInput, ChallengeCredentialState,
    ChallengeSignatureAlgorithm, Error, ErrorAction, ErrorKind, KeyBlobs, Result, SecretBytes,
};
use parking_lot::Mutex;

use crate::block::AuthBlock;
use crate::password::PasswordScryptBlock;

// Preference order when the client offers several algorithms.
const ALGORITHM_PRIORITY: [ChallengeSignatureAlgorithm; 4] = [
    ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha256,
    ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha512,
    ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha384,
    ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha1,
];

/// Out-of-process key delegate, addressed by service name.
#[async_trait]
pub trait KeyDelegate: Send + Sync {
    /// Sign `data` with the key identified by its SPKI DER encoding.
    async fn sign_challenge(
        &self,
        service_name: &str,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Verify a signature produced by the delegate's key.
    async fn verify_signature(
        &self,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool>;
}

fn algorithm_tag(algorithm: ChallengeSignatureAlgorithm) -> &'static [u8] {
    match algorithm {
        ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha1 => b"rsassa-sha1",
        ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha256 => b"rsassa-sha256",
        ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha384 => b"rsassa-sha384",
        ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha512 => b"rsassa-sha512",
    }
}

pub struct ChallengeCredentialBlock {
    delegate: Arc<dyn KeyDelegate>,
}

impl ChallengeCredentialBlock {
    pub fn new(delegate: Arc<dyn KeyDelegate>) -> Self {
        Self { delegate }
    }

    fn pick_algorithm(
        offered: &[ChallengeSignatureAlgorithm],
    ) -> Result<ChallengeSignatureAlgorithm> {
        ALGORITHM_PRIORITY
            .into_iter()
            .find(|candidate| offered.contains(candidate))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidArgument,
                    "no acceptable signature algorithm offered",
                )
            })
    }

    fn challenge_input<'a>(input: &'a AuthInput) -> Result<&'a ChallengeCredentialAuthInput> {
        input.challenge_credential.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidArgument,
                "missing challenge-credential input",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState)
        })
    }

    async fn verify_liveness(
        &self,
        service_name: &str,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
    ) -> Result<()> {
        let challenge = crypto::random_bytes(32);
        let signature = self
            .delegate
            .sign_challenge(service_name, public_key_spki_der, algorithm, &challenge)
            .await?;
        let valid = self
            .delegate
            .verify_signature(public_key_spki_der, algorithm, &challenge, &signature)
            .await?;
        if !valid {
            return Err(Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "liveness challenge signature did not verify",
            )
            .with_action(ErrorAction::Auth));
        }
        Ok(())
    }

    /// Deterministic secret: the digest of the delegate's signature over
    /// the stored salt.
    async fn salt_secret(
        &self,
        service_name: &str,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
        salt: &[u8],
    ) -> Result<SecretBytes> {
        let signature = self
            .delegate
            .sign_challenge(service_name, public_key_spki_der, algorithm, salt)
            .await?;
        Ok(SecretBytes::new(crypto::sha256(&signature).to_vec()))
    }
}

#[async_trait]
impl AuthBlock for ChallengeCredentialBlock {
    fn is_supported(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)> {
        let challenge_input = Self::challenge_input(input)?;
        let service_name = challenge_input
            .key_delegate_service_name
            .as_deref()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidArgument,
                    "missing key delegate service name",
                )
            })?;
        if challenge_input.public_key_spki_der.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument, "missing public key"));
        }
        let algorithm = Self::pick_algorithm(&challenge_input.challenge_signature_algorithms)?;

        self.verify_liveness(service_name, &challenge_input.public_key_spki_der, algorithm)
            .await?;

        let salt = crypto::random_bytes(DEFAULT_SALT_SIZE);
        let secret = self
            .salt_secret(
                service_name,
                &challenge_input.public_key_spki_der,
                algorithm,
                &salt,
            )
            .await?;

        let scrypt_state = PasswordScryptBlock::random_state();
        let blobs = PasswordScryptBlock::derive_blobs(&secret, &scrypt_state)?;
        let state = ChallengeCredentialState {
            public_key_spki_der: challenge_input.public_key_spki_der.clone(),
            algorithm,
            salt,
            scrypt_state,
        };
        Ok((AuthBlockState::ChallengeCredential(state), blobs))
    }

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs> {
        let challenge_input = Self::challenge_input(input)?;
        let AuthBlockState::ChallengeCredential(state) = state else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "auth block state is not challenge-credential",
            )
            .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]));
        };
        let service_name = challenge_input
            .key_delegate_service_name
            .as_deref()
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidArgument,
                    "missing key delegate service name",
                )
            })?;
        // The request may narrow the algorithm set; the stored one must
        // still be acceptable.
        if !challenge_input.challenge_signature_algorithms.is_empty()
            && !challenge_input
                .challenge_signature_algorithms
                .contains(&state.algorithm)
        {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "stored signature algorithm no longer offered",
            ));
        }

        self.verify_liveness(service_name, &state.public_key_spki_der, state.algorithm)
            .await?;
        let secret = self
            .salt_secret(
                service_name,
                &state.public_key_spki_der,
                state.algorithm,
                &state.salt,
            )
            .await?;
        PasswordScryptBlock::derive_blobs(&secret, &state.scrypt_state)
    }
}

/// Software key delegate: per-key secrets with HMAC pseudo-signatures.
/// Used by tests in place of the out-of-process signing service.
pub struct SoftKeyDelegate {
    keys: Mutex<HashMap<Vec<u8>, SecretBytes>>,
}

impl SoftKeyDelegate {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a key pair; returns the public SPKI DER handle.
    pub fn register_key(&self) -> Vec<u8> {
        let secret = crypto::random_secret(32);
        let spki = crypto::sha256(secret.as_slice()).to_vec();
        self.keys.lock().insert(spki.clone(), secret);
        spki
    }

    fn signature(
        key: &SecretBytes,
        algorithm: ChallengeSignatureAlgorithm,
        data: &[u8],
    ) -> Vec<u8> {
        let mut message = algorithm_tag(algorithm).to_vec();
        message.extend_from_slice(data);
        crypto::hmac_sha256(key.as_slice(), &message)
            .as_slice()
            .to_vec()
    }
}

impl Default for SoftKeyDelegate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyDelegate for SoftKeyDelegate {
    async fn sign_challenge(
        &self,
        _service_name: &str,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        let keys = self.keys.lock();
        let key = keys.get(public_key_spki_der).ok_or_else(|| {
            Error::new(ErrorKind::KeyNotFound, "no key for the given public key")
                .with_action(ErrorAction::Auth)
        })?;
        Ok(Self::signature(key, algorithm, data))
    }

    async fn verify_signature(
        &self,
        public_key_spki_der: &[u8],
        algorithm: ChallengeSignatureAlgorithm,
        data: &[u8],
        signature: &[u8],
    ) -> Result<bool> {
        let keys = self.keys.lock();
        let key = keys.get(public_key_spki_der).ok_or_else(|| {
            Error::new(ErrorKind::KeyNotFound, "no key for the given public key")
                .with_action(ErrorAction::Auth)
        })?;
        Ok(Self::signature(key, algorithm, data) == signature)
    }
}
