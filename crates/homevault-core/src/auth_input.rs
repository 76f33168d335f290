//! Per-call input bundle for auth block operations.

use serde::{Deserialize, Serialize};

use crate::secret::SecretBytes;
use crate::username::{ObfuscatedUsername, Username};

/// Signature algorithms accepted for challenge credentials. Requests
/// naming anything outside this set are rejected as invalid arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeSignatureAlgorithm {
    RsassaPkcs1V15Sha1,
    RsassaPkcs1V15Sha256,
    RsassaPkcs1V15Sha384,
    RsassaPkcs1V15Sha512,
}

/// Inputs for the cryptohome-recovery flow. `mediator_pub_key`,
/// `user_gaia_id` and `device_user_id` feed `Create`; the response
/// fields feed `Derive`.
#[derive(Debug, Clone, Default)]
pub struct RecoveryAuthInput {
    pub mediator_pub_key: Vec<u8>,
    pub user_gaia_id: String,
    pub device_user_id: String,
    pub epoch_response: Vec<u8>,
    pub ephemeral_pub_key: Vec<u8>,
    pub recovery_response: Vec<u8>,
    pub ledger_name: String,
    pub ledger_key_hash: u32,
    pub ledger_public_key: Vec<u8>,
}

/// Inputs for the challenge-credential (smart card) flow.
#[derive(Debug, Clone, Default)]
pub struct ChallengeCredentialAuthInput {
    pub public_key_spki_der: Vec<u8>,
    pub challenge_signature_algorithms: Vec<ChallengeSignatureAlgorithm>,
    /// Service name of the out-of-process key delegate.
    pub key_delegate_service_name: Option<String>,
}

/// Inputs for the fingerprint flow.
#[derive(Debug, Clone, Default)]
pub struct FingerprintAuthInput {
    /// Nonce binding the biometrics session to the secure element.
    pub auth_nonce: Option<Vec<u8>>,
}

/// The per-call input bundle handed to any auth block. Which fields are
/// populated depends on the factor type and on whether the call is a
/// Create or a Derive.
#[derive(Debug, Clone, Default)]
pub struct AuthInput {
    /// The user-supplied secret (password, PIN, kiosk passkey).
    pub user_input: Option<SecretBytes>,
    pub username: Option<Username>,
    pub obfuscated_username: Option<ObfuscatedUsername>,
    /// Reset seed shared across a user's vault keysets.
    pub reset_seed: Option<SecretBytes>,
    /// Salt paired with the reset seed for a single factor.
    pub reset_salt: Option<Vec<u8>>,
    /// Reset secret for this factor, either supplied directly (USS) or
    /// derived as `HMAC(reset_salt, reset_seed)` (vault keysets).
    pub reset_secret: Option<SecretBytes>,
    /// Existing rate-limiter credential to reuse.
    pub rate_limiter_label: Option<u64>,
    pub recovery: Option<RecoveryAuthInput>,
    pub challenge_credential: Option<ChallengeCredentialAuthInput>,
    pub fingerprint: Option<FingerprintAuthInput>,
    pub locked_to_single_user: bool,
}
