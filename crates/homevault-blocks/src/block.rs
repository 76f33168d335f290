//! The `AuthBlock` trait and block-kind selection.

use async_trait::async_trait;
use homevault_core::{AuthBlockState, AuthInput, KeyBlobs, Result};

/// Which block implementation a factor's state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthBlockKind {
    PasswordScrypt,
    TpmBoundToPcr,
    TpmNotBoundToPcr,
    PinWeaver,
    CryptohomeRecovery,
    ChallengeCredential,
    Fingerprint,
    DoubleWrappedCompat,
}

impl AuthBlockKind {
    /// The kind a persisted state decrypts with. Total: every state
    /// variant maps to exactly one block.
    pub fn from_state(state: &AuthBlockState) -> AuthBlockKind {
        match state {
            AuthBlockState::PasswordScrypt(_) => AuthBlockKind::PasswordScrypt,
            AuthBlockState::TpmBoundToPcr(_) => AuthBlockKind::TpmBoundToPcr,
            AuthBlockState::TpmNotBoundToPcr(_) => AuthBlockKind::TpmNotBoundToPcr,
            AuthBlockState::PinWeaver(_) => AuthBlockKind::PinWeaver,
            AuthBlockState::CryptohomeRecovery(_) => AuthBlockKind::CryptohomeRecovery,
            AuthBlockState::ChallengeCredential(_) => AuthBlockKind::ChallengeCredential,
            AuthBlockState::DoubleWrappedCompat(_) => AuthBlockKind::DoubleWrappedCompat,
            AuthBlockState::Fingerprint(_) => AuthBlockKind::Fingerprint,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthBlockKind::PasswordScrypt => "password_scrypt",
            AuthBlockKind::TpmBoundToPcr => "tpm_bound_to_pcr",
            AuthBlockKind::TpmNotBoundToPcr => "tpm_not_bound_to_pcr",
            AuthBlockKind::PinWeaver => "pin_weaver",
            AuthBlockKind::CryptohomeRecovery => "cryptohome_recovery",
            AuthBlockKind::ChallengeCredential => "challenge_credential",
            AuthBlockKind::Fingerprint => "fingerprint",
            AuthBlockKind::DoubleWrappedCompat => "double_wrapped_compat",
        }
    }
}

impl std::fmt::Display for AuthBlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-factor-type strategy turning credentials into wrapping keys.
///
/// `create` mints fresh per-factor secrets (possibly talking to the
/// secure element) and returns both the state to persist and the
/// wrapping material. `derive` is the inverse: given the same correct
/// input and the persisted state it reproduces the same wrapping key.
#[async_trait]
pub trait AuthBlock: Send + Sync {
    /// Environment check: does this block have everything it needs?
    fn is_supported(&self) -> Result<()>;

    async fn create(&self, input: &AuthInput) -> Result<(AuthBlockState, KeyBlobs)>;

    async fn derive(&self, input: &AuthInput, state: &AuthBlockState) -> Result<KeyBlobs>;

    /// Release any hardware state backing `state`. Default: nothing to
    /// release.
    async fn prepare_for_removal(&self, state: &AuthBlockState) -> Result<()> {
        let _ = state;
        Ok(())
    }
}
