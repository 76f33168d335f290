//! Secure-element error taxonomy and its mapping onto remediation
//! actions for the session layer.

use homevault_core::{Error, ErrorAction, ErrorKind};

pub type HwsecResult<T> = std::result::Result<T, HwsecError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum HwsecError {
    #[error("secure element is not ready")]
    NotReady,
    #[error("pinweaver is not enabled on this element")]
    PinWeaverDisabled,
    #[error("low-entropy secret did not match")]
    InvalidLeSecret,
    #[error("credential locked after too many attempts")]
    TooManyAttempts,
    #[error("no credential under label {0}")]
    InvalidLabel(u64),
    #[error("credential hash tree is lost")]
    HashTreeLost,
    #[error("reset secret did not match")]
    InvalidResetSecret,
    #[error("unsealing failed under the given policy")]
    UnsealFailed,
    #[error("recovery crypto operation failed: {0}")]
    RecoveryFailed(String),
    #[error("backend failure: {0}")]
    Backend(String),
}

impl HwsecError {
    /// Removal treats a missing label or a lost hash tree as success:
    /// there is nothing left to remove either way.
    pub fn is_success_for_removal(&self) -> bool {
        matches!(self, HwsecError::InvalidLabel(_) | HwsecError::HashTreeLost)
    }

    /// Wrap into the surfaced error taxonomy with the matching actions.
    pub fn into_core(self, context: impl Into<String>) -> Error {
        let (kind, actions): (ErrorKind, &[ErrorAction]) = match &self {
            HwsecError::NotReady | HwsecError::PinWeaverDisabled => (
                ErrorKind::BackingStoreFailure,
                &[ErrorAction::Reboot, ErrorAction::DevCheckUnexpectedState],
            ),
            HwsecError::InvalidLeSecret => {
                (ErrorKind::AuthorizationKeyFailed, &[ErrorAction::Auth])
            }
            HwsecError::TooManyAttempts => (
                ErrorKind::CredentialLocked,
                &[ErrorAction::LeLockedOut, ErrorAction::Auth],
            ),
            HwsecError::InvalidLabel(_) => (
                ErrorKind::AuthorizationKeyFailed,
                &[ErrorAction::DevCheckUnexpectedState, ErrorAction::DeleteVault],
            ),
            HwsecError::HashTreeLost => (
                ErrorKind::BackingStoreFailure,
                &[ErrorAction::Reboot, ErrorAction::DeleteVault],
            ),
            HwsecError::InvalidResetSecret => {
                (ErrorKind::AuthorizationKeyFailed, &[ErrorAction::Auth])
            }
            HwsecError::UnsealFailed => (
                ErrorKind::AuthorizationKeyFailed,
                &[ErrorAction::Auth, ErrorAction::Retry],
            ),
            HwsecError::RecoveryFailed(_) => {
                (ErrorKind::AuthorizationKeyFailed, &[ErrorAction::Auth])
            }
            HwsecError::Backend(_) => (
                ErrorKind::BackingStoreFailure,
                &[ErrorAction::Retry, ErrorAction::Reboot],
            ),
        };
        Error::new(kind, format!("{}: {}", context.into(), self))
            .with_actions(actions.iter().copied())
    }
}
