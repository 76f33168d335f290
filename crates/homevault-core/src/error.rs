//! Error taxonomy for Homevault
//!
//! Every surfaced error carries a kind, a free-form context message and a
//! set of remediation actions that callers (the UI layer) can act on.
//! Lower-level errors are wrapped rather than replaced so the original
//! cause stays inspectable through the source chain.

use std::fmt;

/// Result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown factor type, label mismatch
    InvalidArgument,
    /// Label does not exist for this user
    KeyNotFound,
    /// No persistent user and no active session
    AccountNotFound,
    /// Operation requires an authenticated session
    UnauthenticatedAuthSession,
    /// Timed-out or unknown session token
    InvalidAuthSessionToken,
    /// Derivation succeeded but the supplied credential did not match
    AuthorizationKeyFailed,
    /// PinWeaver permanent lockout
    CredentialLocked,
    /// Adding a credential failed
    AddCredentialsFailed,
    /// Updating a credential failed
    UpdateCredentialsFailed,
    /// Removing a credential failed
    RemoveCredentialsFailed,
    /// Persistent storage failure
    BackingStoreFailure,
    /// Unrecoverable failure while setting up the user's vault
    MountFatal,
    /// Known-unimplemented code path
    NotImplemented,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::KeyNotFound => "key not found",
            ErrorKind::AccountNotFound => "account not found",
            ErrorKind::UnauthenticatedAuthSession => "unauthenticated auth session",
            ErrorKind::InvalidAuthSessionToken => "invalid auth session token",
            ErrorKind::AuthorizationKeyFailed => "authorization key failed",
            ErrorKind::CredentialLocked => "credential locked",
            ErrorKind::AddCredentialsFailed => "add credentials failed",
            ErrorKind::UpdateCredentialsFailed => "update credentials failed",
            ErrorKind::RemoveCredentialsFailed => "remove credentials failed",
            ErrorKind::BackingStoreFailure => "backing store failure",
            ErrorKind::MountFatal => "mount fatal",
            ErrorKind::NotImplemented => "not implemented",
        };
        f.write_str(name)
    }
}

/// Remediation actions attached to errors. Clients map these to
/// user-visible recovery flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry,
    Reboot,
    DeleteVault,
    /// Re-prompt the user for a credential
    Auth,
    /// Low-entropy credential is locked out; offer recovery paths
    LeLockedOut,
    DevCheckUnexpectedState,
}

/// Homevault error with kind, actions and a wrapped cause chain.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    actions: Vec<ErrorAction>,
    #[source]
    source: Option<Box<Error>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            actions: Vec::new(),
            source: None,
        }
    }

    pub fn with_action(mut self, action: ErrorAction) -> Self {
        if !self.actions.contains(&action) {
            self.actions.push(action);
        }
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = ErrorAction>) -> Self {
        for action in actions {
            self = self.with_action(action);
        }
        self
    }

    /// Attach `cause` as the wrapped inner error.
    pub fn wrap(mut self, cause: Error) -> Self {
        self.source = Some(Box::new(cause));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn actions(&self) -> &[ErrorAction] {
        &self.actions
    }

    /// True if `action` is present anywhere in the wrap chain.
    pub fn has_action(&self, action: ErrorAction) -> bool {
        if self.actions.contains(&action) {
            return true;
        }
        match &self.source {
            Some(inner) => inner.has_action(action),
            None => false,
        }
    }

    /// True if `kind` matches this error or any wrapped cause.
    pub fn has_kind(&self, kind: ErrorKind) -> bool {
        if self.kind == kind {
            return true;
        }
        match &self.source {
            Some(inner) => inner.has_kind(kind),
            None => false,
        }
    }

    pub fn source_error(&self) -> Option<&Error> {
        self.source.as_deref()
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::BackingStoreFailure, format!("IO error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::new(
            ErrorKind::BackingStoreFailure,
            format!("serialization error: {err}"),
        )
    }
}
