//! Session registry
//!
//! Owns the live sessions, keyed by their unguessable token. Clients
//! hold only the 16-byte serialized token; every request resolves it
//! here, and a timed-out or unknown token fails the same way.

use std::collections::HashMap;

use homevault_core::{
    AuthIntent, Error, ErrorAction, ErrorKind, Result, UnguessableToken, Username,
};

use crate::session::{AuthSession, AuthStatus, BackingApis};

#[derive(Default)]
pub struct AuthSessionManager {
    sessions: HashMap<UnguessableToken, AuthSession>,
}

impl AuthSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and hand back its serialized token.
    pub fn create_session(
        &mut self,
        account_id: Username,
        is_ephemeral_user: bool,
        intent: AuthIntent,
        apis: BackingApis,
    ) -> [u8; 16] {
        let session = AuthSession::create(account_id, is_ephemeral_user, intent, apis);
        let token = session.token();
        self.sessions.insert(token, session);
        token.to_serialized()
    }

    /// Resolve a serialized token to its session. A malformed token, an
    /// unknown token and a token whose session just expired all surface
    /// as `InvalidAuthSessionToken`; expired sessions are dropped on the
    /// spot.
    pub fn find_session(&mut self, serialized_token: &[u8]) -> Result<&mut AuthSession> {
        let token = UnguessableToken::from_serialized(serialized_token).ok_or_else(|| {
            Error::new(
                ErrorKind::InvalidAuthSessionToken,
                "malformed auth session token",
            )
            .with_action(ErrorAction::Retry)
        })?;

        let timed_out = match self.sessions.get_mut(&token) {
            Some(session) => session.poll_timeout(),
            None => {
                return Err(Error::new(
                    ErrorKind::InvalidAuthSessionToken,
                    "no session for the given token",
                )
                .with_actions([ErrorAction::Retry, ErrorAction::Reboot]));
            }
        };
        if timed_out {
            self.sessions.remove(&token);
            return Err(Error::new(
                ErrorKind::InvalidAuthSessionToken,
                "session timed out",
            )
            .with_actions([ErrorAction::Retry, ErrorAction::Reboot]));
        }
        Ok(self
            .sessions
            .get_mut(&token)
            .expect("session presence was just checked"))
    }

    /// Explicit invalidation; true if a session was removed.
    pub fn remove_session(&mut self, serialized_token: &[u8]) -> bool {
        match UnguessableToken::from_serialized(serialized_token) {
            Some(token) => self.sessions.remove(&token).is_some(),
            None => false,
        }
    }

    /// Drop every expired session, firing their timeout callbacks.
    pub fn expire_sessions(&mut self) {
        let expired: Vec<UnguessableToken> = self
            .sessions
            .iter_mut()
            .filter_map(|(token, session)| session.poll_timeout().then_some(*token))
            .collect();
        for token in expired {
            self.sessions.remove(&token);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently authenticated for a decrypt intent.
    pub fn authenticated_session_count(&mut self) -> usize {
        let mut count = 0;
        for session in self.sessions.values_mut() {
            if session.status() == AuthStatus::Authenticated {
                count += 1;
            }
        }
        count
    }
}
