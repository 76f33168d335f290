//! Biometrics session service
//!
//! Owns enroll/authenticate sessions against the biometrics stack and
//! hands out prepared-factor tokens for them. The token attaches only
//! after the session started successfully, and a fatal session failure
//! reported by the stack detaches the active token so its drop does not
//! terminate a session the hardware already ended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use homevault_core::crypto;
use homevault_core::{
    AuthFactorType, Error, ErrorAction, ErrorKind, ObfuscatedUsername, Result, SecretBytes,
};
use parking_lot::Mutex;

use crate::prepare::PreparedAuthFactorToken;

/// Payload for starting a biometrics session, binding it to the secure
/// element through a nonce handshake.
#[derive(Debug, Clone, Default)]
pub struct OperationInput {
    pub nonce: Vec<u8>,
    pub encrypted_label_seed: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Result of a completed enroll or match operation.
#[derive(Debug)]
pub struct OperationOutput {
    pub record_id: String,
    pub auth_secret: SecretBytes,
    pub auth_pin: SecretBytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
    Failed,
}

/// Legacy fingerprint record from the pre-auth-stack daemon store.
#[derive(Debug, Clone)]
pub struct LegacyRecord {
    pub legacy_record_id: String,
    pub label: String,
}

/// Command surface of the biometrics stack.
#[async_trait]
pub trait BiometricsProcessor: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn get_nonce(&self) -> Result<Vec<u8>>;

    async fn start_enroll_session(&self, input: OperationInput) -> Result<()>;

    async fn create_credential(&self, user: &ObfuscatedUsername) -> Result<OperationOutput>;

    fn end_enroll_session(&self);

    async fn start_authenticate_session(
        &self,
        user: &ObfuscatedUsername,
        input: OperationInput,
    ) -> Result<()>;

    async fn match_credential(&self) -> Result<OperationOutput>;

    fn end_authenticate_session(&self);

    async fn delete_credential(&self, record_id: &str) -> DeleteResult;

    async fn list_legacy_records(&self) -> Result<Vec<LegacyRecord>>;

    async fn enroll_legacy_template(&self, legacy_record_id: &str, input: OperationInput)
        -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Enroll,
    Authenticate,
}

struct ActiveSession {
    kind: SessionKind,
    armed: Arc<AtomicBool>,
}

pub struct BiometricsService {
    processor: Arc<dyn BiometricsProcessor>,
    active: Mutex<Option<ActiveSession>>,
}

impl BiometricsService {
    pub fn new(processor: Arc<dyn BiometricsProcessor>) -> Self {
        Self {
            processor,
            active: Mutex::new(None),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.processor.is_ready()
    }

    pub async fn get_nonce(&self) -> Result<Vec<u8>> {
        self.processor.get_nonce().await
    }

    fn begin_session(
        self: &Arc<Self>,
        factor_type: AuthFactorType,
        kind: SessionKind,
    ) -> Result<BioPreparedToken> {
        let mut active = self.active.lock();
        if active.is_some() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "a biometrics session is already active",
            )
            .with_action(ErrorAction::Retry));
        }
        let armed = Arc::new(AtomicBool::new(true));
        *active = Some(ActiveSession {
            kind,
            armed: armed.clone(),
        });
        Ok(BioPreparedToken {
            factor_type,
            kind,
            armed,
            service: self.clone(),
        })
    }

    pub async fn start_enroll_session(
        self: &Arc<Self>,
        factor_type: AuthFactorType,
        input: OperationInput,
    ) -> Result<Box<dyn PreparedAuthFactorToken>> {
        let token = self.begin_session(factor_type, SessionKind::Enroll)?;
        if let Err(err) = self.processor.start_enroll_session(input).await {
            self.clear_session(SessionKind::Enroll);
            return Err(err);
        }
        Ok(Box::new(token))
    }

    pub async fn start_authenticate_session(
        self: &Arc<Self>,
        factor_type: AuthFactorType,
        user: &ObfuscatedUsername,
        input: OperationInput,
    ) -> Result<Box<dyn PreparedAuthFactorToken>> {
        let token = self.begin_session(factor_type, SessionKind::Authenticate)?;
        if let Err(err) = self.processor.start_authenticate_session(user, input).await {
            self.clear_session(SessionKind::Authenticate);
            return Err(err);
        }
        Ok(Box::new(token))
    }

    pub async fn create_credential(&self, user: &ObfuscatedUsername) -> Result<OperationOutput> {
        self.require_session(SessionKind::Enroll)?;
        self.processor.create_credential(user).await
    }

    pub async fn match_credential(&self) -> Result<OperationOutput> {
        self.require_session(SessionKind::Authenticate)?;
        self.processor.match_credential().await
    }

    pub async fn delete_credential(&self, record_id: &str) -> DeleteResult {
        self.processor.delete_credential(record_id).await
    }

    pub async fn list_legacy_records(&self) -> Result<Vec<LegacyRecord>> {
        self.processor.list_legacy_records().await
    }

    pub async fn enroll_legacy_template(
        &self,
        legacy_record_id: &str,
        input: OperationInput,
    ) -> Result<()> {
        self.require_session(SessionKind::Enroll)?;
        self.processor.enroll_legacy_template(legacy_record_id, input).await
    }

    /// The stack reported a fatal session failure: it has already ended
    /// the session, so detach the active token instead of terminating.
    pub fn notify_session_failed(&self) {
        let mut active = self.active.lock();
        if let Some(session) = active.take() {
            session.armed.store(false, Ordering::SeqCst);
            tracing::warn!("biometrics session failed; active token detached");
        }
    }

    pub fn has_active_session(&self) -> bool {
        self.active.lock().is_some()
    }

    fn require_session(&self, kind: SessionKind) -> Result<()> {
        let active = self.active.lock();
        match active.as_ref() {
            Some(session) if session.kind == kind => Ok(()),
            _ => Err(Error::new(
                ErrorKind::UnauthenticatedAuthSession,
                "no matching biometrics session is active",
            )
            .with_action(ErrorAction::Retry)),
        }
    }

    fn clear_session(&self, kind: SessionKind) {
        let mut active = self.active.lock();
        if active.as_ref().map(|session| session.kind) == Some(kind) {
            if let Some(session) = active.take() {
                session.armed.store(false, Ordering::SeqCst);
            }
        }
    }

    fn end_session(&self, kind: SessionKind) {
        self.clear_session(kind);
        match kind {
            SessionKind::Enroll => self.processor.end_enroll_session(),
            SessionKind::Authenticate => self.processor.end_authenticate_session(),
        }
    }
}

/// Token for an active biometrics session.
pub struct BioPreparedToken {
    factor_type: AuthFactorType,
    kind: SessionKind,
    armed: Arc<AtomicBool>,
    service: Arc<BiometricsService>,
}

impl PreparedAuthFactorToken for BioPreparedToken {
    fn factor_type(&self) -> AuthFactorType {
        self.factor_type
    }

    fn terminate(&mut self) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.service.end_session(self.kind);
        }
        Ok(())
    }

    fn detach(&mut self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl Drop for BioPreparedToken {
    fn drop(&mut self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.service.end_session(self.kind);
        }
    }
}

/// In-memory biometrics stack for tests and development.
pub struct SoftBiometricsProcessor {
    state: Mutex<SoftState>,
}

struct SoftState {
    next_record: u32,
    // record id -> (user, auth secret, auth pin)
    templates: Vec<SoftTemplate>,
    enroll_active: bool,
    auth_session_user: Option<ObfuscatedUsername>,
    programmed_match: Option<String>,
}

struct SoftTemplate {
    record_id: String,
    user: ObfuscatedUsername,
    auth_secret: SecretBytes,
    auth_pin: SecretBytes,
}

impl SoftBiometricsProcessor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState {
                next_record: 1,
                templates: Vec::new(),
                enroll_active: false,
                auth_session_user: None,
                programmed_match: None,
            }),
        }
    }

    /// Force the next match to return the given record.
    pub fn program_match(&self, record_id: impl Into<String>) {
        self.state.lock().programmed_match = Some(record_id.into());
    }
}

impl Default for SoftBiometricsProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BiometricsProcessor for SoftBiometricsProcessor {
    fn is_ready(&self) -> bool {
        true
    }

    async fn get_nonce(&self) -> Result<Vec<u8>> {
        Ok(crypto::random_bytes(32))
    }

    async fn start_enroll_session(&self, _input: OperationInput) -> Result<()> {
        self.state.lock().enroll_active = true;
        Ok(())
    }

    async fn create_credential(&self, user: &ObfuscatedUsername) -> Result<OperationOutput> {
        let mut state = self.state.lock();
        if !state.enroll_active {
            return Err(Error::new(
                ErrorKind::UnauthenticatedAuthSession,
                "no enroll session active",
            ));
        }
        let record_id = format!("template-{}", state.next_record);
        state.next_record += 1;
        let template = SoftTemplate {
            record_id: record_id.clone(),
            user: user.clone(),
            auth_secret: crypto::random_secret(32),
            auth_pin: crypto::random_secret(32),
        };
        let output = OperationOutput {
            record_id,
            auth_secret: template.auth_secret.clone(),
            auth_pin: template.auth_pin.clone(),
        };
        state.templates.push(template);
        Ok(output)
    }

    fn end_enroll_session(&self) {
        self.state.lock().enroll_active = false;
    }

    async fn start_authenticate_session(
        &self,
        user: &ObfuscatedUsername,
        _input: OperationInput,
    ) -> Result<()> {
        self.state.lock().auth_session_user = Some(user.clone());
        Ok(())
    }

    async fn match_credential(&self) -> Result<OperationOutput> {
        let mut state = self.state.lock();
        let user = state.auth_session_user.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::UnauthenticatedAuthSession,
                "no authenticate session active",
            )
        })?;
        let programmed = state.programmed_match.take();
        let template = state
            .templates
            .iter()
            .filter(|t| t.user == user)
            .find(|t| match &programmed {
                Some(record_id) => &t.record_id == record_id,
                None => true,
            })
            .ok_or_else(|| {
                Error::new(ErrorKind::AuthorizationKeyFailed, "no matching template")
                    .with_action(ErrorAction::Auth)
            })?;
        Ok(OperationOutput {
            record_id: template.record_id.clone(),
            auth_secret: template.auth_secret.clone(),
            auth_pin: template.auth_pin.clone(),
        })
    }

    fn end_authenticate_session(&self) {
        self.state.lock().auth_session_user = None;
    }

    async fn delete_credential(&self, record_id: &str) -> DeleteResult {
        let mut state = self.state.lock();
        let before = state.templates.len();
        state.templates.retain(|t| t.record_id != record_id);
        if state.templates.len() < before {
            DeleteResult::Deleted
        } else {
            DeleteResult::NotFound
        }
    }

    async fn list_legacy_records(&self) -> Result<Vec<LegacyRecord>> {
        Ok(Vec::new())
    }

    async fn enroll_legacy_template(
        &self,
        _legacy_record_id: &str,
        _input: OperationInput,
    ) -> Result<()> {
        Err(Error::new(
            ErrorKind::NotImplemented,
            "no legacy templates in the soft stack",
        ))
    }
}
