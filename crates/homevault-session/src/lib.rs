//! Auth session orchestration
//!
//! The session is the per-request state machine tying everything
//! together: it resolves factors, selects auth blocks, talks to the
//! secure element through them, and either unwraps the user secret
//! stash or decrypts a legacy vault keyset to produce the filesystem
//! keyset. Sessions authorize intents, expire after a timeout, and
//! migrate legacy keysets to the stash on successful authentication.

pub mod auth_input_builder;
pub mod session;
pub mod session_manager;
pub mod uss_migrator;
pub mod verifier_cache;

pub use auth_input_builder::{FactorInput, RecoveryDeriveInput};
pub use session::{AuthSession, AuthStatus, BackingApis, Features, AUTH_SESSION_TIMEOUT};
pub use session_manager::AuthSessionManager;
pub use uss_migrator::{MigrationStatus, UssMigrator, MIGRATION_WRAPPING_ID};
pub use verifier_cache::VerifierCache;
