//! Auth block family
//!
//! An auth block is the per-factor-type strategy that turns an
//! `AuthInput` (plus secure-element state) into transient wrapping
//! material (`KeyBlobs`) and a persistable `AuthBlockState`.
//! This crate holds the block implementations, the dispatcher that
//! selects among them, the biometrics session service, and the
//! lightweight credential verifiers.

pub mod bio;
pub mod block;
pub mod challenge;
pub mod dispatcher;
pub mod fingerprint;
pub mod password;
pub mod pin_weaver;
pub mod prepare;
pub mod recovery;
pub mod revocation;
pub mod tpm;
pub mod verifier;

pub use bio::{
    BiometricsProcessor, BiometricsService, DeleteResult, LegacyRecord, OperationInput,
    OperationOutput, SoftBiometricsProcessor,
};
pub use block::{AuthBlock, AuthBlockKind};
pub use challenge::{ChallengeCredentialBlock, KeyDelegate, SoftKeyDelegate};
pub use dispatcher::{AuthBlockDispatcher, PreparePurpose};
pub use fingerprint::FingerprintBlock;
pub use password::PasswordScryptBlock;
pub use pin_weaver::PinWeaverBlock;
pub use prepare::PreparedAuthFactorToken;
pub use recovery::CryptohomeRecoveryBlock;
pub use tpm::{DoubleWrappedCompatBlock, TpmBoundToPcrBlock, TpmNotBoundToPcrBlock};
pub use verifier::{CredentialVerifier, LegacyFingerprintVerifier, ScryptVerifier};
