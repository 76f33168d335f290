//! Core data model and crypto primitives for Homevault
//!
//! Everything in this crate is backend-agnostic: secret containers,
//! usernames, the auth factor model, key objects and the primitives
//! facade that the auth blocks compose.

pub mod auth_input;
pub mod crypto;
pub mod error;
pub mod factor;
pub mod hexutil;
pub mod key_objects;
pub mod secret;
pub mod token;
pub mod username;

pub use auth_input::{
    AuthInput, ChallengeCredentialAuthInput, ChallengeSignatureAlgorithm, FingerprintAuthInput,
    RecoveryAuthInput,
};
pub use error::{Error, ErrorAction, ErrorKind, Result};
pub use factor::{
    AuthBlockState, AuthFactor, AuthFactorMap, AuthFactorMetadata, AuthFactorType, AuthIntent,
    ChallengeCredentialState, DoubleWrappedCompatState, FingerprintState, LabelArity,
    PasswordScryptState, PinWeaverState, RecoveryState, RevocationState, StorageType,
    TpmBoundToPcrState, TpmNotBoundToPcrState,
};
pub use key_objects::{FileSystemKeyset, KeyBlobs};
pub use secret::SecretBytes;
pub use token::UnguessableToken;
pub use username::{ObfuscatedUsername, Username};
