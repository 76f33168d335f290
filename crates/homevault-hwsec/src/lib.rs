//! Secure-element client
//!
//! Typed façade over the hardware security backend: rate-limited
//! credential storage (PinWeaver), sealing/unsealing under device-bound
//! policies, and the recovery-crypto frontend. The element is
//! process-global; implementations serialize their own calls.
//!
//! `SoftSecureElement` is the software backend used by tests and
//! development images.

pub mod element;
pub mod error;
pub mod soft;

pub use element::{
    DelaySchedule, OperationPolicy, PinWeaverCheckResult, RecoveryCreateResult,
    RecoveryRecoverInput, RecoveryRequestResult, SecureElement, INFINITE_DELAY,
};
pub use error::{HwsecError, HwsecResult};
pub use soft::SoftSecureElement;
