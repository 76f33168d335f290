//! Prepared-factor tokens
//!
//! Some factor types (fingerprint, legacy fingerprint) need an
//! out-of-band hardware session before auth or add. The token returned
//! by `Prepare*` is a scoped resource: dropping it terminates the
//! session unless it has been detached, which covers the case where the
//! hardware already ended the session itself and a second termination
//! would be an error.

use homevault_core::{AuthFactorType, Result};

pub trait PreparedAuthFactorToken: Send {
    fn factor_type(&self) -> AuthFactorType;

    /// End the underlying hardware session. Idempotent: terminating an
    /// already-ended or detached token is a no-op.
    fn terminate(&mut self) -> Result<()>;

    /// Disarm the token without terminating. Used when the hardware
    /// signalled a fatal error and tore the session down on its own.
    fn detach(&mut self);
}
