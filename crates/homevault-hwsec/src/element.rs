//! The `SecureElement` trait: the call surface the auth blocks compose.

use std::collections::BTreeMap;

use homevault_core::SecretBytes;

use crate::error::HwsecResult;

/// Delay schedule: wrong-attempt threshold to delay in seconds before the
/// next attempt. `INFINITE_DELAY` means the credential locks forever
/// once the threshold is reached.
pub type DelaySchedule = BTreeMap<u32, u32>;

/// Sentinel for a permanent lockout.
pub const INFINITE_DELAY: u32 = u32::MAX;

/// Device-bound policy a credential or sealed blob is gated on. An empty
/// policy means no user binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationPolicy {
    /// Obfuscated username the operation is bound to, if any.
    pub current_user: Option<String>,
}

impl OperationPolicy {
    pub fn for_user(obfuscated_username: impl Into<String>) -> Self {
        Self {
            current_user: Some(obfuscated_username.into()),
        }
    }
}

/// Successful `pw_check` reply.
#[derive(Debug)]
pub struct PinWeaverCheckResult {
    pub he_secret: SecretBytes,
    pub reset_secret: SecretBytes,
}

/// Output of `recovery_create`: the pieces persisted in the factor's
/// block state plus the secret the vault wrapping key derives from.
#[derive(Debug)]
pub struct RecoveryCreateResult {
    pub hsm_payload: Vec<u8>,
    pub plaintext_destination_share: Vec<u8>,
    pub channel_pub_key: Vec<u8>,
    pub encrypted_channel_priv_key: Vec<u8>,
    pub recovery_key: SecretBytes,
}

/// Output of `recovery_generate_request`.
#[derive(Debug)]
pub struct RecoveryRequestResult {
    pub recovery_request: Vec<u8>,
    pub ephemeral_pub_key: Vec<u8>,
}

/// Inputs to `recovery_recover`; all byte blobs are shuttled from the
/// stored block state and the client-provided mediator response.
#[derive(Debug)]
pub struct RecoveryRecoverInput<'a> {
    pub plaintext_destination_share: &'a [u8],
    pub encrypted_channel_priv_key: &'a [u8],
    pub epoch_response: &'a [u8],
    pub recovery_response: &'a [u8],
    pub ephemeral_pub_key: &'a [u8],
}

/// Stateless façade over the hardware backend. Implementations own their
/// synchronization; calls may be issued from any thread.
pub trait SecureElement: Send + Sync {
    fn is_ready(&self) -> bool;

    fn is_pinweaver_enabled(&self) -> bool;

    /// Insert a rate-limited credential. Returns the label assigned by
    /// the element's hash tree.
    fn pw_insert(
        &self,
        policies: &[OperationPolicy],
        le_secret: &SecretBytes,
        he_secret: &SecretBytes,
        reset_secret: &SecretBytes,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> HwsecResult<u64>;

    /// Check a low-entropy secret. Advances the per-label attempt counter
    /// on mismatch; a matching secret resets the counter and returns the
    /// high-entropy secret.
    fn pw_check(&self, label: u64, le_secret: &SecretBytes) -> HwsecResult<PinWeaverCheckResult>;

    /// Remove a credential. Callers treat `InvalidLabel` and
    /// `HashTreeLost` as success.
    fn pw_remove(&self, label: u64) -> HwsecResult<()>;

    /// Reset the attempt counter with the credential's reset secret.
    fn pw_reset(&self, label: u64, reset_secret: &SecretBytes) -> HwsecResult<()>;

    /// Current delay before the next attempt; `INFINITE_DELAY` means the
    /// credential is locked forever.
    fn pw_get_delay_seconds(&self, label: u64) -> HwsecResult<u32>;

    /// Current wrong-attempt count.
    fn pw_get_wrong_attempts(&self, label: u64) -> HwsecResult<u32>;

    /// Seal `key` under a device-bound policy.
    fn seal(&self, policy: &OperationPolicy, key: &SecretBytes) -> HwsecResult<Vec<u8>>;

    /// Unseal a blob previously sealed under the same policy.
    fn unseal(&self, policy: &OperationPolicy, sealed: &[u8]) -> HwsecResult<SecretBytes>;

    /// Create the on-device pieces of a recovery credential.
    fn recovery_create(&self, mediator_pub_key: &[u8]) -> HwsecResult<RecoveryCreateResult>;

    /// Build the request blob shipped to the off-device mediator.
    fn recovery_generate_request(
        &self,
        hsm_payload: &[u8],
        channel_pub_key: &[u8],
        epoch_response: &[u8],
    ) -> HwsecResult<RecoveryRequestResult>;

    /// Recombine the mediator's response with the on-device share.
    fn recovery_recover(&self, input: RecoveryRecoverInput<'_>) -> HwsecResult<SecretBytes>;
}

/// Delay implied by `schedule` after `wrong_attempts` failed attempts.
pub fn delay_for_attempts(schedule: &DelaySchedule, wrong_attempts: u32) -> u32 {
    let mut delay = 0;
    for (threshold, entry_delay) in schedule {
        if wrong_attempts >= *threshold {
            delay = *entry_delay;
        }
    }
    delay
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_schedule_lookup() {
        let mut schedule = DelaySchedule::new();
        schedule.insert(5, INFINITE_DELAY);
        assert_eq!(delay_for_attempts(&schedule, 0), 0);
        assert_eq!(delay_for_attempts(&schedule, 4), 0);
        assert_eq!(delay_for_attempts(&schedule, 5), INFINITE_DELAY);
        assert_eq!(delay_for_attempts(&schedule, 6), INFINITE_DELAY);
    }

    #[test]
    fn revocation_schedule_never_locks() {
        let mut schedule = DelaySchedule::new();
        schedule.insert(u32::MAX, 1);
        assert_eq!(delay_for_attempts(&schedule, 1_000_000), 0);
    }
}
