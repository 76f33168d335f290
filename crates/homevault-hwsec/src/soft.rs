//! Software secure element
//!
//! Emulates the hardware backend for tests and development images: an
//! in-memory credential table with delay schedules and wrong-attempt
//! counters, policy-bound sealing, and a deterministic stand-in for the
//! recovery-crypto flow. All operations are serialized behind a single
//! lock, matching the process-global element contract.

use std::collections::BTreeMap;

use homevault_core::crypto::{aes_gcm_open, aes_gcm_seal, random_bytes, random_secret, sha256};
use homevault_core::SecretBytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::element::{
    delay_for_attempts, DelaySchedule, OperationPolicy, PinWeaverCheckResult,
    RecoveryCreateResult, RecoveryRecoverInput, RecoveryRequestResult, SecureElement,
    INFINITE_DELAY,
};
use crate::error::{HwsecError, HwsecResult};

const SECRET_SIZE: usize = 32;

const HSM_PAYLOAD_AAD: &[u8] = b"recovery-hsm";
const CHANNEL_KEY_AAD: &[u8] = b"recovery-channel";
const RESPONSE_AAD: &[u8] = b"recovery-response";

struct CredentialRecord {
    // Retained for parity with the hardware call; the soft element does
    // not evaluate device-config policies.
    #[allow(dead_code)]
    policies: Vec<OperationPolicy>,
    le_secret: SecretBytes,
    he_secret: SecretBytes,
    reset_secret: SecretBytes,
    delay_schedule: DelaySchedule,
    wrong_attempts: u32,
    #[allow(dead_code)]
    expiration_delay: Option<u32>,
}

struct Inner {
    next_label: u64,
    credentials: BTreeMap<u64, CredentialRecord>,
}

/// In-memory element. Clone the `Arc` it usually lives in, not the
/// element itself; there is exactly one per process.
pub struct SoftSecureElement {
    inner: Mutex<Inner>,
    device_key: SecretBytes,
    ready: bool,
    pinweaver_enabled: bool,
}

impl SoftSecureElement {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_label: 1,
                credentials: BTreeMap::new(),
            }),
            device_key: random_secret(SECRET_SIZE),
            ready: true,
            pinweaver_enabled: true,
        }
    }

    /// Element reporting no PinWeaver support.
    pub fn without_pinweaver() -> Self {
        Self {
            pinweaver_enabled: false,
            ..Self::new()
        }
    }

    /// Element reporting not-ready, for failure-path tests.
    pub fn unready() -> Self {
        Self {
            ready: false,
            ..Self::new()
        }
    }

    /// Simulate the off-device mediator: decrypt the HSM payload from a
    /// recovery request and produce the response blob the device can
    /// recombine. Test-support only; a production mediator is a remote
    /// service.
    pub fn simulate_mediation(
        mediator_pub_key: &[u8],
        recovery_request: &[u8],
    ) -> HwsecResult<Vec<u8>> {
        let request: RecoveryRequestBlob = serde_json::from_slice(recovery_request)
            .map_err(|e| HwsecError::RecoveryFailed(format!("bad recovery request: {e}")))?;
        let mediator_share = aes_gcm_open(
            &sha256(mediator_pub_key),
            HSM_PAYLOAD_AAD,
            &request.hsm_payload,
        )
        .map_err(|_| HwsecError::RecoveryFailed("cannot open hsm payload".into()))?;
        aes_gcm_seal(
            &response_key(
                &request.channel_pub_key,
                &request.ephemeral_pub_key,
                &request.epoch_response,
            ),
            RESPONSE_AAD,
            mediator_share.as_slice(),
        )
        .map_err(|_| HwsecError::RecoveryFailed("cannot seal mediator response".into()))
    }
}

impl Default for SoftSecureElement {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct RecoveryRequestBlob {
    #[serde(with = "homevault_core::hexutil::hex_bytes")]
    hsm_payload: Vec<u8>,
    #[serde(with = "homevault_core::hexutil::hex_bytes")]
    channel_pub_key: Vec<u8>,
    #[serde(with = "homevault_core::hexutil::hex_bytes")]
    epoch_response: Vec<u8>,
    #[serde(with = "homevault_core::hexutil::hex_bytes")]
    ephemeral_pub_key: Vec<u8>,
}

fn policy_aad(policy: &OperationPolicy) -> Vec<u8> {
    match &policy.current_user {
        Some(user) => format!("policy-user:{user}").into_bytes(),
        None => b"policy-user:-".to_vec(),
    }
}

fn response_key(channel_pub_key: &[u8], ephemeral_pub_key: &[u8], epoch_response: &[u8]) -> [u8; 32] {
    let mut input = Vec::new();
    input.extend_from_slice(channel_pub_key);
    input.extend_from_slice(ephemeral_pub_key);
    input.extend_from_slice(epoch_response);
    sha256(&input)
}

fn xor_shares(a: &[u8], b: &[u8]) -> SecretBytes {
    SecretBytes::new(a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect())
}

impl SecureElement for SoftSecureElement {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn is_pinweaver_enabled(&self) -> bool {
        self.pinweaver_enabled
    }

    fn pw_insert(
        &self,
        policies: &[OperationPolicy],
        le_secret: &SecretBytes,
        he_secret: &SecretBytes,
        reset_secret: &SecretBytes,
        delay_schedule: &DelaySchedule,
        expiration_delay: Option<u32>,
    ) -> HwsecResult<u64> {
        if !self.ready {
            return Err(HwsecError::NotReady);
        }
        if !self.pinweaver_enabled {
            return Err(HwsecError::PinWeaverDisabled);
        }
        let mut inner = self.inner.lock();
        let label = inner.next_label;
        inner.next_label += 1;
        inner.credentials.insert(
            label,
            CredentialRecord {
                policies: policies.to_vec(),
                le_secret: le_secret.clone(),
                he_secret: he_secret.clone(),
                reset_secret: reset_secret.clone(),
                delay_schedule: delay_schedule.clone(),
                wrong_attempts: 0,
                expiration_delay,
            },
        );
        tracing::debug!(label, "inserted pinweaver credential");
        Ok(label)
    }

    fn pw_check(&self, label: u64, le_secret: &SecretBytes) -> HwsecResult<PinWeaverCheckResult> {
        let mut inner = self.inner.lock();
        let record = inner
            .credentials
            .get_mut(&label)
            .ok_or(HwsecError::InvalidLabel(label))?;
        if delay_for_attempts(&record.delay_schedule, record.wrong_attempts) == INFINITE_DELAY {
            return Err(HwsecError::TooManyAttempts);
        }
        let matches: bool = record
            .le_secret
            .as_slice()
            .ct_eq(le_secret.as_slice())
            .into();
        if !matches {
            record.wrong_attempts += 1;
            tracing::debug!(label, attempts = record.wrong_attempts, "wrong le secret");
            return Err(HwsecError::InvalidLeSecret);
        }
        record.wrong_attempts = 0;
        Ok(PinWeaverCheckResult {
            he_secret: record.he_secret.clone(),
            reset_secret: record.reset_secret.clone(),
        })
    }

    fn pw_remove(&self, label: u64) -> HwsecResult<()> {
        let mut inner = self.inner.lock();
        match inner.credentials.remove(&label) {
            Some(_) => {
                tracing::debug!(label, "removed pinweaver credential");
                Ok(())
            }
            None => Err(HwsecError::InvalidLabel(label)),
        }
    }

    fn pw_reset(&self, label: u64, reset_secret: &SecretBytes) -> HwsecResult<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .credentials
            .get_mut(&label)
            .ok_or(HwsecError::InvalidLabel(label))?;
        let matches: bool = record
            .reset_secret
            .as_slice()
            .ct_eq(reset_secret.as_slice())
            .into();
        if !matches {
            return Err(HwsecError::InvalidResetSecret);
        }
        record.wrong_attempts = 0;
        Ok(())
    }

    fn pw_get_delay_seconds(&self, label: u64) -> HwsecResult<u32> {
        let inner = self.inner.lock();
        let record = inner
            .credentials
            .get(&label)
            .ok_or(HwsecError::InvalidLabel(label))?;
        Ok(delay_for_attempts(&record.delay_schedule, record.wrong_attempts))
    }

    fn pw_get_wrong_attempts(&self, label: u64) -> HwsecResult<u32> {
        let inner = self.inner.lock();
        let record = inner
            .credentials
            .get(&label)
            .ok_or(HwsecError::InvalidLabel(label))?;
        Ok(record.wrong_attempts)
    }

    fn seal(&self, policy: &OperationPolicy, key: &SecretBytes) -> HwsecResult<Vec<u8>> {
        if !self.ready {
            return Err(HwsecError::NotReady);
        }
        aes_gcm_seal(self.device_key.as_slice(), &policy_aad(policy), key.as_slice())
            .map_err(|e| HwsecError::Backend(format!("sealing failed: {e}")))
    }

    fn unseal(&self, policy: &OperationPolicy, sealed: &[u8]) -> HwsecResult<SecretBytes> {
        if !self.ready {
            return Err(HwsecError::NotReady);
        }
        aes_gcm_open(self.device_key.as_slice(), &policy_aad(policy), sealed)
            .map_err(|_| HwsecError::UnsealFailed)
    }

    fn recovery_create(&self, mediator_pub_key: &[u8]) -> HwsecResult<RecoveryCreateResult> {
        if mediator_pub_key.is_empty() {
            return Err(HwsecError::RecoveryFailed("empty mediator key".into()));
        }
        let recovery_key = random_secret(SECRET_SIZE);
        let destination_share = random_bytes(SECRET_SIZE);
        let mediator_share = xor_shares(recovery_key.as_slice(), &destination_share);

        let channel_priv_key = random_secret(SECRET_SIZE);
        let channel_pub_key = sha256(channel_priv_key.as_slice()).to_vec();
        let encrypted_channel_priv_key = aes_gcm_seal(
            self.device_key.as_slice(),
            CHANNEL_KEY_AAD,
            channel_priv_key.as_slice(),
        )
        .map_err(|e| HwsecError::RecoveryFailed(format!("channel key sealing failed: {e}")))?;

        let hsm_payload = aes_gcm_seal(
            &sha256(mediator_pub_key),
            HSM_PAYLOAD_AAD,
            mediator_share.as_slice(),
        )
        .map_err(|e| HwsecError::RecoveryFailed(format!("hsm payload sealing failed: {e}")))?;

        Ok(RecoveryCreateResult {
            hsm_payload,
            plaintext_destination_share: destination_share,
            channel_pub_key,
            encrypted_channel_priv_key,
            recovery_key,
        })
    }

    fn recovery_generate_request(
        &self,
        hsm_payload: &[u8],
        channel_pub_key: &[u8],
        epoch_response: &[u8],
    ) -> HwsecResult<RecoveryRequestResult> {
        let ephemeral_pub_key = random_bytes(SECRET_SIZE);
        let blob = RecoveryRequestBlob {
            hsm_payload: hsm_payload.to_vec(),
            channel_pub_key: channel_pub_key.to_vec(),
            epoch_response: epoch_response.to_vec(),
            ephemeral_pub_key: ephemeral_pub_key.clone(),
        };
        let recovery_request = serde_json::to_vec(&blob)
            .map_err(|e| HwsecError::RecoveryFailed(format!("request serialization: {e}")))?;
        Ok(RecoveryRequestResult {
            recovery_request,
            ephemeral_pub_key,
        })
    }

    fn recovery_recover(&self, input: RecoveryRecoverInput<'_>) -> HwsecResult<SecretBytes> {
        let channel_priv_key = aes_gcm_open(
            self.device_key.as_slice(),
            CHANNEL_KEY_AAD,
            input.encrypted_channel_priv_key,
        )
        .map_err(|_| HwsecError::RecoveryFailed("cannot open channel key".into()))?;
        let channel_pub_key = sha256(channel_priv_key.as_slice());
        let mediator_share = aes_gcm_open(
            &response_key(&channel_pub_key, input.ephemeral_pub_key, input.epoch_response),
            RESPONSE_AAD,
            input.recovery_response,
        )
        .map_err(|_| HwsecError::RecoveryFailed("cannot open mediator response".into()))?;
        if mediator_share.len() != input.plaintext_destination_share.len() {
            return Err(HwsecError::RecoveryFailed("share size mismatch".into()));
        }
        Ok(xor_shares(
            mediator_share.as_slice(),
            input.plaintext_destination_share,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule_five_then_lockout() -> DelaySchedule {
        let mut schedule = DelaySchedule::new();
        schedule.insert(5, INFINITE_DELAY);
        schedule
    }

    fn insert_credential(element: &SoftSecureElement) -> (u64, SecretBytes, SecretBytes) {
        let le_secret = random_secret(32);
        let reset_secret = random_secret(32);
        let label = element
            .pw_insert(
                &[OperationPolicy::default()],
                &le_secret,
                &random_secret(32),
                &reset_secret,
                &schedule_five_then_lockout(),
                None,
            )
            .unwrap();
        (label, le_secret, reset_secret)
    }

    #[test]
    fn check_matches_and_resets_counter() {
        let element = SoftSecureElement::new();
        let (label, le_secret, _) = insert_credential(&element);

        assert!(matches!(
            element.pw_check(label, &random_secret(32)),
            Err(HwsecError::InvalidLeSecret)
        ));
        assert_eq!(element.pw_get_wrong_attempts(label).unwrap(), 1);

        element.pw_check(label, &le_secret).unwrap();
        assert_eq!(element.pw_get_wrong_attempts(label).unwrap(), 0);
    }

    #[test]
    fn lockout_is_sticky_even_for_correct_secret() {
        let element = SoftSecureElement::new();
        let (label, le_secret, _) = insert_credential(&element);

        for _ in 0..5 {
            let _ = element.pw_check(label, &random_secret(32));
        }
        assert_eq!(element.pw_get_delay_seconds(label).unwrap(), INFINITE_DELAY);
        assert!(matches!(
            element.pw_check(label, &le_secret),
            Err(HwsecError::TooManyAttempts)
        ));
    }

    #[test]
    fn reset_restores_the_counter() {
        let element = SoftSecureElement::new();
        let (label, le_secret, reset_secret) = insert_credential(&element);

        let _ = element.pw_check(label, &random_secret(32));
        element.pw_reset(label, &reset_secret).unwrap();
        assert_eq!(element.pw_get_wrong_attempts(label).unwrap(), 0);
        element.pw_check(label, &le_secret).unwrap();
    }

    #[test]
    fn reset_with_wrong_secret_fails() {
        let element = SoftSecureElement::new();
        let (label, _, _) = insert_credential(&element);
        assert!(matches!(
            element.pw_reset(label, &random_secret(32)),
            Err(HwsecError::InvalidResetSecret)
        ));
    }

    #[test]
    fn remove_unknown_label_reports_invalid_label() {
        let element = SoftSecureElement::new();
        let err = element.pw_remove(999).unwrap_err();
        assert!(err.is_success_for_removal());
    }

    #[test]
    fn seal_is_policy_bound() {
        let element = SoftSecureElement::new();
        let key = random_secret(32);
        let policy = OperationPolicy::for_user("alice-hash");
        let sealed = element.seal(&policy, &key).unwrap();
        assert_eq!(element.unseal(&policy, &sealed).unwrap(), key);
        assert!(matches!(
            element.unseal(&OperationPolicy::default(), &sealed),
            Err(HwsecError::UnsealFailed)
        ));
    }

    #[test]
    fn recovery_round_trip_through_mediator() {
        let element = SoftSecureElement::new();
        let mediator_pub_key = random_bytes(32);
        let created = element.recovery_create(&mediator_pub_key).unwrap();

        let epoch_response = b"epoch-7".to_vec();
        let request = element
            .recovery_generate_request(
                &created.hsm_payload,
                &created.channel_pub_key,
                &epoch_response,
            )
            .unwrap();
        let response =
            SoftSecureElement::simulate_mediation(&mediator_pub_key, &request.recovery_request)
                .unwrap();

        let recovered = element
            .recovery_recover(RecoveryRecoverInput {
                plaintext_destination_share: &created.plaintext_destination_share,
                encrypted_channel_priv_key: &created.encrypted_channel_priv_key,
                epoch_response: &epoch_response,
                recovery_response: &response,
                ephemeral_pub_key: &request.ephemeral_pub_key,
            })
            .unwrap();
        assert_eq!(recovered, created.recovery_key);
    }
}
