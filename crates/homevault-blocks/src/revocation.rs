//! Revocation wrapper
//!
//! Wraps another block's derived key as a per-credential secret feeding
//! HKDF into `(le_secret, kdf_skey)`, with a PinWeaver entry acting as a
//! purely revocable secret store: the delay schedule `{(u32::MAX, 1)}`
//! never locks on attempts, and removing the entry makes the outer key
//! underivable forever.

use homevault_core::crypto::{self, DEFAULT_KEY_SIZE};
use homevault_core::{Error, ErrorAction, ErrorKind, KeyBlobs, Result, RevocationState, SecretBytes};
use homevault_hwsec::{DelaySchedule, SecureElement};

// HKDF salt for combining the high-entropy secret with kdf_skey.
const HE_SECRET_HKDF_DATA: &[u8] = b"hkdf_data";
// HKDF infos for splitting the per-credential secret.
const LE_SECRET_INFO: &[u8] = b"le_secret_info";
const KDF_SKEY_INFO: &[u8] = b"kdf_skey_info";

/// Attempt-based lockout is pointless here, so the schedule allows
/// unlimited attempts.
fn revocation_delay_schedule() -> DelaySchedule {
    let mut schedule = DelaySchedule::new();
    schedule.insert(u32::MAX, 1);
    schedule
}

pub fn is_revocation_supported(element: &dyn SecureElement) -> bool {
    element.is_ready() && element.is_pinweaver_enabled()
}

fn split_per_credential_secret(
    key_blobs: &KeyBlobs,
    context: &str,
) -> Result<(SecretBytes, SecretBytes)> {
    let per_credential_secret = key_blobs.vkk_key.as_ref().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidArgument,
            format!("no wrapping key to revoke-wrap in {context}"),
        )
        .with_action(ErrorAction::DevCheckUnexpectedState)
    })?;
    // The key is high entropy, so the HKDF salt can be empty.
    let le_secret = crypto::hkdf_sha256(
        per_credential_secret.as_slice(),
        LE_SECRET_INFO,
        &[],
        DEFAULT_KEY_SIZE,
    )?;
    let kdf_skey = crypto::hkdf_sha256(
        per_credential_secret.as_slice(),
        KDF_SKEY_INFO,
        &[],
        DEFAULT_KEY_SIZE,
    )?;
    Ok((le_secret, kdf_skey))
}

fn combine_vkk_key(he_secret: &SecretBytes, kdf_skey: &SecretBytes) -> Result<SecretBytes> {
    crypto::hkdf_sha256(
        SecretBytes::combine(he_secret, kdf_skey).as_slice(),
        &[],
        HE_SECRET_HKDF_DATA,
        DEFAULT_KEY_SIZE,
    )
}

/// Insert the revocable entry and replace the outer wrapping key.
pub fn create(element: &dyn SecureElement, key_blobs: &mut KeyBlobs) -> Result<RevocationState> {
    let (le_secret, kdf_skey) = split_per_credential_secret(key_blobs, "create")?;
    let he_secret = crypto::random_secret(DEFAULT_KEY_SIZE);

    // Empty reset secret: resetting the counter cannot weaken a schedule
    // that never locks. No policies: PCR binding is the inner block's job.
    let label = element
        .pw_insert(
            &[],
            &le_secret,
            &he_secret,
            &SecretBytes::zeroed(DEFAULT_KEY_SIZE),
            &revocation_delay_schedule(),
            None,
        )
        .map_err(|e| e.into_core("revocation credential insert"))?;

    key_blobs.vkk_key = Some(combine_vkk_key(&he_secret, &kdf_skey)?);
    Ok(RevocationState {
        le_label: Some(label),
    })
}

/// Re-derive the outer wrapping key through the revocable entry.
pub fn derive(
    element: &dyn SecureElement,
    state: &RevocationState,
    key_blobs: &mut KeyBlobs,
) -> Result<()> {
    let label = state.le_label.ok_or_else(|| {
        Error::new(ErrorKind::InvalidArgument, "revocation state has no label")
            .with_action(ErrorAction::DevCheckUnexpectedState)
    })?;
    let (le_secret, kdf_skey) = split_per_credential_secret(key_blobs, "derive")?;
    let check = element
        .pw_check(label, &le_secret)
        .map_err(|e| e.into_core("revocation credential check"))?;
    key_blobs.vkk_key = Some(combine_vkk_key(&check.he_secret, &kdf_skey)?);
    Ok(())
}

/// Revoke the entry. Missing label and lost hash tree both count as
/// success: the secret is equally gone.
pub fn revoke(element: &dyn SecureElement, state: &RevocationState) -> Result<()> {
    let label = state.le_label.ok_or_else(|| {
        Error::new(ErrorKind::InvalidArgument, "revocation state has no label")
            .with_action(ErrorAction::DevCheckUnexpectedState)
    })?;
    match element.pw_remove(label) {
        Ok(()) => Ok(()),
        Err(err) if err.is_success_for_removal() => {
            tracing::warn!(label, %err, "treating revocation as success");
            Ok(())
        }
        Err(err) => Err(err.into_core("revocation credential removal")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homevault_hwsec::SoftSecureElement;

    fn blobs_with_key() -> KeyBlobs {
        KeyBlobs {
            vkk_key: Some(crypto::random_secret(32)),
            ..Default::default()
        }
    }

    #[test]
    fn wrap_then_derive_reproduces_key() {
        let element = SoftSecureElement::new();
        let mut created = blobs_with_key();
        let inner_key = created.vkk_key.clone();
        let state = create(&element, &mut created).unwrap();
        // The outer key replaced the inner one.
        assert_ne!(created.vkk_key, inner_key);

        let mut derived = KeyBlobs {
            vkk_key: inner_key,
            ..Default::default()
        };
        derive(&element, &state, &mut derived).unwrap();
        assert_eq!(derived.vkk_key, created.vkk_key);
    }

    #[test]
    fn derive_after_revoke_fails() {
        let element = SoftSecureElement::new();
        let mut blobs = blobs_with_key();
        let inner_key = blobs.vkk_key.clone();
        let state = create(&element, &mut blobs).unwrap();
        revoke(&element, &state).unwrap();

        let mut derived = KeyBlobs {
            vkk_key: inner_key,
            ..Default::default()
        };
        assert!(derive(&element, &state, &mut derived).is_err());
    }

    #[test]
    fn revoke_is_idempotent() {
        let element = SoftSecureElement::new();
        let mut blobs = blobs_with_key();
        let state = create(&element, &mut blobs).unwrap();
        revoke(&element, &state).unwrap();
        revoke(&element, &state).unwrap();
    }

    #[test]
    fn many_wrong_attempts_never_lock() {
        let element = SoftSecureElement::new();
        let mut blobs = blobs_with_key();
        let state = create(&element, &mut blobs).unwrap();

        let mut wrong = KeyBlobs {
            vkk_key: Some(crypto::random_secret(32)),
            ..Default::default()
        };
        for _ in 0..20 {
            assert!(derive(&element, &state, &mut wrong.clone()).is_err());
        }
        assert_eq!(
            element.pw_get_delay_seconds(state.le_label.unwrap()).unwrap(),
            0
        );
    }
}
