//! Typed request inputs and their translation into `AuthInput`
//!
//! Clients describe the credential they are presenting with a
//! `FactorInput`; the builder fills in the common fields (username,
//! obfuscated username, single-user lock) and the per-type bundles.
//! Kiosk inputs derive their passkey from the device-wide public mount
//! salt and the username, so kiosk apps need no stored secret.

use homevault_core::crypto;
use homevault_core::{
    AuthFactorType, AuthInput, ChallengeCredentialAuthInput, ChallengeSignatureAlgorithm, Error,
    ErrorKind, FingerprintAuthInput, RecoveryAuthInput, Result, SecretBytes, Username,
};
use homevault_storage::StorageLayout;

/// Mediator response bundle for authenticating with a recovery factor.
#[derive(Debug, Clone, Default)]
pub struct RecoveryDeriveInput {
    pub epoch_response: Vec<u8>,
    pub recovery_response: Vec<u8>,
    pub ledger_name: String,
    pub ledger_key_hash: u32,
    pub ledger_public_key: Vec<u8>,
}

/// The typed credential payload of an add/authenticate/update request.
#[derive(Debug, Clone)]
pub enum FactorInput {
    Password {
        secret: SecretBytes,
    },
    Pin {
        secret: SecretBytes,
    },
    Kiosk,
    SmartCard {
        public_key_spki_der: Vec<u8>,
        signature_algorithms: Vec<ChallengeSignatureAlgorithm>,
        key_delegate_service_name: String,
    },
    CryptohomeRecovery {
        mediator_pub_key: Vec<u8>,
        user_gaia_id: String,
        device_user_id: String,
        derive: Option<RecoveryDeriveInput>,
    },
    LegacyFingerprint,
    Fingerprint,
}

impl FactorInput {
    pub fn factor_type(&self) -> AuthFactorType {
        match self {
            FactorInput::Password { .. } => AuthFactorType::Password,
            FactorInput::Pin { .. } => AuthFactorType::Pin,
            FactorInput::Kiosk => AuthFactorType::Kiosk,
            FactorInput::SmartCard { .. } => AuthFactorType::SmartCard,
            FactorInput::CryptohomeRecovery { .. } => AuthFactorType::CryptohomeRecovery,
            FactorInput::LegacyFingerprint => AuthFactorType::LegacyFingerprint,
            FactorInput::Fingerprint => AuthFactorType::Fingerprint,
        }
    }
}

/// Translate a request input into the auth block input bundle.
pub fn create_auth_input(
    layout: &StorageLayout,
    factor_input: &FactorInput,
    username: &Username,
    locked_to_single_user: bool,
    recovery_ephemeral_pub_key: Option<&[u8]>,
) -> Result<AuthInput> {
    let mut auth_input = match factor_input {
        FactorInput::Password { secret } | FactorInput::Pin { secret } => AuthInput {
            user_input: Some(secret.clone()),
            ..Default::default()
        },
        FactorInput::Kiosk => AuthInput {
            user_input: Some(kiosk_passkey(layout, username)?),
            ..Default::default()
        },
        FactorInput::SmartCard {
            public_key_spki_der,
            signature_algorithms,
            key_delegate_service_name,
        } => {
            if signature_algorithms.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    "no signature algorithms in smart card input",
                ));
            }
            AuthInput {
                challenge_credential: Some(ChallengeCredentialAuthInput {
                    public_key_spki_der: public_key_spki_der.clone(),
                    challenge_signature_algorithms: signature_algorithms.clone(),
                    key_delegate_service_name: Some(key_delegate_service_name.clone()),
                }),
                ..Default::default()
            }
        }
        FactorInput::CryptohomeRecovery {
            mediator_pub_key,
            user_gaia_id,
            device_user_id,
            derive,
        } => {
            let mut recovery = RecoveryAuthInput {
                mediator_pub_key: mediator_pub_key.clone(),
                user_gaia_id: user_gaia_id.clone(),
                device_user_id: device_user_id.clone(),
                ephemeral_pub_key: recovery_ephemeral_pub_key
                    .map(|key| key.to_vec())
                    .unwrap_or_default(),
                ..Default::default()
            };
            if let Some(derive) = derive {
                recovery.epoch_response = derive.epoch_response.clone();
                recovery.recovery_response = derive.recovery_response.clone();
                recovery.ledger_name = derive.ledger_name.clone();
                recovery.ledger_key_hash = derive.ledger_key_hash;
                recovery.ledger_public_key = derive.ledger_public_key.clone();
            }
            AuthInput {
                recovery: Some(recovery),
                ..Default::default()
            }
        }
        FactorInput::LegacyFingerprint | FactorInput::Fingerprint => AuthInput {
            fingerprint: Some(FingerprintAuthInput::default()),
            ..Default::default()
        },
    };

    auth_input.username = Some(username.clone());
    auth_input.obfuscated_username = Some(username.obfuscate());
    auth_input.locked_to_single_user = locked_to_single_user;
    Ok(auth_input)
}

/// Kiosk passkey: HMAC of the username under the device's public mount
/// salt. Deterministic per device, no stored secret.
fn kiosk_passkey(layout: &StorageLayout, username: &Username) -> Result<SecretBytes> {
    let salt = layout.public_mount_salt()?;
    Ok(crypto::hmac_sha256(&salt, username.as_str().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> (tempfile::TempDir, StorageLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        (dir, layout)
    }

    #[test]
    fn kiosk_passkey_is_stable_per_device() {
        let (_dir, layout) = layout();
        let alice = Username::new("kiosk-app@x");
        let first = create_auth_input(&layout, &FactorInput::Kiosk, &alice, false, None).unwrap();
        let second = create_auth_input(&layout, &FactorInput::Kiosk, &alice, false, None).unwrap();
        assert_eq!(first.user_input, second.user_input);
        assert!(first.user_input.is_some());
    }

    #[test]
    fn common_fields_are_filled() {
        let (_dir, layout) = layout();
        let alice = Username::new("alice@x");
        let input = create_auth_input(
            &layout,
            &FactorInput::Password {
                secret: SecretBytes::from("hunter2"),
            },
            &alice,
            true,
            None,
        )
        .unwrap();
        assert_eq!(input.username, Some(alice.clone()));
        assert_eq!(input.obfuscated_username, Some(alice.obfuscate()));
        assert!(input.locked_to_single_user);
    }

    #[test]
    fn recovery_input_carries_session_ephemeral_key() {
        let (_dir, layout) = layout();
        let alice = Username::new("alice@x");
        let ephemeral = vec![7u8; 32];
        let input = create_auth_input(
            &layout,
            &FactorInput::CryptohomeRecovery {
                mediator_pub_key: vec![1; 32],
                user_gaia_id: "gaia".into(),
                device_user_id: "device".into(),
                derive: Some(RecoveryDeriveInput {
                    epoch_response: b"epoch".to_vec(),
                    recovery_response: b"response".to_vec(),
                    ..Default::default()
                }),
            },
            &alice,
            false,
            Some(&ephemeral),
        )
        .unwrap();
        let recovery = input.recovery.unwrap();
        assert_eq!(recovery.ephemeral_pub_key, ephemeral);
        assert_eq!(recovery.epoch_response, b"epoch");
    }

    #[test]
    fn smart_card_requires_algorithms() {
        let (_dir, layout) = layout();
        let err = create_auth_input(
            &layout,
            &FactorInput::SmartCard {
                public_key_spki_der: vec![1; 16],
                signature_algorithms: vec![],
                key_delegate_service_name: "org.example.Delegate".into(),
            },
            &Username::new("alice@x"),
            false,
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
