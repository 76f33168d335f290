//! Auth factor model
//!
//! An auth factor is the persisted descriptor of one credential: its
//! type, label, per-type metadata and the auth block state required to
//! re-derive the wrapping keys. Factors live either in the user secret
//! stash or in a legacy vault keyset; the storage-type tag is
//! authoritative for choosing the persistence path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hexutil::{hex_bytes, hex_bytes_opt};

/// What an authenticated session is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthIntent {
    Decrypt,
    VerifyOnly,
    WebAuthn,
}

impl AuthIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthIntent::Decrypt => "decrypt",
            AuthIntent::VerifyOnly => "verify-only",
            AuthIntent::WebAuthn => "webauthn",
        }
    }
}

/// How many labels an authenticate request for a factor type carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelArity {
    None,
    Single,
    Multiple,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFactorType {
    Password,
    Pin,
    CryptohomeRecovery,
    Kiosk,
    SmartCard,
    LegacyFingerprint,
    Fingerprint,
}

impl AuthFactorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthFactorType::Password => "password",
            AuthFactorType::Pin => "pin",
            AuthFactorType::CryptohomeRecovery => "cryptohome_recovery",
            AuthFactorType::Kiosk => "kiosk",
            AuthFactorType::SmartCard => "smart_card",
            AuthFactorType::LegacyFingerprint => "legacy_fingerprint",
            AuthFactorType::Fingerprint => "fingerprint",
        }
    }

    pub fn label_arity(&self) -> LabelArity {
        match self {
            AuthFactorType::LegacyFingerprint => LabelArity::None,
            AuthFactorType::Fingerprint => LabelArity::Multiple,
            _ => LabelArity::Single,
        }
    }

    /// Factor types whose PinWeaver attempt counter is reset through a
    /// per-label reset secret.
    pub fn needs_reset_secret(&self) -> bool {
        matches!(self, AuthFactorType::Pin)
    }

    /// Factor types backed by a shared PinWeaver rate-limiter credential.
    pub fn needs_rate_limiter(&self) -> bool {
        matches!(self, AuthFactorType::Fingerprint)
    }

    /// Factor types that can be stored in a legacy vault keyset.
    pub fn is_supported_by_vault_keyset(&self) -> bool {
        matches!(
            self,
            AuthFactorType::Password
                | AuthFactorType::Pin
                | AuthFactorType::SmartCard
                | AuthFactorType::Kiosk
        )
    }

    /// Factor types needing an out-of-band session before auth or add.
    pub fn requires_prepare(&self) -> bool {
        matches!(
            self,
            AuthFactorType::Fingerprint | AuthFactorType::LegacyFingerprint
        )
    }
}

impl std::fmt::Display for AuthFactorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type opaque metadata carried with the factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthFactorMetadata {
    Password,
    Pin,
    Kiosk,
    SmartCard {
        #[serde(with = "hex_bytes")]
        public_key_spki_der: Vec<u8>,
    },
    CryptohomeRecovery {
        #[serde(with = "hex_bytes")]
        mediator_pub_key: Vec<u8>,
    },
    LegacyFingerprint,
    Fingerprint,
}

impl AuthFactorMetadata {
    pub fn factor_type(&self) -> AuthFactorType {
        match self {
            AuthFactorMetadata::Password => AuthFactorType::Password,
            AuthFactorMetadata::Pin => AuthFactorType::Pin,
            AuthFactorMetadata::Kiosk => AuthFactorType::Kiosk,
            AuthFactorMetadata::SmartCard { .. } => AuthFactorType::SmartCard,
            AuthFactorMetadata::CryptohomeRecovery { .. } => AuthFactorType::CryptohomeRecovery,
            AuthFactorMetadata::LegacyFingerprint => AuthFactorType::LegacyFingerprint,
            AuthFactorMetadata::Fingerprint => AuthFactorType::Fingerprint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordScryptState {
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub chaps_salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub reset_seed_salt: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmBoundToPcrState {
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    /// HVKKM sealed under the current-user PCR policy.
    #[serde(with = "hex_bytes")]
    pub sealed_hvkkm: Vec<u8>,
    /// HVKKM sealed under the pre-auth (extended) policy.
    #[serde(with = "hex_bytes")]
    pub extended_sealed_hvkkm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TpmNotBoundToPcrState {
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub sealed_hvkkm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinWeaverState {
    /// Label of the credential in the secure element's hash tree.
    pub le_label: u64,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    /// Pre-generated IVs; carried through Derive unchanged.
    #[serde(default, with = "hex_bytes_opt")]
    pub chaps_iv: Option<Vec<u8>>,
    #[serde(default, with = "hex_bytes_opt")]
    pub fek_iv: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevocationState {
    pub le_label: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    #[serde(with = "hex_bytes")]
    pub hsm_payload: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub plaintext_destination_share: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub channel_pub_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub encrypted_channel_priv_key: Vec<u8>,
    pub revocation_state: Option<RevocationState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeCredentialState {
    #[serde(with = "hex_bytes")]
    pub public_key_spki_der: Vec<u8>,
    pub algorithm: crate::auth_input::ChallengeSignatureAlgorithm,
    /// Stable salt whose signature yields the sealing secret.
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub scrypt_state: PasswordScryptState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoubleWrappedCompatState {
    pub scrypt_state: PasswordScryptState,
    pub tpm_state: TpmNotBoundToPcrState,
    /// HVKKM wrapped under the scrypt-derived key, so the keyset stays
    /// decryptable when the element copy is unavailable.
    #[serde(with = "hex_bytes")]
    pub wrapped_hvkkm: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintState {
    pub template_id: String,
    /// Secure-element label guarding the template secret.
    pub gsc_secret_label: Option<u64>,
}

/// Tagged union selecting one variant per auth block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum AuthBlockState {
    PasswordScrypt(PasswordScryptState),
    TpmBoundToPcr(TpmBoundToPcrState),
    TpmNotBoundToPcr(TpmNotBoundToPcrState),
    PinWeaver(PinWeaverState),
    CryptohomeRecovery(RecoveryState),
    ChallengeCredential(ChallengeCredentialState),
    DoubleWrappedCompat(DoubleWrappedCompatState),
    Fingerprint(FingerprintState),
}

/// Persisted credential descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthFactor {
    pub factor_type: AuthFactorType,
    pub label: String,
    pub metadata: AuthFactorMetadata,
    pub block_state: AuthBlockState,
}

impl AuthFactor {
    pub fn new(
        factor_type: AuthFactorType,
        label: impl Into<String>,
        metadata: AuthFactorMetadata,
        block_state: AuthBlockState,
    ) -> Self {
        Self {
            factor_type,
            label: label.into(),
            metadata,
            block_state,
        }
    }
}

/// Labels are used as file names and wrapping ids; restrict them to a
/// conservative character set.
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Which store holds a factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    UserSecretStash,
    VaultKeyset,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::UserSecretStash => "uss",
            StorageType::VaultKeyset => "vault_keyset",
        }
    }
}

/// Map of label to (factor, storage type) for one user. Labels are
/// unique: at most one factor per label regardless of storage.
#[derive(Debug, Clone, Default)]
pub struct AuthFactorMap {
    factors: BTreeMap<String, (AuthFactor, StorageType)>,
}

impl AuthFactorMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a factor, replacing any existing entry under the same
    /// label.
    pub fn add(&mut self, factor: AuthFactor, storage_type: StorageType) {
        self.factors
            .insert(factor.label.clone(), (factor, storage_type));
    }

    pub fn find(&self, label: &str) -> Option<(&AuthFactor, StorageType)> {
        self.factors
            .get(label)
            .map(|(factor, storage)| (factor, *storage))
    }

    pub fn remove(&mut self, label: &str) -> Option<(AuthFactor, StorageType)> {
        self.factors.remove(label)
    }

    pub fn size(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AuthFactor, StorageType)> {
        self.factors
            .values()
            .map(|(factor, storage)| (factor, *storage))
    }

    pub fn has_factor_with_storage(&self, storage_type: StorageType) -> bool {
        self.factors
            .values()
            .any(|(_, storage)| *storage == storage_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_factor(label: &str) -> AuthFactor {
        AuthFactor::new(
            AuthFactorType::Password,
            label,
            AuthFactorMetadata::Password,
            AuthBlockState::PasswordScrypt(PasswordScryptState {
                salt: vec![1; 16],
                chaps_salt: vec![2; 16],
                reset_seed_salt: vec![3; 16],
            }),
        )
    }

    #[test]
    fn map_enforces_unique_labels() {
        let mut map = AuthFactorMap::new();
        map.add(password_factor("legacy-0"), StorageType::VaultKeyset);
        map.add(password_factor("legacy-0"), StorageType::UserSecretStash);
        assert_eq!(map.size(), 1);
        let (_, storage) = map.find("legacy-0").unwrap();
        assert_eq!(storage, StorageType::UserSecretStash);
    }

    #[test]
    fn map_find_and_remove() {
        let mut map = AuthFactorMap::new();
        map.add(password_factor("a"), StorageType::VaultKeyset);
        assert!(map.find("a").is_some());
        assert!(map.find("b").is_none());
        assert!(map.remove("a").is_some());
        assert!(map.is_empty());
    }

    #[test]
    fn label_validation() {
        assert!(is_valid_label("legacy-0"));
        assert!(is_valid_label("pin_1"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("../escape"));
        assert!(!is_valid_label("with space"));
    }

    #[test]
    fn block_state_serde_round_trip() {
        let state = AuthBlockState::PinWeaver(PinWeaverState {
            le_label: 42,
            salt: vec![9; 16],
            chaps_iv: Some(vec![1; 16]),
            fek_iv: None,
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: AuthBlockState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn arity_per_type() {
        assert_eq!(
            AuthFactorType::LegacyFingerprint.label_arity(),
            LabelArity::None
        );
        assert_eq!(AuthFactorType::Password.label_arity(), LabelArity::Single);
        assert_eq!(
            AuthFactorType::Fingerprint.label_arity(),
            LabelArity::Multiple
        );
    }
}
