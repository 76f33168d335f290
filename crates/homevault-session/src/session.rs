//! The auth session state machine
//!
//! A session is constructed per client request and owns the attempt's
//! transient state: the requested intent, the authorized intent set,
//! the in-memory stash and main key after a successful decrypt, the
//! authenticated keyset, and the timeout. All methods complete in call
//! order on the session; it is a serial actor. Timeout expiry is
//! evaluated on entry to every operation, never mid-handler.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use homevault_blocks::{AuthBlockDispatcher, PreparePurpose, PreparedAuthFactorToken};
use homevault_core::crypto::{self, RESET_SECRET_SIZE};
use homevault_core::{
    AuthBlockState, AuthFactor, AuthFactorMap, AuthFactorMetadata, AuthFactorType, AuthInput,
    AuthIntent, Error, ErrorAction, ErrorKind, FileSystemKeyset, KeyBlobs, LabelArity,
    ObfuscatedUsername, Result, SecretBytes, StorageType, UnguessableToken, Username,
};
use homevault_core::factor::is_valid_label;
use homevault_hwsec::SecureElement;
use homevault_storage::{
    AuthFactorManager, KeysetManagement, StorageLayout, UserSecretStash, UssStorage, VaultKeyset,
};
use tokio::time::Instant;

use crate::auth_input_builder::{create_auth_input, FactorInput};
use crate::uss_migrator::UssMigrator;
use crate::verifier_cache::VerifierCache;

/// Sessions expire this long after the last successful authentication.
pub const AUTH_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const HIBERNATE_SECRET_HMAC_MESSAGE: &[u8] = b"AuthTimeHibernateSecret";

const FULL_AUTH_INTENTS: [AuthIntent; 3] = [
    AuthIntent::Decrypt,
    AuthIntent::VerifyOnly,
    AuthIntent::WebAuthn,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    FurtherFactorRequired,
    Authenticated,
    TimedOut,
}

/// Feature switches carried into every session.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub user_secret_stash: bool,
    pub migrate_to_user_secret_stash: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            user_secret_stash: true,
            migrate_to_user_secret_stash: true,
        }
    }
}

/// Everything a session borrows from the daemon. No global singletons:
/// hardware clients, storage facades and feature flags all arrive here.
#[derive(Clone)]
pub struct BackingApis {
    pub element: Arc<dyn SecureElement>,
    pub dispatcher: Arc<AuthBlockDispatcher>,
    pub layout: Arc<StorageLayout>,
    pub keyset_management: Arc<KeysetManagement>,
    pub auth_factor_manager: Arc<AuthFactorManager>,
    pub uss_storage: Arc<UssStorage>,
    pub verifier_cache: Arc<VerifierCache>,
    pub features: Features,
}

type OnTimeout = Box<dyn FnOnce(UnguessableToken) + Send>;

pub struct AuthSession {
    username: Username,
    obfuscated_username: ObfuscatedUsername,
    is_ephemeral_user: bool,
    auth_intent: AuthIntent,

    status: AuthStatus,
    authorized_intents: BTreeSet<AuthIntent>,
    token: UnguessableToken,
    deadline: Option<Instant>,
    on_timeout: Option<OnTimeout>,

    user_exists: bool,
    auth_factor_map: AuthFactorMap,
    authenticated_factor_label: Option<String>,

    file_system_keyset: Option<FileSystemKeyset>,
    user_secret_stash: Option<UserSecretStash>,
    uss_main_key: Option<SecretBytes>,
    vault_keyset: Option<VaultKeyset>,
    enable_backup_vk_with_uss: bool,
    recovery_ephemeral_pub_key: Option<Vec<u8>>,
    active_factor_tokens: HashMap<AuthFactorType, Box<dyn PreparedAuthFactorToken>>,

    apis: BackingApis,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("username", &self.username)
            .field("status", &self.status)
            .field("token", &self.token)
            .finish()
    }
}

impl AuthSession {
    pub fn create(
        account_id: Username,
        is_ephemeral_user: bool,
        intent: AuthIntent,
        apis: BackingApis,
    ) -> Self {
        let obfuscated_username = account_id.obfuscate();

        // A user exists if they have a persistent directory, or are
        // active without one (ephemeral with live verifiers).
        let persistent_user_exists = apis.layout.user_exists(&obfuscated_username);
        let user_is_active = apis.verifier_cache.has_user(&obfuscated_username);
        let user_exists = persistent_user_exists || user_is_active;

        let auth_factor_map = if persistent_user_exists {
            load_auth_factor_map(
                &obfuscated_username,
                &apis.auth_factor_manager,
                &apis.keyset_management,
                apis.uss_storage.exists(&obfuscated_username),
            )
        } else {
            AuthFactorMap::new()
        };

        let enable_backup_vk_with_uss = all_factors_have_keysets(
            &obfuscated_username,
            &auth_factor_map,
            &apis.keyset_management,
        );

        let session = Self {
            username: account_id,
            obfuscated_username,
            is_ephemeral_user,
            auth_intent: intent,
            status: AuthStatus::FurtherFactorRequired,
            authorized_intents: BTreeSet::new(),
            token: UnguessableToken::create(),
            deadline: None,
            on_timeout: None,
            user_exists,
            auth_factor_map,
            authenticated_factor_label: None,
            file_system_keyset: None,
            user_secret_stash: None,
            uss_main_key: None,
            vault_keyset: None,
            enable_backup_vk_with_uss,
            recovery_ephemeral_pub_key: None,
            active_factor_tokens: HashMap::new(),
            apis,
        };

        let factors: Vec<String> = session
            .auth_factor_map
            .iter()
            .map(|(factor, storage)| {
                format!("{}(type {} {})", factor.label, factor.factor_type, storage.as_str())
            })
            .collect();
        tracing::info!(
            user = %session.obfuscated_username,
            is_ephemeral = session.is_ephemeral_user,
            intent = intent.as_str(),
            user_exists = session.user_exists,
            factors = factors.join(","),
            "auth session started"
        );
        session
    }

    // ---- accessors ----------------------------------------------------

    pub fn token(&self) -> UnguessableToken {
        self.token
    }

    pub fn serialized_token(&self) -> [u8; 16] {
        self.token.to_serialized()
    }

    pub fn status(&mut self) -> AuthStatus {
        self.tick();
        self.status
    }

    pub fn authorized_intents(&self) -> &BTreeSet<AuthIntent> {
        &self.authorized_intents
    }

    pub fn user_exists(&self) -> bool {
        self.user_exists
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    pub fn obfuscated_username(&self) -> &ObfuscatedUsername {
        &self.obfuscated_username
    }

    pub fn auth_factor_map(&self) -> &AuthFactorMap {
        &self.auth_factor_map
    }

    pub fn file_system_keyset(&self) -> Result<&FileSystemKeyset> {
        self.file_system_keyset.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::UnauthenticatedAuthSession,
                "no filesystem keyset before authentication",
            )
        })
    }

    /// HMAC of `fnek` then `fek` under the hibernate message; needs a
    /// decrypted keyset.
    pub fn get_hibernate_secret(&self) -> Result<SecretBytes> {
        let keyset = self.file_system_keyset()?;
        Ok(crypto::hmac_sha256(
            SecretBytes::combine(&keyset.fnek, &keyset.fek).as_slice(),
            HIBERNATE_SECRET_HMAC_MESSAGE,
        ))
    }

    // ---- timeout handling ---------------------------------------------

    fn tick(&mut self) {
        if self.status == AuthStatus::TimedOut {
            return;
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.time_out();
            }
        }
    }

    fn time_out(&mut self) {
        tracing::info!(user = %self.obfuscated_username, "auth session timed out");
        self.status = AuthStatus::TimedOut;
        self.authorized_intents.clear();
        if let Some(on_timeout) = self.on_timeout.take() {
            on_timeout(self.token);
        }
    }

    /// Evaluate expiry now; true if the session is (now) timed out.
    pub fn poll_timeout(&mut self) -> bool {
        self.tick();
        self.status == AuthStatus::TimedOut
    }

    pub fn set_on_timeout(&mut self, on_timeout: OnTimeout) {
        if self.status == AuthStatus::TimedOut {
            on_timeout(self.token);
        } else {
            self.on_timeout = Some(on_timeout);
        }
    }

    /// Remaining time before expiry: `None` while the timer has not
    /// started, zero once expired.
    pub fn get_remaining_time(&mut self) -> Option<Duration> {
        self.tick();
        if self.status == AuthStatus::TimedOut {
            return Some(Duration::ZERO);
        }
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Add to the remaining time. Fails once the session expired.
    pub fn extend_timeout(&mut self, extension: Duration) -> Result<()> {
        self.tick();
        if self.status == AuthStatus::TimedOut {
            return Err(Error::new(
                ErrorKind::InvalidAuthSessionToken,
                "session already timed out",
            )
            .with_actions([
                ErrorAction::Reboot,
                ErrorAction::Retry,
                ErrorAction::DevCheckUnexpectedState,
            ]));
        }
        if let Some(deadline) = self.deadline {
            self.deadline = Some(deadline + extension);
        }
        Ok(())
    }

    fn ensure_active(&mut self) -> Result<()> {
        self.tick();
        if self.status == AuthStatus::TimedOut {
            return Err(Error::new(
                ErrorKind::InvalidAuthSessionToken,
                "session timed out",
            )
            .with_actions([ErrorAction::Reboot, ErrorAction::Retry]));
        }
        Ok(())
    }

    fn ensure_authenticated(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.status != AuthStatus::Authenticated {
            return Err(Error::new(
                ErrorKind::UnauthenticatedAuthSession,
                "operation requires an authenticated session",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        Ok(())
    }

    fn set_authenticated(&mut self, intents: &[AuthIntent]) {
        self.authorized_intents.extend(intents.iter().copied());
        if self.authorized_intents.contains(&AuthIntent::Decrypt) {
            self.status = AuthStatus::Authenticated;
        }
        let authorized: Vec<&str> = self
            .authorized_intents
            .iter()
            .map(|intent| intent.as_str())
            .collect();
        tracing::info!(
            user = %self.obfuscated_username,
            intents = authorized.join(","),
            "auth session authorized"
        );
        self.deadline = Some(Instant::now() + AUTH_SESSION_TIMEOUT);
    }

    // ---- user creation ------------------------------------------------

    /// A freshly created user has no credentials yet, so the session is
    /// immediately authenticated. Persistent users get a random
    /// filesystem keyset and, with the stash enabled, an in-memory stash
    /// that is persisted when the first factor is added.
    pub fn on_user_created(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.set_authenticated(&FULL_AUTH_INTENTS);
        self.user_exists = true;

        if !self.is_ephemeral_user {
            self.apis.layout.create_user_dir(&self.obfuscated_username)?;
            if self.file_system_keyset.is_none() {
                self.file_system_keyset = Some(FileSystemKeyset::create_random());
            }
            if self.apis.features.user_secret_stash {
                let keyset = self
                    .file_system_keyset
                    .clone()
                    .expect("filesystem keyset was just created");
                self.user_secret_stash = Some(UserSecretStash::create_random(keyset));
                self.uss_main_key = Some(UserSecretStash::create_random_main_key());
            }
        }
        Ok(())
    }

    // ---- add ----------------------------------------------------------

    pub async fn add_auth_factor(&mut self, label: &str, input: &FactorInput) -> Result<()> {
        self.ensure_authenticated()?;
        let factor_type = input.factor_type();
        if !is_valid_label(label) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("invalid auth factor label {label:?}"),
            ));
        }
        if self.auth_factor_map.find(label).is_some() {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                format!("auth factor {label} already exists"),
            ));
        }

        if self.is_ephemeral_user {
            return self.add_auth_factor_for_ephemeral(label, factor_type, input);
        }

        // Stash-only factor types have no keyset representation at all.
        if self.user_secret_stash.is_none() && !factor_type.is_supported_by_vault_keyset() {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                format!("{factor_type} factors require the user secret stash"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }

        // With keysets, reset is seeded from the first password keyset;
        // a PIN therefore cannot be the very first factor.
        if self.user_secret_stash.is_none()
            && !self
                .auth_factor_map
                .has_factor_with_storage(StorageType::VaultKeyset)
            && factor_type == AuthFactorType::Pin
        {
            return Err(Error::new(
                ErrorKind::AddCredentialsFailed,
                "a pin cannot be the first credential",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }

        let auth_input = self.create_auth_input_for_adding(input, factor_type)?;
        let metadata = metadata_for_input(input);
        let kind = self.apis.dispatcher.kind_for_creation(factor_type)?;
        let dispatcher = self.apis.dispatcher.clone();
        let (block_state, key_blobs) = dispatcher
            .create_key_blobs(kind, &auth_input)
            .await
            .map_err(|e| {
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    format!("key blob creation failed for {label}"),
                )
                .wrap(e)
            })?;

        if self.user_secret_stash.is_some() {
            self.persist_auth_factor_to_uss(
                factor_type,
                label,
                metadata,
                &auth_input,
                &key_blobs,
                block_state,
            )?;
        } else {
            self.create_and_persist_vault_keyset(
                factor_type,
                label,
                metadata,
                &auth_input,
                &key_blobs,
                block_state,
            )?;
        }

        self.add_credential_verifier(factor_type, label, &auth_input);
        Ok(())
    }

    fn add_auth_factor_for_ephemeral(
        &mut self,
        label: &str,
        factor_type: AuthFactorType,
        input: &FactorInput,
    ) -> Result<()> {
        let auth_input = self.build_base_auth_input(input)?;
        if auth_input.user_input.is_none() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "ephemeral factors need a user secret",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        if self
            .apis
            .verifier_cache
            .has_verifier_for_label(&self.obfuscated_username, label)
        {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                format!("a verifier already exists for label {label}"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        let Some(verifier) =
            self.apis
                .dispatcher
                .create_credential_verifier(factor_type, label, &auth_input)
        else {
            return Err(Error::new(
                ErrorKind::BackingStoreFailure,
                format!("no verifier available for {factor_type} factors"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        self.apis
            .verifier_cache
            .add_verifier(&self.obfuscated_username, verifier.into());
        Ok(())
    }

    fn build_base_auth_input(&self, input: &FactorInput) -> Result<AuthInput> {
        create_auth_input(
            &self.apis.layout,
            input,
            &self.username,
            self.apis.dispatcher.locked_to_single_user(),
            self.recovery_ephemeral_pub_key.as_deref(),
        )
    }

    /// Fill in the reset and rate-limiter material a new factor needs.
    fn create_auth_input_for_adding(
        &self,
        input: &FactorInput,
        factor_type: AuthFactorType,
    ) -> Result<AuthInput> {
        let mut auth_input = self.build_base_auth_input(input)?;

        // Rate-limited types are exclusive with per-label reset secrets.
        if factor_type.needs_rate_limiter() {
            if let Some(stash) = &self.user_secret_stash {
                if let Some(rate_limiter_label) = stash.fingerprint_rate_limiter_id() {
                    let reset_secret = stash
                        .rate_limiter_reset_secret(factor_type)
                        .cloned()
                        .ok_or_else(|| {
                            Error::new(
                                ErrorKind::BackingStoreFailure,
                                "rate-limiter exists without its reset secret",
                            )
                            .with_action(ErrorAction::DevCheckUnexpectedState)
                        })?;
                    auth_input.rate_limiter_label = Some(rate_limiter_label);
                    auth_input.reset_secret = Some(reset_secret);
                }
                // Otherwise the block mints a limiter on create.
            }
            return Ok(auth_input);
        }

        if factor_type.needs_reset_secret() {
            if self.user_secret_stash.is_some() && !self.enable_backup_vk_with_uss {
                // Stash-only factors get an independent random secret.
                tracing::info!("minting a random reset secret for the stash factor");
                auth_input.reset_secret = Some(crypto::random_secret(RESET_SECRET_SIZE));
                return Ok(auth_input);
            }
            // Keyset world: derive from the shared reset seed of the
            // authenticated password keyset.
            let vault_keyset = self.vault_keyset.as_ref().ok_or_else(|| {
                Error::new(
                    ErrorKind::BackingStoreFailure,
                    "no authenticated keyset to source the reset seed from",
                )
                .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            let reset_seed = vault_keyset.reset_seed().ok_or_else(|| {
                Error::new(
                    ErrorKind::BackingStoreFailure,
                    "authenticated keyset has no reset seed",
                )
                .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            let reset_salt = crypto::random_bytes(crypto::AES_BLOCK_SIZE);
            auth_input.reset_secret =
                Some(crypto::hmac_sha256(&reset_salt, reset_seed.as_slice()));
            auth_input.reset_seed = Some(reset_seed.clone());
            auth_input.reset_salt = Some(reset_salt);
        }
        Ok(auth_input)
    }

    /// Stash persistence, factor file first, container second.
    fn persist_auth_factor_to_uss(
        &mut self,
        factor_type: AuthFactorType,
        label: &str,
        metadata: AuthFactorMetadata,
        auth_input: &AuthInput,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
    ) -> Result<()> {
        let factor = AuthFactor::new(factor_type, label, metadata, block_state);
        self.add_auth_factor_to_uss_in_memory(&factor, key_blobs)?;

        let container = {
            let stash = self.user_secret_stash.as_ref().expect("stash checked by caller");
            let main_key = self.uss_main_key.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::AddCredentialsFailed, "stash main key is missing")
                    .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            stash.to_encrypted_container(main_key).map_err(|e| {
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    format!("cannot serialize the stash for {label}"),
                )
                .wrap(e)
            })?
        };

        self.apis
            .auth_factor_manager
            .save_auth_factor(&self.obfuscated_username, &factor)
            .map_err(|e| {
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    format!("cannot persist auth factor {label}"),
                )
                .wrap(e)
            })?;
        self.apis
            .uss_storage
            .persist(&container, &self.obfuscated_username)
            .map_err(|e| {
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    format!("cannot persist the stash after adding {label}"),
                )
                .wrap(e)
            })?;

        if !factor_type.is_supported_by_vault_keyset() {
            // A stash-only factor invalidates every backup keyset.
            self.enable_backup_vk_with_uss = false;
            self.clean_up_all_backup_keysets();
        } else if self.enable_backup_vk_with_uss {
            self.add_backup_vault_keyset(label, auth_input, key_blobs, &factor)?;
        }

        tracing::info!(label, "added auth factor into the stash");
        self.auth_factor_map
            .add(factor, StorageType::UserSecretStash);
        Ok(())
    }

    fn add_auth_factor_to_uss_in_memory(
        &mut self,
        factor: &AuthFactor,
        key_blobs: &KeyBlobs,
    ) -> Result<()> {
        let credential_secret = key_blobs.derive_uss_credential_secret().map_err(|e| {
            Error::new(
                ErrorKind::AddCredentialsFailed,
                "cannot derive the stash credential secret",
            )
            .with_actions([ErrorAction::Reboot, ErrorAction::Retry, ErrorAction::DeleteVault])
            .wrap(e)
        })?;
        let main_key = self.uss_main_key.clone().ok_or_else(|| {
            Error::new(ErrorKind::AddCredentialsFailed, "stash main key is missing")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let stash = self.user_secret_stash.as_mut().ok_or_else(|| {
            Error::new(ErrorKind::AddCredentialsFailed, "no stash in memory")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;

        stash.add_wrapped_main_key(&main_key, &factor.label, &credential_secret)?;

        if factor.factor_type.needs_rate_limiter() {
            if let Some(rate_limiter_label) = key_blobs.rate_limiter_label {
                let reset_secret = key_blobs.reset_secret.clone().ok_or_else(|| {
                    Error::new(
                        ErrorKind::AddCredentialsFailed,
                        "a fresh rate-limiter came without a reset secret",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                })?;
                stash.initialize_fingerprint_rate_limiter_id(rate_limiter_label)?;
                stash.set_rate_limiter_reset_secret(factor.factor_type, reset_secret)?;
            }
        } else if factor.factor_type.needs_reset_secret() {
            if let Some(reset_secret) = &key_blobs.reset_secret {
                stash.set_reset_secret_for_label(&factor.label, reset_secret.clone())?;
            }
        }
        Ok(())
    }

    fn add_backup_vault_keyset(
        &mut self,
        label: &str,
        auth_input: &AuthInput,
        key_blobs: &KeyBlobs,
        factor: &AuthFactor,
    ) -> Result<()> {
        let is_initial = !self
            .auth_factor_map
            .has_factor_with_storage(StorageType::VaultKeyset)
            && self.vault_keyset.is_none()
            && self.auth_factor_map.is_empty();
        let keyset = if is_initial {
            let file_system_keyset = self.file_system_keyset.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::AddCredentialsFailed, "no filesystem keyset")
                    .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Reboot])
            })?;
            self.apis.keyset_management.add_initial_keyset(
                &self.obfuscated_username,
                label,
                file_system_keyset,
                key_blobs,
                factor.block_state.clone(),
                true,
            )?
        } else {
            let source = self.vault_keyset.as_ref().ok_or_else(|| {
                // Possible if the backup keyset was corrupt and the
                // authentication completed via the stash alone.
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    "no authenticated keyset to copy from",
                )
                .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            self.apis.keyset_management.add_keyset(
                &self.obfuscated_username,
                label,
                source,
                auth_input.reset_salt.clone(),
                key_blobs.reset_secret.as_ref(),
                key_blobs,
                factor.block_state.clone(),
                true,
            )?
        };
        if is_initial {
            self.vault_keyset = Some(keyset);
        }
        Ok(())
    }

    fn clean_up_all_backup_keysets(&self) {
        for (factor, _) in self.auth_factor_map.iter() {
            if let Some(keyset) = self
                .apis
                .keyset_management
                .get_vault_keyset(&self.obfuscated_username, &factor.label)
            {
                if keyset.is_backup() {
                    if let Err(err) = self
                        .apis
                        .keyset_management
                        .remove_keyset_file(&self.obfuscated_username, &keyset)
                    {
                        tracing::error!(label = factor.label, %err, "backup keyset cleanup failed");
                    }
                }
            }
        }
    }

    /// Legacy path: the factor becomes a full vault keyset.
    fn create_and_persist_vault_keyset(
        &mut self,
        factor_type: AuthFactorType,
        label: &str,
        metadata: AuthFactorMetadata,
        auth_input: &AuthInput,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
    ) -> Result<()> {
        let is_initial = !self
            .auth_factor_map
            .has_factor_with_storage(StorageType::VaultKeyset);
        let keyset = if is_initial {
            let file_system_keyset = self.file_system_keyset.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::AddCredentialsFailed, "no filesystem keyset")
                    .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Reboot])
            })?;
            self.apis.keyset_management.add_initial_keyset(
                &self.obfuscated_username,
                label,
                file_system_keyset,
                key_blobs,
                block_state.clone(),
                false,
            )?
        } else {
            let source = self.vault_keyset.as_ref().ok_or_else(|| {
                Error::new(
                    ErrorKind::AddCredentialsFailed,
                    "no authenticated keyset to copy from",
                )
                .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            self.apis.keyset_management.add_keyset(
                &self.obfuscated_username,
                label,
                source,
                auth_input.reset_salt.clone(),
                auth_input.reset_secret.as_ref(),
                key_blobs,
                block_state.clone(),
                false,
            )?
        };
        if is_initial {
            self.vault_keyset = Some(keyset);
        }

        let factor = AuthFactor::new(factor_type, label, metadata, block_state);
        self.auth_factor_map.add(factor, StorageType::VaultKeyset);
        tracing::info!(label, "added vault keyset factor");
        Ok(())
    }

    // ---- authenticate --------------------------------------------------

    pub async fn authenticate_auth_factor(
        &mut self,
        labels: &[String],
        input: &FactorInput,
    ) -> Result<()> {
        self.ensure_active()?;
        let request_type = input.factor_type();
        let label_text = if labels.is_empty() {
            "(unlabelled)".to_string()
        } else {
            labels.join(",")
        };
        tracing::info!(
            intent = self.auth_intent.as_str(),
            labels = label_text,
            "authentication attempt"
        );

        match request_type.label_arity() {
            LabelArity::None => {
                if !labels.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("unexpected labels for factor type {request_type}"),
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState));
                }
                let verifier = self
                    .apis
                    .verifier_cache
                    .find_by_type(&self.obfuscated_username, request_type);
                let supported = self
                    .apis
                    .dispatcher
                    .is_verify_supported(self.auth_intent, request_type);
                let Some(verifier) = verifier.filter(|_| supported) else {
                    return Err(Error::new(
                        ErrorKind::UnauthenticatedAuthSession,
                        "no usable verifier for the requested factor type",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState));
                };
                let auth_input = self.build_base_auth_input(input)?;
                verifier.verify(&auth_input).await?;
                self.complete_verify_only_authentication();
                Ok(())
            }
            LabelArity::Single => {
                if labels.len() != 1 {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("exactly one label expected for factor type {request_type}"),
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState));
                }
                let label = labels[0].clone();

                // Lightweight path first, when the intent allows it.
                if self
                    .apis
                    .dispatcher
                    .is_verify_supported(self.auth_intent, request_type)
                {
                    if let Some(verifier) = self
                        .apis
                        .verifier_cache
                        .find_by_label(&self.obfuscated_username, &label)
                    {
                        let auth_input = self.build_base_auth_input(input)?;
                        verifier.verify(&auth_input).await?;
                        self.complete_verify_only_authentication();
                        return Ok(());
                    }
                }

                let Some((factor, storage_type)) = self.auth_factor_map.find(&label) else {
                    // Either the user or just the factor is missing.
                    if !self.user_exists {
                        return Err(Error::new(
                            ErrorKind::AccountNotFound,
                            format!("user {} does not exist", self.username),
                        )
                        .with_action(ErrorAction::DevCheckUnexpectedState));
                    }
                    return Err(Error::new(
                        ErrorKind::KeyNotFound,
                        format!("no auth factor with label {label}"),
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState));
                };
                let factor = factor.clone();

                // The stored type must match the request, with one
                // exception: an old keyset factor used by a kiosk shows
                // up as password and is fixed up in memory.
                let mut metadata = factor.metadata.clone();
                if request_type != factor.factor_type {
                    if storage_type == StorageType::VaultKeyset
                        && request_type == AuthFactorType::Kiosk
                        && factor.factor_type == AuthFactorType::Password
                    {
                        metadata = AuthFactorMetadata::Kiosk;
                    } else {
                        return Err(Error::new(
                            ErrorKind::InvalidArgument,
                            "requested factor type does not match the stored factor",
                        )
                        .with_action(ErrorAction::DevCheckUnexpectedState));
                    }
                }

                let auth_input = self.build_base_auth_input(input)?;
                match storage_type {
                    StorageType::UserSecretStash => {
                        self.authenticate_via_user_secret_stash(&label, &factor, auth_input)
                            .await
                    }
                    StorageType::VaultKeyset => {
                        self.authenticate_via_vault_keyset(
                            request_type,
                            &label,
                            metadata,
                            auth_input,
                        )
                        .await
                    }
                }
            }
            LabelArity::Multiple => {
                if labels.is_empty() {
                    return Err(Error::new(
                        ErrorKind::InvalidArgument,
                        format!("at least one label expected for factor type {request_type}"),
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState));
                }
                // Selecting the matching template among the candidate
                // factors needs the matcher-reported template id.
                Err(Error::new(
                    ErrorKind::NotImplemented,
                    "selector-based fingerprint authentication",
                )
                .with_actions([ErrorAction::DevCheckUnexpectedState, ErrorAction::Auth]))
            }
        }
    }

    fn complete_verify_only_authentication(&mut self) {
        if self.auth_intent == AuthIntent::WebAuthn {
            self.authorized_intents.insert(AuthIntent::WebAuthn);
        }
        self.set_authenticated(&[AuthIntent::VerifyOnly]);
    }

    async fn authenticate_via_user_secret_stash(
        &mut self,
        label: &str,
        factor: &AuthFactor,
        auth_input: AuthInput,
    ) -> Result<()> {
        let dispatcher = self.apis.dispatcher.clone();
        let key_blobs = match dispatcher
            .derive_key_blobs(&auth_input, &factor.block_state)
            .await
        {
            Ok(blobs) => blobs,
            Err(err) => {
                self.latch_auth_locked_on_lockout(label, &err);
                return Err(err);
            }
        };

        let credential_secret = key_blobs.derive_uss_credential_secret().map_err(|e| {
            Error::new(
                ErrorKind::AuthorizationKeyFailed,
                "cannot derive the stash credential secret",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState)
            .wrap(e)
        })?;
        let container = self
            .apis
            .uss_storage
            .load_persisted(&self.obfuscated_username)
            .map_err(|e| {
                Error::new(ErrorKind::AuthorizationKeyFailed, "cannot load the stash").wrap(e)
            })?;
        let (stash, main_key) = UserSecretStash::from_encrypted_container_with_wrapping_key(
            &container,
            label,
            &credential_secret,
        )
        .map_err(|e| {
            Error::new(ErrorKind::AuthorizationKeyFailed, "cannot decrypt the stash").wrap(e)
        })?;

        self.file_system_keyset = Some(stash.file_system_keyset().clone());
        self.user_secret_stash = Some(stash);
        self.uss_main_key = Some(main_key);

        self.prepare_webauthn_secret_if_needed();
        self.set_authenticated(&FULL_AUTH_INTENTS);
        self.authenticated_factor_label = Some(label.to_string());
        self.add_credential_verifier(factor.factor_type, label, &auth_input);

        if self.enable_backup_vk_with_uss && factor.factor_type == AuthFactorType::Password {
            // Load the decrypted backup keyset so a PIN backup can be
            // created later in this session.
            match self.apis.keyset_management.get_valid_keyset(
                &self.obfuscated_username,
                label,
                &key_blobs,
            ) {
                Ok(keyset) => self.vault_keyset = Some(keyset),
                Err(err) => {
                    tracing::warn!(label, %err, "backup keyset did not load after stash auth");
                }
            }
        }

        self.reset_le_credentials();
        Ok(())
    }

    async fn authenticate_via_vault_keyset(
        &mut self,
        request_type: AuthFactorType,
        label: &str,
        metadata: AuthFactorMetadata,
        auth_input: AuthInput,
    ) -> Result<()> {
        let Some(keyset) = self
            .apis
            .keyset_management
            .get_vault_keyset(&self.obfuscated_username, label)
        else {
            return Err(Error::new(
                ErrorKind::AuthorizationKeyFailed,
                format!("no keyset state for label {label}"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };

        // The lockout latch spares the element a doomed round trip.
        if keyset.is_auth_locked() && request_type == AuthFactorType::Pin {
            return Err(Error::new(
                ErrorKind::CredentialLocked,
                "pin is locked out after too many wrong attempts",
            )
            .with_actions([ErrorAction::Auth, ErrorAction::LeLockedOut]));
        }

        let dispatcher = self.apis.dispatcher.clone();
        let key_blobs = match dispatcher
            .derive_key_blobs(&auth_input, keyset.block_state())
            .await
        {
            Ok(blobs) => blobs,
            Err(err) => {
                self.latch_auth_locked_on_lockout(label, &err);
                return Err(err);
            }
        };

        let mut keyset = keyset;
        keyset.decrypt(&key_blobs)?;
        self.file_system_keyset = keyset.file_system_keyset().cloned();
        let is_le_credential = request_type == AuthFactorType::Pin;
        self.vault_keyset = Some(keyset);

        if !is_le_credential {
            self.reset_le_credentials();
        }

        self.prepare_webauthn_secret_if_needed();
        self.set_authenticated(&FULL_AUTH_INTENTS);
        self.authenticated_factor_label = Some(label.to_string());
        self.add_credential_verifier(request_type, label, &auth_input);

        if self.apis.features.migrate_to_user_secret_stash
            && self.apis.features.user_secret_stash
            && self.status == AuthStatus::Authenticated
        {
            self.migrate_authenticated_keyset_to_uss(request_type, metadata, &auth_input)
                .await;
        }
        Ok(())
    }

    /// One-shot migration of the just-authenticated keyset. Whatever
    /// happens here, the caller's authentication result stands.
    async fn migrate_authenticated_keyset_to_uss(
        &mut self,
        factor_type: AuthFactorType,
        metadata: AuthFactorMetadata,
        auth_input: &AuthInput,
    ) {
        let Some(vault_keyset) = self.vault_keyset.clone() else {
            return;
        };
        if vault_keyset.is_migrated() {
            return;
        }
        let migration_input = match self.create_auth_input_for_migration(auth_input, factor_type) {
            Ok(input) => input,
            Err(err) => {
                tracing::error!(%err, "cannot assemble migration input");
                return;
            }
        };

        let keyset_management = self.apis.keyset_management.clone();
        let uss_storage = self.apis.uss_storage.clone();
        let auth_factor_manager = self.apis.auth_factor_manager.clone();
        let dispatcher = self.apis.dispatcher.clone();
        let migrator = UssMigrator {
            user: &self.obfuscated_username,
            keyset_management: &keyset_management,
            uss_storage: &uss_storage,
            auth_factor_manager: &auth_factor_manager,
            dispatcher: &dispatcher,
        };
        let (status, outcome) = migrator
            .migrate_vault_keyset_to_uss(&vault_keyset, factor_type, metadata, &migration_input)
            .await;
        tracing::info!(status = ?status, label = vault_keyset.label(), "keyset migration finished");

        if let Some(outcome) = outcome {
            self.user_secret_stash = Some(outcome.stash);
            self.uss_main_key = Some(outcome.main_key);
            self.auth_factor_map
                .add(outcome.factor, StorageType::UserSecretStash);
        }
    }

    /// Reset material for the factor being migrated: the PIN keyset
    /// carries its own reset secret; everything else derives a fresh
    /// pair from the password keyset's reset seed.
    fn create_auth_input_for_migration(
        &self,
        auth_input: &AuthInput,
        factor_type: AuthFactorType,
    ) -> Result<AuthInput> {
        let mut migration_input = auth_input.clone();
        if !factor_type.needs_reset_secret() {
            return Ok(migration_input);
        }
        let vault_keyset = self.vault_keyset.as_ref().ok_or_else(|| {
            Error::new(ErrorKind::BackingStoreFailure, "no authenticated keyset")
                .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        if let Some(reset_secret) = vault_keyset.reset_secret() {
            migration_input.reset_secret = Some(reset_secret.clone());
            return Ok(migration_input);
        }
        let reset_seed = vault_keyset.reset_seed().ok_or_else(|| {
            Error::new(
                ErrorKind::BackingStoreFailure,
                "authenticated keyset has no reset seed",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState)
        })?;
        let reset_salt = crypto::random_bytes(crypto::AES_BLOCK_SIZE);
        migration_input.reset_secret = Some(crypto::hmac_sha256(&reset_salt, reset_seed.as_slice()));
        migration_input.reset_seed = Some(reset_seed.clone());
        migration_input.reset_salt = Some(reset_salt);
        Ok(migration_input)
    }

    fn latch_auth_locked_on_lockout(&self, label: &str, err: &Error) {
        if !err.has_action(ErrorAction::LeLockedOut) {
            return;
        }
        if let Some(mut keyset) = self
            .apis
            .keyset_management
            .get_vault_keyset(&self.obfuscated_username, label)
        {
            tracing::info!(label, "pin locked out; latching the keyset");
            keyset.set_auth_locked(true);
            if let Err(save_err) = self.apis.keyset_management.save(&self.obfuscated_username, &keyset)
            {
                tracing::error!(label, %save_err, "cannot latch auth_locked");
            }
        }
    }

    fn prepare_webauthn_secret_if_needed(&mut self) {
        if self.auth_intent != AuthIntent::WebAuthn {
            return;
        }
        // Even if this fails the authentication proceeds; the secret is
        // only needed by the WebAuthn flow itself.
        match &self.file_system_keyset {
            Some(keyset) => {
                self.apis.verifier_cache.prepare_webauthn_secret(
                    &self.obfuscated_username,
                    &keyset.fek,
                    &keyset.fnek,
                );
                self.authorized_intents.insert(AuthIntent::WebAuthn);
            }
            None => {
                tracing::error!("no filesystem keyset while preparing the webauthn secret");
            }
        }
    }

    /// Best-effort reset of the other factors' attempt counters once a
    /// full authentication proved the user's presence.
    fn reset_le_credentials(&mut self) {
        let element = self.apis.element.clone();
        let mut cleared_labels: Vec<String> = Vec::new();

        for (factor, _) in self.auth_factor_map.iter() {
            let AuthBlockState::PinWeaver(state) = &factor.block_state else {
                continue;
            };
            match element.pw_get_wrong_attempts(state.le_label) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(label = factor.label, %err, "cannot read attempt counter");
                    continue;
                }
            }

            let reset_secret = self
                .user_secret_stash
                .as_ref()
                .and_then(|stash| stash.reset_secret_for_label(&factor.label).cloned())
                .or_else(|| self.reset_secret_from_keyset(&factor.label));
            let Some(reset_secret) = reset_secret else {
                tracing::warn!(label = factor.label, "no reset secret available");
                continue;
            };
            match element.pw_reset(state.le_label, &reset_secret) {
                Ok(()) => cleared_labels.push(factor.label.clone()),
                Err(err) => {
                    tracing::warn!(label = factor.label, %err, "attempt counter reset failed");
                }
            }
        }

        // Unlatch keysets whose counters were just cleared.
        for label in cleared_labels {
            if let Some(mut keyset) = self
                .apis
                .keyset_management
                .get_vault_keyset(&self.obfuscated_username, &label)
            {
                if keyset.is_auth_locked() {
                    keyset.set_auth_locked(false);
                    let _ = self.apis.keyset_management.save(&self.obfuscated_username, &keyset);
                }
            }
        }

        // The fingerprint rate-limiter resets through its own secret.
        if let Some(stash) = &self.user_secret_stash {
            if let (Some(rate_limiter_label), Some(reset_secret)) = (
                stash.fingerprint_rate_limiter_id(),
                stash.rate_limiter_reset_secret(AuthFactorType::Fingerprint),
            ) {
                if let Err(err) = element.pw_reset(rate_limiter_label, reset_secret) {
                    tracing::warn!(%err, "fingerprint rate-limiter reset failed");
                }
            }
        }
    }

    fn reset_secret_from_keyset(&self, label: &str) -> Option<SecretBytes> {
        let reset_seed = self
            .vault_keyset
            .as_ref()
            .and_then(|keyset| keyset.reset_seed())?;
        let keyset = self
            .apis
            .keyset_management
            .get_vault_keyset(&self.obfuscated_username, label)?;
        let reset_salt = keyset.reset_salt()?;
        Some(crypto::hmac_sha256(reset_salt, reset_seed.as_slice()))
    }

    fn add_credential_verifier(
        &mut self,
        factor_type: AuthFactorType,
        label: &str,
        auth_input: &AuthInput,
    ) {
        match self
            .apis
            .dispatcher
            .create_credential_verifier(factor_type, label, auth_input)
        {
            Some(verifier) => {
                self.apis
                    .verifier_cache
                    .add_verifier(&self.obfuscated_username, verifier.into());
            }
            None => {
                self.apis
                    .verifier_cache
                    .remove_verifier_for_label(&self.obfuscated_username, label);
            }
        }
    }

    // ---- update --------------------------------------------------------

    pub async fn update_auth_factor(&mut self, label: &str, input: &FactorInput) -> Result<()> {
        self.ensure_authenticated()?;
        if label.is_empty() {
            return Err(Error::new(ErrorKind::InvalidArgument, "empty auth factor label")
                .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        let Some((stored_factor, storage_type)) = self.auth_factor_map.find(label) else {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                format!("no auth factor with label {label}"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        let stored_factor = stored_factor.clone();

        let factor_type = input.factor_type();
        if factor_type != stored_factor.factor_type {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                "updated factor must keep its type",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }

        let kind = self.apis.dispatcher.kind_for_creation(factor_type)?;
        let auth_input = self.create_auth_input_for_adding(input, factor_type)?;
        let metadata = metadata_for_input(input);
        let dispatcher = self.apis.dispatcher.clone();
        let (block_state, key_blobs) = dispatcher
            .create_key_blobs(kind, &auth_input)
            .await
            .map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    format!("key blob creation failed for {label}"),
                )
                .wrap(e)
            })?;

        match storage_type {
            StorageType::UserSecretStash => {
                self.update_auth_factor_via_uss(
                    factor_type,
                    label,
                    metadata,
                    &auth_input,
                    &key_blobs,
                    block_state,
                )?;
            }
            StorageType::VaultKeyset => {
                let source = self.vault_keyset.as_ref().ok_or_else(|| {
                    Error::new(
                        ErrorKind::UpdateCredentialsFailed,
                        "no authenticated keyset to copy from",
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                })?;
                self.apis.keyset_management.add_keyset(
                    &self.obfuscated_username,
                    label,
                    source,
                    auth_input.reset_salt.clone(),
                    auth_input.reset_secret.as_ref(),
                    &key_blobs,
                    block_state.clone(),
                    false,
                )?;
                let factor = AuthFactor::new(factor_type, label, metadata, block_state);
                self.auth_factor_map.add(factor, StorageType::VaultKeyset);
            }
        }

        self.add_credential_verifier(factor_type, label, &auth_input);
        tracing::info!(label, "updated auth factor");
        Ok(())
    }

    fn update_auth_factor_via_uss(
        &mut self,
        factor_type: AuthFactorType,
        label: &str,
        metadata: AuthFactorMetadata,
        auth_input: &AuthInput,
        key_blobs: &KeyBlobs,
        block_state: AuthBlockState,
    ) -> Result<()> {
        let factor = AuthFactor::new(factor_type, label, metadata, block_state);

        {
            let stash = self.user_secret_stash.as_mut().ok_or_else(|| {
                Error::new(ErrorKind::UpdateCredentialsFailed, "no stash in memory")
                    .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            stash.remove_wrapped_main_key(label).map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    "cannot drop the old stash wrapping",
                )
                .wrap(e)
            })?;
            stash.remove_reset_secret_for_label(label);
        }
        self.add_auth_factor_to_uss_in_memory(&factor, key_blobs)
            .map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    "cannot add the new stash wrapping",
                )
                .wrap(e)
            })?;

        let container = {
            let stash = self.user_secret_stash.as_ref().expect("stash checked above");
            let main_key = self.uss_main_key.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::UpdateCredentialsFailed, "stash main key is missing")
                    .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            stash.to_encrypted_container(main_key).map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    format!("cannot serialize the stash for {label}"),
                )
                .wrap(e)
            })?
        };

        if self.enable_backup_vk_with_uss {
            self.add_backup_vault_keyset(label, auth_input, key_blobs, &factor)
                .map_err(|e| {
                    Error::new(
                        ErrorKind::UpdateCredentialsFailed,
                        "cannot refresh the backup keyset",
                    )
                    .wrap(e)
                })?;
        } else if factor_type.is_supported_by_vault_keyset() {
            // The update may be happening because the old credential
            // leaked; a stale backup keyset must not outlive it.
            if let Some(keyset) = self
                .apis
                .keyset_management
                .get_vault_keyset(&self.obfuscated_username, label)
            {
                if keyset.is_backup() {
                    self.apis
                        .keyset_management
                        .remove_keyset_file(&self.obfuscated_username, &keyset)
                        .map_err(|e| {
                            Error::new(
                                ErrorKind::UpdateCredentialsFailed,
                                "cannot delete the obsolete backup keyset",
                            )
                            .with_action(ErrorAction::DevCheckUnexpectedState)
                            .wrap(e)
                        })?;
                    tracing::info!(label, "deleted obsolete backup keyset");
                }
            }
        }

        self.apis
            .auth_factor_manager
            .update_auth_factor(&self.obfuscated_username, label, &factor)
            .map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    format!("cannot persist updated auth factor {label}"),
                )
                .wrap(e)
            })?;
        self.apis
            .uss_storage
            .persist(&container, &self.obfuscated_username)
            .map_err(|e| {
                Error::new(
                    ErrorKind::UpdateCredentialsFailed,
                    format!("cannot persist the stash after updating {label}"),
                )
                .wrap(e)
            })?;

        self.auth_factor_map
            .add(factor, StorageType::UserSecretStash);
        Ok(())
    }

    // ---- remove --------------------------------------------------------

    pub async fn remove_auth_factor(&mut self, label: &str) -> Result<()> {
        self.ensure_authenticated()?;
        let Some((factor, storage_type)) = self.auth_factor_map.find(label) else {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                format!("no auth factor with label {label}"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        let factor = factor.clone();

        if self.auth_factor_map.size() == 1 {
            return Err(Error::new(
                ErrorKind::RemoveCredentialsFailed,
                "cannot remove the last auth factor",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        if self.authenticated_factor_label.as_deref() == Some(label) {
            return Err(Error::new(
                ErrorKind::RemoveCredentialsFailed,
                "cannot remove the currently authenticated factor",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }

        let remove_using_uss =
            self.user_secret_stash.is_some() && storage_type == StorageType::UserSecretStash;
        if remove_using_uss {
            self.remove_auth_factor_via_uss(label, &factor).await?;
        } else {
            // Keyset-stored factors release their hardware state here;
            // the stash path does it through the factor manager.
            let dispatcher = self.apis.dispatcher.clone();
            dispatcher
                .prepare_for_removal(&factor.block_state)
                .await
                .map_err(|e| {
                    Error::new(
                        ErrorKind::RemoveCredentialsFailed,
                        format!("cannot release hardware state for {label}"),
                    )
                    .wrap(e)
                })?;
        }

        if !remove_using_uss || self.enable_backup_vk_with_uss {
            // Remove the keyset under this label whatever its role:
            // regular, backup or migrated.
            match self
                .apis
                .keyset_management
                .force_remove_keyset(&self.obfuscated_username, label)
            {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::KeyNotFound && remove_using_uss => {}
                Err(err) if factor.factor_type == AuthFactorType::CryptohomeRecovery => {
                    tracing::warn!(label, %err, "keyset removal failed for recovery factor");
                }
                Err(err) => {
                    return Err(Error::new(
                        ErrorKind::RemoveCredentialsFailed,
                        format!("cannot remove keyset {label}"),
                    )
                    .with_action(ErrorAction::DevCheckUnexpectedState)
                    .wrap(err));
                }
            }
        }

        self.auth_factor_map.remove(label);
        self.apis
            .verifier_cache
            .remove_verifier_for_label(&self.obfuscated_username, label);
        tracing::info!(label, "removed auth factor");
        Ok(())
    }

    async fn remove_auth_factor_via_uss(&mut self, label: &str, factor: &AuthFactor) -> Result<()> {
        let dispatcher = self.apis.dispatcher.clone();
        let auth_factor_manager = self.apis.auth_factor_manager.clone();
        auth_factor_manager
            .remove_auth_factor(&self.obfuscated_username, factor, &dispatcher)
            .await
            .map_err(|e| {
                Error::new(
                    ErrorKind::RemoveCredentialsFailed,
                    format!("cannot remove auth factor {label}"),
                )
                .wrap(e)
            })?;

        let container = {
            let stash = self.user_secret_stash.as_mut().ok_or_else(|| {
                Error::new(ErrorKind::RemoveCredentialsFailed, "no stash in memory")
                    .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            stash.remove_wrapped_main_key(label).map_err(|e| {
                Error::new(
                    ErrorKind::RemoveCredentialsFailed,
                    "cannot drop the stash wrapping",
                )
                .wrap(e)
            })?;
            stash.remove_reset_secret_for_label(label);

            let main_key = self.uss_main_key.as_ref().ok_or_else(|| {
                Error::new(ErrorKind::RemoveCredentialsFailed, "stash main key is missing")
                    .with_action(ErrorAction::DevCheckUnexpectedState)
            })?;
            self.user_secret_stash
                .as_ref()
                .expect("stash checked above")
                .to_encrypted_container(main_key)
                .map_err(|e| {
                    Error::new(
                        ErrorKind::RemoveCredentialsFailed,
                        "cannot serialize the stash after removal",
                    )
                    .wrap(e)
                })?
        };
        self.apis
            .uss_storage
            .persist(&container, &self.obfuscated_username)
            .map_err(|e| {
                Error::new(
                    ErrorKind::RemoveCredentialsFailed,
                    "cannot persist the stash after removal",
                )
                .wrap(e)
            })?;
        Ok(())
    }

    // ---- prepare / terminate -------------------------------------------

    pub async fn prepare_auth_factor(
        &mut self,
        factor_type: AuthFactorType,
        purpose: PreparePurpose,
    ) -> Result<()> {
        self.ensure_active()?;
        if !self.apis.dispatcher.is_prepare_required(factor_type) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("factor type {factor_type} does not support prepare"),
            )
            .with_action(ErrorAction::Retry));
        }
        if self.active_factor_tokens.contains_key(&factor_type) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("factor type {factor_type} is already prepared"),
            )
            .with_action(ErrorAction::Retry));
        }

        let dispatcher = self.apis.dispatcher.clone();
        let token = dispatcher
            .prepare_auth_factor(factor_type, purpose, &self.obfuscated_username)
            .await?;
        self.active_factor_tokens.insert(factor_type, token);

        // Types with label-less verifiers get one alongside the session.
        if let Some(verifier) =
            self.apis
                .dispatcher
                .create_credential_verifier(factor_type, "", &AuthInput::default())
        {
            self.apis
                .verifier_cache
                .add_verifier(&self.obfuscated_username, verifier.into());
        }
        Ok(())
    }

    pub fn terminate_auth_factor(&mut self, factor_type: AuthFactorType) -> Result<()> {
        if !self.apis.dispatcher.is_prepare_required(factor_type) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("factor type {factor_type} does not support terminate"),
            )
            .with_action(ErrorAction::Retry));
        }
        let Some(mut token) = self.active_factor_tokens.remove(&factor_type) else {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("factor type {factor_type} is not prepared"),
            )
            .with_action(ErrorAction::Retry));
        };
        // Remove from the active list even if termination fails.
        let result = token.terminate();
        self.apis
            .verifier_cache
            .remove_verifier_for_type(&self.obfuscated_username, factor_type);
        result
    }

    // ---- recovery ------------------------------------------------------

    /// Build the request blob for the off-device recovery mediator and
    /// remember the ephemeral key for the subsequent authenticate call.
    pub fn get_recovery_request(&mut self, label: &str, epoch_response: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let Some((factor, _)) = self.auth_factor_map.find(label) else {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                format!("no auth factor with label {label}"),
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };
        if factor.factor_type != AuthFactorType::CryptohomeRecovery {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                "recovery requests need a recovery factor",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        }
        let AuthBlockState::CryptohomeRecovery(state) = &factor.block_state else {
            return Err(Error::new(
                ErrorKind::KeyNotFound,
                "recovery factor has no recovery block state",
            )
            .with_action(ErrorAction::DevCheckUnexpectedState));
        };

        let (request, ephemeral_pub_key) = self
            .apis
            .dispatcher
            .generate_recovery_request(state, epoch_response)?;
        self.recovery_ephemeral_pub_key = Some(ephemeral_pub_key);
        Ok(request)
    }
}

/// Per-type metadata recorded with a factor built from this input.
fn metadata_for_input(input: &FactorInput) -> AuthFactorMetadata {
    match input {
        FactorInput::Password { .. } => AuthFactorMetadata::Password,
        FactorInput::Pin { .. } => AuthFactorMetadata::Pin,
        FactorInput::Kiosk => AuthFactorMetadata::Kiosk,
        FactorInput::SmartCard {
            public_key_spki_der,
            ..
        } => AuthFactorMetadata::SmartCard {
            public_key_spki_der: public_key_spki_der.clone(),
        },
        FactorInput::CryptohomeRecovery {
            mediator_pub_key, ..
        } => AuthFactorMetadata::CryptohomeRecovery {
            mediator_pub_key: mediator_pub_key.clone(),
        },
        FactorInput::LegacyFingerprint => AuthFactorMetadata::LegacyFingerprint,
        FactorInput::Fingerprint => AuthFactorMetadata::Fingerprint,
    }
}

/// Factor map assembly: stash factors from their files, then keysets
/// for any label not already covered. Factor files without a stash
/// container are dangling (crash between factor and container writes)
/// and are ignored so the keyset fallback stays usable.
fn load_auth_factor_map(
    user: &ObfuscatedUsername,
    auth_factor_manager: &AuthFactorManager,
    keyset_management: &KeysetManagement,
    stash_exists: bool,
) -> AuthFactorMap {
    let mut map = AuthFactorMap::new();
    if stash_exists {
        for factor in auth_factor_manager.list_auth_factors(user) {
            map.add(factor, StorageType::UserSecretStash);
        }
    } else {
        let dangling = auth_factor_manager.list_auth_factors(user);
        if !dangling.is_empty() {
            tracing::warn!(
                %user,
                count = dangling.len(),
                "ignoring dangling auth factors without a stash container"
            );
        }
    }
    for index in keyset_management.list_indices(user) {
        let keyset = match keyset_management.load(user, index) {
            Ok(keyset) => keyset,
            Err(err) => {
                tracing::warn!(index, %err, "skipping unreadable keyset");
                continue;
            }
        };
        if map.find(keyset.label()).is_some() {
            continue;
        }
        map.add(convert_keyset_to_factor(&keyset), StorageType::VaultKeyset);
    }
    map
}

/// Keysets predate typed factors; infer the type from the block state.
fn convert_keyset_to_factor(keyset: &VaultKeyset) -> AuthFactor {
    let (factor_type, metadata) = match keyset.block_state() {
        AuthBlockState::PinWeaver(_) => (AuthFactorType::Pin, AuthFactorMetadata::Pin),
        AuthBlockState::ChallengeCredential(state) => (
            AuthFactorType::SmartCard,
            AuthFactorMetadata::SmartCard {
                public_key_spki_der: state.public_key_spki_der.clone(),
            },
        ),
        _ => (AuthFactorType::Password, AuthFactorMetadata::Password),
    };
    AuthFactor::new(
        factor_type,
        keyset.label(),
        metadata,
        keyset.block_state().clone(),
    )
}

/// Backup keysets stay maintainable only while every factor both can
/// have one and actually has one.
fn all_factors_have_keysets(
    user: &ObfuscatedUsername,
    map: &AuthFactorMap,
    keyset_management: &KeysetManagement,
) -> bool {
    for (factor, _) in map.iter() {
        if !factor.factor_type.is_supported_by_vault_keyset() {
            return false;
        }
    }
    for (factor, _) in map.iter() {
        if keyset_management
            .get_vault_keyset(user, &factor.label)
            .is_none()
        {
            return false;
        }
    }
    true
}
