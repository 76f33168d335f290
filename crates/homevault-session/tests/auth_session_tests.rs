//! End-to-end auth session scenarios
//!
//! Each test drives full sessions against the soft secure element and a
//! temporary on-disk layout: user creation, factor add/authenticate/
//! update/remove, keyset migration, lockout and timeout behavior.

use std::sync::Arc;

use homevault_blocks::{AuthBlockDispatcher, PreparePurpose, SoftKeyDelegate};
use homevault_blocks::{BiometricsService, SoftBiometricsProcessor};
use homevault_core::{
    AuthFactorType, AuthIntent, ChallengeSignatureAlgorithm, ErrorAction, ErrorKind, SecretBytes,
    StorageType, Username,
};
use homevault_hwsec::SoftSecureElement;
use homevault_session::{
    AuthSession, AuthStatus, BackingApis, FactorInput, Features, RecoveryDeriveInput,
    VerifierCache, AUTH_SESSION_TIMEOUT,
};
use homevault_storage::{AuthFactorManager, KeysetManagement, StorageLayout, UssStorage};

fn init_test_logging() {
    static INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

struct TestEnv {
    _dir: tempfile::TempDir,
    element: Arc<SoftSecureElement>,
    layout: Arc<StorageLayout>,
    keyset_management: Arc<KeysetManagement>,
    auth_factor_manager: Arc<AuthFactorManager>,
    uss_storage: Arc<UssStorage>,
    verifier_cache: Arc<VerifierCache>,
    dispatcher: Arc<AuthBlockDispatcher>,
}

impl TestEnv {
    fn new() -> Self {
        init_test_logging();
        let dir = tempfile::tempdir().unwrap();
        let element = Arc::new(SoftSecureElement::new());
        let layout = Arc::new(StorageLayout::new(dir.path()));
        let dispatcher = Arc::new(AuthBlockDispatcher::new(element.clone()));
        Self {
            _dir: dir,
            element: element.clone(),
            layout: layout.clone(),
            keyset_management: Arc::new(KeysetManagement::new(layout.clone())),
            auth_factor_manager: Arc::new(AuthFactorManager::new(layout.clone())),
            uss_storage: Arc::new(UssStorage::new(layout)),
            verifier_cache: Arc::new(VerifierCache::new()),
            dispatcher,
        }
    }

    fn with_dispatcher(mut self, dispatcher: AuthBlockDispatcher) -> Self {
        self.dispatcher = Arc::new(dispatcher);
        self
    }

    fn apis(&self, features: Features) -> BackingApis {
        BackingApis {
            element: self.element.clone(),
            dispatcher: self.dispatcher.clone(),
            layout: self.layout.clone(),
            keyset_management: self.keyset_management.clone(),
            auth_factor_manager: self.auth_factor_manager.clone(),
            uss_storage: self.uss_storage.clone(),
            verifier_cache: self.verifier_cache.clone(),
            features,
        }
    }

    fn session(&self, name: &str, intent: AuthIntent, features: Features) -> AuthSession {
        AuthSession::create(Username::new(name), false, intent, self.apis(features))
    }

    fn decrypt_session(&self, name: &str) -> AuthSession {
        self.session(name, AuthIntent::Decrypt, Features::default())
    }
}

fn password(secret: &str) -> FactorInput {
    FactorInput::Password {
        secret: SecretBytes::from(secret),
    }
}

fn pin(secret: &str) -> FactorInput {
    FactorInput::Pin {
        secret: SecretBytes::from(secret),
    }
}

fn labels(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

async fn create_user_with_password(env: &TestEnv, name: &str) -> AuthSession {
    let mut session = env.decrypt_session(name);
    assert!(!session.user_exists());
    session.on_user_created().unwrap();
    assert_eq!(session.status(), AuthStatus::Authenticated);
    session
        .add_auth_factor("legacy-0", &password("hunter2"))
        .await
        .unwrap();
    session
}

#[tokio::test]
async fn new_persistent_user_with_password() {
    let env = TestEnv::new();
    let session = create_user_with_password(&env, "alice@x").await;
    let user = Username::new("alice@x").obfuscate();

    // The stash container and the factor file are both on disk.
    assert!(env.uss_storage.exists(&user));
    assert!(env.layout.auth_factor_path(&user, "legacy-0").is_file());
    assert!(session.file_system_keyset().is_ok());

    // A fresh session sees the persistent user and its factor.
    let mut second = env.decrypt_session("alice@x");
    assert!(second.user_exists());
    assert_eq!(second.auth_factor_map().size(), 1);
    second
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    assert_eq!(second.status(), AuthStatus::Authenticated);
    assert_eq!(
        second.file_system_keyset().unwrap(),
        session.file_system_keyset().unwrap()
    );
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let env = TestEnv::new();
    create_user_with_password(&env, "alice@x").await;

    let mut session = env.decrypt_session("alice@x");
    let err = session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
    assert_eq!(session.status(), AuthStatus::FurtherFactorRequired);
}

#[tokio::test]
async fn missing_factor_and_missing_user_are_distinguished() {
    let env = TestEnv::new();
    create_user_with_password(&env, "alice@x").await;

    let mut session = env.decrypt_session("alice@x");
    let err = session
        .authenticate_auth_factor(&labels(&["nope"]), &password("hunter2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);

    let mut unknown = env.decrypt_session("nobody@x");
    let err = unknown
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AccountNotFound);
}

#[tokio::test]
async fn add_pin_after_password_and_authenticate() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();

    // Both factors are stash-backed; backup keysets shadow them.
    let user = Username::new("alice@x").obfuscate();
    let backup = env.keyset_management.get_vault_keyset(&user, "pin1").unwrap();
    assert!(backup.is_backup());

    let mut pin_session = env.decrypt_session("alice@x");
    assert_eq!(pin_session.auth_factor_map().size(), 2);
    pin_session
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("0000"))
        .await
        .unwrap();
    assert_eq!(
        pin_session.file_system_keyset().unwrap(),
        session.file_system_keyset().unwrap()
    );
}

#[tokio::test]
async fn pin_cannot_be_the_first_keyset_factor() {
    let env = TestEnv::new();
    let features = Features {
        user_secret_stash: false,
        migrate_to_user_secret_stash: false,
    };
    let mut session = env.session("alice@x", AuthIntent::Decrypt, features);
    session.on_user_created().unwrap();
    let err = session.add_auth_factor("pin1", &pin("0000")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddCredentialsFailed);
}

#[tokio::test]
async fn pin_lockout_is_sticky_after_five_wrong_attempts() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();
    drop(session);

    for attempt in 1..=5u32 {
        let mut attempt_session = env.decrypt_session("alice@x");
        let err = attempt_session
            .authenticate_auth_factor(&labels(&["pin1"]), &pin("9999"))
            .await
            .unwrap_err();
        if attempt < 5 {
            assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed, "attempt {attempt}");
        } else {
            assert_eq!(err.kind(), ErrorKind::CredentialLocked, "attempt {attempt}");
            assert!(err.has_action(ErrorAction::LeLockedOut));
        }
    }

    // Even the correct PIN stays locked out.
    let mut locked_session = env.decrypt_session("alice@x");
    let err = locked_session
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("0000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CredentialLocked);
    assert!(err.has_action(ErrorAction::LeLockedOut));
}

#[tokio::test]
async fn successful_password_auth_resets_pin_attempts() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();
    drop(session);

    // Burn some attempts, short of the limit.
    for _ in 0..3 {
        let mut attempt_session = env.decrypt_session("alice@x");
        let _ = attempt_session
            .authenticate_auth_factor(&labels(&["pin1"]), &pin("9999"))
            .await;
    }

    // A password authentication resets the counter.
    let mut password_session = env.decrypt_session("alice@x");
    password_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();

    // Five fresh attempts are available again.
    for _ in 0..4 {
        let mut attempt_session = env.decrypt_session("alice@x");
        let _ = attempt_session
            .authenticate_auth_factor(&labels(&["pin1"]), &pin("9999"))
            .await;
    }
    let mut pin_session = env.decrypt_session("alice@x");
    pin_session
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("0000"))
        .await
        .unwrap();
}

#[tokio::test]
async fn remove_constraints_hold() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();
    drop(session);

    let mut session = env.decrypt_session("alice@x");
    session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();

    // The currently authenticated factor cannot go.
    let err = session.remove_auth_factor("legacy-0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoveCredentialsFailed);

    // The other one can.
    session.remove_auth_factor("pin1").await.unwrap();

    // And now the last factor is protected.
    let err = session.remove_auth_factor("legacy-0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RemoveCredentialsFailed);
}

#[tokio::test]
async fn remove_after_authenticating_with_another_factor() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();
    drop(session);
    let user = Username::new("alice@x").obfuscate();

    let mut pin_session = env.decrypt_session("alice@x");
    pin_session
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("0000"))
        .await
        .unwrap();
    pin_session.remove_auth_factor("legacy-0").await.unwrap();

    // Factor file, keyset and verifier are gone.
    assert!(!env.layout.auth_factor_path(&user, "legacy-0").is_file());
    assert!(env.keyset_management.get_vault_keyset(&user, "legacy-0").is_none());
    assert!(!env.verifier_cache.has_verifier_for_label(&user, "legacy-0"));

    // The removed factor no longer authenticates.
    let mut stale = env.decrypt_session("alice@x");
    let err = stale
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[tokio::test]
async fn update_password_invalidates_the_old_secret() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session
        .update_auth_factor("legacy-0", &password("correct-horse"))
        .await
        .unwrap();
    drop(session);

    let mut old_session = env.decrypt_session("alice@x");
    let err = old_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);

    let mut new_session = env.decrypt_session("alice@x");
    new_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("correct-horse"))
        .await
        .unwrap();
}

#[tokio::test]
async fn update_rejects_type_and_label_mismatches() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;

    let err = session
        .update_auth_factor("legacy-0", &pin("0000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = session
        .update_auth_factor("missing", &password("x"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotFound);
}

#[tokio::test]
async fn verify_only_session_uses_the_cached_verifier() {
    let env = TestEnv::new();
    create_user_with_password(&env, "alice@x").await;

    let mut verify_session =
        env.session("alice@x", AuthIntent::VerifyOnly, Features::default());
    verify_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    // Verify-only grants no decrypt capability.
    assert!(verify_session
        .authorized_intents()
        .contains(&AuthIntent::VerifyOnly));
    assert_ne!(verify_session.status(), AuthStatus::Authenticated);
    assert!(verify_session.file_system_keyset().is_err());

    let mut bad_session = env.session("alice@x", AuthIntent::VerifyOnly, Features::default());
    let err = bad_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("wrong"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);
}

#[tokio::test]
async fn ephemeral_users_live_in_the_verifier_cache() {
    let env = TestEnv::new();
    let mut session = AuthSession::create(
        Username::new("guest@x"),
        true,
        AuthIntent::Decrypt,
        env.apis(Features::default()),
    );
    session.on_user_created().unwrap();
    session
        .add_auth_factor("guest-pass", &password("letmein"))
        .await
        .unwrap();

    // Nothing on disk for an ephemeral user.
    let user = Username::new("guest@x").obfuscate();
    assert!(!env.layout.user_exists(&user));

    let mut verify_session = AuthSession::create(
        Username::new("guest@x"),
        true,
        AuthIntent::VerifyOnly,
        env.apis(Features::default()),
    );
    assert!(verify_session.user_exists());
    verify_session
        .authenticate_auth_factor(&labels(&["guest-pass"]), &password("letmein"))
        .await
        .unwrap();
}

#[tokio::test]
async fn vault_keyset_user_migrates_to_the_stash() {
    let env = TestEnv::new();
    let user = Username::new("legacy@x").obfuscate();
    let keyset_features = Features {
        user_secret_stash: false,
        migrate_to_user_secret_stash: false,
    };

    // Phase 1: a pre-stash user with a password keyset.
    let mut setup = env.session("legacy@x", AuthIntent::Decrypt, keyset_features);
    setup.on_user_created().unwrap();
    setup
        .add_auth_factor("legacy-0", &password("hunter2"))
        .await
        .unwrap();
    let original_keyset = setup.file_system_keyset().unwrap().clone();
    drop(setup);
    assert!(!env.uss_storage.exists(&user));

    // Phase 2: authentication with migration enabled migrates the factor.
    let mut session = env.decrypt_session("legacy@x");
    assert_eq!(
        session.auth_factor_map().find("legacy-0").unwrap().1,
        StorageType::VaultKeyset
    );
    session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    assert!(env.uss_storage.exists(&user));
    assert!(env
        .keyset_management
        .get_vault_keyset(&user, "legacy-0")
        .unwrap()
        .is_migrated());
    assert_eq!(
        session.auth_factor_map().find("legacy-0").unwrap().1,
        StorageType::UserSecretStash
    );

    // Phase 3: the migrated factor authenticates through the stash and
    // yields the same filesystem keyset.
    let mut migrated_session = env.decrypt_session("legacy@x");
    assert_eq!(
        migrated_session.auth_factor_map().find("legacy-0").unwrap().1,
        StorageType::UserSecretStash
    );
    migrated_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    assert_eq!(*migrated_session.file_system_keyset().unwrap(), original_keyset);
}

#[tokio::test]
async fn interrupted_migration_leaves_the_keyset_usable_and_retries() {
    let env = TestEnv::new();
    let user = Username::new("legacy@x").obfuscate();
    let keyset_features = Features {
        user_secret_stash: false,
        migrate_to_user_secret_stash: false,
    };

    let mut setup = env.session("legacy@x", AuthIntent::Decrypt, keyset_features);
    setup.on_user_created().unwrap();
    setup
        .add_auth_factor("legacy-0", &password("hunter2"))
        .await
        .unwrap();
    drop(setup);

    // Snapshot the keyset file, run the migration, then reconstruct the
    // crash window: factor file written, stash container not, keyset
    // not yet marked migrated.
    let keyset_path = env.layout.keyset_path(&user, 0);
    let pre_migration_keyset = std::fs::read(&keyset_path).unwrap();

    let mut session = env.decrypt_session("legacy@x");
    session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    drop(session);
    assert!(env.layout.auth_factor_path(&user, "legacy-0").is_file());

    std::fs::remove_file(env.layout.uss_path(&user)).unwrap();
    std::fs::write(&keyset_path, &pre_migration_keyset).unwrap();

    // The keyset is still usable and the retry completes the migration.
    let mut retry_session = env.decrypt_session("legacy@x");
    assert_eq!(
        retry_session.auth_factor_map().find("legacy-0").unwrap().1,
        StorageType::VaultKeyset
    );
    retry_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    assert!(env.uss_storage.exists(&user));
    assert!(env
        .keyset_management
        .get_vault_keyset(&user, "legacy-0")
        .unwrap()
        .is_migrated());

    let mut final_session = env.decrypt_session("legacy@x");
    final_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn session_times_out_and_fires_the_callback_once() {
    let env = TestEnv::new();
    let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut session = create_user_with_password(&env, "alice@x").await;
    let expected_token = session.token();
    let sink = fired.clone();
    session.set_on_timeout(Box::new(move |token| {
        sink.lock().push(token);
    }));

    tokio::time::advance(AUTH_SESSION_TIMEOUT + std::time::Duration::from_secs(1)).await;
    assert!(session.poll_timeout());
    assert_eq!(session.status(), AuthStatus::TimedOut);
    assert_eq!(session.get_remaining_time(), Some(std::time::Duration::ZERO));

    // Operations on the dead session fail with the token error.
    let err = session
        .add_auth_factor("pin1", &pin("0000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAuthSessionToken);
    let err = session.extend_timeout(std::time::Duration::from_secs(60)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidAuthSessionToken);

    assert!(session.poll_timeout());
    assert_eq!(*fired.lock(), vec![expected_token]);
}

#[tokio::test(start_paused = true)]
async fn extend_timeout_adds_to_remaining_time() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    assert_eq!(session.get_remaining_time(), Some(AUTH_SESSION_TIMEOUT));

    tokio::time::advance(std::time::Duration::from_secs(120)).await;
    session
        .extend_timeout(std::time::Duration::from_secs(60))
        .unwrap();
    assert_eq!(
        session.get_remaining_time(),
        Some(AUTH_SESSION_TIMEOUT - std::time::Duration::from_secs(120)
            + std::time::Duration::from_secs(60))
    );

    // Still alive right up to the new deadline.
    tokio::time::advance(std::time::Duration::from_secs(230)).await;
    assert!(!session.poll_timeout());
    tokio::time::advance(std::time::Duration::from_secs(11)).await;
    assert!(session.poll_timeout());
}

#[tokio::test]
async fn unauthenticated_sessions_cannot_mutate_factors() {
    let env = TestEnv::new();
    create_user_with_password(&env, "alice@x").await;

    let mut session = env.decrypt_session("alice@x");
    let err = session
        .add_auth_factor("pin1", &pin("0000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnauthenticatedAuthSession);
    let err = session.remove_auth_factor("legacy-0").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnauthenticatedAuthSession);
}

#[tokio::test]
async fn hibernate_secret_needs_an_authenticated_session() {
    let env = TestEnv::new();
    let session = create_user_with_password(&env, "alice@x").await;
    let secret = session.get_hibernate_secret().unwrap();
    assert_eq!(secret.len(), 32);

    let fresh = env.decrypt_session("alice@x");
    assert!(fresh.get_hibernate_secret().is_err());
}

#[tokio::test]
async fn recovery_factor_round_trip() {
    let env = TestEnv::new();
    let user = Username::new("alice@x").obfuscate();
    let mediator_pub_key = vec![0x42; 32];

    let mut session = create_user_with_password(&env, "alice@x").await;
    session
        .add_auth_factor(
            "recovery",
            &FactorInput::CryptohomeRecovery {
                mediator_pub_key: mediator_pub_key.clone(),
                user_gaia_id: "gaia-1".into(),
                device_user_id: "device-1".into(),
                derive: None,
            },
        )
        .await
        .unwrap();
    drop(session);

    // Adding a stash-only factor invalidated the backup keysets.
    assert!(env.keyset_management.get_vault_keyset(&user, "legacy-0").is_none());

    // Recover on a fresh session: request, mediate off-device, derive.
    let mut recovery_session = env.decrypt_session("alice@x");
    let epoch_response = b"epoch-9".to_vec();
    let request = recovery_session
        .get_recovery_request("recovery", &epoch_response)
        .unwrap();
    let response = SoftSecureElement::simulate_mediation(&mediator_pub_key, &request).unwrap();

    recovery_session
        .authenticate_auth_factor(
            &labels(&["recovery"]),
            &FactorInput::CryptohomeRecovery {
                mediator_pub_key: mediator_pub_key.clone(),
                user_gaia_id: "gaia-1".into(),
                device_user_id: "device-1".into(),
                derive: Some(RecoveryDeriveInput {
                    epoch_response,
                    recovery_response: response,
                    ..Default::default()
                }),
            },
        )
        .await
        .unwrap();
    assert_eq!(recovery_session.status(), AuthStatus::Authenticated);
}

#[tokio::test]
async fn smart_card_factor_round_trip() {
    let delegate = Arc::new(SoftKeyDelegate::new());
    let spki = delegate.register_key();
    let env = {
        let env = TestEnv::new();
        let dispatcher =
            AuthBlockDispatcher::new(env.element.clone()).with_key_delegate(delegate);
        env.with_dispatcher(dispatcher)
    };

    let smart_card = FactorInput::SmartCard {
        public_key_spki_der: spki,
        signature_algorithms: vec![ChallengeSignatureAlgorithm::RsassaPkcs1V15Sha256],
        key_delegate_service_name: "org.example.KeyDelegate".into(),
    };

    let mut session = env.decrypt_session("alice@x");
    session.on_user_created().unwrap();
    session.add_auth_factor("card", &smart_card).await.unwrap();
    drop(session);

    let mut card_session = env.decrypt_session("alice@x");
    card_session
        .authenticate_auth_factor(&labels(&["card"]), &smart_card)
        .await
        .unwrap();
    assert_eq!(card_session.status(), AuthStatus::Authenticated);
}

#[tokio::test]
async fn fingerprint_prepare_add_and_terminate() {
    let bio_service = Arc::new(BiometricsService::new(Arc::new(
        SoftBiometricsProcessor::new(),
    )));
    let env = {
        let env = TestEnv::new();
        let dispatcher = AuthBlockDispatcher::new(env.element.clone())
            .with_bio_service(bio_service.clone());
        env.with_dispatcher(dispatcher)
    };

    let mut session = create_user_with_password(&env, "alice@x").await;
    session
        .prepare_auth_factor(AuthFactorType::Fingerprint, PreparePurpose::AddAuthFactor)
        .await
        .unwrap();
    session
        .add_auth_factor("finger1", &FactorInput::Fingerprint)
        .await
        .unwrap();
    session
        .terminate_auth_factor(AuthFactorType::Fingerprint)
        .unwrap();
    assert!(!bio_service.has_active_session());

    // Terminating again is an error: nothing is prepared.
    let err = session
        .terminate_auth_factor(AuthFactorType::Fingerprint)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    // Selector-based multi-label authentication is not implemented.
    let mut fp_session = env.decrypt_session("alice@x");
    let err = fp_session
        .authenticate_auth_factor(&labels(&["finger1"]), &FactorInput::Fingerprint)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotImplemented);

    // Preparing an unpreparable type is invalid.
    let err = fp_session
        .prepare_auth_factor(AuthFactorType::Password, PreparePurpose::AuthenticateAuthFactor)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn legacy_fingerprint_verifies_without_labels() {
    let bio_service = Arc::new(BiometricsService::new(Arc::new(
        SoftBiometricsProcessor::new(),
    )));
    let env = {
        let env = TestEnv::new();
        let dispatcher = AuthBlockDispatcher::new(env.element.clone())
            .with_bio_service(bio_service.clone());
        env.with_dispatcher(dispatcher)
    };

    // Enroll a template through the modern fingerprint flow first.
    let mut session = create_user_with_password(&env, "alice@x").await;
    session
        .prepare_auth_factor(AuthFactorType::Fingerprint, PreparePurpose::AddAuthFactor)
        .await
        .unwrap();
    session
        .add_auth_factor("finger1", &FactorInput::Fingerprint)
        .await
        .unwrap();
    session
        .terminate_auth_factor(AuthFactorType::Fingerprint)
        .unwrap();
    drop(session);

    // Arity-zero verify-only authentication through the scanner.
    let mut verify_session =
        env.session("alice@x", AuthIntent::VerifyOnly, Features::default());
    verify_session
        .prepare_auth_factor(
            AuthFactorType::LegacyFingerprint,
            PreparePurpose::AuthenticateAuthFactor,
        )
        .await
        .unwrap();
    verify_session
        .authenticate_auth_factor(&[], &FactorInput::LegacyFingerprint)
        .await
        .unwrap();
    assert!(verify_session
        .authorized_intents()
        .contains(&AuthIntent::VerifyOnly));
    verify_session
        .terminate_auth_factor(AuthFactorType::LegacyFingerprint)
        .unwrap();

    // Labels on an arity-zero factor type are invalid.
    let mut bad_session = env.session("alice@x", AuthIntent::VerifyOnly, Features::default());
    let err = bad_session
        .authenticate_auth_factor(&labels(&["finger1"]), &FactorInput::LegacyFingerprint)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn duplicate_labels_are_refused() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    let err = session
        .add_auth_factor("legacy-0", &password("other"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AddCredentialsFailed);
}

#[tokio::test]
async fn webauthn_intent_parks_the_webauthn_secret() {
    let env = TestEnv::new();
    create_user_with_password(&env, "alice@x").await;
    let user = Username::new("alice@x").obfuscate();

    let mut session = env.session("alice@x", AuthIntent::WebAuthn, Features::default());
    session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    assert!(session.authorized_intents().contains(&AuthIntent::WebAuthn));
    assert!(session.authorized_intents().contains(&AuthIntent::Decrypt));

    let secret = env.verifier_cache.take_webauthn_secret(&user).unwrap();
    assert_eq!(secret.len(), 32);
    // One-shot: a second read yields nothing.
    assert!(env.verifier_cache.take_webauthn_secret(&user).is_none());
}

#[tokio::test]
async fn update_pin_re_derives_its_reset_secret() {
    let env = TestEnv::new();
    let mut session = create_user_with_password(&env, "alice@x").await;
    session.add_auth_factor("pin1", &pin("0000")).await.unwrap();
    drop(session);

    let mut update_session = env.decrypt_session("alice@x");
    update_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    update_session
        .update_auth_factor("pin1", &pin("4321"))
        .await
        .unwrap();

    let mut old_pin = env.decrypt_session("alice@x");
    let err = old_pin
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("0000"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthorizationKeyFailed);

    let mut new_pin = env.decrypt_session("alice@x");
    new_pin
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("4321"))
        .await
        .unwrap();

    // The new credential still resets cleanly after wrong attempts.
    let mut wrong = env.decrypt_session("alice@x");
    let _ = wrong
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("1111"))
        .await;
    let mut password_session = env.decrypt_session("alice@x");
    password_session
        .authenticate_auth_factor(&labels(&["legacy-0"]), &password("hunter2"))
        .await
        .unwrap();
    let mut final_pin = env.decrypt_session("alice@x");
    final_pin
        .authenticate_auth_factor(&labels(&["pin1"]), &pin("4321"))
        .await
        .unwrap();
}

#[tokio::test]
async fn kiosk_factor_derives_its_passkey_from_the_username() {
    let env = TestEnv::new();
    let mut session = env.decrypt_session("kiosk-app@x");
    session.on_user_created().unwrap();
    session
        .add_auth_factor("kiosk", &FactorInput::Kiosk)
        .await
        .unwrap();
    drop(session);

    let mut kiosk_session = env.decrypt_session("kiosk-app@x");
    kiosk_session
        .authenticate_auth_factor(&labels(&["kiosk"]), &FactorInput::Kiosk)
        .await
        .unwrap();
    assert_eq!(kiosk_session.status(), AuthStatus::Authenticated);
}
