//! Persistent stores for Homevault
//!
//! The user secret stash (single wrapped master key, unlockable by any
//! factor), the legacy per-factor vault keysets, and the auth factor
//! files, all under one on-disk layout with atomic write-temp-rename
//! persistence.

pub mod auth_factor_manager;
pub mod keyset_management;
pub mod layout;
pub mod user_secret_stash;
pub mod vault_keyset;

pub use auth_factor_manager::AuthFactorManager;
pub use keyset_management::KeysetManagement;
pub use layout::StorageLayout;
pub use user_secret_stash::{UserSecretStash, UssStorage, MAIN_KEY_SIZE};
pub use vault_keyset::VaultKeyset;
