//! On-disk layout and atomic file persistence
//!
//! Per-user directory tree, keyed by obfuscated username:
//!
//! ```text
//! <root>/<obfuscated>/auth_factors/<label>.json
//! <root>/<obfuscated>/user_secret_stash/uss.container
//! <root>/<obfuscated>/keysets/<index>.json
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use homevault_core::{Error, ErrorKind, ObfuscatedUsername, Result};

const AUTH_FACTORS_DIR: &str = "auth_factors";
const USS_DIR: &str = "user_secret_stash";
const USS_CONTAINER_FILE: &str = "uss.container";
const KEYSETS_DIR: &str = "keysets";
const PUBLIC_MOUNT_SALT_FILE: &str = "public_mount_salt";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user_dir(&self, user: &ObfuscatedUsername) -> PathBuf {
        self.root.join(user.as_str())
    }

    /// A persistent user exists once their directory does.
    pub fn user_exists(&self, user: &ObfuscatedUsername) -> bool {
        self.user_dir(user).is_dir()
    }

    pub fn create_user_dir(&self, user: &ObfuscatedUsername) -> Result<()> {
        fs::create_dir_all(self.user_dir(user))?;
        Ok(())
    }

    pub fn auth_factors_dir(&self, user: &ObfuscatedUsername) -> PathBuf {
        self.user_dir(user).join(AUTH_FACTORS_DIR)
    }

    pub fn auth_factor_path(&self, user: &ObfuscatedUsername, label: &str) -> PathBuf {
        self.auth_factors_dir(user).join(format!("{label}.json"))
    }

    pub fn uss_path(&self, user: &ObfuscatedUsername) -> PathBuf {
        self.user_dir(user).join(USS_DIR).join(USS_CONTAINER_FILE)
    }

    pub fn keysets_dir(&self, user: &ObfuscatedUsername) -> PathBuf {
        self.user_dir(user).join(KEYSETS_DIR)
    }

    pub fn keyset_path(&self, user: &ObfuscatedUsername, index: u32) -> PathBuf {
        self.keysets_dir(user).join(format!("{index}.json"))
    }

    /// Device-wide salt for deriving public (kiosk) mount passkeys.
    /// Created on first use.
    pub fn public_mount_salt(&self) -> Result<Vec<u8>> {
        let path = self.root.join(PUBLIC_MOUNT_SALT_FILE);
        match fs::read(&path) {
            Ok(salt) if !salt.is_empty() => Ok(salt),
            _ => {
                let salt = homevault_core::crypto::random_bytes(
                    homevault_core::crypto::DEFAULT_SALT_SIZE,
                );
                atomic_write(&path, &salt)?;
                Ok(salt)
            }
        }
    }
}

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename over the target, fsync the directory. Readers see
/// either the old or the new contents, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::new(
            ErrorKind::BackingStoreFailure,
            format!("no parent directory for {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent)?;

    let file_name = path.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
        Error::new(
            ErrorKind::BackingStoreFailure,
            format!("unusable file name in {}", path.display()),
        )
    })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Ok(dir) = File::open(parent) {
        // Directory sync is best-effort; some filesystems refuse it.
        let _ = dir.sync_all();
    }
    Ok(())
}
