//! Vault configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all) is a
//! valid configuration. [`VaultConfig::validate`] must pass before a vault is
//! opened with it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::crypto::{DEFAULT_KDF_ITERATIONS, MIN_KDF_ITERATIONS, PasswordHashParams};
use crate::error::{Result, VaultError};

/// Environment variable overriding [`VaultConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "KEYWARD_DATA_DIR";

/// File name of the SQLite database inside the data directory.
pub const DATABASE_FILE: &str = "vault.db";

/// File name of the wrapped master key inside the data directory.
pub const KEY_FILE: &str = "master.key";

/// Longest accepted lockout (one week).
pub const MAX_LOCKOUT_MINUTES: i64 = 7 * 24 * 60;

/// Longest accepted session lifetime (one year).
pub const MAX_SESSION_TTL_HOURS: i64 = 365 * 24;

/// Top-level vault configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Directory holding `vault.db` and `master.key`.
    pub data_dir: PathBuf,
    /// PBKDF2 iterations used to wrap the master key.
    pub kdf_iterations: u32,
    /// PBKDF2 iterations used to derive backup archive keys.
    pub backup_kdf_iterations: u32,
    /// Argon2id cost for user password hashes.
    pub password_hash: PasswordHashParams,
    /// Consecutive failures that lock an account.
    pub lockout_threshold: u32,
    /// How long a locked account stays locked.
    pub lockout_minutes: i64,
    /// Lifetime of a session token.
    pub session_ttl_hours: i64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/vault"),
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            backup_kdf_iterations: DEFAULT_KDF_ITERATIONS,
            password_hash: PasswordHashParams::default(),
            lockout_threshold: 5,
            lockout_minutes: 30,
            session_ttl_hours: 24,
        }
    }
}

impl VaultConfig {
    /// Configuration rooted at `data_dir` with all other fields defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| VaultError::Config(format!("failed to parse config: {e}")))
    }

    /// Load a configuration file, apply environment overrides and validate.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::from_toml_str(&text)?
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEYWARD_DATA_DIR` if it is set and non-empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                tracing::debug!(data_dir = %dir, "data directory overridden from environment");
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::Config(format!(
                "kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        if self.backup_kdf_iterations < MIN_KDF_ITERATIONS {
            return Err(VaultError::Config(format!(
                "backup_kdf_iterations must be at least {MIN_KDF_ITERATIONS}"
            )));
        }
        let hash = &self.password_hash;
        if hash.iterations == 0 || hash.parallelism == 0 {
            return Err(VaultError::Config(
                "password_hash iterations and parallelism must be positive".into(),
            ));
        }
        if hash.memory_kib < hash.parallelism.saturating_mul(8) {
            return Err(VaultError::Config(
                "password_hash memory_kib must be at least 8 * parallelism".into(),
            ));
        }
        if self.lockout_threshold == 0 {
            return Err(VaultError::Config("lockout_threshold must be positive".into()));
        }
        if !(1..=MAX_LOCKOUT_MINUTES).contains(&self.lockout_minutes) {
            return Err(VaultError::Config(format!(
                "lockout_minutes must be between 1 and {MAX_LOCKOUT_MINUTES}"
            )));
        }
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.session_ttl_hours) {
            return Err(VaultError::Config(format!(
                "session_ttl_hours must be between 1 and {MAX_SESSION_TTL_HOURS}"
            )));
        }
        Ok(())
    }

    /// Path of the SQLite database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Path of the wrapped master key file.
    pub fn key_file_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }
}
