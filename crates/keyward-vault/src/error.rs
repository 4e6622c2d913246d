//! Vault error types.
//!
//! All vault subsystems surface errors through [`VaultError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.
//!
//! Authentication failures are deliberately uninformative: an unknown user,
//! a wrong password and a wrong vault password all surface as
//! [`VaultError::Authentication`] with the same message.

use chrono::{DateTime, Utc};
use keyward_store::StoreError;

/// Unified error type for the keyward credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // -- Authentication -----------------------------------------------------
    /// Bad credentials. Never says which part was wrong.
    #[error("invalid credentials")]
    Authentication,

    /// Too many failed attempts; authentication is blocked until `until`.
    #[error("account is temporarily locked")]
    AccountLocked { until: DateTime<Utc> },

    /// The account has been deactivated.
    #[error("account is disabled")]
    AccountInactive,

    /// A user with the same username or email already exists.
    #[error("user already exists: {field} is taken")]
    DuplicateUser { field: &'static str },

    /// The password does not satisfy the password policy.
    #[error("password does not meet requirements: {reason}")]
    WeakPassword { reason: String },

    // -- Records ------------------------------------------------------------
    /// The requested record does not exist.
    #[error("{entity} not found: {name}")]
    NotFound { entity: &'static str, name: String },

    /// The record exists but has been deactivated.
    #[error("{entity} is inactive: {name}")]
    InactiveRecord { entity: &'static str, name: String },

    /// The record exists but its expiry has passed.
    #[error("{entity} has expired: {name}")]
    ExpiredRecord { entity: &'static str, name: String },

    /// The decrypted plaintext does not match its stored digest.
    #[error("integrity check failed for {entity}: {name}")]
    Integrity { entity: &'static str, name: String },

    // -- Crypto -------------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed (e.g. wrong key, corrupted ciphertext, unknown key version).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// Key derivation failed (e.g. invalid parameters).
    #[error("key derivation failed: {reason}")]
    KeyDerivationFailed { reason: String },

    // -- Vault lifecycle ----------------------------------------------------
    /// The operation needs an unlocked vault.
    #[error("vault is locked")]
    Locked,

    /// `initialize` was called on a vault that already has a master key.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// `unlock` was called before the vault was initialized.
    #[error("vault is not initialized")]
    NotInitialized,

    // -- Backup -------------------------------------------------------------
    /// The backup archive is malformed, of an unsupported version, or incomplete.
    #[error("backup error: {reason}")]
    Backup { reason: String },

    /// A long-running operation was cancelled before it took effect.
    #[error("operation cancelled")]
    Cancelled,

    // -- Underlying errors --------------------------------------------------
    /// Storage engine error (SQLite, contention, migrations).
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// I/O error from the filesystem (key file, backup archives).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal vault error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for VaultError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StoreError::Sqlite(err))
    }
}

/// Convenience alias used throughout the vault crate.
pub type Result<T> = std::result::Result<T, VaultError>;
