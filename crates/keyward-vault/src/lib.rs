//! Encrypted credential vault.
//!
//! Secrets are protected with envelope encryption: a password-derived key
//! wraps the master key, the master key wraps versioned data keys, and the
//! active data key seals every credential and API key record with
//! AES-256-GCM. Around that core the crate provides user accounts with
//! Argon2id password hashing and lockout, server-side sessions, an
//! append-only audit log and portable encrypted backups.
//!
//! Open a [`Vault`] from a [`VaultConfig`], then [`Vault::initialize`] or
//! [`Vault::unlock`] it before touching records.

pub mod audit;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod keyfile;
pub mod keys;
pub mod payload;
pub mod records;
pub mod session;
pub mod vault;

pub use audit::{AuditAction, AuditEvent};
pub use backup::ArchiveSummary;
pub use config::VaultConfig;
pub use crypto::PasswordHashParams;
pub use error::{Result, VaultError};
pub use identity::{User, UserRole};
pub use records::{
    ApiKey, ApiKeyMetadata, Credential, CredentialMetadata, NewApiKey, NewCredential, mask_secret,
};
pub use session::SessionToken;
pub use vault::{Vault, VaultStats};

/// Run CPU-heavy work (key derivation, password hashing, bulk encryption)
/// off the async runtime.
pub(crate) async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Internal(format!("blocking task failed: {e}")))?
}
