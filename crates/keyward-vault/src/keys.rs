//! Master key and data key lifecycle.
//!
//! Keys form a two-level envelope:
//!
//! ```text
//! vault password ──PBKDF2──▶ wrapping key ──AES-GCM──▶ master key   (master.key file)
//!                                                      │
//!                                                      └─AES-GCM──▶ data keys (data_keys table)
//!                                                                   │
//!                                                                   └─AES-GCM──▶ records
//! ```
//!
//! Changing the vault password re-wraps the master key and touches nothing
//! else. Rotating the data key re-encrypts every record in one transaction
//! and retires the previous key, erasing its wrapped material.

use chrono::Utc;
use keyward_store::Database;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::blocking;
use crate::crypto::{self, KEY_LEN, Key};
use crate::error::{Result, VaultError};
use crate::keyfile::{KeyFile, WrappedMasterKey};
use crate::records::{self, RecordKind};

// ---------------------------------------------------------------------------
// Key types
// ---------------------------------------------------------------------------

/// The root key. Exists unwrapped only in memory.
#[derive(Clone)]
pub struct MasterKey(Key);

impl MasterKey {
    fn generate() -> Result<Self> {
        crypto::generate_key().map(Self)
    }

    fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != KEY_LEN {
            return None;
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Some(Self(key))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([redacted])")
    }
}

/// A versioned record-encryption key.
#[derive(Clone)]
pub struct DataKey {
    version: u32,
    key: Key,
}

impl DataKey {
    pub(crate) fn generate(version: u32) -> Result<Self> {
        Ok(Self {
            version,
            key: crypto::generate_key()?,
        })
    }

    pub(crate) fn from_slice(version: u32, bytes: &[u8]) -> Option<Self> {
        MasterKey::from_slice(bytes).map(|k| Self { version, key: k.0 })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.key.as_ref()
    }

    fn aad(version: u32) -> Vec<u8> {
        let mut aad = b"keyward/data_key/".to_vec();
        aad.extend_from_slice(&version.to_be_bytes());
        aad
    }

    /// Encrypt this key under `master` as `(nonce, wrapped)`.
    pub(crate) fn wrap(&self, master: &MasterKey) -> Result<(Vec<u8>, Vec<u8>)> {
        let (nonce, wrapped) = crypto::encrypt(self.as_bytes(), master.as_bytes(), &Self::aad(self.version))?;
        Ok((nonce.to_vec(), wrapped))
    }

    fn unwrap_with(version: u32, nonce: &[u8], wrapped: &[u8], master: &MasterKey) -> Result<Self> {
        let plaintext = crypto::decrypt(nonce, wrapped, master.as_bytes(), &Self::aad(version))?;
        Self::from_slice(version, &plaintext).ok_or_else(|| VaultError::DecryptionFailed {
            reason: format!("data key v{version} has the wrong length"),
        })
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// The keys held by an unlocked vault.
#[derive(Clone)]
pub struct Keyring {
    master: MasterKey,
    active: DataKey,
}

impl Keyring {
    pub fn active_version(&self) -> u32 {
        self.active.version
    }

    pub(crate) fn master(&self) -> &MasterKey {
        &self.master
    }

    pub(crate) fn active(&self) -> &DataKey {
        &self.active
    }

    /// Same master key, different active data key.
    pub(crate) fn with_active(&self, active: DataKey) -> Self {
        Self {
            master: self.master.clone(),
            active,
        }
    }
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("active_version", &self.active.version)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Master key wrapping
// ---------------------------------------------------------------------------

fn wrap_master(master: &MasterKey, password: &[u8], iterations: u32) -> Result<WrappedMasterKey> {
    let salt = crypto::generate_salt()?;
    let wrapping = crypto::derive_key(password, &salt, iterations)?;
    let aad = WrappedMasterKey::header(iterations, &salt);
    let (nonce, ciphertext) = crypto::encrypt(master.as_bytes(), wrapping.as_ref(), &aad)?;
    Ok(WrappedMasterKey {
        iterations,
        salt,
        nonce,
        ciphertext,
    })
}

/// Every failure here is reported as [`VaultError::Authentication`] so a
/// wrong password cannot be told apart from a damaged salt or header.
fn unwrap_master(wrapped: &WrappedMasterKey, password: &[u8]) -> Result<MasterKey> {
    let wrapping = crypto::derive_key(password, &wrapped.salt, wrapped.iterations)
        .map_err(|_| VaultError::Authentication)?;
    let plaintext = crypto::decrypt(&wrapped.nonce, &wrapped.ciphertext, wrapping.as_ref(), &wrapped.aad())
        .map_err(|_| VaultError::Authentication)?;
    MasterKey::from_slice(&plaintext).ok_or(VaultError::Authentication)
}

// ---------------------------------------------------------------------------
// Data key rows
// ---------------------------------------------------------------------------

fn load_active(conn: &Connection, master: &MasterKey) -> Result<Option<DataKey>> {
    let row = conn
        .query_row(
            "SELECT version, wrapped_key, nonce FROM data_keys WHERE state = 'active'",
            [],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(None),
        Some((version, Some(wrapped), Some(nonce))) => {
            DataKey::unwrap_with(version, &nonce, &wrapped, master).map(Some)
        }
        Some((version, _, _)) => Err(VaultError::DecryptionFailed {
            reason: format!("active data key v{version} has no key material"),
        }),
    }
}

fn next_version(conn: &Connection) -> Result<u32> {
    let max: u32 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM data_keys", [], |row| {
        row.get(0)
    })?;
    Ok(max + 1)
}

/// Insert `key` as a data key row in `state`, wrapped under `master`.
pub(crate) fn insert_data_key(
    conn: &Connection,
    key: &DataKey,
    master: &MasterKey,
    state: &str,
    created_at: i64,
) -> Result<()> {
    let (nonce, wrapped) = key.wrap(master)?;
    conn.execute(
        "INSERT INTO data_keys (version, wrapped_key, nonce, state, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![key.version, wrapped, nonce, state, created_at],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// KeyManager
// ---------------------------------------------------------------------------

/// Owns the key file and the `data_keys` table.
#[derive(Debug, Clone)]
pub struct KeyManager {
    key_file: KeyFile,
    db: Database,
    kdf_iterations: u32,
}

impl KeyManager {
    pub fn new(key_file: KeyFile, db: Database, kdf_iterations: u32) -> Self {
        Self {
            key_file,
            db,
            kdf_iterations,
        }
    }

    /// Whether a master key has been created.
    pub fn is_initialized(&self) -> bool {
        self.key_file.exists()
    }

    /// Create the master key, wrap it under `password`, and create the
    /// first data key.
    #[instrument(skip(self, password))]
    pub async fn initialize(&self, password: &str) -> Result<Keyring> {
        if self.key_file.exists() {
            return Err(VaultError::AlreadyInitialized);
        }
        if password.is_empty() {
            return Err(VaultError::InvalidArgument("vault password must not be empty".into()));
        }

        let password = Zeroizing::new(password.to_owned());
        let iterations = self.kdf_iterations;
        let (master, wrapped) = blocking(move || {
            let master = MasterKey::generate()?;
            let wrapped = wrap_master(&master, password.as_bytes(), iterations)?;
            Ok((master, wrapped))
        })
        .await?;

        self.key_file.write(&wrapped)?;
        let active = self.ensure_data_key(&master).await?;

        info!(active_version = active.version, "vault initialized");
        Ok(Keyring { master, active })
    }

    /// Read the key file for a password check.
    ///
    /// A damaged file reports [`VaultError::Authentication`] like a wrong
    /// password does; a missing one still reports `NotInitialized`.
    fn load_wrapped_master(&self) -> Result<WrappedMasterKey> {
        self.key_file.load().map_err(|e| match e {
            VaultError::DecryptionFailed { reason } => {
                warn!(%reason, "master key file is unreadable");
                VaultError::Authentication
            }
            other => other,
        })
    }

    /// Unwrap the master key with `password` and load the active data key.
    #[instrument(skip(self, password))]
    pub async fn unlock(&self, password: &str) -> Result<Keyring> {
        let wrapped = self.load_wrapped_master()?;
        let password = Zeroizing::new(password.to_owned());
        let master = blocking(move || unwrap_master(&wrapped, password.as_bytes())).await?;
        let active = self.ensure_data_key(&master).await?;

        info!(active_version = active.version, "vault unlocked");
        Ok(Keyring { master, active })
    }

    /// Re-wrap the same master key under `new_password` with a fresh salt.
    ///
    /// The key file is replaced atomically; data keys and records are not
    /// touched.
    #[instrument(skip(self, old_password, new_password))]
    pub async fn rotate_master_key(&self, old_password: &str, new_password: &str) -> Result<()> {
        if new_password.is_empty() {
            return Err(VaultError::InvalidArgument("vault password must not be empty".into()));
        }
        let wrapped = self.load_wrapped_master()?;
        let old_password = Zeroizing::new(old_password.to_owned());
        let new_password = Zeroizing::new(new_password.to_owned());
        let iterations = self.kdf_iterations;

        let rewrapped = blocking(move || {
            let master = unwrap_master(&wrapped, old_password.as_bytes())?;
            wrap_master(&master, new_password.as_bytes(), iterations)
        })
        .await?;

        self.key_file.write(&rewrapped)?;
        info!("master key re-wrapped under new password");
        Ok(())
    }

    /// Replace the active data key, re-encrypting every record.
    ///
    /// Runs as a single write transaction: the new key is inserted as
    /// `pending`, every credential and API key is decrypted, verified and
    /// re-encrypted, the old key is retired with its material erased, and the
    /// new key is promoted. Any failure rolls everything back and leaves the
    /// old key active. Returns the new keyring and the number of records
    /// migrated.
    #[instrument(skip(self, keyring), fields(from_version = keyring.active_version()))]
    pub async fn rotate_data_key(&self, keyring: &Keyring) -> Result<(Keyring, usize)> {
        let old = keyring.active.clone();
        let master = keyring.master.clone();

        let (new, migrated) = self
            .db
            .transaction(move |conn| {
                let now = Utc::now().timestamp();
                let new = DataKey::generate(next_version(conn)?)?;
                insert_data_key(conn, &new, &master, "pending", now)?;

                let mut migrated = 0;
                for kind in RecordKind::ALL {
                    migrated += records::reencrypt_all(conn, kind, &old, &new)?;
                }

                let retired = conn.execute(
                    "UPDATE data_keys SET state = 'retired', wrapped_key = NULL, nonce = NULL, retired_at = ?1 \
                     WHERE version = ?2 AND state = 'active'",
                    params![now, old.version],
                )?;
                if retired != 1 {
                    return Err(VaultError::Internal(format!(
                        "data key v{} is no longer active",
                        old.version
                    )));
                }
                conn.execute(
                    "UPDATE data_keys SET state = 'active' WHERE version = ?1",
                    params![new.version],
                )?;
                Ok::<_, VaultError>((new, migrated))
            })
            .await?;

        info!(to_version = new.version, migrated, "data key rotated");
        Ok((keyring.with_active(new), migrated))
    }

    /// Version of the active data key, readable while locked.
    pub async fn active_version(&self) -> Result<Option<u32>> {
        self.db
            .execute(|conn| {
                let version = conn
                    .query_row("SELECT version FROM data_keys WHERE state = 'active'", [], |row| {
                        row.get(0)
                    })
                    .optional()?;
                Ok::<_, VaultError>(version)
            })
            .await
    }

    /// Load the active data key, creating version 1 if none exists.
    async fn ensure_data_key(&self, master: &MasterKey) -> Result<DataKey> {
        let master = master.clone();
        self.db
            .transaction(move |conn| {
                if let Some(active) = load_active(conn, &master)? {
                    return Ok(active);
                }
                let key = DataKey::generate(next_version(conn)?)?;
                insert_data_key(conn, &key, &master, "active", Utc::now().timestamp())?;
                warn!(version = key.version, "no active data key found, created a new one");
                Ok::<_, VaultError>(key)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MIN_KDF_ITERATIONS;

    async fn manager(dir: &tempfile::TempDir) -> KeyManager {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        KeyManager::new(KeyFile::new(dir.path().join("master.key")), db, MIN_KDF_ITERATIONS)
    }

    #[tokio::test]
    async fn initialize_then_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        assert!(!keys.is_initialized());

        let created = keys.initialize("vault-pass").await.unwrap();
        assert!(keys.is_initialized());
        assert_eq!(created.active_version(), 1);

        let unlocked = keys.unlock("vault-pass").await.unwrap();
        assert_eq!(unlocked.master().as_bytes(), created.master().as_bytes());
        assert_eq!(unlocked.active().as_bytes(), created.active().as_bytes());
    }

    #[tokio::test]
    async fn initialize_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        keys.initialize("vault-pass").await.unwrap();
        assert!(matches!(
            keys.initialize("other").await,
            Err(VaultError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn wrong_password_is_generic_authentication_error() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        keys.initialize("vault-pass").await.unwrap();

        let err = keys.unlock("not-the-pass").await.unwrap_err();
        assert!(matches!(err, VaultError::Authentication));
        assert_eq!(err.to_string(), "invalid credentials");
    }

    #[tokio::test]
    async fn damaged_key_file_reads_as_wrong_password() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        keys.initialize("vault-pass").await.unwrap();
        std::fs::write(dir.path().join("master.key"), b"not a key file").unwrap();

        assert!(matches!(
            keys.unlock("vault-pass").await,
            Err(VaultError::Authentication)
        ));
        assert!(matches!(
            keys.rotate_master_key("vault-pass", "next-pass").await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn unlock_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        assert!(matches!(keys.unlock("x").await, Err(VaultError::NotInitialized)));
    }

    #[tokio::test]
    async fn master_key_rotation_keeps_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        let before = keys.initialize("old-pass").await.unwrap();

        keys.rotate_master_key("old-pass", "new-pass").await.unwrap();

        assert!(matches!(
            keys.unlock("old-pass").await,
            Err(VaultError::Authentication)
        ));
        let after = keys.unlock("new-pass").await.unwrap();
        assert_eq!(after.master().as_bytes(), before.master().as_bytes());
    }

    #[tokio::test]
    async fn master_key_rotation_requires_old_password() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        keys.initialize("old-pass").await.unwrap();

        assert!(matches!(
            keys.rotate_master_key("guess", "new-pass").await,
            Err(VaultError::Authentication)
        ));
        keys.unlock("old-pass").await.unwrap();
    }

    #[tokio::test]
    async fn data_key_rotation_retires_old_key() {
        let dir = tempfile::tempdir().unwrap();
        let keys = manager(&dir).await;
        let keyring = keys.initialize("vault-pass").await.unwrap();

        let (rotated, migrated) = keys.rotate_data_key(&keyring).await.unwrap();
        assert_eq!(rotated.active_version(), 2);
        assert_eq!(migrated, 0);
        assert_eq!(keys.active_version().await.unwrap(), Some(2));

        let (state, wrapped): (String, Option<Vec<u8>>) = keys
            .db
            .execute(|conn| {
                let row = conn.query_row(
                    "SELECT state, wrapped_key FROM data_keys WHERE version = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                Ok::<_, VaultError>(row)
            })
            .await
            .unwrap();
        assert_eq!(state, "retired");
        assert!(wrapped.is_none());

        let unlocked = keys.unlock("vault-pass").await.unwrap();
        assert_eq!(unlocked.active_version(), 2);
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = DataKey::generate(3).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("version: 3"));
        assert!(!rendered.contains("key:"));
    }
}
