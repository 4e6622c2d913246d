//! Encrypted, password-protected backup archives.
//!
//! An archive is a consistent snapshot of every table plus the active data
//! key, encrypted under a key derived from a backup password with its own
//! salt. Archives can therefore be restored into any vault, whatever that
//! vault's own password is.
//!
//! The archive layout (binary, big-endian integers):
//! ```text
//! [4 bytes:  magic "KWBK"]
//! [2 bytes:  format version]
//! [8 bytes:  creation time, unix seconds]
//! [4 bytes:  PBKDF2 iterations]
//! [32 bytes: PBKDF2 salt]
//! [12 bytes: AES-256-GCM nonce]
//! [remaining: AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! Everything before the nonce is the associated data of the ciphertext.
//!
//! # Restore
//!
//! Nothing live is touched until the archive has been fully decrypted and
//! every record in it has been verified against its digest. The swap then
//! happens in one write transaction. Cancellation is honoured up to the
//! commit; a cancelled restore leaves the store exactly as it was.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use keyward_store::{Database, migration};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use zeroize::{Zeroize, Zeroizing};

use crate::audit::timestamp_from_db;
use crate::blocking;
use crate::crypto::{self, NONCE_LEN_BYTES, SALT_LEN};
use crate::error::{Result, VaultError};
use crate::keyfile::sync_dir;
use crate::keys::{DataKey, Keyring, insert_data_key};
use crate::records::{self, RecordKind, SealedRecord};

const MAGIC: &[u8; 4] = b"KWBK";

/// Archive format written by this build.
pub const FORMAT_VERSION: u16 = 1;

/// Length of the authenticated header (magic through salt).
const AAD_LEN: usize = 4 + 2 + 8 + 4 + SALT_LEN;

const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    version: u16,
    created_at: i64,
    iterations: u32,
    salt: [u8; SALT_LEN],
}

impl Header {
    fn aad(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AAD_LEN);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.created_at.to_be_bytes());
        out.extend_from_slice(&self.iterations.to_be_bytes());
        out.extend_from_slice(&self.salt);
        out
    }

    /// Split an archive into header, nonce and ciphertext.
    ///
    /// The magic number and format version are checked before anything else
    /// is parsed.
    fn parse(data: &[u8]) -> Result<(Self, &[u8], &[u8])> {
        if data.len() < 6 || &data[..4] != MAGIC {
            return Err(backup_error("not a keyward backup archive"));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(backup_error(&format!(
                "unsupported backup format version {version} (expected {FORMAT_VERSION})"
            )));
        }
        if data.len() < AAD_LEN + NONCE_LEN_BYTES + TAG_LEN {
            return Err(backup_error("archive is truncated"));
        }

        let mut created_at = [0u8; 8];
        created_at.copy_from_slice(&data[6..14]);
        let mut iterations = [0u8; 4];
        iterations.copy_from_slice(&data[14..18]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[18..AAD_LEN]);

        let header = Self {
            version,
            created_at: i64::from_be_bytes(created_at),
            iterations: u32::from_be_bytes(iterations),
            salt,
        };
        let (nonce, ciphertext) = data[AAD_LEN..].split_at(NONCE_LEN_BYTES);
        Ok((header, nonce, ciphertext))
    }
}

fn backup_error(reason: &str) -> VaultError {
    VaultError::Backup {
        reason: reason.to_string(),
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(VaultError::Cancelled);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Binary columns travel as standard base64 strings.
mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
struct ArchivedKey {
    version: u32,
    #[serde(with = "b64")]
    key: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UserRow {
    id: String,
    username: String,
    email: String,
    #[serde(with = "b64")]
    password_hash: Vec<u8>,
    #[serde(with = "b64")]
    password_salt: Vec<u8>,
    password_params: String,
    role: String,
    active: bool,
    failed_attempts: u32,
    locked_until: Option<i64>,
    created_at: i64,
    last_login: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionRow {
    token_hash: String,
    user_id: String,
    created_at: i64,
    expires_at: i64,
    active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct DataKeyRow {
    version: u32,
    state: String,
    created_at: i64,
    retired_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialRow {
    name: String,
    credential_type: String,
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    nonce: Vec<u8>,
    #[serde(with = "b64")]
    digest: Vec<u8>,
    key_version: u32,
    tags: String,
    created_at: i64,
    updated_at: i64,
    accessed_at: Option<i64>,
    access_count: i64,
    expires_at: Option<i64>,
    active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiKeyRow {
    name: String,
    service: String,
    #[serde(with = "b64")]
    ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    nonce: Vec<u8>,
    #[serde(with = "b64")]
    digest: Vec<u8>,
    key_version: u32,
    tags: String,
    permissions: String,
    rate_limit: Option<u32>,
    created_at: i64,
    updated_at: i64,
    last_used: Option<i64>,
    usage_count: i64,
    expires_at: Option<i64>,
    active: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditRow {
    id: i64,
    user_id: Option<String>,
    target_name: Option<String>,
    action: String,
    success: bool,
    timestamp: i64,
    detail: Option<String>,
}

/// Plaintext body of an archive.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    data_key: ArchivedKey,
    data_keys: Vec<DataKeyRow>,
    users: Vec<UserRow>,
    sessions: Vec<SessionRow>,
    credentials: Vec<CredentialRow>,
    api_keys: Vec<ApiKeyRow>,
    audit_events: Vec<AuditRow>,
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.data_key.key.zeroize();
    }
}

fn read_rows<T>(conn: &Connection, sql: &str, map: fn(&rusqlite::Row<'_>) -> rusqlite::Result<T>) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<T>>>()?;
    Ok(rows)
}

impl Snapshot {
    /// Read every table. Must run inside a read transaction.
    fn read(conn: &Connection, active: &DataKey) -> Result<Self> {
        let data_keys = read_rows(
            conn,
            "SELECT version, state, created_at, retired_at FROM data_keys ORDER BY version",
            |row| {
                Ok(DataKeyRow {
                    version: row.get(0)?,
                    state: row.get(1)?,
                    created_at: row.get(2)?,
                    retired_at: row.get(3)?,
                })
            },
        )?;
        let current = data_keys.iter().find(|k| k.state == "active").map(|k| k.version);
        if current != Some(active.version()) {
            return Err(VaultError::Internal(format!(
                "active data key changed during backup (expected v{})",
                active.version()
            )));
        }

        let users = read_rows(
            conn,
            "SELECT id, username, email, password_hash, password_salt, password_params, role, active, \
                 failed_attempts, locked_until, created_at, last_login FROM users",
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get(2)?,
                    password_hash: row.get(3)?,
                    password_salt: row.get(4)?,
                    password_params: row.get(5)?,
                    role: row.get(6)?,
                    active: row.get(7)?,
                    failed_attempts: row.get(8)?,
                    locked_until: row.get(9)?,
                    created_at: row.get(10)?,
                    last_login: row.get(11)?,
                })
            },
        )?;
        let sessions = read_rows(
            conn,
            "SELECT token_hash, user_id, created_at, expires_at, active FROM sessions",
            |row| {
                Ok(SessionRow {
                    token_hash: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: row.get(2)?,
                    expires_at: row.get(3)?,
                    active: row.get(4)?,
                })
            },
        )?;
        let credentials = read_rows(
            conn,
            "SELECT name, type, ciphertext, nonce, digest, key_version, tags, created_at, updated_at, \
                 accessed_at, access_count, expires_at, active FROM credentials",
            |row| {
                Ok(CredentialRow {
                    name: row.get(0)?,
                    credential_type: row.get(1)?,
                    ciphertext: row.get(2)?,
                    nonce: row.get(3)?,
                    digest: row.get(4)?,
                    key_version: row.get(5)?,
                    tags: row.get(6)?,
                    created_at: row.get(7)?,
                    updated_at: row.get(8)?,
                    accessed_at: row.get(9)?,
                    access_count: row.get(10)?,
                    expires_at: row.get(11)?,
                    active: row.get(12)?,
                })
            },
        )?;
        let api_keys = read_rows(
            conn,
            "SELECT name, service, ciphertext, nonce, digest, key_version, tags, permissions, rate_limit, \
                 created_at, updated_at, last_used, usage_count, expires_at, active FROM api_keys",
            |row| {
                Ok(ApiKeyRow {
                    name: row.get(0)?,
                    service: row.get(1)?,
                    ciphertext: row.get(2)?,
                    nonce: row.get(3)?,
                    digest: row.get(4)?,
                    key_version: row.get(5)?,
                    tags: row.get(6)?,
                    permissions: row.get(7)?,
                    rate_limit: row.get(8)?,
                    created_at: row.get(9)?,
                    updated_at: row.get(10)?,
                    last_used: row.get(11)?,
                    usage_count: row.get(12)?,
                    expires_at: row.get(13)?,
                    active: row.get(14)?,
                })
            },
        )?;
        let audit_events = read_rows(
            conn,
            "SELECT id, user_id, target_name, action, success, timestamp, detail FROM audit_events ORDER BY id",
            |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    target_name: row.get(2)?,
                    action: row.get(3)?,
                    success: row.get(4)?,
                    timestamp: row.get(5)?,
                    detail: row.get(6)?,
                })
            },
        )?;

        Ok(Self {
            schema_version: migration::current_version(conn)?,
            data_key: ArchivedKey {
                version: active.version(),
                key: active.as_bytes().to_vec(),
            },
            data_keys,
            users,
            sessions,
            credentials,
            api_keys,
            audit_events,
        })
    }

    /// Check that every record opens under the archived key.
    fn verify(&self) -> Result<DataKey> {
        if self.schema_version != migration::latest_version() {
            return Err(backup_error(&format!(
                "archive schema v{} does not match store schema v{}",
                self.schema_version,
                migration::latest_version()
            )));
        }
        let key = DataKey::from_slice(self.data_key.version, &self.data_key.key)
            .ok_or_else(|| backup_error("archived data key has the wrong length"))?;
        let active: Vec<_> = self.data_keys.iter().filter(|k| k.state == "active").collect();
        if active.len() != 1 || active[0].version != key.version() {
            return Err(backup_error("archive key table does not match its data key"));
        }

        for row in &self.credentials {
            let sealed = SealedRecord {
                nonce: row.nonce.clone(),
                ciphertext: row.ciphertext.clone(),
                digest: row.digest.clone(),
                key_version: row.key_version,
            };
            records::open(RecordKind::Credential, &row.name, &sealed, &key)?;
        }
        for row in &self.api_keys {
            let sealed = SealedRecord {
                nonce: row.nonce.clone(),
                ciphertext: row.ciphertext.clone(),
                digest: row.digest.clone(),
                key_version: row.key_version,
            };
            records::open(RecordKind::ApiKey, &row.name, &sealed, &key)?;
        }
        Ok(key)
    }

    /// Replace every table with the snapshot. Must run inside a write
    /// transaction.
    fn replace_live(&self, conn: &Connection, key: &DataKey, keyring: &Keyring) -> Result<()> {
        conn.execute_batch(
            "DELETE FROM sessions;
             DELETE FROM credentials;
             DELETE FROM api_keys;
             DELETE FROM audit_events;
             DELETE FROM users;
             DELETE FROM data_keys;",
        )?;

        for row in &self.data_keys {
            if row.version == key.version() {
                insert_data_key(conn, key, keyring.master(), "active", row.created_at)?;
            } else {
                conn.execute(
                    "INSERT INTO data_keys (version, wrapped_key, nonce, state, created_at, retired_at) \
                     VALUES (?1, NULL, NULL, 'retired', ?2, ?3)",
                    params![row.version, row.created_at, row.retired_at],
                )?;
            }
        }
        for row in &self.users {
            conn.execute(
                "INSERT INTO users (id, username, email, password_hash, password_salt, password_params, role, \
                     active, failed_attempts, locked_until, created_at, last_login) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id,
                    row.username,
                    row.email,
                    row.password_hash,
                    row.password_salt,
                    row.password_params,
                    row.role,
                    row.active,
                    row.failed_attempts,
                    row.locked_until,
                    row.created_at,
                    row.last_login,
                ],
            )?;
        }
        for row in &self.sessions {
            conn.execute(
                "INSERT INTO sessions (token_hash, user_id, created_at, expires_at, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![row.token_hash, row.user_id, row.created_at, row.expires_at, row.active],
            )?;
        }
        for row in &self.credentials {
            conn.execute(
                "INSERT INTO credentials (name, type, ciphertext, nonce, digest, key_version, tags, created_at, \
                     updated_at, accessed_at, access_count, expires_at, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    row.name,
                    row.credential_type,
                    row.ciphertext,
                    row.nonce,
                    row.digest,
                    row.key_version,
                    row.tags,
                    row.created_at,
                    row.updated_at,
                    row.accessed_at,
                    row.access_count,
                    row.expires_at,
                    row.active,
                ],
            )?;
        }
        for row in &self.api_keys {
            conn.execute(
                "INSERT INTO api_keys (name, service, ciphertext, nonce, digest, key_version, tags, permissions, \
                     rate_limit, created_at, updated_at, last_used, usage_count, expires_at, active) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.name,
                    row.service,
                    row.ciphertext,
                    row.nonce,
                    row.digest,
                    row.key_version,
                    row.tags,
                    row.permissions,
                    row.rate_limit,
                    row.created_at,
                    row.updated_at,
                    row.last_used,
                    row.usage_count,
                    row.expires_at,
                    row.active,
                ],
            )?;
        }
        for row in &self.audit_events {
            conn.execute(
                "INSERT INTO audit_events (id, user_id, target_name, action, success, timestamp, detail) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.user_id,
                    row.target_name,
                    row.action,
                    row.success,
                    row.timestamp,
                    row.detail,
                ],
            )?;
        }
        Ok(())
    }

    fn summary(&self, path: &Path, created_at: i64) -> ArchiveSummary {
        ArchiveSummary {
            path: path.to_path_buf(),
            format_version: FORMAT_VERSION,
            created_at: timestamp_from_db(created_at),
            data_key_version: self.data_key.version,
            users: self.users.len(),
            credentials: self.credentials.len(),
            api_keys: self.api_keys.len(),
            audit_events: self.audit_events.len(),
        }
    }
}

// ---------------------------------------------------------------------------
// BackupManager
// ---------------------------------------------------------------------------

/// What an archive contains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub format_version: u16,
    pub created_at: DateTime<Utc>,
    pub data_key_version: u32,
    pub users: usize,
    pub credentials: usize,
    pub api_keys: usize,
    pub audit_events: usize,
}

/// Writes and restores backup archives.
#[derive(Debug, Clone)]
pub struct BackupManager {
    db: Database,
    kdf_iterations: u32,
}

impl BackupManager {
    pub fn new(db: Database, kdf_iterations: u32) -> Self {
        Self { db, kdf_iterations }
    }

    /// Write an encrypted snapshot of the whole store to `destination`.
    ///
    /// The archive is staged next to `destination` and renamed into place
    /// only once it is complete and flushed. If `cancel` fires first,
    /// `destination` is left as it was.
    #[instrument(skip(self, keyring, password, cancel), fields(destination = %destination.display()))]
    pub async fn backup(
        &self,
        keyring: &Keyring,
        password: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveSummary> {
        if password.is_empty() {
            return Err(VaultError::InvalidArgument("backup password must not be empty".into()));
        }
        check_cancelled(cancel)?;

        let active = keyring.active().clone();
        let snapshot = self
            .db
            .snapshot(move |conn| Snapshot::read(conn, &active))
            .await?;
        check_cancelled(cancel)?;

        let header = Header {
            version: FORMAT_VERSION,
            created_at: Utc::now().timestamp(),
            iterations: self.kdf_iterations,
            salt: crypto::generate_salt()?,
        };
        let summary = snapshot.summary(destination, header.created_at);
        let body = Zeroizing::new(serde_json::to_vec(&snapshot)?);
        drop(snapshot);

        let password = Zeroizing::new(password.to_owned());
        let aad = header.aad();
        let sealing_aad = aad.clone();
        let (salt, iterations) = (header.salt, header.iterations);
        let (nonce, ciphertext) = blocking(move || {
            let key = crypto::derive_key(password.as_bytes(), &salt, iterations)?;
            crypto::encrypt(&body, key.as_ref(), &sealing_aad)
        })
        .await?;
        check_cancelled(cancel)?;

        let mut archive = aad;
        archive.reserve(NONCE_LEN_BYTES + ciphertext.len());
        archive.extend_from_slice(&nonce);
        archive.extend_from_slice(&ciphertext);

        let destination = destination.to_path_buf();
        let cancel = cancel.clone();
        blocking(move || write_atomically(&destination, &archive, &cancel)).await?;

        info!(
            credentials = summary.credentials,
            api_keys = summary.api_keys,
            users = summary.users,
            "backup written"
        );
        Ok(summary)
    }

    /// Replace the live store with the archive at `source`.
    ///
    /// Returns the keyring to use from now on: the live master key with the
    /// archive's data key as the active key.
    #[instrument(skip(self, keyring, password, cancel), fields(source = %source.display()))]
    pub async fn restore(
        &self,
        keyring: &Keyring,
        source: &Path,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<(Keyring, ArchiveSummary)> {
        check_cancelled(cancel)?;
        let data = tokio::fs::read(source).await?;
        let (header, nonce, ciphertext) = Header::parse(&data)?;
        debug!(version = header.version, created_at = header.created_at, "backup header accepted");

        let password = Zeroizing::new(password.to_owned());
        let aad = header.aad();
        let nonce = nonce.to_vec();
        let ciphertext = ciphertext.to_vec();
        let salt = header.salt;
        let iterations = header.iterations;
        let body = blocking(move || {
            let key = crypto::derive_key(password.as_bytes(), &salt, iterations)
                .map_err(|_| backup_error("archive has invalid key derivation parameters"))?;
            crypto::decrypt(&nonce, &ciphertext, key.as_ref(), &aad)
                .map_err(|_| backup_error("archive could not be decrypted: wrong password or corrupted data"))
        })
        .await?;
        check_cancelled(cancel)?;

        let snapshot: Snapshot = serde_json::from_slice(&body)
            .map_err(|e| backup_error(&format!("archive body is malformed: {e}")))?;
        drop(body);
        let key = snapshot.verify()?;
        let summary = snapshot.summary(source, header.created_at);
        check_cancelled(cancel)?;

        let live = keyring.clone();
        let staged_key = key.clone();
        let cancel = cancel.clone();
        self.db
            .transaction(move |conn| {
                snapshot.replace_live(conn, &staged_key, &live)?;
                // Last point at which the restore can still be abandoned.
                check_cancelled(&cancel)
            })
            .await?;

        info!(
            credentials = summary.credentials,
            api_keys = summary.api_keys,
            data_key_version = key.version(),
            "backup restored"
        );
        Ok((keyring.with_active(key), summary))
    }
}

/// Stage `data` beside `destination`, flush it, and rename it into place.
fn write_atomically(destination: &Path, data: &[u8], cancel: &CancellationToken) -> Result<()> {
    let dir = match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
    staged.write_all(data)?;
    staged.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    // Dropping the staged file deletes it.
    check_cancelled(cancel)?;
    staged.persist(destination).map_err(|e| e.error)?;
    sync_dir(&dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Header {
        Header {
            version: FORMAT_VERSION,
            created_at: 1_700_000_000,
            iterations: 100_000,
            salt: [3u8; SALT_LEN],
        }
    }

    fn archive_bytes(header: &Header) -> Vec<u8> {
        let mut data = header.aad();
        data.extend_from_slice(&[0u8; NONCE_LEN_BYTES]);
        data.extend_from_slice(&[0u8; 32]);
        data
    }

    #[test]
    fn header_parses_back() {
        let h = header();
        let data = archive_bytes(&h);
        let (parsed, nonce, ciphertext) = Header::parse(&data).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(nonce.len(), NONCE_LEN_BYTES);
        assert_eq!(ciphertext.len(), 32);
    }

    #[test]
    fn wrong_magic_rejected() {
        let mut data = archive_bytes(&header());
        data[..4].copy_from_slice(b"ZIP!");
        assert!(matches!(Header::parse(&data), Err(VaultError::Backup { .. })));
    }

    #[test]
    fn future_version_rejected_before_parsing_rest() {
        let mut data = archive_bytes(&header());
        data[4..6].copy_from_slice(&2u16.to_be_bytes());
        data.truncate(8);
        let err = Header::parse(&data).unwrap_err();
        assert!(err.to_string().contains("unsupported backup format version 2"));
    }

    #[test]
    fn truncated_archive_rejected() {
        let data = archive_bytes(&header());
        assert!(Header::parse(&data[..AAD_LEN]).is_err());
    }

    #[test]
    fn binary_columns_encode_as_base64() {
        let key = ArchivedKey {
            version: 1,
            key: vec![0xff, 0x00, 0x10],
        };
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"{"version":1,"key":"/wAQ"}"#);
        let back: ArchivedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back.key, vec![0xff, 0x00, 0x10]);
    }

    #[test]
    fn cancelled_write_leaves_destination_alone() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("vault.bak");
        std::fs::write(&dest, b"previous").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            write_atomically(&dest, b"new archive", &cancel),
            Err(VaultError::Cancelled)
        ));
        assert_eq!(std::fs::read(&dest).unwrap(), b"previous");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
