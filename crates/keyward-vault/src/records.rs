//! Encrypted record store for credentials and API keys.
//!
//! Each record's payload is rendered canonically (see [`crate::payload`]),
//! digested, and encrypted with the active data key before it reaches
//! SQLite. The record name is the AES-GCM associated data, so ciphertext
//! copied onto another row fails to decrypt.
//!
//! # Read path
//!
//! Retrieval checks, in order: the row exists, it is active, it has not
//! expired, it decrypts under the key version it claims, and the decrypted
//! bytes match the stored digest. Only then are the usage counters bumped,
//! inside the same write transaction as the read.
//!
//! Rate limits and permissions on API keys are stored and returned verbatim;
//! enforcing them is the caller's job.

use chrono::{DateTime, Utc};
use keyward_store::Database;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::timestamp_from_db;
use crate::crypto;
use crate::error::{Result, VaultError};
use crate::keys::DataKey;
use crate::payload;

// ---------------------------------------------------------------------------
// Record kinds
// ---------------------------------------------------------------------------

/// The two encrypted tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Credential,
    ApiKey,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Credential, RecordKind::ApiKey];

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Self::Credential => "credentials",
            Self::ApiKey => "api_keys",
        }
    }

    /// Name used in error messages.
    pub fn entity(&self) -> &'static str {
        match self {
            Self::Credential => "credential",
            Self::ApiKey => "api key",
        }
    }

    fn aad(&self, name: &str) -> Vec<u8> {
        format!("keyward/{}/{}", self.table(), name).into_bytes()
    }
}

/// Ciphertext and integrity material of one record as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SealedRecord {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub digest: Vec<u8>,
    pub key_version: u32,
}

/// Encrypt canonical `plaintext` for record `name` under `key`.
pub(crate) fn seal(kind: RecordKind, name: &str, plaintext: &[u8], key: &DataKey) -> Result<SealedRecord> {
    let (nonce, ciphertext) = crypto::encrypt(plaintext, key.as_bytes(), &kind.aad(name))?;
    Ok(SealedRecord {
        nonce: nonce.to_vec(),
        ciphertext,
        digest: crypto::digest(plaintext).to_vec(),
        key_version: key.version(),
    })
}

/// Decrypt a sealed record and verify its digest.
///
/// Never returns plaintext that has not passed both AEAD authentication and
/// the digest comparison.
pub(crate) fn open(
    kind: RecordKind,
    name: &str,
    sealed: &SealedRecord,
    key: &DataKey,
) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.key_version != key.version() {
        return Err(VaultError::DecryptionFailed {
            reason: format!(
                "{} {name} is sealed under key version {}, expected {}",
                kind.entity(),
                sealed.key_version,
                key.version()
            ),
        });
    }

    let plaintext = crypto::decrypt(&sealed.nonce, &sealed.ciphertext, key.as_bytes(), &kind.aad(name))
        .map_err(|_| VaultError::DecryptionFailed {
            reason: format!("{} {name} failed authentication", kind.entity()),
        })?;

    if !crypto::digests_match(&crypto::digest(&plaintext), &sealed.digest) {
        return Err(VaultError::Integrity {
            entity: kind.entity(),
            name: name.to_string(),
        });
    }
    Ok(plaintext)
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Non-secret description of a stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub name: String,
    pub credential_type: String,
    pub tags: Vec<String>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// A decrypted credential.
#[derive(Clone)]
pub struct Credential {
    pub metadata: CredentialMetadata,
    /// The secret payload.
    pub payload: Value,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("metadata", &self.metadata)
            .field("payload", &"[redacted]")
            .finish()
    }
}

/// Input for [`RecordStore::store_credential`].
#[derive(Clone)]
pub struct NewCredential {
    pub name: String,
    pub credential_type: String,
    pub payload: Value,
    pub tags: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewCredential {
    pub fn new(name: impl Into<String>, credential_type: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            credential_type: credential_type.into(),
            payload,
            tags: Vec::new(),
            expires_at: None,
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Non-secret description of a stored API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyMetadata {
    pub name: String,
    pub service: String,
    pub tags: Vec<String>,
    /// Opaque to the vault; enforced by the caller.
    pub permissions: Vec<String>,
    /// Requests per minute the caller should allow. Not enforced here.
    pub rate_limit: Option<u32>,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// A decrypted API key.
#[derive(Clone)]
pub struct ApiKey {
    pub metadata: ApiKeyMetadata,
    pub key: Zeroizing<String>,
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKey")
            .field("metadata", &self.metadata)
            .field("key", &mask_secret(&self.key))
            .finish()
    }
}

/// Input for [`RecordStore::store_api_key`].
#[derive(Clone)]
pub struct NewApiKey {
    pub name: String,
    pub service: String,
    pub key: Zeroizing<String>,
    pub tags: Vec<String>,
    pub permissions: Vec<String>,
    pub rate_limit: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewApiKey {
    pub fn new(name: impl Into<String>, service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            key: Zeroizing::new(key.into()),
            tags: Vec::new(),
            permissions: Vec::new(),
            rate_limit: None,
            expires_at: None,
        }
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = permissions.into_iter().map(Into::into).collect();
        self
    }

    pub fn rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = Some(per_minute);
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

/// Preview of a secret for display: first 8 and last 4 characters.
///
/// Values of 12 characters or fewer are fully masked.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const CREDENTIAL_COLUMNS: &str = "name, type, tags, key_version, created_at, updated_at, \
     accessed_at, access_count, expires_at, active, ciphertext, nonce, digest";

const API_KEY_COLUMNS: &str = "name, service, tags, permissions, rate_limit, key_version, \
     created_at, updated_at, last_used, usage_count, expires_at, active, ciphertext, nonce, digest";

struct CredentialRow {
    name: String,
    credential_type: String,
    tags: String,
    key_version: u32,
    created_at: i64,
    updated_at: i64,
    accessed_at: Option<i64>,
    access_count: i64,
    expires_at: Option<i64>,
    active: bool,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    digest: Vec<u8>,
}

impl CredentialRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            credential_type: row.get(1)?,
            tags: row.get(2)?,
            key_version: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            accessed_at: row.get(6)?,
            access_count: row.get(7)?,
            expires_at: row.get(8)?,
            active: row.get(9)?,
            ciphertext: row.get(10)?,
            nonce: row.get(11)?,
            digest: row.get(12)?,
        })
    }

    fn sealed(&self) -> SealedRecord {
        SealedRecord {
            nonce: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
            digest: self.digest.clone(),
            key_version: self.key_version,
        }
    }

    fn metadata(&self) -> Result<CredentialMetadata> {
        Ok(CredentialMetadata {
            name: self.name.clone(),
            credential_type: self.credential_type.clone(),
            tags: serde_json::from_str(&self.tags)?,
            key_version: self.key_version,
            created_at: timestamp_from_db(self.created_at),
            updated_at: timestamp_from_db(self.updated_at),
            accessed_at: self.accessed_at.map(timestamp_from_db),
            access_count: self.access_count.max(0) as u64,
            expires_at: self.expires_at.map(timestamp_from_db),
            active: self.active,
        })
    }
}

struct ApiKeyRow {
    name: String,
    service: String,
    tags: String,
    permissions: String,
    rate_limit: Option<u32>,
    key_version: u32,
    created_at: i64,
    updated_at: i64,
    last_used: Option<i64>,
    usage_count: i64,
    expires_at: Option<i64>,
    active: bool,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    digest: Vec<u8>,
}

impl ApiKeyRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            service: row.get(1)?,
            tags: row.get(2)?,
            permissions: row.get(3)?,
            rate_limit: row.get(4)?,
            key_version: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_used: row.get(8)?,
            usage_count: row.get(9)?,
            expires_at: row.get(10)?,
            active: row.get(11)?,
            ciphertext: row.get(12)?,
            nonce: row.get(13)?,
            digest: row.get(14)?,
        })
    }

    fn sealed(&self) -> SealedRecord {
        SealedRecord {
            nonce: self.nonce.clone(),
            ciphertext: self.ciphertext.clone(),
            digest: self.digest.clone(),
            key_version: self.key_version,
        }
    }

    fn metadata(&self) -> Result<ApiKeyMetadata> {
        Ok(ApiKeyMetadata {
            name: self.name.clone(),
            service: self.service.clone(),
            tags: serde_json::from_str(&self.tags)?,
            permissions: serde_json::from_str(&self.permissions)?,
            rate_limit: self.rate_limit,
            key_version: self.key_version,
            created_at: timestamp_from_db(self.created_at),
            updated_at: timestamp_from_db(self.updated_at),
            last_used: self.last_used.map(timestamp_from_db),
            usage_count: self.usage_count.max(0) as u64,
            expires_at: self.expires_at.map(timestamp_from_db),
            active: self.active,
        })
    }
}

/// Visibility checks shared by both read paths.
fn ensure_readable(kind: RecordKind, name: &str, active: bool, expires_at: Option<i64>, now: i64) -> Result<()> {
    if !active {
        return Err(VaultError::InactiveRecord {
            entity: kind.entity(),
            name: name.to_string(),
        });
    }
    if expires_at.is_some_and(|at| at <= now) {
        return Err(VaultError::ExpiredRecord {
            entity: kind.entity(),
            name: name.to_string(),
        });
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(VaultError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// CRUD over the encrypted `credentials` and `api_keys` tables.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // -- Credentials --------------------------------------------------------

    /// Insert or overwrite a credential by name.
    ///
    /// Overwriting is a new secret version: the access counter and last
    /// access time are reset, the row is reactivated, and `created_at` is
    /// kept.
    pub async fn store_credential(&self, key: &DataKey, new: NewCredential) -> Result<CredentialMetadata> {
        require_non_empty("credential name", &new.name)?;
        require_non_empty("credential type", &new.credential_type)?;

        let plaintext = payload::encode(&new.payload)?;
        let sealed = seal(RecordKind::Credential, &new.name, &plaintext, key)?;
        let tags = serde_json::to_string(&new.tags)?;
        let now = Utc::now().timestamp();
        let expires_at = new.expires_at.map(|at| at.timestamp());

        let name = new.name.clone();
        let credential_type = new.credential_type.clone();
        let created_at = self
            .db
            .transaction(move |conn| {
                let created_at: i64 = conn.query_row(
                    "INSERT INTO credentials (name, type, ciphertext, nonce, digest, key_version, tags, \
                         created_at, updated_at, accessed_at, access_count, expires_at, active) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, NULL, 0, ?9, 1) \
                     ON CONFLICT(name) DO UPDATE SET \
                         type = excluded.type, ciphertext = excluded.ciphertext, nonce = excluded.nonce, \
                         digest = excluded.digest, key_version = excluded.key_version, tags = excluded.tags, \
                         updated_at = excluded.updated_at, accessed_at = NULL, access_count = 0, \
                         expires_at = excluded.expires_at, active = 1 \
                     RETURNING created_at",
                    params![
                        name,
                        credential_type,
                        sealed.ciphertext,
                        sealed.nonce,
                        sealed.digest,
                        sealed.key_version,
                        tags,
                        now,
                        expires_at,
                    ],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(created_at)
            })
            .await?;

        info!(name = %new.name, credential_type = %new.credential_type, "stored credential");
        Ok(CredentialMetadata {
            name: new.name,
            credential_type: new.credential_type,
            tags: new.tags,
            key_version: key.version(),
            created_at: timestamp_from_db(created_at),
            updated_at: timestamp_from_db(now),
            accessed_at: None,
            access_count: 0,
            expires_at: new.expires_at,
            active: true,
        })
    }

    /// Decrypt a credential and record the access.
    pub async fn get_credential(&self, key: &DataKey, name: &str) -> Result<Credential> {
        let key = key.clone();
        let name = name.to_string();
        self.db
            .transaction(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE name = ?1"),
                        params![name],
                        CredentialRow::from_row,
                    )
                    .optional()?
                    .ok_or_else(|| VaultError::NotFound {
                        entity: RecordKind::Credential.entity(),
                        name: name.clone(),
                    })?;

                let now = Utc::now().timestamp();
                ensure_readable(RecordKind::Credential, &name, row.active, row.expires_at, now)?;
                let plaintext = open(RecordKind::Credential, &name, &row.sealed(), &key)?;
                let payload = payload::decode(&plaintext)?;

                conn.execute(
                    "UPDATE credentials SET access_count = access_count + 1, accessed_at = ?1 WHERE name = ?2",
                    params![now, name],
                )?;

                let mut metadata = row.metadata()?;
                metadata.access_count += 1;
                metadata.accessed_at = Some(timestamp_from_db(now));
                debug!(name = %name, "credential retrieved");
                Ok::<_, VaultError>(Credential { metadata, payload })
            })
            .await
    }

    /// Metadata of every active, unexpired credential, optionally filtered by type.
    pub async fn list_credentials(&self, type_filter: Option<&str>) -> Result<Vec<CredentialMetadata>> {
        let type_filter = type_filter.map(str::to_string);
        self.db
            .execute(move |conn| {
                let now = Utc::now().timestamp();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credentials \
                     WHERE active = 1 AND (expires_at IS NULL OR expires_at > ?1) \
                       AND (?2 IS NULL OR type = ?2) \
                     ORDER BY name"
                ))?;
                let rows = stmt.query_map(params![now, type_filter], CredentialRow::from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.metadata()?);
                }
                Ok::<_, VaultError>(out)
            })
            .await
    }

    /// Soft-delete a credential.
    pub async fn deactivate_credential(&self, name: &str) -> Result<()> {
        self.deactivate(RecordKind::Credential, name).await
    }

    // -- API keys -----------------------------------------------------------

    /// Insert or overwrite an API key by name. Same overwrite rules as
    /// [`RecordStore::store_credential`].
    pub async fn store_api_key(&self, key: &DataKey, new: NewApiKey) -> Result<ApiKeyMetadata> {
        require_non_empty("api key name", &new.name)?;
        require_non_empty("service", &new.service)?;
        require_non_empty("api key", &new.key)?;

        let plaintext = payload::encode(&Value::String(new.key.to_string()))?;
        let sealed = seal(RecordKind::ApiKey, &new.name, &plaintext, key)?;
        let tags = serde_json::to_string(&new.tags)?;
        let permissions = serde_json::to_string(&new.permissions)?;
        let now = Utc::now().timestamp();
        let expires_at = new.expires_at.map(|at| at.timestamp());

        let name = new.name.clone();
        let service = new.service.clone();
        let rate_limit = new.rate_limit;
        let created_at = self
            .db
            .transaction(move |conn| {
                let created_at: i64 = conn.query_row(
                    "INSERT INTO api_keys (name, service, ciphertext, nonce, digest, key_version, tags, \
                         permissions, rate_limit, created_at, updated_at, last_used, usage_count, \
                         expires_at, active) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, NULL, 0, ?11, 1) \
                     ON CONFLICT(name) DO UPDATE SET \
                         service = excluded.service, ciphertext = excluded.ciphertext, \
                         nonce = excluded.nonce, digest = excluded.digest, \
                         key_version = excluded.key_version, tags = excluded.tags, \
                         permissions = excluded.permissions, rate_limit = excluded.rate_limit, \
                         updated_at = excluded.updated_at, last_used = NULL, usage_count = 0, \
                         expires_at = excluded.expires_at, active = 1 \
                     RETURNING created_at",
                    params![
                        name,
                        service,
                        sealed.ciphertext,
                        sealed.nonce,
                        sealed.digest,
                        sealed.key_version,
                        tags,
                        permissions,
                        rate_limit,
                        now,
                        expires_at,
                    ],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(created_at)
            })
            .await?;

        info!(name = %new.name, service = %new.service, "stored api key");
        Ok(ApiKeyMetadata {
            name: new.name,
            service: new.service,
            tags: new.tags,
            permissions: new.permissions,
            rate_limit: new.rate_limit,
            key_version: key.version(),
            created_at: timestamp_from_db(created_at),
            updated_at: timestamp_from_db(now),
            last_used: None,
            usage_count: 0,
            expires_at: new.expires_at,
            active: true,
        })
    }

    /// Decrypt an API key and record the use.
    pub async fn get_api_key(&self, key: &DataKey, name: &str) -> Result<ApiKey> {
        let key = key.clone();
        let name = name.to_string();
        self.db
            .transaction(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE name = ?1"),
                        params![name],
                        ApiKeyRow::from_row,
                    )
                    .optional()?
                    .ok_or_else(|| VaultError::NotFound {
                        entity: RecordKind::ApiKey.entity(),
                        name: name.clone(),
                    })?;

                let now = Utc::now().timestamp();
                ensure_readable(RecordKind::ApiKey, &name, row.active, row.expires_at, now)?;
                let plaintext = open(RecordKind::ApiKey, &name, &row.sealed(), &key)?;
                let secret = match payload::decode(&plaintext)? {
                    Value::String(s) => Zeroizing::new(s),
                    _ => {
                        return Err(VaultError::DecryptionFailed {
                            reason: format!("api key {name} has a non-string payload"),
                        });
                    }
                };

                conn.execute(
                    "UPDATE api_keys SET usage_count = usage_count + 1, last_used = ?1 WHERE name = ?2",
                    params![now, name],
                )?;

                let mut metadata = row.metadata()?;
                metadata.usage_count += 1;
                metadata.last_used = Some(timestamp_from_db(now));
                debug!(name = %name, "api key retrieved");
                Ok::<_, VaultError>(ApiKey { metadata, key: secret })
            })
            .await
    }

    /// Metadata of every active, unexpired API key, optionally filtered by service.
    pub async fn list_api_keys(&self, service_filter: Option<&str>) -> Result<Vec<ApiKeyMetadata>> {
        let service_filter = service_filter.map(str::to_string);
        self.db
            .execute(move |conn| {
                let now = Utc::now().timestamp();
                let mut stmt = conn.prepare(&format!(
                    "SELECT {API_KEY_COLUMNS} FROM api_keys \
                     WHERE active = 1 AND (expires_at IS NULL OR expires_at > ?1) \
                       AND (?2 IS NULL OR service = ?2) \
                     ORDER BY name"
                ))?;
                let rows = stmt.query_map(params![now, service_filter], ApiKeyRow::from_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.metadata()?);
                }
                Ok::<_, VaultError>(out)
            })
            .await
    }

    /// Soft-delete an API key.
    pub async fn deactivate_api_key(&self, name: &str) -> Result<()> {
        self.deactivate(RecordKind::ApiKey, name).await
    }

    // -- Shared -------------------------------------------------------------

    async fn deactivate(&self, kind: RecordKind, name: &str) -> Result<()> {
        let name = name.to_string();
        let now = Utc::now().timestamp();
        self.db
            .transaction(move |conn| {
                let updated = conn.execute(
                    &format!("UPDATE {} SET active = 0, updated_at = ?1 WHERE name = ?2", kind.table()),
                    params![now, name],
                )?;
                if updated == 0 {
                    return Err(VaultError::NotFound {
                        entity: kind.entity(),
                        name,
                    });
                }
                info!(name = %name, entity = kind.entity(), "record deactivated");
                Ok::<_, VaultError>(())
            })
            .await
    }

    /// Number of active, unexpired rows of `kind`.
    pub async fn count_active(&self, kind: RecordKind) -> Result<u64> {
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    &format!(
                        "SELECT count(*) FROM {} WHERE active = 1 AND (expires_at IS NULL OR expires_at > ?1)",
                        kind.table()
                    ),
                    params![Utc::now().timestamp()],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(count.max(0) as u64)
            })
            .await
    }
}

/// Re-encrypt every row of `kind` from `old` to `new`, verifying each digest.
///
/// Runs on the caller's connection so it joins the caller's transaction.
pub(crate) fn reencrypt_all(
    conn: &rusqlite::Connection,
    kind: RecordKind,
    old: &DataKey,
    new: &DataKey,
) -> Result<usize> {
    let rows: Vec<(String, SealedRecord)> = {
        let mut stmt = conn.prepare(&format!(
            "SELECT name, nonce, ciphertext, digest, key_version FROM {}",
            kind.table()
        ))?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                SealedRecord {
                    nonce: row.get(1)?,
                    ciphertext: row.get(2)?,
                    digest: row.get(3)?,
                    key_version: row.get(4)?,
                },
            ))
        })?;
        mapped.collect::<rusqlite::Result<_>>()?
    };

    let mut update = conn.prepare(&format!(
        "UPDATE {} SET ciphertext = ?1, nonce = ?2, digest = ?3, key_version = ?4 WHERE name = ?5",
        kind.table()
    ))?;
    for (name, sealed) in &rows {
        let plaintext = open(kind, name, sealed, old)?;
        let resealed = seal(kind, name, &plaintext, new)?;
        update.execute(params![
            resealed.ciphertext,
            resealed.nonce,
            resealed.digest,
            resealed.key_version,
            name
        ])?;
    }
    Ok(rows.len())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
