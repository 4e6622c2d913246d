//! Append-only audit trail.
//!
//! [`AuditLog::record`] is the only write path into `audit_events`; there is
//! deliberately no update or delete. Readers get the most recent events or a
//! count over a time window.

use chrono::{DateTime, TimeZone, Utc};
use keyward_store::Database;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Every auditable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    VaultInitialize,
    VaultUnlock,
    MasterKeyRotate,
    DataKeyRotate,
    UserRegister,
    UserDeactivate,
    Authenticate,
    SessionCreate,
    SessionValidate,
    SessionRevoke,
    CredentialStore,
    CredentialRead,
    CredentialList,
    CredentialDeactivate,
    ApiKeyStore,
    ApiKeyRead,
    ApiKeyList,
    ApiKeyDeactivate,
    Backup,
    Restore,
}

impl AuditAction {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VaultInitialize => "vault_initialize",
            Self::VaultUnlock => "vault_unlock",
            Self::MasterKeyRotate => "master_key_rotate",
            Self::DataKeyRotate => "data_key_rotate",
            Self::UserRegister => "user_register",
            Self::UserDeactivate => "user_deactivate",
            Self::Authenticate => "authenticate",
            Self::SessionCreate => "session_create",
            Self::SessionValidate => "session_validate",
            Self::SessionRevoke => "session_revoke",
            Self::CredentialStore => "credential_store",
            Self::CredentialRead => "credential_read",
            Self::CredentialList => "credential_list",
            Self::CredentialDeactivate => "credential_deactivate",
            Self::ApiKeyStore => "api_key_store",
            Self::ApiKeyRead => "api_key_read",
            Self::ApiKeyList => "api_key_list",
            Self::ApiKeyDeactivate => "api_key_deactivate",
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "vault_initialize" => Self::VaultInitialize,
            "vault_unlock" => Self::VaultUnlock,
            "master_key_rotate" => Self::MasterKeyRotate,
            "data_key_rotate" => Self::DataKeyRotate,
            "user_register" => Self::UserRegister,
            "user_deactivate" => Self::UserDeactivate,
            "authenticate" => Self::Authenticate,
            "session_create" => Self::SessionCreate,
            "session_validate" => Self::SessionValidate,
            "session_revoke" => Self::SessionRevoke,
            "credential_store" => Self::CredentialStore,
            "credential_read" => Self::CredentialRead,
            "credential_list" => Self::CredentialList,
            "credential_deactivate" => Self::CredentialDeactivate,
            "api_key_store" => Self::ApiKeyStore,
            "api_key_read" => Self::ApiKeyRead,
            "api_key_list" => Self::ApiKeyList,
            "api_key_deactivate" => Self::ApiKeyDeactivate,
            "backup" => Self::Backup,
            "restore" => Self::Restore,
            _ => return None,
        })
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub success: bool,
    pub user_id: Option<String>,
    pub target_name: Option<String>,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, success: bool) -> Self {
        Self {
            action,
            success,
            user_id: None,
            target_name: None,
            detail: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn target(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Success or failure from an operation's result; failures carry the
    /// error's display text as detail.
    pub fn outcome<T>(action: AuditAction, result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::new(action, true),
            Err(err) => Self::new(action, false).detail(err.to_string()),
        }
    }
}

/// A recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub user_id: Option<String>,
    pub target_name: Option<String>,
    pub action: AuditAction,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

/// Append-only handle onto `audit_events`.
#[derive(Debug, Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one event.
    pub async fn record(&self, entry: AuditEntry) -> Result<()> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO audit_events (user_id, target_name, action, success, timestamp, detail) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.user_id,
                        entry.target_name,
                        entry.action.as_str(),
                        entry.success,
                        now,
                        entry.detail,
                    ],
                )?;
                Ok::<_, VaultError>(())
            })
            .await
    }

    /// Append one event; a write failure is logged and swallowed so it never
    /// replaces the audited operation's own outcome.
    pub async fn emit(&self, entry: AuditEntry) {
        let action = entry.action;
        if let Err(err) = self.record(entry).await {
            tracing::error!(%action, error = %err, "failed to write audit event");
        }
    }

    /// The newest `limit` events, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, target_name, action, success, timestamp, detail \
                     FROM audit_events ORDER BY id DESC LIMIT ?1",
                )?;
                let rows = stmt.query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                })?;

                let mut events = Vec::new();
                for row in rows {
                    let (id, user_id, target_name, action, success, timestamp, detail) = row?;
                    let action = AuditAction::parse(&action).ok_or_else(|| {
                        VaultError::Internal(format!("unknown audit action in store: {action}"))
                    })?;
                    events.push(AuditEvent {
                        id,
                        user_id,
                        target_name,
                        action,
                        success,
                        timestamp: timestamp_from_db(timestamp),
                        detail,
                    });
                }
                Ok::<_, VaultError>(events)
            })
            .await
    }

    /// Number of events recorded at or after `since`.
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let since = since.timestamp();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM audit_events WHERE timestamp >= ?1",
                    params![since],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(count.max(0) as u64)
            })
            .await
    }
}

/// Convert a stored unix timestamp, clamping out-of-range values to the epoch.
pub(crate) fn timestamp_from_db(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn log() -> AuditLog {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        AuditLog::new(db)
    }

    #[test]
    fn action_strings_roundtrip() {
        for action in [
            AuditAction::VaultInitialize,
            AuditAction::Authenticate,
            AuditAction::ApiKeyRead,
            AuditAction::CredentialList,
            AuditAction::ApiKeyList,
            AuditAction::Restore,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(AuditAction::parse("drop_tables"), None);
    }

    #[tokio::test]
    async fn record_and_read_back() {
        let log = log().await;
        log.record(AuditEntry::new(AuditAction::CredentialStore, true).target("db-prod"))
            .await
            .unwrap();
        log.record(
            AuditEntry::new(AuditAction::Authenticate, false)
                .user("u-1")
                .detail("invalid credentials"),
        )
        .await
        .unwrap();

        let events = log.recent(10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, AuditAction::Authenticate);
        assert!(!events[0].success);
        assert_eq!(events[0].user_id.as_deref(), Some("u-1"));
        assert_eq!(events[1].target_name.as_deref(), Some("db-prod"));
        assert!(events[0].id > events[1].id);
    }

    #[tokio::test]
    async fn recent_respects_limit() {
        let log = log().await;
        for _ in 0..5 {
            log.emit(AuditEntry::new(AuditAction::VaultUnlock, true)).await;
        }
        assert_eq!(log.recent(3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn count_since_filters_by_time() {
        let log = log().await;
        log.emit(AuditEntry::new(AuditAction::Backup, true)).await;

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let in_an_hour = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(log.count_since(hour_ago).await.unwrap(), 1);
        assert_eq!(log.count_since(in_an_hour).await.unwrap(), 0);
    }

    #[test]
    fn outcome_captures_error_text() {
        let failed: Result<()> = Err(VaultError::Authentication);
        let entry = AuditEntry::outcome(AuditAction::Authenticate, &failed);
        assert!(!entry.success);
        assert_eq!(entry.detail.as_deref(), Some("invalid credentials"));
    }
}
