//! Server-side session tokens.
//!
//! A token is 32 random bytes rendered as unpadded base64url. Only the
//! SHA-256 of the token is stored, so a copy of the database cannot be
//! replayed as a live session. Sessions have a fixed lifetime: validation
//! never extends it.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use keyward_store::Database;
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::timestamp_from_db;
use crate::crypto;
use crate::error::{Result, VaultError};

/// Random bytes per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// A freshly issued session token. Shown to the caller once.
#[derive(Clone)]
pub struct SessionToken {
    token: Zeroizing<String>,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

impl SessionToken {
    pub fn as_str(&self) -> &str {
        &self.token
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("user_id", &self.user_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

fn token_hash(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(crypto::digest(token.as_bytes()))
}

/// Issues, validates and revokes session tokens.
#[derive(Debug, Clone)]
pub struct SessionManager {
    db: Database,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Issue a token for an existing, active user.
    pub async fn create_session(&self, user_id: &str) -> Result<SessionToken> {
        let token = Zeroizing::new(URL_SAFE_NO_PAD.encode(crypto::random_bytes(TOKEN_BYTES)?));
        let hash = token_hash(&token);
        let now = Utc::now();
        let expires_at = timestamp_from_db((now + self.ttl).timestamp());

        let id = user_id.to_string();
        self.db
            .transaction(move |conn| {
                let active: Option<bool> = conn
                    .query_row("SELECT active FROM users WHERE id = ?1", params![id], |row| row.get(0))
                    .optional()?;
                match active {
                    None => return Err(VaultError::NotFound { entity: "user", name: id }),
                    Some(false) => return Err(VaultError::AccountInactive),
                    Some(true) => {}
                }
                conn.execute(
                    "INSERT INTO sessions (token_hash, user_id, created_at, expires_at, active) \
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    params![hash, id, now.timestamp(), expires_at.timestamp()],
                )?;
                Ok::<_, VaultError>(())
            })
            .await?;

        info!(user_id = %user_id, %expires_at, "session created");
        Ok(SessionToken {
            token,
            user_id: user_id.to_string(),
            expires_at,
        })
    }

    /// Return the user ID bound to `token`.
    ///
    /// Unknown, revoked and expired tokens, and tokens of deactivated users,
    /// all fail with [`VaultError::Authentication`].
    pub async fn validate_session(&self, token: &str) -> Result<String> {
        let hash = token_hash(token);
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let user_id: Option<String> = conn
                    .query_row(
                        "SELECT s.user_id FROM sessions s JOIN users u ON u.id = s.user_id \
                         WHERE s.token_hash = ?1 AND s.active = 1 AND s.expires_at > ?2 AND u.active = 1",
                        params![hash, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                user_id.ok_or(VaultError::Authentication)
            })
            .await
            .inspect(|user_id| debug!(user_id = %user_id, "session validated"))
    }

    /// Invalidate `token` (logout).
    pub async fn revoke_session(&self, token: &str) -> Result<String> {
        let hash = token_hash(token);
        let user_id = self
            .db
            .transaction(move |conn| {
                let user_id: Option<String> = conn
                    .query_row(
                        "UPDATE sessions SET active = 0 WHERE token_hash = ?1 AND active = 1 RETURNING user_id",
                        params![hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                user_id.ok_or(VaultError::Authentication)
            })
            .await?;
        info!(user_id = %user_id, "session revoked");
        Ok(user_id)
    }

    /// Number of live sessions.
    pub async fn count_active(&self) -> Result<u64> {
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM sessions WHERE active = 1 AND expires_at > ?1",
                    params![now],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(count.max(0) as u64)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SessionManager, Database) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db.execute(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, password_hash, password_salt, password_params, created_at) \
                 VALUES ('u-1', 'alice', 'a@x.com', x'00', x'00', '{}', 0)",
                [],
            )?;
            Ok::<_, VaultError>(())
        })
        .await
        .unwrap();
        (SessionManager::new(db.clone(), Duration::hours(24)), db)
    }

    #[tokio::test]
    async fn create_and_validate() {
        let (sessions, _db) = setup().await;
        let token = sessions.create_session("u-1").await.unwrap();

        assert!(token.as_str().len() >= 43);
        assert_eq!(sessions.validate_session(token.as_str()).await.unwrap(), "u-1");
        assert_eq!(sessions.count_active().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tokens_are_unique_and_not_stored() {
        let (sessions, db) = setup().await;
        let a = sessions.create_session("u-1").await.unwrap();
        let b = sessions.create_session("u-1").await.unwrap();
        assert_ne!(a.as_str(), b.as_str());

        let raw = a.as_str().to_string();
        let stored: i64 = db
            .execute(move |conn| {
                let n = conn.query_row(
                    "SELECT count(*) FROM sessions WHERE token_hash = ?1",
                    params![raw],
                    |row| row.get(0),
                )?;
                Ok::<_, VaultError>(n)
            })
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn unknown_token_rejected() {
        let (sessions, _db) = setup().await;
        assert!(matches!(
            sessions.validate_session("not-a-token").await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn revoked_token_rejected() {
        let (sessions, _db) = setup().await;
        let token = sessions.create_session("u-1").await.unwrap();
        assert_eq!(sessions.revoke_session(token.as_str()).await.unwrap(), "u-1");

        assert!(matches!(
            sessions.validate_session(token.as_str()).await,
            Err(VaultError::Authentication)
        ));
        assert!(sessions.revoke_session(token.as_str()).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_rejected_and_not_extended() {
        let (sessions, db) = setup().await;
        let token = sessions.create_session("u-1").await.unwrap();

        let before = token.expires_at.timestamp();
        sessions.validate_session(token.as_str()).await.unwrap();
        let after: i64 = db
            .execute(|conn| {
                let t = conn.query_row("SELECT expires_at FROM sessions", [], |row| row.get(0))?;
                Ok::<_, VaultError>(t)
            })
            .await
            .unwrap();
        assert_eq!(before, after);

        db.execute(|conn| {
            conn.execute("UPDATE sessions SET expires_at = 0", [])?;
            Ok::<_, VaultError>(())
        })
        .await
        .unwrap();
        assert!(matches!(
            sessions.validate_session(token.as_str()).await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn unknown_user_gets_no_session() {
        let (sessions, _db) = setup().await;
        assert!(matches!(
            sessions.create_session("ghost").await,
            Err(VaultError::NotFound { .. })
        ));
    }
}
