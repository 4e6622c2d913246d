//! User accounts, password policy and authentication with lockout.
//!
//! Passwords are hashed with Argon2id; the cost parameters are stored next to
//! each hash so they can be raised without invalidating existing accounts.
//!
//! Every attempt is charged to the account's failure counter inside one
//! write transaction before the password is verified, so concurrent guesses
//! can neither skip the lockout transition nor slip past it. A lock that has
//! already run out does not carry over: the next attempt starts a fresh
//! count at 1.

use chrono::{DateTime, Duration, Utc};
use keyward_store::Database;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::audit::timestamp_from_db;
use crate::blocking;
use crate::crypto::{self, PasswordHashParams};
use crate::error::{Result, VaultError};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Coarse role attached to every account. The vault stores it; callers
/// decide what each role may do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    #[default]
    User,
    Viewer,
}

impl UserRole {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::Viewer => "viewer",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "viewer" => Ok(Self::Viewer),
            other => Err(VaultError::InvalidArgument(format!("unknown user role: {other}"))),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user account, without its password material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Unique identifier (UUID v7).
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: UserRole,
    pub active: bool,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

const USER_COLUMNS: &str =
    "id, username, email, role, active, failed_attempts, locked_until, created_at, last_login";

/// Internal row type for mapping SQLite results.
struct UserRow {
    id: String,
    username: String,
    email: String,
    role: String,
    active: bool,
    failed_attempts: u32,
    locked_until: Option<i64>,
    created_at: i64,
    last_login: Option<i64>,
}

impl UserRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            active: row.get(4)?,
            failed_attempts: row.get(5)?,
            locked_until: row.get(6)?,
            created_at: row.get(7)?,
            last_login: row.get(8)?,
        })
    }

    fn into_user(self) -> Result<User> {
        Ok(User {
            role: UserRole::parse(&self.role)?,
            id: self.id,
            username: self.username,
            email: self.email,
            active: self.active,
            failed_attempts: self.failed_attempts,
            locked_until: self.locked_until.map(timestamp_from_db),
            created_at: timestamp_from_db(self.created_at),
            last_login: self.last_login.map(timestamp_from_db),
        })
    }
}

/// Stored password material for one account.
struct PasswordRecord {
    hash: Vec<u8>,
    salt: Vec<u8>,
    params: PasswordHashParams,
}

// ═══════════════════════════════════════════════════════════════════════
//  Password policy
// ═══════════════════════════════════════════════════════════════════════

/// Minimum password length in characters.
pub const MIN_PASSWORD_LEN: usize = 12;

/// Check `password` against the password policy: at least
/// [`MIN_PASSWORD_LEN`] characters with an uppercase letter, a lowercase
/// letter, a digit and a symbol.
pub fn check_password_policy(password: &str) -> Result<()> {
    let weak = |reason: &str| VaultError::WeakPassword {
        reason: reason.to_string(),
    };

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(weak("must be at least 12 characters"));
    }
    if !password.chars().any(char::is_uppercase) {
        return Err(weak("must contain an uppercase letter"));
    }
    if !password.chars().any(char::is_lowercase) {
        return Err(weak("must contain a lowercase letter"));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(weak("must contain a digit"));
    }
    if !password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace()) {
        return Err(weak("must contain a symbol"));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  IdentityManager
// ═══════════════════════════════════════════════════════════════════════

/// Registration, lookup and authentication of user accounts.
#[derive(Debug, Clone)]
pub struct IdentityManager {
    db: Database,
    hash_params: PasswordHashParams,
    lockout_threshold: u32,
    lockout_duration: Duration,
}

impl IdentityManager {
    pub fn new(
        db: Database,
        hash_params: PasswordHashParams,
        lockout_threshold: u32,
        lockout_duration: Duration,
    ) -> Self {
        Self {
            db,
            hash_params,
            lockout_threshold,
            lockout_duration,
        }
    }

    /// Create a user account.
    ///
    /// # Errors
    ///
    /// [`VaultError::WeakPassword`] if the password fails the policy,
    /// [`VaultError::DuplicateUser`] if the username or email is taken (the
    /// existing account is left untouched).
    #[instrument(skip(self, password))]
    pub async fn register_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> Result<User> {
        let username = username.trim().to_string();
        let email = email.trim().to_string();
        if username.is_empty() {
            return Err(VaultError::InvalidArgument("username must not be empty".into()));
        }
        if !email.contains('@') {
            return Err(VaultError::InvalidArgument("email address is not valid".into()));
        }
        check_password_policy(password)?;

        let password = Zeroizing::new(password.to_owned());
        let params = self.hash_params;
        let (hash, salt) = blocking(move || crypto::hash_password(&password, &params)).await?;
        let params_json = serde_json::to_string(&params)?;

        let now = Utc::now();
        let user = User {
            id: Uuid::now_v7().to_string(),
            username,
            email,
            role,
            active: true,
            failed_attempts: 0,
            locked_until: None,
            created_at: timestamp_from_db(now.timestamp()),
            last_login: None,
        };

        let row = user.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO users (id, username, email, password_hash, password_salt, password_params, \
                         role, active, failed_attempts, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, 0, ?8)",
                    params![
                        row.id,
                        row.username,
                        row.email,
                        hash.as_slice(),
                        salt.as_slice(),
                        params_json,
                        row.role.as_str(),
                        now.timestamp(),
                    ],
                )
                .map_err(duplicate_user)?;
                Ok::<_, VaultError>(())
            })
            .await?;

        info!(user_id = %user.id, username = %user.username, role = %user.role, "user registered");
        Ok(user)
    }

    /// Check `username`/`password` and update the account's counters.
    ///
    /// An unknown user and a wrong password produce the same
    /// [`VaultError::Authentication`]. A locked account is reported as
    /// locked even when the password is right.
    ///
    /// Each attempt is charged against the failure counter in one write
    /// transaction before the password is verified, so at most
    /// `lockout_threshold` verifications can run per lockout window no matter
    /// how many attempts arrive at once. A correct password refunds the
    /// attempt by resetting the counter.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let lookup = username.to_string();
        let found = self
            .db
            .execute(move |conn| {
                let found = conn
                    .query_row(
                        &format!(
                            "SELECT {USER_COLUMNS}, password_hash, password_salt, password_params \
                             FROM users WHERE username = ?1"
                        ),
                        params![lookup],
                        |row| {
                            Ok((
                                UserRow::from_row(row)?,
                                row.get::<_, Vec<u8>>(9)?,
                                row.get::<_, Vec<u8>>(10)?,
                                row.get::<_, String>(11)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok::<_, VaultError>(found)
            })
            .await?;

        let password = Zeroizing::new(password.to_owned());

        let Some((row, hash, salt, params_json)) = found else {
            // Spend the same effort as a real check so timing does not reveal
            // whether the username exists.
            let params = self.hash_params;
            let _ = blocking(move || crypto::hash_password(&password, &params)).await;
            debug!("authentication for unknown user");
            return Err(VaultError::Authentication);
        };

        let mut user = row.into_user()?;
        let attempts = self.claim_attempt(&user.id).await?;

        let record = PasswordRecord {
            hash,
            salt,
            params: serde_json::from_str(&params_json)?,
        };
        let verified = blocking(move || {
            crypto::verify_password(&password, &record.hash, &record.salt, &record.params)
        })
        .await?;

        if !verified {
            if attempts >= self.lockout_threshold {
                warn!(user_id = %user.id, attempts, "account locked after repeated failures");
            } else {
                debug!(user_id = %user.id, attempts, "authentication failed");
            }
            return Err(VaultError::Authentication);
        }

        let now = Utc::now().timestamp();
        let id = user.id.clone();
        self.db
            .transaction(move |conn| {
                let updated = conn.execute(
                    "UPDATE users SET failed_attempts = 0, locked_until = NULL, last_login = ?1 \
                     WHERE id = ?2 AND active = 1",
                    params![now, id],
                )?;
                if updated == 0 {
                    return Err(VaultError::AccountInactive);
                }
                Ok::<_, VaultError>(())
            })
            .await?;

        user.failed_attempts = 0;
        user.locked_until = None;
        user.last_login = Some(timestamp_from_db(now));
        debug!(user_id = %user.id, "authentication succeeded");
        Ok(user)
    }

    /// Charge one attempt to `user_id`, refusing locked and inactive accounts.
    ///
    /// Runs as a single write transaction, so concurrent attempts are
    /// serialized on the counter. The attempt that reaches the threshold
    /// sets the lock; every later one is refused without a password check.
    /// An expired lock is cleared and the count restarts at 1.
    async fn claim_attempt(&self, user_id: &str) -> Result<u32> {
        let now = Utc::now();
        let lock_until = (now + self.lockout_duration).timestamp();
        let threshold = self.lockout_threshold;
        let id = user_id.to_string();

        self.db
            .transaction(move |conn| {
                let (active, failed, locked_until): (bool, u32, Option<i64>) = conn
                    .query_row(
                        "SELECT active, failed_attempts, locked_until FROM users WHERE id = ?1",
                        params![id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .optional()?
                    .ok_or(VaultError::Authentication)?;

                if let Some(until) = locked_until.filter(|&until| until > now.timestamp()) {
                    return Err(VaultError::AccountLocked {
                        until: timestamp_from_db(until),
                    });
                }
                if !active {
                    return Err(VaultError::AccountInactive);
                }

                let attempts = if locked_until.is_some() { 1 } else { failed.saturating_add(1) };
                let lock = (attempts >= threshold).then_some(lock_until);
                conn.execute(
                    "UPDATE users SET failed_attempts = ?1, locked_until = ?2 WHERE id = ?3",
                    params![attempts, lock, id],
                )?;
                Ok::<_, VaultError>(attempts)
            })
            .await
    }

    /// Fetch a user by ID.
    pub async fn get_user(&self, id: &str) -> Result<User> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                        params![id],
                        UserRow::from_row,
                    )
                    .optional()?
                    .ok_or_else(|| VaultError::NotFound {
                        entity: "user",
                        name: id.clone(),
                    })?;
                row.into_user()
            })
            .await
    }

    /// Soft-delete a user. The row is kept for audit history.
    pub async fn deactivate_user(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.db
            .transaction(move |conn| {
                let updated = conn.execute("UPDATE users SET active = 0 WHERE id = ?1", params![id])?;
                if updated == 0 {
                    return Err(VaultError::NotFound { entity: "user", name: id });
                }
                conn.execute("UPDATE sessions SET active = 0 WHERE user_id = ?1", params![id])?;
                info!(user_id = %id, "user deactivated");
                Ok::<_, VaultError>(())
            })
            .await
    }

    /// Number of active accounts.
    pub async fn count_active(&self) -> Result<u64> {
        self.db
            .execute(|conn| {
                let count: i64 =
                    conn.query_row("SELECT count(*) FROM users WHERE active = 1", [], |row| row.get(0))?;
                Ok::<_, VaultError>(count.max(0) as u64)
            })
            .await
    }
}

/// Map a UNIQUE violation on `users` to [`VaultError::DuplicateUser`].
fn duplicate_user(err: rusqlite::Error) -> VaultError {
    if let rusqlite::Error::SqliteFailure(ref failure, Some(ref message)) = err {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            if message.contains("users.username") {
                return VaultError::DuplicateUser { field: "username" };
            }
            if message.contains("users.email") {
                return VaultError::DuplicateUser { field: "email" };
            }
        }
    }
    err.into()
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWORD: &str = "Str0ng!Passw0rd";

    async fn setup() -> (IdentityManager, Database) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let params = PasswordHashParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        };
        (
            IdentityManager::new(db.clone(), params, 5, Duration::minutes(30)),
            db,
        )
    }

    #[test]
    fn password_policy() {
        assert!(matches!(
            check_password_policy("short1!"),
            Err(VaultError::WeakPassword { .. })
        ));
        assert!(check_password_policy("alllowercase1!").is_err());
        assert!(check_password_policy("ALLUPPERCASE1!").is_err());
        assert!(check_password_policy("NoDigitsHere!!").is_err());
        assert!(check_password_policy("NoSymbols12345").is_err());
        assert!(check_password_policy("Spaces Only 123").is_err());
        check_password_policy("LongEnough1!Password").unwrap();
    }

    #[test]
    fn role_strings() {
        assert_eq!(UserRole::default(), UserRole::User);
        assert_eq!(UserRole::parse("viewer").unwrap(), UserRole::Viewer);
        assert!(UserRole::parse("root").is_err());
    }

    #[tokio::test]
    async fn register_and_authenticate() {
        let (ids, _db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        let authed = ids.authenticate("alice", PASSWORD).await.unwrap();
        assert_eq!(authed.id, user.id);
        assert_eq!(authed.role, UserRole::User);
        assert!(authed.last_login.is_some());
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_look_alike() {
        let (ids, _db) = setup().await;
        ids.register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        let unknown = ids.authenticate("mallory", PASSWORD).await.unwrap_err();
        let wrong = ids.authenticate("alice", "Wr0ng!Passw0rd").await.unwrap_err();
        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(matches!(unknown, VaultError::Authentication));
    }

    #[tokio::test]
    async fn duplicate_username_and_email() {
        let (ids, _db) = setup().await;
        let first = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::Admin)
            .await
            .unwrap();

        assert!(matches!(
            ids.register_user("alice", "other@x.com", PASSWORD, UserRole::User).await,
            Err(VaultError::DuplicateUser { field: "username" })
        ));
        assert!(matches!(
            ids.register_user("bob", "a@x.com", PASSWORD, UserRole::User).await,
            Err(VaultError::DuplicateUser { field: "email" })
        ));

        let unchanged = ids.get_user(&first.id).await.unwrap();
        assert_eq!(unchanged.email, "a@x.com");
        assert_eq!(unchanged.role, UserRole::Admin);
    }

    #[tokio::test]
    async fn invalid_email_rejected() {
        let (ids, _db) = setup().await;
        assert!(matches!(
            ids.register_user("alice", "not-an-email", PASSWORD, UserRole::User).await,
            Err(VaultError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn lockout_after_threshold() {
        let (ids, db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        for _ in 0..5 {
            assert!(matches!(
                ids.authenticate("alice", "Wr0ng!Passw0rd").await,
                Err(VaultError::Authentication)
            ));
        }
        assert!(matches!(
            ids.authenticate("alice", PASSWORD).await,
            Err(VaultError::AccountLocked { .. })
        ));

        // Let the lock run out.
        let id = user.id.clone();
        db.execute(move |conn| {
            conn.execute(
                "UPDATE users SET locked_until = ?1 WHERE id = ?2",
                params![Utc::now().timestamp() - 1, id],
            )?;
            Ok::<_, VaultError>(())
        })
        .await
        .unwrap();

        let authed = ids.authenticate("alice", PASSWORD).await.unwrap();
        assert_eq!(authed.failed_attempts, 0);
        assert!(ids.get_user(&user.id).await.unwrap().locked_until.is_none());
    }

    #[tokio::test]
    async fn expired_lock_restarts_the_count() {
        let (ids, db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        let id = user.id.clone();
        db.execute(move |conn| {
            conn.execute(
                "UPDATE users SET failed_attempts = 5, locked_until = ?1 WHERE id = ?2",
                params![Utc::now().timestamp() - 1, id],
            )?;
            Ok::<_, VaultError>(())
        })
        .await
        .unwrap();

        assert!(matches!(
            ids.authenticate("alice", "Wr0ng!Passw0rd").await,
            Err(VaultError::Authentication)
        ));
        let after = ids.get_user(&user.id).await.unwrap();
        assert_eq!(after.failed_attempts, 1);
        assert!(after.locked_until.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_guesses_stop_at_the_threshold() {
        let (ids, _db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ids = ids.clone();
            handles.push(tokio::spawn(async move {
                ids.authenticate("alice", "Wr0ng!Passw0rd").await
            }));
        }

        let mut rejected = 0;
        let mut locked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(VaultError::Authentication) => rejected += 1,
                Err(VaultError::AccountLocked { .. }) => locked += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(rejected, 5);
        assert_eq!(locked, 15);

        let after = ids.get_user(&user.id).await.unwrap();
        assert_eq!(after.failed_attempts, 5);
        assert!(after.locked_until.is_some());
        assert!(matches!(
            ids.authenticate("alice", PASSWORD).await,
            Err(VaultError::AccountLocked { .. })
        ));
    }

    #[tokio::test]
    async fn success_refunds_the_attempt() {
        let (ids, _db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();

        for _ in 0..4 {
            assert!(ids.authenticate("alice", "Wr0ng!Passw0rd").await.is_err());
        }
        ids.authenticate("alice", PASSWORD).await.unwrap();

        let after = ids.get_user(&user.id).await.unwrap();
        assert_eq!(after.failed_attempts, 0);
        assert!(after.locked_until.is_none());
    }

    #[tokio::test]
    async fn inactive_user_cannot_authenticate() {
        let (ids, _db) = setup().await;
        let user = ids
            .register_user("alice", "a@x.com", PASSWORD, UserRole::User)
            .await
            .unwrap();
        ids.deactivate_user(&user.id).await.unwrap();

        assert!(matches!(
            ids.authenticate("alice", PASSWORD).await,
            Err(VaultError::AccountInactive)
        ));
        assert_eq!(ids.count_active().await.unwrap(), 0);
    }
}
