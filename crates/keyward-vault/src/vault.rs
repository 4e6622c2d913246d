//! The vault handle.
//!
//! [`Vault`] owns the database, the key file and, once unlocked, the keyring.
//! Every operation goes through it; there is no process-wide state, so any
//! number of independent vaults can be open at once.
//!
//! Key-state transitions (initialize, unlock, lock, data-key rotation,
//! restore) take the state lock for writing. Record operations and backups
//! hold it for reading for their whole duration, so a rotation can never
//! interleave with a write sealed under the old key.

use std::path::Path;

use chrono::{Duration, Utc};
use keyward_store::Database;
use serde::Serialize;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::audit::{AuditAction, AuditEntry, AuditEvent, AuditLog};
use crate::backup::{ArchiveSummary, BackupManager};
use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::identity::{IdentityManager, User, UserRole};
use crate::keyfile::KeyFile;
use crate::keys::{KeyManager, Keyring};
use crate::records::{
    ApiKey, ApiKeyMetadata, Credential, CredentialMetadata, NewApiKey, NewCredential, RecordKind,
    RecordStore,
};
use crate::session::{SessionManager, SessionToken};

/// Whether the keyring is in memory.
#[derive(Debug)]
enum KeyState {
    Locked,
    Unlocked(Keyring),
}

fn unlocked<'a>(state: &'a RwLockReadGuard<'_, KeyState>) -> Result<&'a Keyring> {
    match &**state {
        KeyState::Unlocked(keyring) => Ok(keyring),
        KeyState::Locked => Err(VaultError::Locked),
    }
}

/// Audit entry for a listing: the filter is the target, the row count the detail.
fn list_entry<T>(action: AuditAction, filter: Option<&str>, result: &Result<Vec<T>>) -> AuditEntry {
    let mut entry = AuditEntry::outcome(action, result);
    if let Some(filter) = filter {
        entry = entry.target(filter);
    }
    if let Ok(rows) = result {
        entry = entry.detail(format!("{} listed", rows.len()));
    }
    entry
}

/// Point-in-time counters for dashboards and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VaultStats {
    pub initialized: bool,
    pub unlocked: bool,
    pub active_key_version: Option<u32>,
    pub credentials: u64,
    pub api_keys: u64,
    pub users: u64,
    pub sessions: u64,
    pub audit_events_24h: u64,
}

/// An open credential vault.
#[derive(Debug)]
pub struct Vault {
    config: VaultConfig,
    keys: KeyManager,
    records: RecordStore,
    identity: IdentityManager,
    sessions: SessionManager,
    audit: AuditLog,
    backups: BackupManager,
    state: RwLock<KeyState>,
}

impl Vault {
    /// Open the vault described by `config`, creating its data directory and
    /// migrating its database. The vault starts locked.
    #[instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
    pub async fn open(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let db = Database::open_and_migrate(config.database_path()).await?;

        let vault = Self {
            keys: KeyManager::new(
                KeyFile::new(config.key_file_path()),
                db.clone(),
                config.kdf_iterations,
            ),
            records: RecordStore::new(db.clone()),
            identity: IdentityManager::new(
                db.clone(),
                config.password_hash,
                config.lockout_threshold,
                Duration::minutes(config.lockout_minutes),
            ),
            sessions: SessionManager::new(db.clone(), Duration::hours(config.session_ttl_hours)),
            audit: AuditLog::new(db.clone()),
            backups: BackupManager::new(db, config.backup_kdf_iterations),
            state: RwLock::new(KeyState::Locked),
            config,
        };

        info!(initialized = vault.is_initialized(), "vault opened");
        Ok(vault)
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    // -- Lifecycle ----------------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.keys.is_initialized()
    }

    pub async fn is_unlocked(&self) -> bool {
        matches!(*self.state.read().await, KeyState::Unlocked(_))
    }

    /// Create the master key under `password` and unlock.
    #[instrument(skip(self, password))]
    pub async fn initialize(&self, password: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let result = self.keys.initialize(password).await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::VaultInitialize, &result))
            .await;
        *state = KeyState::Unlocked(result?);
        Ok(())
    }

    /// Unwrap the master key with `password`.
    ///
    /// A wrong password fails with [`VaultError::Authentication`] and leaves
    /// the vault in whatever state it was in.
    #[instrument(skip(self, password))]
    pub async fn unlock(&self, password: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let result = self.keys.unlock(password).await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::VaultUnlock, &result))
            .await;
        *state = KeyState::Unlocked(result?);
        Ok(())
    }

    /// Drop the keyring from memory.
    pub async fn lock(&self) {
        *self.state.write().await = KeyState::Locked;
        info!("vault locked");
    }

    /// Lock and release the vault.
    pub async fn close(self) {
        self.lock().await;
        info!("vault closed");
    }

    /// Re-wrap the master key under a new password.
    #[instrument(skip(self, old_password, new_password))]
    pub async fn rotate_master_key(&self, old_password: &str, new_password: &str) -> Result<()> {
        let _state = self.state.write().await;
        let result = self.keys.rotate_master_key(old_password, new_password).await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::MasterKeyRotate, &result))
            .await;
        result
    }

    /// Re-encrypt every record under a fresh data key. Returns the new key
    /// version.
    #[instrument(skip(self))]
    pub async fn rotate_data_key(&self) -> Result<u32> {
        let mut state = self.state.write().await;
        let result = match &*state {
            KeyState::Locked => Err(VaultError::Locked),
            KeyState::Unlocked(keyring) => self.keys.rotate_data_key(keyring).await,
        };

        let entry = match &result {
            Ok((keyring, migrated)) => AuditEntry::new(AuditAction::DataKeyRotate, true).detail(format!(
                "active key v{}, {migrated} records re-encrypted",
                keyring.active_version()
            )),
            Err(err) => AuditEntry::new(AuditAction::DataKeyRotate, false).detail(err.to_string()),
        };
        self.audit.emit(entry).await;

        let (keyring, _) = result?;
        let version = keyring.active_version();
        *state = KeyState::Unlocked(keyring);
        Ok(version)
    }

    // -- Identity -----------------------------------------------------------

    #[instrument(skip(self, password))]
    pub async fn register_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: UserRole,
    ) -> Result<User> {
        let result = self
            .identity
            .register_user(username, email, password, role)
            .await;
        let mut entry = AuditEntry::outcome(AuditAction::UserRegister, &result).target(username);
        if let Ok(user) = &result {
            entry = entry.user(&user.id);
        }
        self.audit.emit(entry).await;
        result
    }

    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User> {
        let result = self.identity.authenticate(username, password).await;
        let mut entry = AuditEntry::outcome(AuditAction::Authenticate, &result).target(username);
        if let Ok(user) = &result {
            entry = entry.user(&user.id);
        }
        self.audit.emit(entry).await;
        result
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User> {
        self.identity.get_user(user_id).await
    }

    pub async fn deactivate_user(&self, user_id: &str) -> Result<()> {
        let result = self.identity.deactivate_user(user_id).await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::UserDeactivate, &result).user(user_id))
            .await;
        result
    }

    // -- Sessions -----------------------------------------------------------

    pub async fn create_session(&self, user_id: &str) -> Result<SessionToken> {
        let result = self.sessions.create_session(user_id).await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::SessionCreate, &result).user(user_id))
            .await;
        result
    }

    /// Resolve a session token to its user ID.
    #[instrument(skip(self, token))]
    pub async fn validate_session(&self, token: &str) -> Result<String> {
        let result = self.sessions.validate_session(token).await;
        let mut entry = AuditEntry::outcome(AuditAction::SessionValidate, &result);
        if let Ok(user_id) = &result {
            entry = entry.user(user_id);
        }
        self.audit.emit(entry).await;
        result
    }

    /// Log out.
    #[instrument(skip(self, token))]
    pub async fn revoke_session(&self, token: &str) -> Result<()> {
        let result = self.sessions.revoke_session(token).await;
        let mut entry = AuditEntry::outcome(AuditAction::SessionRevoke, &result);
        if let Ok(user_id) = &result {
            entry = entry.user(user_id);
        }
        self.audit.emit(entry).await;
        result.map(|_| ())
    }

    // -- Credentials --------------------------------------------------------

    pub async fn store_credential(&self, credential: NewCredential) -> Result<CredentialMetadata> {
        let name = credential.name.clone();
        let result = async {
            let state = self.state.read().await;
            let keyring = unlocked(&state)?;
            self.records.store_credential(keyring.active(), credential).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::CredentialStore, &result).target(name))
            .await;
        result
    }

    pub async fn get_credential(&self, name: &str) -> Result<Credential> {
        let result = async {
            let state = self.state.read().await;
            let keyring = unlocked(&state)?;
            self.records.get_credential(keyring.active(), name).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::CredentialRead, &result).target(name))
            .await;
        result
    }

    pub async fn list_credentials(&self, type_filter: Option<&str>) -> Result<Vec<CredentialMetadata>> {
        let result = async {
            let state = self.state.read().await;
            unlocked(&state)?;
            self.records.list_credentials(type_filter).await
        }
        .await;
        self.audit
            .emit(list_entry(AuditAction::CredentialList, type_filter, &result))
            .await;
        result
    }

    pub async fn deactivate_credential(&self, name: &str) -> Result<()> {
        let result = async {
            let state = self.state.read().await;
            unlocked(&state)?;
            self.records.deactivate_credential(name).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::CredentialDeactivate, &result).target(name))
            .await;
        result
    }

    // -- API keys -----------------------------------------------------------

    pub async fn store_api_key(&self, api_key: NewApiKey) -> Result<ApiKeyMetadata> {
        let name = api_key.name.clone();
        let result = async {
            let state = self.state.read().await;
            let keyring = unlocked(&state)?;
            self.records.store_api_key(keyring.active(), api_key).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::ApiKeyStore, &result).target(name))
            .await;
        result
    }

    pub async fn get_api_key(&self, name: &str) -> Result<ApiKey> {
        let result = async {
            let state = self.state.read().await;
            let keyring = unlocked(&state)?;
            self.records.get_api_key(keyring.active(), name).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::ApiKeyRead, &result).target(name))
            .await;
        result
    }

    pub async fn list_api_keys(&self, service_filter: Option<&str>) -> Result<Vec<ApiKeyMetadata>> {
        let result = async {
            let state = self.state.read().await;
            unlocked(&state)?;
            self.records.list_api_keys(service_filter).await
        }
        .await;
        self.audit
            .emit(list_entry(AuditAction::ApiKeyList, service_filter, &result))
            .await;
        result
    }

    pub async fn deactivate_api_key(&self, name: &str) -> Result<()> {
        let result = async {
            let state = self.state.read().await;
            unlocked(&state)?;
            self.records.deactivate_api_key(name).await
        }
        .await;
        self.audit
            .emit(AuditEntry::outcome(AuditAction::ApiKeyDeactivate, &result).target(name))
            .await;
        result
    }

    // -- Backup -------------------------------------------------------------

    /// Write an encrypted archive of the whole store to `destination`.
    pub async fn backup(&self, password: &str, destination: &Path) -> Result<ArchiveSummary> {
        self.backup_with_cancel(password, destination, &CancellationToken::new())
            .await
    }

    /// [`Vault::backup`] that stops early, leaving `destination` untouched,
    /// once `cancel` fires.
    #[instrument(skip(self, password, cancel))]
    pub async fn backup_with_cancel(
        &self,
        password: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveSummary> {
        let result = async {
            let state = self.state.read().await;
            let keyring = unlocked(&state)?;
            self.backups.backup(keyring, password, destination, cancel).await
        }
        .await;
        self.audit
            .emit(
                AuditEntry::outcome(AuditAction::Backup, &result)
                    .target(destination.display().to_string()),
            )
            .await;
        result
    }

    /// Replace the live store with the archive at `source`.
    pub async fn restore(&self, source: &Path, password: &str) -> Result<ArchiveSummary> {
        self.restore_with_cancel(source, password, &CancellationToken::new())
            .await
    }

    /// [`Vault::restore`] that stops early, leaving the store untouched, if
    /// `cancel` fires before the swap commits.
    #[instrument(skip(self, password, cancel))]
    pub async fn restore_with_cancel(
        &self,
        source: &Path,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<ArchiveSummary> {
        let mut state = self.state.write().await;
        let result = match &*state {
            KeyState::Locked => Err(VaultError::Locked),
            KeyState::Unlocked(keyring) => self.backups.restore(keyring, source, password, cancel).await,
        };

        let summary = match result {
            Ok((keyring, summary)) => {
                *state = KeyState::Unlocked(keyring);
                Ok(summary)
            }
            Err(err) => Err(err),
        };
        self.audit
            .emit(
                AuditEntry::outcome(AuditAction::Restore, &summary)
                    .target(source.display().to_string()),
            )
            .await;
        summary
    }

    // -- Reporting ----------------------------------------------------------

    pub async fn stats(&self) -> Result<VaultStats> {
        let unlocked = self.is_unlocked().await;
        Ok(VaultStats {
            initialized: self.is_initialized(),
            unlocked,
            active_key_version: self.keys.active_version().await?,
            credentials: self.records.count_active(RecordKind::Credential).await?,
            api_keys: self.records.count_active(RecordKind::ApiKey).await?,
            users: self.identity.count_active().await?,
            sessions: self.sessions.count_active().await?,
            audit_events_24h: self
                .audit
                .count_since(Utc::now() - Duration::hours(24))
                .await?,
        })
    }

    /// The newest `limit` audit events, newest first.
    pub async fn recent_audit_events(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.audit.recent(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{MIN_KDF_ITERATIONS, PasswordHashParams};
    use serde_json::json;

    async fn open(dir: &tempfile::TempDir) -> Vault {
        let config = VaultConfig {
            kdf_iterations: MIN_KDF_ITERATIONS,
            backup_kdf_iterations: MIN_KDF_ITERATIONS,
            password_hash: PasswordHashParams {
                memory_kib: 64,
                iterations: 1,
                parallelism: 1,
            },
            ..VaultConfig::with_data_dir(dir.path())
        };
        Vault::open(config).await.unwrap()
    }

    #[tokio::test]
    async fn starts_locked() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(&dir).await;
        assert!(!vault.is_initialized());
        assert!(!vault.is_unlocked().await);
        assert!(matches!(
            vault.get_credential("x").await,
            Err(VaultError::Locked)
        ));
    }

    #[tokio::test]
    async fn open_rejects_oversized_durations() {
        let dir = tempfile::tempdir().unwrap();
        let config = VaultConfig {
            lockout_minutes: i64::MAX,
            ..VaultConfig::with_data_dir(dir.path())
        };
        assert!(matches!(Vault::open(config).await, Err(VaultError::Config(_))));
    }

    #[tokio::test]
    async fn lock_drops_access() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(&dir).await;
        vault.initialize("vault-pass").await.unwrap();
        vault
            .store_credential(NewCredential::new("db", "database", json!({"pw": "x"})))
            .await
            .unwrap();

        vault.lock().await;
        assert!(matches!(vault.get_credential("db").await, Err(VaultError::Locked)));

        vault.unlock("vault-pass").await.unwrap();
        assert_eq!(vault.get_credential("db").await.unwrap().payload, json!({"pw": "x"}));
    }

    #[tokio::test]
    async fn every_operation_is_audited_once() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(&dir).await;
        vault.initialize("vault-pass").await.unwrap();
        vault
            .store_credential(NewCredential::new("db", "database", json!({"pw": "x"})))
            .await
            .unwrap();
        assert_eq!(vault.list_credentials(Some("database")).await.unwrap().len(), 1);
        let _ = vault.get_credential("missing").await;

        let events = vault.recent_audit_events(10).await.unwrap();
        let actions: Vec<AuditAction> = events.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::CredentialRead,
                AuditAction::CredentialList,
                AuditAction::CredentialStore,
                AuditAction::VaultInitialize
            ]
        );
        assert!(!events[0].success);
        assert_eq!(events[0].target_name.as_deref(), Some("missing"));
        assert!(events[1].success);
        assert_eq!(events[1].target_name.as_deref(), Some("database"));
        assert_eq!(events[1].detail.as_deref(), Some("1 listed"));
    }

    #[tokio::test]
    async fn listing_while_locked_is_audited_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(&dir).await;
        assert!(matches!(vault.list_api_keys(None).await, Err(VaultError::Locked)));

        let events = vault.recent_audit_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].action, AuditAction::ApiKeyList);
        assert!(!events[0].success);
    }

    #[tokio::test]
    async fn stats_reflect_contents() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(&dir).await;
        vault.initialize("vault-pass").await.unwrap();
        vault
            .store_api_key(NewApiKey::new("openai", "OpenAI", "sk-test-1234"))
            .await
            .unwrap();

        let stats = vault.stats().await.unwrap();
        assert!(stats.initialized);
        assert!(stats.unlocked);
        assert_eq!(stats.active_key_version, Some(1));
        assert_eq!(stats.api_keys, 1);
        assert_eq!(stats.credentials, 0);
        assert_eq!(stats.audit_events_24h, 2);
    }
}
