//! SQLite database setup with WAL mode and safety pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//!
//! Closures passed to [`Database::execute`], [`Database::transaction`] and
//! [`Database::snapshot`] may return any error type that can absorb a
//! [`StoreError`], so callers keep their own error taxonomy across the
//! blocking boundary.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// How many times acquiring the write lock is retried on contention.
const MAX_BUSY_RETRIES: u32 = 3;

/// Base back-off between busy retries; doubled on every attempt.
const BUSY_BACKOFF: Duration = Duration::from_millis(25);

/// Thread-safe handle to a SQLite database.
///
/// All read/write operations go through [`Database::execute`] (or one of the
/// transactional variants) which dispatch onto the blocking thread pool via
/// `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) a database at `path` and apply pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup before
    /// entering the main async loop, or wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database, mainly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| migration::run_all(conn)).await
    }

    /// Execute an arbitrary closure against the connection on the blocking pool.
    ///
    /// Statements run in autocommit mode. Use [`Database::transaction`] for
    /// read-modify-write sequences.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM users", [], |row| row.get(0))?;
    ///     Ok::<_, StoreError>(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(StoreError::from)?
    }

    /// Run `f` inside an immediate (write-locked) transaction.
    ///
    /// The transaction commits only if `f` returns `Ok`; any error rolls it
    /// back. Contention while acquiring the write lock is retried a bounded
    /// number of times before surfacing [`StoreError::Busy`].
    pub async fn transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        self.run_in_transaction(TransactionBehavior::Immediate, f)
            .await
    }

    /// Run `f` inside a deferred read transaction.
    ///
    /// Every statement issued by `f` observes the same database state, which
    /// makes this the building block for consistent whole-store reads.
    pub async fn snapshot<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        self.run_in_transaction(TransactionBehavior::Deferred, f)
            .await
    }

    async fn run_in_transaction<F, T, E>(&self, behavior: TransactionBehavior, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            let tx = begin(&conn, behavior)?;
            let value = f(&*tx)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(value)
        })
        .await
        .map_err(StoreError::from)?
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply all pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // FULL sync: a committed credential or key rotation survives power loss.
        conn.pragma_update(None, "synchronous", "FULL")?;

        // Temp tables and indices in memory, never spilled to disk.
        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Enforce foreign key constraints.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Busy timeout so concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        // Zero freed pages so erased key material does not linger on disk.
        conn.pragma_update(None, "secure_delete", "ON")?;

        debug!("database pragmas applied (WAL, synchronous FULL, secure_delete)");
        Ok(())
    }
}

// ── internals ────────────────────────────────────────────────────────

/// Begin a transaction, retrying lock contention with exponential back-off.
fn begin(conn: &Connection, behavior: TransactionBehavior) -> StoreResult<Transaction<'_>> {
    let mut attempt = 0;
    loop {
        match Transaction::new_unchecked(conn, behavior) {
            Ok(tx) => return Ok(tx),
            Err(err) if is_busy(&err) => {
                attempt += 1;
                if attempt > MAX_BUSY_RETRIES {
                    warn!(attempts = attempt, "giving up on busy database");
                    return Err(StoreError::Busy { attempts: attempt });
                }
                let backoff = BUSY_BACKOFF * 2u32.pow(attempt - 1);
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "database busy, retrying");
                std::thread::sleep(backoff);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

// ── tests ────────────────────────────────────────────────────────────
