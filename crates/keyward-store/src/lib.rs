//! # keyward-store
//!
//! Storage engine for the keyward credential vault.
//!
//! Provides SQLite-backed persistence in WAL mode, versioned schema
//! migrations, and transactional helpers that run on tokio's blocking pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Database::transaction  (BEGIN IMMEDIATE,│
//! │                          busy retry)     │
//! │  Database::snapshot     (consistent read)│
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL)                 │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use keyward_store::Database;
//!
//! let db = Database::open_and_migrate("data/vault/vault.db").await?;
//! ```

pub mod db;
pub mod error;
pub mod migration;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
