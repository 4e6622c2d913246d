//! Integration tests for the keyward-store crate.
//!
//! These tests exercise the database lifecycle against a real SQLite
//! database on disk (via tempfile).

use keyward_store::{Database, StoreError, migration};

// ═══════════════════════════════════════════════════════════════════════
//  Database lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn database_open_and_migrate_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();

    for table in ["users", "sessions", "data_keys", "credentials", "api_keys", "audit_events"] {
        let count: i64 = db
            .execute(move |conn| {
                let c: i64 =
                    conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0))?;
                Ok::<_, StoreError>(c)
            })
            .await
            .unwrap();
        assert_eq!(count, 0, "table {table} should start empty");
    }

    assert!(db_path.exists());
}

#[tokio::test]
async fn database_open_and_migrate_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");

    let db = Database::open_and_migrate(db_path.clone()).await.unwrap();
    drop(db);
    let db = Database::open_and_migrate(db_path).await.unwrap();

    let version = db
        .execute(|conn| migration::current_version(conn))
        .await
        .unwrap();
    assert_eq!(version, migration::latest_version());
}

#[tokio::test]
async fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("vault.db");

    {
        let db = Database::open_and_migrate(db_path.clone()).await.unwrap();
        db.transaction(|conn| {
            conn.execute(
                "INSERT INTO audit_events (action, success, timestamp) VALUES ('vault_unlock', 1, 0)",
                [],
            )?;
            Ok::<_, StoreError>(())
        })
        .await
        .unwrap();
    }

    let db = Database::open_and_migrate(db_path).await.unwrap();
    let count: i64 = db
        .execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM audit_events", [], |row| row.get(0))?;
            Ok::<_, StoreError>(c)
        })
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_and_migrate(dir.path().join("vault.db"))
        .await
        .unwrap();

    db.execute(|conn| {
        conn.execute(
            "INSERT INTO data_keys (version, state, created_at) VALUES (1, 'active', 0)",
            [],
        )?;
        conn.execute(
            "INSERT INTO credentials (name, type, ciphertext, nonce, digest, key_version, created_at, updated_at) \
             VALUES ('c1', 'database', x'00', x'00', x'00', 1, 0, 0)",
            [],
        )?;
        Ok::<_, StoreError>(())
    })
    .await
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            db.transaction(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT access_count FROM credentials WHERE name = 'c1'",
                    [],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "UPDATE credentials SET access_count = ?1 WHERE name = 'c1'",
                    [count + 1],
                )?;
                Ok::<_, StoreError>(())
            })
            .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let count: i64 = db
        .execute(|conn| {
            let c: i64 = conn.query_row(
                "SELECT access_count FROM credentials WHERE name = 'c1'",
                [],
                |row| row.get(0),
            )?;
            Ok::<_, StoreError>(c)
        })
        .await
        .unwrap();
    assert_eq!(count, 16);
}
