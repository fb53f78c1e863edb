//! Crypto migration runner, tracked in its own `_crypto_migrations` table so
//! it can share a database file with an embedding application.

use crate::error::CryptoError;
use rusqlite::Connection;

const MIGRATIONS: &[(i32, &str)] = &[(1, MIGRATION_001), (2, MIGRATION_002)];

const MIGRATION_001: &str = "
CREATE TABLE IF NOT EXISTS crypto_device_keys (
    device_id      TEXT PRIMARY KEY,
    public_key     BLOB NOT NULL,
    private_key    BLOB NOT NULL,
    format_version INTEGER NOT NULL,
    created_at     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS crypto_config (
    key   TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
";

const MIGRATION_002: &str = "
CREATE TABLE IF NOT EXISTS crypto_peer_keys (
    user_id            TEXT NOT NULL,
    device_id          TEXT NOT NULL,
    record_id          TEXT NOT NULL,
    public_key         BLOB NOT NULL,
    record_created_at  INTEGER NOT NULL,
    key_fingerprint    TEXT NOT NULL,
    key_version        INTEGER NOT NULL DEFAULT 1,
    verification_state TEXT NOT NULL DEFAULT 'unverified',
    verified_at        INTEGER,
    first_seen_at      INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    PRIMARY KEY (user_id, device_id)
);
";

pub fn run_crypto_migrations(conn: &Connection) -> Result<(), CryptoError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _crypto_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _crypto_migrations",
        [],
        |row| row.get(0),
    )?;

    for &(version, sql) in MIGRATIONS {
        if version > current_version {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO _crypto_migrations (version) VALUES (?1)",
                [version],
            )?;
            tx.commit()?;
            tracing::debug!(version, "applied crypto migration");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    #[test]
    fn run_migrations_creates_all_crypto_tables() {
        let conn = init_test_db();
        for table in ["crypto_device_keys", "crypto_config", "crypto_peer_keys"] {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "table {table} should exist");
        }
    }

    #[test]
    fn run_migrations_is_idempotent() {
        let conn = init_test_db();
        let count = |conn: &Connection| -> i32 {
            conn.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                [],
                |row| row.get(0),
            )
            .unwrap()
        };
        let before = count(&conn);
        run_crypto_migrations(&conn).unwrap();
        assert_eq!(before, count(&conn));
    }

    #[test]
    fn migrations_table_tracks_latest_version() {
        let conn = init_test_db();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _crypto_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn device_keys_primary_key_rejects_duplicate_device() {
        let conn = init_test_db();
        conn.execute(
            "INSERT INTO crypto_device_keys (device_id, public_key, private_key, format_version, created_at)
             VALUES ('d1', X'AA', X'BB', 2, 0)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO crypto_device_keys (device_id, public_key, private_key, format_version, created_at)
             VALUES ('d1', X'CC', X'DD', 2, 0)",
            [],
        );
        assert!(result.is_err());
    }
}
