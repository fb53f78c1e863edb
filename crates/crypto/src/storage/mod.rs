//! Local crypto storage: an (optionally SQLCipher-encrypted) SQLite database
//! holding device keypairs, the peer key cache, and small config values.

pub mod migrations;
pub mod peer_keys;
pub mod unlock;

use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::error::CryptoError;

/// Borrowed view over a crypto database connection.
pub struct CryptoStore<'a> {
    pub(crate) conn: &'a Connection,
}

impl<'a> CryptoStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn run_migrations(&self) -> Result<(), CryptoError> {
        migrations::run_crypto_migrations(self.conn)
    }

    pub fn get_config(&self, key: &str) -> Result<Option<Vec<u8>>, CryptoError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM crypto_config WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn store_config(&self, key: &str, value: &[u8]) -> Result<(), CryptoError> {
        self.conn.execute(
            "INSERT INTO crypto_config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_config(&self, key: &str) -> Result<(), CryptoError> {
        self.conn
            .execute("DELETE FROM crypto_config WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Run `f` inside an IMMEDIATE transaction: the write lock is taken up front,
/// so a concurrent check-then-insert from another connection blocks instead
/// of racing. Rolls back when `f` fails.
pub fn with_transaction<T>(
    conn: &Connection,
    f: impl FnOnce(&CryptoStore<'_>) -> Result<T, CryptoError>,
) -> Result<T, CryptoError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let store = CryptoStore::new(&tx);
    let value = f(&store)?;
    tx.commit()?;
    Ok(value)
}

/// A connection shared by the key store and the peer cache.
#[derive(Clone)]
pub struct SharedConnection {
    inner: Arc<Mutex<Connection>>,
}

impl SharedConnection {
    /// Wrap a connection and bring its schema up to date.
    pub fn new(conn: Connection) -> Result<Self, CryptoError> {
        CryptoStore::new(&conn).run_migrations()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, CryptoError> {
        self.inner
            .lock()
            .map_err(|e| CryptoError::StorageError(format!("crypto DB lock poisoned: {e}")))
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Unencrypted in-memory database with migrations applied.
#[cfg(test)]
pub(crate) fn init_test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    migrations::run_crypto_migrations(&conn).unwrap();
    conn
}
