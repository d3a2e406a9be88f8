//! The embedded relational store behind a storage: connection ownership and
//! scoped transactions. Tables live in [`kv`] and [`calls`]; everything here
//! is connection plumbing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use crate::error::Result;

pub mod calls;
pub mod kv;

enum Backing {
    /// One connection kept open for the adapter's lifetime.
    Memory(Mutex<Connection>),
    /// A fresh connection per transaction, closed on completion.
    File(PathBuf),
}

/// Owns access to the embedded store. In-memory databases keep a single
/// connection alive (dropping it would drop the data); file databases open a
/// connection per transaction.
pub struct DbAdapter {
    backing: Backing,
}

impl DbAdapter {
    pub fn in_memory() -> Result<Self> {
        Ok(DbAdapter {
            backing: Backing::Memory(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Open (or create) a file database. On first creation the database is
    /// switched to write-ahead logging and incremental vacuuming; both must
    /// be set before any table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let fresh = !path.exists();
        let conn = Connection::open(path)?;
        if fresh {
            // auto_vacuum only takes hold while the database has no pages
            conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;")?;
            let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }
        drop(conn);
        Ok(DbAdapter {
            backing: Backing::File(path.to_path_buf()),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// Run `f` inside one transaction: commit on success, roll back on error.
    /// Storage entry points open a single transaction here and hand the
    /// connection down to table methods, so inner operations fold into the
    /// outer transaction instead of opening their own.
    pub fn with_txn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.backing {
            Backing::Memory(conn) => {
                let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let txn = guard.unchecked_transaction()?;
                let out = f(&txn)?;
                txn.commit()?;
                Ok(out)
            }
            Backing::File(path) => {
                let conn = Connection::open(path)?;
                let txn = conn.unchecked_transaction()?;
                let out = f(&txn)?;
                txn.commit()?;
                Ok(out)
            }
        }
    }

    /// Reclaim free pages. Must run outside any transaction.
    pub fn vacuum(&self) -> Result<()> {
        match &self.backing {
            Backing::Memory(conn) => {
                let guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.execute_batch("VACUUM")?;
            }
            Backing::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("VACUUM")?;
            }
        }
        Ok(())
    }

    /// Names of the relations present in the database.
    pub fn tables(&self) -> Result<Vec<String>> {
        self.with_txn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use tempfile::TempDir;

    #[test]
    fn file_db_gets_creation_pragmas() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        let db = DbAdapter::open(&path).unwrap();
        db.with_txn(|conn| {
            conn.execute_batch("CREATE TABLE t (key TEXT PRIMARY KEY)")?;
            Ok(())
        })
        .unwrap();

        let conn = Connection::open(&path).unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let auto_vacuum: i64 = conn
            .query_row("PRAGMA auto_vacuum", [], |row| row.get(0))
            .unwrap();
        assert_eq!(auto_vacuum, 2); // incremental
    }

    #[test]
    fn rollback_on_error() {
        let db = DbAdapter::in_memory().unwrap();
        db.with_txn(|conn| {
            conn.execute_batch("CREATE TABLE t (key TEXT PRIMARY KEY, value BLOB)")?;
            Ok(())
        })
        .unwrap();

        let result: Result<()> = db.with_txn(|conn| {
            conn.execute("INSERT INTO t VALUES ('a', x'00')", [])?;
            Err(StoreError::IntegrityViolation("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_txn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn reopening_a_file_db_sees_committed_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = DbAdapter::open(&path).unwrap();
            db.with_txn(|conn| {
                conn.execute_batch(
                    "CREATE TABLE t (key TEXT PRIMARY KEY, value BLOB);
                     INSERT INTO t VALUES ('a', x'01');",
                )?;
                Ok(())
            })
            .unwrap();
        }
        let db = DbAdapter::open(&path).unwrap();
        assert_eq!(db.tables().unwrap(), vec!["t".to_owned()]);
    }
}
