use std::collections::{HashMap, HashSet};

use memodb_lib::op::Op;
use memodb_lib::refs::Ref;
use memodb_lib::value::{CodecError, Encode, Value};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{Result, StoreError};

/// How a table value crosses the blob boundary. Raw byte payloads pass
/// through untouched; model types go through the versioned codec.
pub trait TableValue: Clone {
    fn to_blob(&self) -> Vec<u8>;
    fn from_blob(bytes: &[u8]) -> std::result::Result<Self, CodecError>;
}

impl TableValue for Vec<u8> {
    fn to_blob(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_blob(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl TableValue for Ref {
    fn to_blob(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_blob(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        Self::decode(bytes)
    }
}

impl TableValue for Op {
    fn to_blob(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_blob(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        Self::decode(bytes)
    }
}

impl TableValue for Value {
    fn to_blob(&self) -> Vec<u8> {
        self.encode()
    }

    fn from_blob(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        Self::decode(bytes)
    }
}

/// A keyed blob table. All methods run on the caller's connection, so they
/// take part in whatever transaction is open.
#[derive(Clone, Copy)]
pub struct KvTable {
    table: &'static str,
}

impl KvTable {
    pub const fn new(table: &'static str) -> Self {
        KvTable { table }
    }

    pub fn name(&self) -> &'static str {
        self.table
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (key TEXT PRIMARY KEY, value BLOB)",
            self.table
        ))?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, key: &str) -> Result<Vec<u8>> {
        conn.query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", self.table),
            params![key],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::KeyNotFound {
            table: self.table,
            key: key.to_owned(),
        })
    }

    pub fn set(&self, conn: &Connection, key: &str, value: &[u8]) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                self.table
            ),
            params![key, value],
        )?;
        Ok(())
    }

    pub fn remove(&self, conn: &Connection, key: &str) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", self.table),
            params![key],
        )?;
        Ok(())
    }

    pub fn exists(&self, conn: &Connection, key: &str) -> Result<bool> {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE key = ?1", self.table),
            params![key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn keys(&self, conn: &Connection) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!("SELECT key FROM {}", self.table))?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    pub fn values(&self, conn: &Connection) -> Result<Vec<Vec<u8>>> {
        let mut stmt = conn.prepare(&format!("SELECT value FROM {}", self.table))?;
        let values = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<Vec<u8>>>>()?;
        Ok(values)
    }

    pub fn load_all(&self, conn: &Connection) -> Result<Vec<(String, Vec<u8>)>> {
        let mut stmt = conn.prepare(&format!("SELECT key, value FROM {}", self.table))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;
        Ok(rows)
    }
}

/// Write-through cache over a [`KvTable`]. Reads memoize persistent hits;
/// writes land in the cache and the dirty set, and reach the table only on
/// [`CachedKv::commit`]. `dirty` is always a subset of the cached keys.
pub struct CachedKv<V> {
    persistent: KvTable,
    cache: HashMap<String, V>,
    dirty: HashSet<String>,
}

impl<V: TableValue> CachedKv<V> {
    pub fn new(table: &'static str) -> Self {
        CachedKv {
            persistent: KvTable::new(table),
            cache: HashMap::new(),
            dirty: HashSet::new(),
        }
    }

    pub fn persistent(&self) -> &KvTable {
        &self.persistent
    }

    pub fn create(&self, conn: &Connection) -> Result<()> {
        self.persistent.create(conn)
    }

    pub fn get(&mut self, conn: &Connection, key: &str) -> Result<V> {
        if let Some(v) = self.cache.get(key) {
            return Ok(v.clone());
        }
        let value = V::from_blob(&self.persistent.get(conn, key)?)?;
        self.cache.insert(key.to_owned(), value.clone());
        Ok(value)
    }

    pub fn set(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        self.cache.insert(key.clone(), value);
        self.dirty.insert(key);
    }

    /// Write to cache and persistence at once, bypassing the dirty set.
    pub fn put_through(&mut self, conn: &Connection, key: impl Into<String>, value: V) -> Result<()> {
        let key = key.into();
        self.persistent.set(conn, &key, &value.to_blob())?;
        self.cache.insert(key, value);
        Ok(())
    }

    /// Remove the key everywhere; from the cache's viewpoint it never existed.
    pub fn remove(&mut self, conn: &Connection, key: &str) -> Result<()> {
        self.cache.remove(key);
        self.dirty.remove(key);
        self.persistent.remove(conn, key)
    }

    pub fn exists(&self, conn: &Connection, key: &str) -> Result<bool> {
        if self.cache.contains_key(key) {
            return Ok(true);
        }
        self.persistent.exists(conn, key)
    }

    pub fn contains_cached(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Flush every dirty entry and clear the dirty set. The caller provides
    /// the transaction, so a failed commit leaves the dirty set intact.
    pub fn commit(&mut self, conn: &Connection) -> Result<()> {
        for key in &self.dirty {
            let value = self
                .cache
                .get(key)
                .ok_or_else(|| StoreError::IntegrityViolation(format!(
                    "dirty key `{key}` missing from the {} cache",
                    self.persistent.name()
                )))?;
            self.persistent.set(conn, key, &value.to_blob())?;
        }
        self.dirty.clear();
        Ok(())
    }

    /// Hydrate the cache with the full persistent contents.
    pub fn preload(&mut self, conn: &Connection) -> Result<()> {
        for (key, blob) in self.persistent.load_all(conn)? {
            self.cache.insert(key, V::from_blob(&blob)?);
        }
        Ok(())
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.dirty.clear();
    }
}
