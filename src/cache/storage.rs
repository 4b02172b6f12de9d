//! Partition storage trait with SQLite and in-memory implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use super::entry::CacheEntry;
use crate::config;
use crate::http::RequestKey;

/// Trait for partition storage backends.
///
/// A write to an existing key replaces the previous entry and moves it to the
/// end of the partition's insertion order.
pub trait CacheStorage: Send + Sync {
  /// Names of all partitions, sorted.
  fn partitions(&self) -> Result<Vec<String>>;

  /// Drop a partition and everything in it.
  fn delete_partition(&self, name: &str) -> Result<bool>;

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>>;

  /// Store an entry, creating the partition on first write.
  fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()>;

  /// Store several entries; either all are written or none are.
  fn put_all(&self, partition: &str, entries: &[CacheEntry]) -> Result<()>;

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool>;

  /// Keys of a partition, oldest write first.
  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>>;

  /// First entry for `key` across all partitions.
  fn match_any(&self, key: &RequestKey) -> Result<Option<CacheEntry>> {
    for partition in self.partitions()? {
      if let Some(entry) = self.get(&partition, key)? {
        return Ok(Some(entry));
      }
    }
    Ok(None)
  }
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  partitions: Mutex<BTreeMap<String, Vec<CacheEntry>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<CacheEntry>>>> {
    self
      .partitions
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn partitions(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    Ok(self.lock()?.remove(name).is_some())
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    Ok(
      self
        .lock()?
        .get(partition)
        .and_then(|entries| entries.iter().find(|e| &e.key == key))
        .cloned(),
    )
  }

  fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()> {
    let mut partitions = self.lock()?;
    let entries = partitions.entry(partition.to_string()).or_default();
    entries.retain(|e| e.key != entry.key);
    entries.push(entry.clone());
    Ok(())
  }

  fn put_all(&self, partition: &str, entries: &[CacheEntry]) -> Result<()> {
    let mut partitions = self.lock()?;
    let stored = partitions.entry(partition.to_string()).or_default();
    for entry in entries {
      stored.retain(|e| e.key != entry.key);
      stored.push(entry.clone());
    }
    Ok(())
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let mut partitions = self.lock()?;
    let Some(entries) = partitions.get_mut(partition) else {
      return Ok(false);
    };
    let before = entries.len();
    entries.retain(|e| &e.key != key);
    Ok(entries.len() != before)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    Ok(
      self
        .lock()?
        .get(partition)
        .map(|entries| entries.iter().map(|e| e.key.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = config::data_dir()?.join("cache.db");
    Self::open_at(&path)
  }

  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[allow(dead_code)]
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Rowid order is write order: REPLACE deletes the old row and appends a new one.
CREATE TABLE IF NOT EXISTS cache_entries (
    partition TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    PRIMARY KEY (partition, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_partition ON cache_entries(partition);
"#;

fn insert_entry(conn: &Connection, partition: &str, entry: &CacheEntry) -> Result<()> {
  let headers = serde_json::to_string(&entry.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR IGNORE INTO cache_partitions (name) VALUES (?)",
      params![partition],
    )
    .map_err(|e| eyre!("Failed to create partition {}: {}", partition, e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (partition, key_hash, method, url, status, headers, body)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        entry.key.cache_hash(),
        entry.key.method,
        entry.key.url,
        entry.status,
        headers,
        entry.body
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", entry.key, e))?;

  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_partitions ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list partitions: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(names)
  }

  fn delete_partition(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM cache_entries WHERE partition = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;
    let removed = conn
      .execute("DELETE FROM cache_partitions WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete partition {}: {}", name, e))?;

    Ok(removed > 0)
  }

  fn get(&self, partition: &str, key: &RequestKey) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match row {
      Some((status, headers, body)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          key: key.clone(),
          status,
          headers,
          body,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, partition: &str, entry: &CacheEntry) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, partition, entry)
  }

  fn put_all(&self, partition: &str, entries: &[CacheEntry]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for entry in entries {
      insert_entry(&tx, partition, entry)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn delete(&self, partition: &str, key: &RequestKey) -> Result<bool> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE partition = ? AND key_hash = ?",
        params![partition, key.cache_hash()],
      )
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;

    Ok(removed > 0)
  }

  fn keys(&self, partition: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM cache_entries WHERE partition = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![partition], |row| {
        Ok(RequestKey {
          method: row.get(0)?,
          url: row.get(1)?,
        })
      })
      .map_err(|e| eyre!("Failed to list keys of {}: {}", partition, e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }
}
