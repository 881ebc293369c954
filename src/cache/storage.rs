//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::key::CacheKey;
use super::traits::CachedResponse;
use crate::http::{Headers, Request, Response};

/// Trait for bucketed response storage.
///
/// Every operation is atomic per key; concurrent writers to the same key
/// resolve last-write-wins.
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  fn open(&self, bucket: &str) -> Result<()>;

  /// Names of every bucket, in creation order.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop a bucket and all of its entries. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Look a request up in one bucket.
  fn match_in(&self, bucket: &str, request: &Request) -> Result<Option<CachedResponse>>;

  /// Look a request up in every bucket, in creation order.
  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any entry with the same key.
  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<()>;

  /// Number of entries in a bucket.
  fn entry_count(&self, bucket: &str) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-based cache storage implementation.
///
/// Also hosts the pending-mutation queue, see `cache::queue`.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Fresh database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("sw-cache").join("cache.db"))
  }

  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, ?)",
        params![bucket, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to open bucket {}: {}", bucket, e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named, versioned buckets (seq keeps creation order stable)
CREATE TABLE IF NOT EXISTS buckets (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

-- One row per (bucket, request key)
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    description TEXT NOT NULL,
    vary TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (bucket, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(key_hash);

-- Small key/value store for lifecycle bookkeeping
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Writes captured while offline, replayed by background sync
CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT NOT NULL,
    path TEXT NOT NULL,
    body BLOB NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    dead INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Request header values named by a response's `Vary`.
///
/// `None` means the response varies on everything and must never match.
fn vary_snapshot(request: &Request, response: &Response) -> Option<BTreeMap<String, String>> {
  let names = response.vary();
  if names.iter().any(|n| n == "*") {
    return None;
  }
  Some(
    names
      .into_iter()
      .map(|name| {
        let value = request.headers.get(&name).unwrap_or("").to_string();
        (name, value)
      })
      .collect(),
  )
}

fn vary_matches(stored: &str, request: &Request) -> bool {
  let stored: Option<BTreeMap<String, String>> = match serde_json::from_str(stored) {
    Ok(v) => v,
    Err(_) => return false,
  };

  match stored {
    None => false,
    Some(map) => map
      .iter()
      .all(|(name, value)| request.headers.get(name).unwrap_or("") == value),
  }
}

type EntryRow = (String, String, u16, String, String, Vec<u8>, String);

fn row_to_cached(row: EntryRow, request: &Request) -> Result<Option<CachedResponse>> {
  let (bucket, vary, status, status_text, headers, body, cached_at) = row;

  if !vary_matches(&vary, request) {
    return Ok(None);
  }

  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;

  Ok(Some(CachedResponse {
    response: Response {
      status,
      status_text,
      headers: headers.into_iter().collect::<Headers>(),
      body: body.into(),
    },
    bucket,
    cached_at: parse_datetime(&cached_at)?,
  }))
}

impl CacheStorage for SqliteStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let conn = self.conn()?;
    Self::ensure_bucket(&conn, bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY seq")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_in(&self, bucket: &str, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let key = CacheKey::for_request(request);

    let row: Option<EntryRow> = conn
      .query_row(
        "SELECT bucket, vary, status, status_text, headers, body, cached_at FROM entries
         WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to query {}: {}", key.description(), e))?;

    match row {
      Some(row) => row_to_cached(row, request),
      None => Ok(None),
    }
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedResponse>> {
    let conn = self.conn()?;
    let key = CacheKey::for_request(request);

    let mut stmt = conn
      .prepare(
        "SELECT e.bucket, e.vary, e.status, e.status_text, e.headers, e.body, e.cached_at
         FROM entries e
         INNER JOIN buckets b ON b.name = e.bucket
         WHERE e.key_hash = ?
         ORDER BY b.seq",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows: Vec<EntryRow> = stmt
      .query_map(params![key.hash()], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query {}: {}", key.description(), e))?
      .collect::<Result<_, _>>()
      .map_err(|e| eyre!("Failed to read cached entry: {}", e))?;

    for row in rows {
      if let Some(cached) = row_to_cached(row, request)? {
        return Ok(Some(cached));
      }
    }

    Ok(None)
  }

  fn put(&self, bucket: &str, request: &Request, response: &Response) -> Result<()> {
    let mut conn = self.conn()?;
    let key = CacheKey::for_request(request);

    let vary = serde_json::to_string(&vary_snapshot(request, response))
      .map_err(|e| eyre!("Failed to serialize vary snapshot: {}", e))?;
    let headers: Vec<(&str, &str)> = response.headers.iter().collect();
    let headers = serde_json::to_string(&headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    Self::ensure_bucket(&tx, bucket)?;

    tx.execute(
      "INSERT OR REPLACE INTO entries
         (bucket, key_hash, description, vary, status, status_text, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        bucket,
        key.hash(),
        key.description(),
        vary,
        response.status,
        response.status_text,
        headers,
        response.body.as_ref(),
        Utc::now().to_rfc3339(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.description(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entry_count(&self, bucket: &str) -> Result<usize> {
    let conn = self.conn()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries in {}: {}", bucket, e))?;

    Ok(count as usize)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;

    conn
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;

    Ok(())
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
