//! Cache storage trait with SQLite and in-memory implementations.
//!
//! A storage holds any number of named generations, each mapping a
//! [`RequestKey`] to the last response written for it.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::entry::{digest, CachedEntry, EntrySummary, RequestKey};
use crate::http::Response;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync + 'static {
  /// Create the generation if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Generation names in creation order.
  fn keys(&self) -> Result<Vec<String>>;

  fn has(&self, name: &str) -> Result<bool>;

  /// Delete a generation and all its entries. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look up an entry in one generation.
  fn lookup(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Overwrite the entry for `key`, opening the generation if needed.
  /// Only GET requests can be stored.
  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Entries of one generation, ordered by URL.
  fn entries(&self, name: &str) -> Result<Vec<EntrySummary>>;
}

/// Lets several agents share one store, as successive versions do.
impl<S: CacheStorage> CacheStorage for std::sync::Arc<S> {
  fn open(&self, name: &str) -> Result<()> {
    (**self).open(name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    (**self).keys()
  }

  fn has(&self, name: &str) -> Result<bool> {
    (**self).has(name)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    (**self).delete(name)
  }

  fn lookup(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    (**self).lookup(name, key)
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    (**self).put(name, key, response)
  }

  fn entries(&self, name: &str) -> Result<Vec<EntrySummary>> {
    (**self).entries(name)
  }
}

fn ensure_cacheable(key: &RequestKey) -> Result<()> {
  if key.method != Method::GET {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET requests are cacheable",
      key.method,
      key.url
    ));
  }
  Ok(())
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Vec<(String, HashMap<RequestKey, CachedEntry>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_generations<R>(
    &self,
    f: impl FnOnce(&mut Vec<(String, HashMap<RequestKey, CachedEntry>)>) -> R,
  ) -> Result<R> {
    let mut generations = self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut generations))
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, name: &str) -> Result<()> {
    self.with_generations(|gens| {
      if !gens.iter().any(|(n, _)| n == name) {
        gens.push((name.to_string(), HashMap::new()));
      }
    })
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.with_generations(|gens| gens.iter().map(|(n, _)| n.clone()).collect())
  }

  fn has(&self, name: &str) -> Result<bool> {
    self.with_generations(|gens| gens.iter().any(|(n, _)| n == name))
  }

  fn delete(&self, name: &str) -> Result<bool> {
    self.with_generations(|gens| {
      let before = gens.len();
      gens.retain(|(n, _)| n != name);
      gens.len() != before
    })
  }

  fn lookup(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    self.with_generations(|gens| {
      gens
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, entries)| entries.get(key).cloned())
    })
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    ensure_cacheable(key)?;
    let entry = CachedEntry {
      response: response.clone(),
      cached_at: Utc::now(),
      digest: digest(&response.body),
    };
    self.with_generations(|gens| {
      let index = match gens.iter().position(|(n, _)| n == name) {
        Some(index) => index,
        None => {
          gens.push((name.to_string(), HashMap::new()));
          gens.len() - 1
        }
      };
      gens[index].1.insert(key.clone(), entry);
    })
  }

  fn entries(&self, name: &str) -> Result<Vec<EntrySummary>> {
    self.with_generations(|gens| {
      let mut summaries: Vec<EntrySummary> = gens
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, entries)| {
          entries
            .iter()
            .map(|(key, entry)| EntrySummary {
              method: key.method.to_string(),
              url: key.url.clone(),
              status: entry.response.status,
              size: entry.response.body.len(),
              digest: entry.digest.clone(),
              cached_at: entry.cached_at,
            })
            .collect()
        })
        .unwrap_or_default();
      summaries.sort_by(|a, b| a.url.cmp(&b.url));
      summaries
    })
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location.
  pub fn open_at(path: Option<&Path>) -> Result<Self> {
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

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
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
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("asset-agent").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per generation; rowid gives creation order
CREATE TABLE IF NOT EXISTS generations (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots, overwritten wholesale
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, method, url)
);
"#;

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to open generation {}: {}", name, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read generation name: {}", e))?;

    Ok(names)
  }

  fn has(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM generations WHERE name = ?",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query generation {}: {}", name, e))?;

    Ok(found.is_some())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn lookup(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, digest, cached_at FROM entries
         WHERE generation = ? AND method = ? AND url = ?",
        params![name, key.method.as_str(), key.url],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key.url, e))?;

    match row {
      Some((status, headers, body, digest, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key.url, e))?;
        let cached_at = parse_datetime(&cached_at_str)?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
          },
          cached_at,
          digest,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, name: &str, key: &RequestKey, response: &Response) -> Result<()> {
    ensure_cacheable(key)?;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open generation {}: {}", name, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO entries (generation, method, url, status, headers, body, digest, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        key.method.as_str(),
        key.url,
        response.status,
        headers,
        response.body,
        digest(&response.body)
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", key.url, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<EntrySummary>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT method, url, status, length(body), digest, cached_at FROM entries
         WHERE generation = ?
         ORDER BY url",
      )
      .map_err(|e| eyre!("Failed to prepare entry query: {}", e))?;

    let rows = stmt
      .query_map(params![name], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, u16>(2)?,
          row.get::<_, i64>(3)?,
          row.get::<_, String>(4)?,
          row.get::<_, String>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query entries: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    rows
      .into_iter()
      .map(|(method, url, status, size, digest, cached_at)| {
        Ok(EntrySummary {
          method,
          url,
          status,
          size: usize::try_from(size).unwrap_or_default(),
          digest,
          cached_at: parse_datetime(&cached_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
