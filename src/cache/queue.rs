//! Persistent queue of writes captured while offline.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};

use super::storage::{parse_datetime, SqliteStorage};
use crate::http::Method;

/// A write waiting to be replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
  pub id: i64,
  pub method: Method,
  /// Path on the origin, e.g. `/api/todos`
  pub path: String,
  /// JSON payload
  pub body: Vec<u8>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
  /// Gave up after too many attempts
  pub dead: bool,
  pub created_at: DateTime<Utc>,
}

/// A write to be queued.
#[derive(Debug, Clone)]
pub struct NewMutation {
  pub method: Method,
  pub path: String,
  pub body: Vec<u8>,
}

impl NewMutation {
  pub fn post(path: &str, body: impl Into<Vec<u8>>) -> Self {
    Self {
      method: Method::Post,
      path: path.to_string(),
      body: body.into(),
    }
  }
}

/// Where a mutation stands after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
  /// Will be replayed on the next trigger
  Retained { attempts: u32 },
  /// Moved to the dead-letter set
  DeadLettered { attempts: u32 },
}

/// Trait for mutation queue backends.
pub trait MutationQueue: Send + Sync {
  /// Append a mutation, returning its id.
  fn enqueue(&self, mutation: &NewMutation) -> Result<i64>;

  /// Live mutations, oldest first.
  fn pending(&self) -> Result<Vec<PendingMutation>>;

  /// Mutations that exhausted their attempts.
  fn dead_letters(&self) -> Result<Vec<PendingMutation>>;

  /// Drop a mutation after a successful replay.
  fn remove(&self, id: i64) -> Result<()>;

  /// Count a failed replay, dead-lettering once `max_attempts` is reached.
  fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<RetryState>;
}

type MutationRow = (i64, String, String, Vec<u8>, u32, Option<String>, bool, String);

fn row_to_mutation(row: MutationRow) -> Result<PendingMutation> {
  let (id, method, path, body, attempts, last_error, dead, created_at) = row;
  Ok(PendingMutation {
    id,
    method: Method::parse(&method),
    path,
    body,
    attempts,
    last_error,
    dead,
    created_at: parse_datetime(&created_at)?,
  })
}

impl SqliteStorage {
  fn select_mutations(&self, dead: bool) -> Result<Vec<PendingMutation>> {
    let conn = self.conn()?;

    let mut stmt = conn
      .prepare(
        "SELECT id, method, path, body, attempts, last_error, dead, created_at
         FROM pending_mutations WHERE dead = ? ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<MutationRow> = stmt
      .query_map(params![dead], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
          row.get(6)?,
          row.get(7)?,
        ))
      })
      .map_err(|e| eyre!("Failed to read mutation queue: {}", e))?
      .collect::<Result<_, _>>()
      .map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;

    rows.into_iter().map(row_to_mutation).collect()
  }
}

impl MutationQueue for SqliteStorage {
  fn enqueue(&self, mutation: &NewMutation) -> Result<i64> {
    let conn = self.conn()?;
    let now = Utc::now().to_rfc3339();

    conn
      .execute(
        "INSERT INTO pending_mutations (method, path, body, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![
          mutation.method.as_str(),
          mutation.path,
          mutation.body,
          now,
          now
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<PendingMutation>> {
    self.select_mutations(false)
  }

  fn dead_letters(&self) -> Result<Vec<PendingMutation>> {
    self.select_mutations(true)
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.conn()?;

    conn
      .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove mutation {}: {}", id, e))?;

    Ok(())
  }

  fn record_failure(&self, id: i64, error: &str, max_attempts: u32) -> Result<RetryState> {
    let mut conn = self.conn()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let attempts: u32 = tx
      .query_row(
        "SELECT attempts FROM pending_mutations WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read mutation {}: {}", id, e))?
      .ok_or_else(|| eyre!("Mutation {} is not queued", id))?;

    let attempts = attempts + 1;
    let dead = attempts >= max_attempts;

    tx.execute(
      "UPDATE pending_mutations SET attempts = ?, last_error = ?, dead = ?, updated_at = ?
       WHERE id = ?",
      params![attempts, error, dead, Utc::now().to_rfc3339(), id],
    )
    .map_err(|e| eyre!("Failed to update mutation {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(if dead {
      RetryState::DeadLettered { attempts }
    } else {
      RetryState::Retained { attempts }
    })
  }
}
