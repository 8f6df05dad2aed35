//! SQLite-backed durable store
//!
//! Every `put` appends one row. The public key combines the row id with a
//! random 32-bit discriminant stored alongside, so keys cannot be guessed by
//! counting. Old rows are never purged here; that is left to the operator.
//!
//! ```sql
//! CREATE TABLE flowstates (
//!     id     INTEGER PRIMARY KEY AUTOINCREMENT,
//!     scope  TEXT    NOT NULL,
//!     random INTEGER NOT NULL,
//!     state  BLOB    NOT NULL
//! )
//! ```

use super::{CheckpointRecord, CheckpointStore, Scope};
use crate::error::{CheckpointError, Result};
use crate::id::parse_key;
use crate::transform::Pipeline;
use async_trait::async_trait;
use rand::Rng;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

/// Default table name
pub const DEFAULT_TABLE: &str = "flowstates";

const KEY_SEPARATOR: char = ':';

/// Checkpoints persisted as rows of a SQLite table
#[derive(Clone)]
pub struct DurableStore {
    pool: SqlitePool,
    table: String,
    pipeline: Option<Pipeline>,
}

impl DurableStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
            pipeline: None,
        }
    }

    /// Open a pool for `database_url` (e.g. `sqlite:states.db` or `sqlite::memory:`)
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Use another table; the name must be a plain SQL identifier
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(CheckpointError::Config(format!(
                "invalid table name: {:?}",
                table
            )));
        }
        self.table = table;
        Ok(self)
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the table if it does not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scope TEXT NOT NULL,
                random INTEGER NOT NULL,
                state BLOB NOT NULL
            )",
            self.table
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of stored rows across all scopes
    pub async fn row_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", self.table))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn format_key(id: i64, random: i32) -> String {
    format!("{:x}{}{:x}", id, KEY_SEPARATOR, random as u32)
}

fn parse(key: &str) -> Option<(i64, i32)> {
    let (id, random) = key.split_once(KEY_SEPARATOR)?;
    let id = parse_key(id)? as i64;
    if random.is_empty() || random.len() > 8 || random.starts_with('+') {
        return None;
    }
    let random = u32::from_str_radix(random, 16).ok()? as i32;
    Some((id, random))
}

#[async_trait]
impl CheckpointStore for DurableStore {
    fn name(&self) -> &'static str {
        "durable"
    }

    #[tracing::instrument(skip(self, record), fields(table = %self.table, bytes = record.bytes.len()))]
    async fn put(&self, scope: &Scope, record: CheckpointRecord) -> Result<String> {
        let state = match &self.pipeline {
            Some(pipeline) => pipeline.encode(record.bytes)?,
            None => record.bytes,
        };
        let random: i32 = rand::thread_rng().gen();
        let id = sqlx::query(&format!(
            "INSERT INTO {} (scope, random, state) VALUES (?, ?, ?)",
            self.table
        ))
        .bind(scope.as_str())
        .bind(random)
        .bind(state)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let key = format_key(id, random);
        tracing::debug!(%key, "Stored checkpoint row");
        Ok(key)
    }

    #[tracing::instrument(skip(self), fields(table = %self.table))]
    async fn get(&self, scope: &Scope, key: &str) -> Result<Option<CheckpointRecord>> {
        let Some((id, random)) = parse(key) else {
            return Ok(None);
        };
        let row: Option<(Vec<u8>,)> = sqlx::query_as(&format!(
            "SELECT state FROM {} WHERE id = ? AND random = ? AND scope = ?",
            self.table
        ))
        .bind(id)
        .bind(random)
        .bind(scope.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some((state,)) = row else {
            tracing::debug!("Checkpoint row not found");
            return Ok(None);
        };
        let bytes = match &self.pipeline {
            Some(pipeline) => pipeline.decode(state)?,
            None => state,
        };
        Ok(Some(CheckpointRecord::new(bytes)))
    }
}

impl std::fmt::Debug for DurableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("table", &self.table)
            .field("pipeline", &self.pipeline)
            .finish()
    }
}
