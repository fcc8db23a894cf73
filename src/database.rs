use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlcipher_window::{CursorWindow, Value};
use sqlx_sqlcipher_conn_mgr::{
   CheckpointMode, CheckpointOutcome, Connection, ConnectionPool, ExecuteResult, JournalMode,
   KeyMaterial, PoolStats, PooledConnection,
};
use sqlx_sqlcipher_observer::{ChangeStream, ObserverRegistry};
use tracing::{debug, trace, warn};

use crate::config::StoreConfig;
use crate::cursor::Cursor;
use crate::decode::{self, Row};
use crate::transaction::{Statement, Transaction};
use crate::{Error, Result};

/// Result returned from write operations (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the write operation. Zero for DDL.
   pub rows_affected: u64,
   /// The last inserted row ID (SQLite ROWID).
   ///
   /// Only set for INSERT operations on tables with a ROWID.
   /// Tables created with `WITHOUT ROWID` will not set this value (returns 0).
   pub last_insert_id: i64,
}

impl From<ExecuteResult> for WriteQueryResult {
   fn from(result: ExecuteResult) -> Self {
      Self {
         rows_affected: result.rows_affected,
         last_insert_id: result.last_insert_id,
      }
   }
}

/// An open encrypted database.
///
/// Writes go through the single primary connection and notify observers once
/// they commit. Reads borrow a pooled read connection and stream their rows
/// through a [`CursorWindow`], so a result set never has to fit in one buffer.
pub struct Database {
   pool: Arc<ConnectionPool>,
   observers: Arc<ObserverRegistry>,
   config: StoreConfig,
}

impl Database {
   /// Open (or create) the database at `path`.
   ///
   /// Fails with a `KEY_ERROR` coded error if `key` does not decrypt the file.
   pub async fn open(
      path: impl AsRef<Path>,
      key: Option<KeyMaterial>,
      config: StoreConfig,
   ) -> Result<Self> {
      let config = config.validated();
      let pool = ConnectionPool::open(path, key, config.pool.clone()).await?;
      let observers = ObserverRegistry::new(config.observer_channel_capacity);

      debug!(path = %pool.path().display(), "opened database");

      Ok(Self {
         pool,
         observers,
         config,
      })
   }

   pub fn path(&self) -> &Path {
      self.pool.path()
   }

   pub fn config(&self) -> &StoreConfig {
      &self.config
   }

   pub fn journal_mode(&self) -> JournalMode {
      self.pool.journal_mode()
   }

   /// Whether reads run on their own connections alongside the writer.
   pub fn wal_active(&self) -> bool {
      self.pool.wal_active()
   }

   pub fn stats(&self) -> PoolStats {
      self.pool.stats()
   }

   pub fn pool(&self) -> &Arc<ConnectionPool> {
      &self.pool
   }

   /// Registry notified after every committed write.
   pub fn observers(&self) -> &Arc<ObserverRegistry> {
      &self.observers
   }

   /// Stream of commit notices from now on.
   pub fn subscribe(&self) -> ChangeStream {
      self.observers.subscribe_stream()
   }

   /// Execute a write query (INSERT/UPDATE/DELETE/DDL)
   pub async fn execute(&self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      let params = decode::bind_values(values);
      let mut writer = self.pool.acquire_writer().await?;
      let result = writer.execute(query, &params).await?;
      finish_write(writer, &self.observers).await;
      Ok(result.into())
   }

   /// Run a script of statements separated by semicolons, without parameters.
   pub async fn execute_batch(&self, sql: &str) -> Result<()> {
      let mut writer = self.pool.acquire_writer().await?;
      writer.execute_batch(sql).await?;
      finish_write(writer, &self.observers).await;
      Ok(())
   }

   /// Start a transaction on the primary connection.
   ///
   /// The writer stays borrowed until the transaction commits, rolls back or
   /// drops. Dropping it rolls back.
   pub async fn begin(&self) -> Result<Transaction> {
      let writer = self.pool.acquire_writer().await?;
      Transaction::begin(writer, Arc::clone(&self.observers), self.config.window_capacity).await
   }

   /// Execute multiple write statements atomically within a transaction.
   ///
   /// Commits when every statement succeeds and rolls back on the first
   /// failure. Returns the result of each statement execution.
   pub async fn execute_transaction(
      &self,
      statements: Vec<Statement>,
   ) -> Result<Vec<WriteQueryResult>> {
      let mut tx = self.begin().await?;

      match tx.execute_statements(statements).await {
         Ok(results) => {
            tx.commit().await?;
            Ok(results)
         }
         Err(err) => Err(tx.abort(err).await),
      }
   }

   /// Execute a SELECT query, possibly returning multiple rows
   pub async fn fetch_all(&self, query: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      let params = decode::bind_values(values);
      let mut reader = self.pool.acquire_reader().await?;
      read_rows(&mut reader, query, &params, self.config.window_capacity).await
   }

   /// Execute a SELECT query expecting zero or one result
   pub async fn fetch_one(&self, query: &str, values: Vec<JsonValue>) -> Result<Option<Row>> {
      // Two rows are enough to tell "one" from "more than one"
      let limited_query = format!("{} LIMIT 2", query.trim_end().trim_end_matches(';'));
      let mut rows = self.fetch_all(&limited_query, values).await?;

      match rows.len() {
         0 => Ok(None),
         1 => Ok(rows.pop()),
         count => Err(Error::MultipleRowsReturned(count)),
      }
   }

   /// Open a cursor over the results of `query`.
   ///
   /// Rows are fetched on demand as the cursor moves, one window at a time.
   pub async fn query(&self, query: &str, values: Vec<JsonValue>) -> Result<Cursor> {
      Cursor::open(
         Arc::clone(&self.pool),
         &self.observers,
         query,
         decode::bind_values(values),
         self.config.window_capacity,
      )
      .await
   }

   /// Checkpoint the WAL now with `mode`, regardless of its size.
   pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
      Ok(self.pool.checkpoint(mode).await?)
   }

   /// Ask the engine to free cached pages. Returns the number of bytes freed.
   pub fn release_memory(&self) -> i32 {
      self.pool.release_memory()
   }

   /// Close the database, waiting for borrowed connections to come back.
   pub async fn close(&self) -> Result<()> {
      self.pool.close().await?;
      Ok(())
   }

   /// Close the database connection and remove all database files
   pub async fn remove(&self) -> Result<()> {
      self.pool.remove().await?;
      Ok(())
   }
}

impl std::fmt::Debug for Database {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Database")
         .field("path", &self.pool.path())
         .field("journal_mode", &self.pool.journal_mode())
         .field("observers", &self.observers.len())
         .finish()
   }
}

/// Return the writer (checkpointing if due) and announce what it committed.
///
/// Returns the number of committed row changes.
pub(crate) async fn finish_write(mut writer: PooledConnection, observers: &ObserverRegistry) -> u64 {
   let changes = writer.take_changes();
   // Returning the writer rolls back anything left open, so nothing commits
   let committed = !writer.in_transaction();
   let pool = Arc::clone(writer.pool());

   match pool.release(writer).await {
      Ok(outcome) => trace!(?outcome, "released writer"),
      Err(err) => warn!(error = %err, "checkpoint after write failed"),
   }

   if !committed {
      return 0;
   }
   if changes > 0 {
      observers.dispatch(changes, None);
   }
   changes
}

/// Stream every row of `sql` through a window and decode it.
pub(crate) async fn read_rows(
   conn: &mut Connection,
   sql: &str,
   params: &[Value],
   window_capacity: usize,
) -> Result<Vec<Row>> {
   let columns = conn.columns(sql).await?;
   let mut window = CursorWindow::new(window_capacity);
   let mut rows = Vec::new();

   loop {
      let filled = conn.fill_window(sql, params, &mut window, rows.len()).await?;
      if filled == 0 {
         break;
      }
      for row in window.start_row()..window.end_row() {
         rows.push(decode::window_row(&window, row, &columns)?);
      }
   }

   Ok(rows)
}
