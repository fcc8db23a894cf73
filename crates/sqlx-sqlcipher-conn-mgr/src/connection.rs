//! A single native connection to an encrypted database file

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use sqlcipher_window::{CursorWindow, Value, ValueRef, WindowError};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Connection as _, Executor as _, Row as _};
use tracing::{debug, trace, warn};

use crate::config::{CheckpointMode, JournalMode, KeyHooks, KeyMaterial, PoolConfig, default_page_size};
use crate::error::{Error, Result};
use crate::ffi::{EngineError, ProgressGuard, RawDb, Step, WalHookRegistration};
use crate::statement_cache::{PreparedStatement, StatementCache, StatementCacheStats};

/// Query used to force the engine to decrypt page 1 after the key is applied
const KEY_CHECK_SQL: &str = "SELECT count(*) FROM sqlite_master";

/// Returns a row only when the engine was built with encryption support
const CIPHER_VERSION_SQL: &str = "PRAGMA cipher_version";

/// Role of a connection within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
   /// The single read-write connection
   Primary,
   /// One of the pooled read-only connections (WAL only)
   ReadOnly,
}

impl fmt::Display for ConnectionMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         ConnectionMode::Primary => f.write_str("primary"),
         ConnectionMode::ReadOnly => f.write_str("read-only"),
      }
   }
}

/// Result of a write statement
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteResult {
   /// Rows inserted, updated or deleted by the statement
   pub rows_affected: u64,
   /// Rowid of the most recent successful INSERT on this connection
   pub last_insert_id: i64,
}

/// Result of a window fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
   /// Rows committed to the window
   pub filled_rows: usize,
   /// Total rows in the result, when counting was requested
   pub total_rows: Option<usize>,
}

/// Result of `PRAGMA wal_checkpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalCheckpoint {
   pub busy: bool,
   /// Frames in the WAL, or -1 when the database is not in WAL mode
   pub log_frames: i64,
   /// Frames copied back into the database file
   pub checkpointed_frames: i64,
}

/// Cancels the statement running on a connection from any task or thread.
///
/// Cloneable and `Send + Sync`. Once the connection closes the handle does nothing.
#[derive(Clone)]
pub struct InterruptHandle {
   db: Arc<Mutex<Option<RawDb>>>,
}

impl InterruptHandle {
   /// Signal the engine to abort the current statement at its next safe point.
   ///
   /// Returns `false` if the connection is already closed.
   pub fn interrupt(&self) -> bool {
      match *self.db.lock() {
         Some(db) => {
            db.interrupt();
            true
         }
         None => false,
      }
   }
}

impl fmt::Debug for InterruptHandle {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("InterruptHandle")
         .field("armed", &self.db.lock().is_some())
         .finish()
   }
}

/// Disarms every InterruptHandle when dropped
struct InterruptSlot(Arc<Mutex<Option<RawDb>>>);

impl Drop for InterruptSlot {
   fn drop(&mut self) {
      self.0.lock().take();
   }
}

pub(crate) struct OpenOptions {
   pub id: u64,
   pub path: PathBuf,
   pub mode: ConnectionMode,
   pub key: Option<KeyMaterial>,
   pub config: PoolConfig,
   /// WAL page counter fed by the engine's WAL hook (primary only)
   pub wal_pages: Option<Arc<AtomicU32>>,
}

/// Failure inside a statement operation, before SQL context is attached
enum OpError {
   Engine(EngineError),
   Window(WindowError),
}

impl From<EngineError> for OpError {
   fn from(err: EngineError) -> Self {
      OpError::Engine(err)
   }
}

impl From<WindowError> for OpError {
   fn from(err: WindowError) -> Self {
      OpError::Window(err)
   }
}

/// One native handle plus its statement cache.
///
/// A connection is used by one caller at a time; the pool moves it between
/// callers. The sqlx connection owns the native handle and closes it exactly
/// once, after every statement compiled on it has been finalized.
pub struct Connection {
   id: u64,
   mode: ConnectionMode,
   path: PathBuf,
   journal_mode: JournalMode,
   statement_timeout: Option<Duration>,
   changes: u64,
   poisoned: bool,
   raw: RawDb,
   // Fields below drop in order; everything referencing the native handle
   // has to go before `conn`.
   statements: StatementCache<PreparedStatement>,
   wal_hook: Option<WalHookRegistration>,
   interrupt: InterruptSlot,
   conn: SqliteConnection,
}

impl Connection {
   /// Open, key and configure a connection.
   ///
   /// The future owns its inputs so pool callers can run on any task.
   pub(crate) fn open(options: OpenOptions) -> BoxFuture<'static, Result<Self>> {
      Self::open_owned(options).boxed()
   }

   async fn open_owned(options: OpenOptions) -> Result<Self> {
      let OpenOptions {
         id,
         path,
         mode,
         key,
         config,
         wal_pages,
      } = options;

      let connect_options = SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(mode == ConnectionMode::Primary)
         .read_only(mode == ConnectionMode::ReadOnly)
         .serialized(true)
         .busy_timeout(config.busy_timeout);

      let mut conn = SqliteConnection::connect_with(&connect_options)
         .await
         .map_err(|e| Error::from_sqlx(e, "open"))?;

      if let Err(err) = apply_key(&mut conn, &path, key.as_ref(), &config.key_hooks).await {
         close_quietly(conn).await;
         return Err(err);
      }

      let journal_mode = match configure(&mut conn, &path, mode, key.is_some(), &config).await {
         Ok(journal_mode) => journal_mode,
         Err(err) => {
            close_quietly(conn).await;
            return Err(err);
         }
      };

      let raw = {
         let mut handle = conn
            .lock_handle()
            .await
            .map_err(|e| Error::from_sqlx(e, "open"))?;
         RawDb::new(handle.as_raw_handle())
      };

      let wal_hook = match (mode, journal_mode.is_wal(), wal_pages) {
         (ConnectionMode::Primary, true, Some(counter)) => {
            Some(WalHookRegistration::register(raw, counter))
         }
         _ => None,
      };

      debug!(id, %mode, %journal_mode, path = %path.display(), "opened connection");

      Ok(Self {
         id,
         mode,
         path,
         journal_mode,
         statement_timeout: config.statement_timeout,
         changes: 0,
         poisoned: false,
         raw,
         statements: StatementCache::new(config.statement_cache_capacity),
         wal_hook,
         interrupt: InterruptSlot(Arc::new(Mutex::new(Some(raw)))),
         conn,
      })
   }

   pub fn id(&self) -> u64 {
      self.id
   }

   pub fn mode(&self) -> ConnectionMode {
      self.mode
   }

   pub fn is_primary(&self) -> bool {
      self.mode == ConnectionMode::Primary
   }

   /// Journal mode the engine actually uses for this connection.
   pub fn journal_mode(&self) -> JournalMode {
      self.journal_mode
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// A handle that can cancel statements running on this connection.
   pub fn interrupt_handle(&self) -> InterruptHandle {
      InterruptHandle {
         db: Arc::clone(&self.interrupt.0),
      }
   }

   /// Limit how long a single execute or window fill may run.
   pub fn set_statement_timeout(&mut self, timeout: Option<Duration>) {
      self.statement_timeout = timeout;
   }

   pub fn statement_timeout(&self) -> Option<Duration> {
      self.statement_timeout
   }

   pub fn statement_cache_stats(&self) -> StatementCacheStats {
      self.statements.stats()
   }

   pub fn statement_cache_capacity(&self) -> usize {
      self.statements.capacity()
   }

   /// SQL texts currently cached, least recently used first.
   pub fn cached_statements(&self) -> Vec<String> {
      self.statements.keys().map(str::to_owned).collect()
   }

   /// Rows changed through this connection since the last call.
   pub fn take_changes(&mut self) -> u64 {
      std::mem::take(&mut self.changes)
   }

   /// True once the engine reported the file as corrupt or undecryptable.
   pub fn is_poisoned(&self) -> bool {
      self.poisoned
   }

   fn track<T>(&mut self, result: Result<T>) -> Result<T> {
      if let Err(err) = &result
         && err.poisons_connection()
      {
         warn!(id = self.id, error = %err, "connection poisoned");
         self.poisoned = true;
      }
      result
   }

   /// Run a single statement to completion through the statement cache.
   pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecuteResult> {
      let timeout = self.statement_timeout;
      let result = {
         let mut handle = self
            .conn
            .lock_handle()
            .await
            .map_err(|e| Error::from_sqlx(e, sql))?;
         let db = RawDb::new(handle.as_raw_handle());
         let before = db.total_changes();

         with_statement(db, &mut self.statements, sql, timeout, |stmt| {
            stmt.start(params)?;
            while stmt.raw.step()? == Step::Row {}
            stmt.reset();
            Ok(())
         })
         .map(|()| ExecuteResult {
            rows_affected: db.total_changes().saturating_sub(before),
            last_insert_id: db.last_insert_rowid(),
         })
      };

      let result = self.track(result)?;
      self.changes += result.rows_affected;
      if is_schema_statement(sql) {
         debug!(id = self.id, "schema statement executed; clearing statement cache");
         self.statements.invalidate_all();
      }
      trace!(id = self.id, sql, rows = result.rows_affected, "executed");
      Ok(result)
   }

   /// Run one or more `;`-separated statements without caching them.
   ///
   /// Clears the statement cache afterwards since the batch may change the schema.
   pub async fn execute_batch(&mut self, sql: &str) -> Result<u64> {
      self.reset_statements();
      let result = (&mut self.conn)
         .execute(sql)
         .await
         .map_err(|e| Error::from_sqlx(e, sql));
      self.statements.invalidate_all();

      let rows = self.track(result)?.rows_affected();
      self.changes += rows;
      Ok(rows)
   }

   /// Column names of the result of `sql`.
   pub async fn columns(&mut self, sql: &str) -> Result<Vec<String>> {
      let result = {
         let mut handle = self
            .conn
            .lock_handle()
            .await
            .map_err(|e| Error::from_sqlx(e, sql))?;
         let db = RawDb::new(handle.as_raw_handle());
         with_statement(db, &mut self.statements, sql, None, |stmt| {
            Ok(stmt.raw.column_names())
         })
      };
      self.track(result)
   }

   /// Fill `window` with rows of `sql` starting at absolute row `start_row`.
   ///
   /// Continues the running query when the previous fill of the same SQL and
   /// parameters stopped at or before `start_row`; otherwise restarts it and
   /// skips ahead. Returns the number of rows committed, which is 0 once
   /// `start_row` is past the end of the result. On error the window is not
   /// modified.
   pub async fn fill_window(
      &mut self,
      sql: &str,
      params: &[Value],
      window: &mut CursorWindow,
      start_row: usize,
   ) -> Result<usize> {
      self
         .fill(sql, params, window, start_row, false)
         .await
         .map(|outcome| outcome.filled_rows)
   }

   /// Like [`Self::fill_window`], then keep stepping to count every row of the result.
   pub async fn fill_window_counting(
      &mut self,
      sql: &str,
      params: &[Value],
      window: &mut CursorWindow,
      start_row: usize,
   ) -> Result<FillOutcome> {
      self.fill(sql, params, window, start_row, true).await
   }

   async fn fill(
      &mut self,
      sql: &str,
      params: &[Value],
      window: &mut CursorWindow,
      start_row: usize,
      count_all: bool,
   ) -> Result<FillOutcome> {
      let timeout = self.statement_timeout;
      let result = {
         let mut handle = self
            .conn
            .lock_handle()
            .await
            .map_err(|e| Error::from_sqlx(e, sql))?;
         let db = RawDb::new(handle.as_raw_handle());
         with_statement(db, &mut self.statements, sql, timeout, |stmt| {
            fill_from_statement(stmt, params, &mut *window, start_row, count_all)
         })
      };

      let outcome = self.track(result)?;
      trace!(
         id = self.id,
         sql,
         start_row,
         filled = outcome.filled_rows,
         total = ?outcome.total_rows,
         "filled window"
      );
      Ok(outcome)
   }

   /// True while a transaction begun on this connection is still open.
   pub fn in_transaction(&self) -> bool {
      !self.raw.is_autocommit()
   }

   /// Roll back a transaction the last borrower left open.
   ///
   /// Runs synchronously so the pool can call it when a connection is returned.
   pub(crate) fn rollback_abandoned(&mut self) {
      if self.raw.is_autocommit() {
         return;
      }
      self.reset_statements();
      let result = self
         .raw
         .prepare("ROLLBACK")
         .and_then(|mut stmt| stmt.step().map(drop));
      match result {
         Ok(()) => debug!(id = self.id, "rolled back abandoned transaction"),
         Err(err) => {
            warn!(id = self.id, code = err.code, message = %err.message, "rollback of abandoned transaction failed");
            self.poisoned = true;
         }
      }
   }

   /// Reset every statement with an open query so it stops holding a read snapshot.
   pub fn reset_statements(&mut self) {
      for stmt in self.statements.values_mut() {
         if stmt.bound.is_some() {
            stmt.reset();
         }
      }
   }

   /// Drop every cached statement. The next use of any SQL recompiles it.
   pub fn clear_statement_cache(&mut self) {
      self.statements.invalidate_all();
   }

   pub(crate) async fn wal_checkpoint(&mut self, mode: CheckpointMode) -> Result<WalCheckpoint> {
      self.reset_statements();
      let sql = format!("PRAGMA wal_checkpoint({})", mode.as_str());
      let row = fetch_row(&mut self.conn, &sql).await?;
      let column = |index: usize| row.try_get::<i64, _>(index).map_err(|e| Error::from_sqlx(e, &sql));

      Ok(WalCheckpoint {
         busy: column(0)? != 0,
         log_frames: column(1)?,
         checkpointed_frames: column(2)?,
      })
   }

   /// Release as much of this connection's page cache as possible.
   pub async fn release_memory(&mut self) -> Result<i32> {
      let mut handle = self
         .conn
         .lock_handle()
         .await
         .map_err(|e| Error::from_sqlx(e, "release_memory"))?;
      Ok(RawDb::new(handle.as_raw_handle()).release_memory())
   }

   /// Finalize every statement, then close the native handle.
   pub async fn close(self) -> Result<()> {
      let Self {
         id,
         statements,
         wal_hook,
         interrupt,
         conn,
         ..
      } = self;

      drop(statements);
      drop(wal_hook);
      drop(interrupt);
      conn.close().await.map_err(|e| Error::from_sqlx(e, "close"))?;
      debug!(id, "closed connection");
      Ok(())
   }
}

impl fmt::Debug for Connection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("Connection")
         .field("id", &self.id)
         .field("mode", &self.mode)
         .field("journal_mode", &self.journal_mode)
         .field("cached_statements", &self.statements.len())
         .finish_non_exhaustive()
   }
}

/// Run `op` on the cached statement for `sql`.
///
/// A schema-changed signal clears the whole cache and retries once with a
/// freshly compiled statement. An interrupt becomes `StatementTimeout` when
/// the deadline fired, `Cancelled` otherwise.
fn with_statement<T>(
   db: RawDb,
   cache: &mut StatementCache<PreparedStatement>,
   sql: &str,
   timeout: Option<Duration>,
   mut op: impl FnMut(&mut PreparedStatement) -> std::result::Result<T, OpError>,
) -> Result<T> {
   let deadline = timeout.map(|t| ProgressGuard::install(db, Instant::now() + t));
   let mut recompiled = false;

   loop {
      let attempt = cache
         .get_or_insert_with(sql, |sql| db.prepare(sql).map(PreparedStatement::new))
         .map_err(OpError::Engine)
         .and_then(|stmt| {
            let result = op(&mut *stmt);
            if result.is_err() {
               stmt.reset();
            }
            result
         });

      let err = match attempt {
         Ok(value) => return Ok(value),
         Err(OpError::Window(err)) => return Err(Error::Window(err)),
         Err(OpError::Engine(err)) => err,
      };

      if err.is_schema_change() && !recompiled {
         debug!(sql, "schema changed; recompiling statements");
         cache.invalidate_all();
         recompiled = true;
         continue;
      }

      if err.is_interrupt() {
         return Err(match (&deadline, timeout) {
            (Some(guard), Some(timeout)) if guard.expired() => Error::StatementTimeout {
               timeout,
               sql: sql.to_owned(),
            },
            _ => Error::Cancelled {
               sql: sql.to_owned(),
            },
         });
      }

      return Err(err.into_error(sql));
   }
}

fn fill_from_statement(
   stmt: &mut PreparedStatement,
   params: &[Value],
   window: &mut CursorWindow,
   start_row: usize,
   count_all: bool,
) -> std::result::Result<FillOutcome, OpError> {
   if !stmt.can_resume(params, start_row) {
      stmt.start(params)?;
   }

   // A carried-over row before start_row is no longer wanted
   if stmt.pending.is_some() && stmt.position - 1 < start_row {
      stmt.pending = None;
   }
   while stmt.position < start_row && !stmt.exhausted {
      match stmt.raw.step()? {
         Step::Row => stmt.position += 1,
         Step::Done => stmt.exhausted = true,
      }
   }

   let mut columns = stmt.raw.column_count();
   let mut pass = window.begin_fill(start_row, columns);

   if let Some(row) = stmt.pending.take() {
      let cells: Vec<ValueRef<'_>> = row.iter().map(Value::as_ref).collect();
      pass.push_row(&cells)?;
   }

   while !stmt.exhausted {
      match stmt.raw.step()? {
         Step::Done => stmt.exhausted = true,
         Step::Row => {
            stmt.position += 1;
            let width = stmt.raw.column_count();
            if width != columns && pass.num_rows() == 0 {
               // The engine recompiled the statement on its first step
               columns = width;
               drop(pass);
               pass = window.begin_fill(start_row, columns);
            }
            let cells: Vec<ValueRef<'_>> = (0..columns).map(|i| stmt.raw.column(i)).collect();
            if !pass.push_row(&cells)? {
               stmt.pending = Some(cells.iter().map(ValueRef::to_owned_value).collect());
               break;
            }
         }
      }
   }

   let filled_rows = pass.commit();

   let total_rows = if count_all {
      while !stmt.exhausted {
         match stmt.raw.step()? {
            Step::Row => stmt.position += 1,
            Step::Done => stmt.exhausted = true,
         }
      }
      stmt.pending = None;
      Some(stmt.position)
   } else {
      None
   };

   Ok(FillOutcome {
      filled_rows,
      total_rows,
   })
}

/// Whether `sql` starts with a keyword that changes the schema.
fn is_schema_statement(sql: &str) -> bool {
   let keyword: String = sql
      .trim_start()
      .chars()
      .take_while(char::is_ascii_alphabetic)
      .collect();
   matches!(
      keyword.to_ascii_uppercase().as_str(),
      "CREATE" | "DROP" | "ALTER"
   )
}

// Engine access below goes through `Executor` methods so every future stays `Send`.

async fn run_sql(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
   (&mut *conn)
      .execute(sql)
      .await
      .map_err(|e| Error::from_sqlx(e, sql))?;
   Ok(())
}

async fn fetch_row(conn: &mut SqliteConnection, sql: &str) -> Result<SqliteRow> {
   (&mut *conn)
      .fetch_one(sql)
      .await
      .map_err(|e| Error::from_sqlx(e, sql))
}

async fn fetch_text(conn: &mut SqliteConnection, sql: &str) -> Result<String> {
   fetch_row(conn, sql)
      .await?
      .try_get::<String, _>(0)
      .map_err(|e| Error::from_sqlx(e, sql))
}

/// Fail unless the engine can encrypt. Plain SQLite ignores `PRAGMA key`.
async fn ensure_cipher_support(conn: &mut SqliteConnection, path: &Path) -> Result<()> {
   let version = (&mut *conn)
      .fetch_optional(CIPHER_VERSION_SQL)
      .await
      .map_err(|e| Error::from_sqlx(e, CIPHER_VERSION_SQL))?
      .and_then(|row| row.try_get::<String, _>(0).ok())
      .filter(|version| !version.is_empty());

   match version {
      Some(version) => {
         trace!(%version, "cipher support detected");
         Ok(())
      }
      None => {
         warn!(path = %path.display(), "key given but engine has no encryption support");
         Err(Error::EncryptionUnsupported {
            path: path.to_path_buf(),
         })
      }
   }
}

/// Apply key hooks and the key, then prove the key by reading the schema.
async fn apply_key(
   conn: &mut SqliteConnection,
   path: &Path,
   key: Option<&KeyMaterial>,
   hooks: &KeyHooks,
) -> Result<()> {
   for sql in &hooks.pre_key {
      run_sql(conn, sql).await?;
   }

   if let Some(key) = key {
      ensure_cipher_support(conn, path).await?;
      let pragma = format!("PRAGMA key = {}", key.pragma_value());
      (&mut *conn)
         .execute(pragma.as_str())
         .await
         .map_err(|e| Error::from_sqlx(e, "PRAGMA key"))?;
   }

   for sql in &hooks.post_key {
      run_sql(conn, sql).await?;
   }

   match (&mut *conn).fetch_one(KEY_CHECK_SQL).await {
      Ok(_) => Ok(()),
      Err(err) => {
         let not_a_database = err
            .as_database_error()
            .and_then(|db_err| db_err.code())
            .and_then(|code| code.parse::<i32>().ok())
            .is_some_and(|code| code & 0xff == libsqlite3_sys::SQLITE_NOTADB);

         if not_a_database {
            warn!(path = %path.display(), "key check failed");
            Err(Error::Key {
               path: path.to_path_buf(),
            })
         } else {
            Err(Error::from_sqlx(err, KEY_CHECK_SQL))
         }
      }
   }
}

/// Apply the open configuration and return the effective journal mode.
async fn configure(
   conn: &mut SqliteConnection,
   path: &Path,
   mode: ConnectionMode,
   encrypted: bool,
   config: &PoolConfig,
) -> Result<JournalMode> {
   if mode == ConnectionMode::ReadOnly {
      let current = fetch_text(conn, "PRAGMA journal_mode").await?;
      return Ok(current.parse().unwrap_or(JournalMode::Delete));
   }

   // Only takes effect while the file is still empty. Encrypted files take
   // their page size from `cipher_page_size`, settable through key hooks.
   if !encrypted {
      let page_size = config.page_size.unwrap_or_else(|| default_page_size(path));
      run_sql(conn, &format!("PRAGMA page_size = {page_size}")).await?;
   }
   run_sql(
      conn,
      &format!("PRAGMA journal_size_limit = {}", config.journal_size_limit),
   )
   .await?;

   let sql = format!("PRAGMA journal_mode = {}", config.journal_mode.as_str());
   let reported = fetch_text(conn, &sql).await?;
   let journal_mode = reported.parse().unwrap_or(config.journal_mode);
   if journal_mode != config.journal_mode {
      warn!(
         requested = %config.journal_mode,
         actual = %journal_mode,
         "engine did not accept requested journal mode"
      );
   }

   let synchronous = config.synchronous_for(journal_mode);
   run_sql(conn, &format!("PRAGMA synchronous = {}", synchronous.as_str())).await?;

   Ok(journal_mode)
}

async fn close_quietly(conn: SqliteConnection) {
   if let Err(err) = conn.close().await {
      warn!(error = %err, "failed to close connection after open error");
   }
}
