//! Connection pool: one primary read-write connection plus read-only connections under WAL

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::checkpoint::{CheckpointCoordinator, CheckpointOutcome};
use crate::config::{CheckpointMode, JournalMode, KeyMaterial, PoolConfig};
use crate::connection::{Connection, ConnectionMode, OpenOptions};
use crate::error::{Error, Result};

/// What a caller intends to do with an acquired connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
   Read,
   Write,
}

impl fmt::Display for AccessMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         AccessMode::Read => f.write_str("read"),
         AccessMode::Write => f.write_str("write"),
      }
   }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
   pub wal_active: bool,
   pub read_pool_size: usize,
   /// Read-only connections currently open, idle or lent out
   pub open_readers: usize,
   pub idle_readers: usize,
   pub primary_in_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
   Primary,
   Reader,
}

#[derive(Debug, Default)]
struct IdleConnections {
   primary: Option<Connection>,
   readers: Vec<Connection>,
}

/// Pool of connections to one encrypted database file.
///
/// ## Architecture
///
/// - **Primary**: exactly one read-write connection, lent to one caller at a time.
///   Every write goes through it.
/// - **Readers**: up to `read_pool_size` read-only connections, opened lazily and
///   only when the effective journal mode is WAL. Without WAL, reads borrow the
///   primary.
/// - **Checkpoints**: releasing the primary through [`ConnectionPool::release`]
///   runs the [`CheckpointCoordinator`].
///
/// Acquiring waits up to a timeout for a free connection. After
/// [`ConnectionPool::close`] every acquire fails with [`Error::DatabaseClosed`].
pub struct ConnectionPool {
   path: PathBuf,
   key: Option<KeyMaterial>,
   config: PoolConfig,
   journal_mode: JournalMode,
   read_pool_size: usize,
   primary_permits: Arc<Semaphore>,
   reader_permits: Arc<Semaphore>,
   idle: Mutex<IdleConnections>,
   open_readers: AtomicUsize,
   checkpoints: CheckpointCoordinator,
   closed: AtomicBool,
   /// Held for the whole shutdown; `true` once every connection is closed
   shutdown: AsyncMutex<bool>,
   next_id: AtomicU64,
}

impl ConnectionPool {
   /// Open the primary connection and build a pool around it.
   ///
   /// Creates the file (and its parent directory) if missing, applies the key,
   /// and fails with [`Error::Key`] if the key does not decrypt the file.
   pub async fn open(
      path: impl AsRef<Path>,
      key: Option<KeyMaterial>,
      config: PoolConfig,
   ) -> Result<Arc<Self>> {
      let path = path.as_ref().to_path_buf();
      let config = config.validated();

      if let Some(parent) = path.parent()
         && !parent.as_os_str().is_empty()
      {
         tokio::fs::create_dir_all(parent).await?;
      }

      let checkpoints = CheckpointCoordinator::new(config.wal_autocheckpoint, config.checkpoint_mode);
      let primary = Connection::open(OpenOptions {
         id: 0,
         path: path.clone(),
         mode: ConnectionMode::Primary,
         key: key.clone(),
         config: config.clone(),
         wal_pages: Some(checkpoints.page_counter()),
      })
      .await?;

      let journal_mode = primary.journal_mode();
      let read_pool_size = if journal_mode.is_wal() {
         config.read_pool_size as usize
      } else {
         0
      };

      debug!(
         path = %path.display(),
         %journal_mode,
         read_pool_size,
         "opened connection pool"
      );

      Ok(Arc::new(Self {
         path,
         key,
         journal_mode,
         read_pool_size,
         primary_permits: Arc::new(Semaphore::new(1)),
         reader_permits: Arc::new(Semaphore::new(read_pool_size)),
         idle: Mutex::new(IdleConnections {
            primary: Some(primary),
            readers: Vec::with_capacity(read_pool_size),
         }),
         open_readers: AtomicUsize::new(0),
         checkpoints,
         closed: AtomicBool::new(false),
         shutdown: AsyncMutex::new(false),
         next_id: AtomicU64::new(1),
         config,
      }))
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn config(&self) -> &PoolConfig {
      &self.config
   }

   /// Journal mode the engine accepted for the primary connection.
   pub fn journal_mode(&self) -> JournalMode {
      self.journal_mode
   }

   /// Whether read-only connections are pooled.
   pub fn wal_active(&self) -> bool {
      self.journal_mode.is_wal()
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   pub fn checkpoint_coordinator(&self) -> &CheckpointCoordinator {
      &self.checkpoints
   }

   pub fn stats(&self) -> PoolStats {
      let idle = self.idle.lock();
      PoolStats {
         wal_active: self.wal_active(),
         read_pool_size: self.read_pool_size,
         open_readers: self.open_readers.load(Ordering::SeqCst),
         idle_readers: idle.readers.len(),
         primary_in_use: self.primary_permits.available_permits() == 0,
      }
   }

   fn ensure_open(&self) -> Result<()> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }

   /// Borrow the primary connection, waiting up to the configured acquire timeout.
   pub async fn acquire_writer(self: &Arc<Self>) -> Result<PooledConnection> {
      self.acquire(AccessMode::Write, self.config.acquire_timeout).await
   }

   /// Borrow a read connection, waiting up to the configured acquire timeout.
   pub async fn acquire_reader(self: &Arc<Self>) -> Result<PooledConnection> {
      self.acquire(AccessMode::Read, self.config.acquire_timeout).await
   }

   /// Borrow a connection for `mode` within `timeout`.
   ///
   /// The deadline covers both waiting for a free connection and opening one.
   /// Reads get a read-only connection under WAL and the primary otherwise.
   pub async fn acquire(self: &Arc<Self>, mode: AccessMode, timeout: Duration) -> Result<PooledConnection> {
      self.ensure_open()?;

      match tokio::time::timeout(timeout, self.acquire_within_deadline(mode)).await {
         Ok(result) => result,
         Err(_) => {
            debug!(%mode, ?timeout, "timed out acquiring connection");
            Err(Error::AcquireTimeout { mode, timeout })
         }
      }
   }

   async fn acquire_within_deadline(self: &Arc<Self>, mode: AccessMode) -> Result<PooledConnection> {
      let slot = match mode {
         AccessMode::Read if self.wal_active() => Slot::Reader,
         _ => Slot::Primary,
      };
      let permits = match slot {
         Slot::Primary => &self.primary_permits,
         Slot::Reader => &self.reader_permits,
      };

      let permit = Arc::clone(permits)
         .acquire_owned()
         .await
         .map_err(|_| Error::DatabaseClosed)?;

      // The pool may have closed while we waited
      self.ensure_open()?;

      let idle = {
         let mut idle = self.idle.lock();
         match slot {
            Slot::Primary => idle.primary.take(),
            Slot::Reader => idle.readers.pop(),
         }
      };

      // Dropping this future on timeout releases the permit with it
      let conn = match idle {
         Some(conn) => conn,
         None => self.open_connection(slot).await?,
      };

      Ok(PooledConnection {
         conn: Some(conn),
         slot,
         access: mode,
         pool: Arc::clone(self),
         _permit: permit,
      })
   }

   async fn open_connection(&self, slot: Slot) -> Result<Connection> {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      let (mode, wal_pages) = match slot {
         Slot::Primary => (ConnectionMode::Primary, Some(self.checkpoints.page_counter())),
         Slot::Reader => (ConnectionMode::ReadOnly, None),
      };

      let conn = Connection::open(OpenOptions {
         id,
         path: self.path.clone(),
         mode,
         key: self.key.clone(),
         config: self.config.clone(),
         wal_pages,
      })
      .await?;

      if slot == Slot::Reader {
         self.open_readers.fetch_add(1, Ordering::SeqCst);
      }
      Ok(conn)
   }

   /// Return a connection and, for the primary, checkpoint if the WAL has grown
   /// past the threshold.
   ///
   /// Dropping a [`PooledConnection`] also returns it, without the checkpoint.
   pub async fn release(&self, mut conn: PooledConnection) -> Result<CheckpointOutcome> {
      let pages = self.checkpoints.wal_pages();
      if conn.slot != Slot::Primary || !self.wal_active() || conn.is_poisoned() {
         return Ok(CheckpointOutcome::NotNeeded { pages });
      }

      let outcome = self.checkpoints.maybe_checkpoint(&mut conn).await;
      drop(conn);
      outcome
   }

   /// Checkpoint now through the primary connection.
   pub async fn checkpoint(self: &Arc<Self>, mode: CheckpointMode) -> Result<CheckpointOutcome> {
      let mut conn = self.acquire_writer().await?;
      self.checkpoints.checkpoint(&mut conn, mode).await
   }

   /// Ask the engine to free unused heap memory. Returns bytes released.
   pub fn release_memory(&self) -> i32 {
      crate::ffi::release_memory(i32::MAX)
   }

   /// Close every connection.
   ///
   /// Waits for borrowed connections to come back, then closes them. Further
   /// acquires fail with [`Error::DatabaseClosed`]. A concurrent or repeated
   /// call waits until the first one has finished and then returns `Ok`.
   pub async fn close(&self) -> Result<()> {
      self.closed.store(true, Ordering::SeqCst);

      let mut finished = self.shutdown.lock().await;
      if *finished {
         return Ok(());
      }

      // Holding every permit means every connection is idle
      let primary_permit = self.primary_permits.acquire_many(1).await;
      let reader_permits = self
         .reader_permits
         .acquire_many(self.read_pool_size as u32)
         .await;

      let IdleConnections { primary, readers } = std::mem::take(&mut *self.idle.lock());

      let mut first_error = None;
      for conn in readers.into_iter().chain(primary) {
         if conn.mode() == ConnectionMode::ReadOnly {
            self.open_readers.fetch_sub(1, Ordering::SeqCst);
         }
         if let Err(err) = conn.close().await {
            warn!(error = %err, "failed to close connection");
            first_error.get_or_insert(err);
         }
      }

      self.primary_permits.close();
      self.reader_permits.close();
      drop(primary_permit);
      drop(reader_permits);
      *finished = true;

      debug!(path = %self.path.display(), "closed connection pool");
      first_error.map_or(Ok(()), Err)
   }

   /// Close the pool and delete the database file with its WAL and shared-memory files.
   pub async fn remove(&self) -> Result<()> {
      self.close().await?;

      for path in database_files(&self.path) {
         match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed database file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
         }
      }
      Ok(())
   }

   fn give_back(&self, slot: Slot, mut conn: Connection) {
      conn.rollback_abandoned();
      if conn.is_poisoned() {
         warn!(id = conn.id(), "discarding poisoned connection");
         if slot == Slot::Reader {
            self.open_readers.fetch_sub(1, Ordering::SeqCst);
         }
         return;
      }

      conn.reset_statements();
      let mut idle = self.idle.lock();
      match slot {
         Slot::Primary => idle.primary = Some(conn),
         Slot::Reader => idle.readers.push(conn),
      }
   }
}

impl fmt::Debug for ConnectionPool {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ConnectionPool")
         .field("path", &self.path)
         .field("journal_mode", &self.journal_mode)
         .field("read_pool_size", &self.read_pool_size)
         .field("closed", &self.is_closed())
         .finish_non_exhaustive()
   }
}

/// The database file plus the `-wal` and `-shm` files next to it.
fn database_files(path: &Path) -> [PathBuf; 3] {
   let with_suffix = |suffix: &str| {
      let mut name = path.as_os_str().to_owned();
      name.push(suffix);
      PathBuf::from(name)
   };
   [path.to_path_buf(), with_suffix("-wal"), with_suffix("-shm")]
}

/// A connection borrowed from a [`ConnectionPool`].
///
/// Returns to the pool when dropped. Active queries are reset on return; a
/// connection that reported corruption or a key failure is closed instead.
pub struct PooledConnection {
   conn: Option<Connection>,
   slot: Slot,
   access: AccessMode,
   pool: Arc<ConnectionPool>,
   _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
   /// The access mode this connection was acquired for.
   pub fn access_mode(&self) -> AccessMode {
      self.access
   }

   pub fn pool(&self) -> &Arc<ConnectionPool> {
      &self.pool
   }
}

impl Deref for PooledConnection {
   type Target = Connection;

   fn deref(&self) -> &Connection {
      // conn is only taken in Drop
      match &self.conn {
         Some(conn) => conn,
         None => unreachable!("pooled connection used after release"),
      }
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Connection {
      match &mut self.conn {
         Some(conn) => conn,
         None => unreachable!("pooled connection used after release"),
      }
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         self.pool.give_back(self.slot, conn);
      }
   }
}

impl fmt::Debug for PooledConnection {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PooledConnection")
         .field("access", &self.access)
         .field("conn", &self.conn)
         .finish()
   }
}
