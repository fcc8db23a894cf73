//! # sqlx-sqlcipher-conn-mgr
//!
//! Connection management for encrypted SQLite (SQLCipher) databases on top of SQLx.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: one primary read-write connection plus lazily opened
//!   read-only connections when the journal mode is WAL
//! - **[`PooledConnection`]**: RAII handle for a borrowed [`Connection`]
//! - **[`Connection`]**: native handle with an LRU statement cache, execute and
//!   resumable [`CursorWindow`](sqlcipher_window::CursorWindow) fills
//! - **[`CheckpointCoordinator`]**: runs WAL checkpoints when the primary is released
//! - **[`PoolConfig`]**: open-time configuration
//! - **[`Error`]**: error type for database operations
//!
//! ## Architecture
//!
//! - **Single writer**: every write goes through the primary connection, lent to
//!   one caller at a time
//! - **Concurrent reads**: under WAL, up to `read_pool_size` read-only connections
//!   serve reads in parallel; otherwise reads share the primary
//! - **Keys**: the key is applied to every connection before first use and
//!   verified by reading the schema
//! - **Windowed reads**: query results are copied page by page into fixed-capacity
//!   windows, continuing the running statement when the next page follows on
//!
//! ## Example
//!
//! ```no_run
//! use sqlx_sqlcipher_conn_mgr::{ConnectionPool, KeyMaterial, PoolConfig};
//! use sqlcipher_window::{CursorWindow, Value};
//!
//! # async fn example() -> sqlx_sqlcipher_conn_mgr::Result<()> {
//! let key = KeyMaterial::Passphrase("correct horse battery staple".into());
//! let pool = ConnectionPool::open("app.db", Some(key), PoolConfig::default()).await?;
//!
//! let mut writer = pool.acquire_writer().await?;
//! writer.execute("CREATE TABLE IF NOT EXISTS notes (body TEXT)", &[]).await?;
//! writer.execute("INSERT INTO notes VALUES (?)", &[Value::from("hello")]).await?;
//! pool.release(writer).await?;
//!
//! let mut reader = pool.acquire_reader().await?;
//! let mut window = CursorWindow::new(64 * 1024);
//! let rows = reader.fill_window("SELECT body FROM notes", &[], &mut window, 0).await?;
//! assert_eq!(rows, 1);
//! drop(reader);
//!
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```

mod checkpoint;
mod config;
mod connection;
mod error;
mod ffi;
mod pool;
mod statement_cache;

pub use checkpoint::{CheckpointCoordinator, CheckpointOutcome, CheckpointStats, DeferReason};
pub use config::{
   CheckpointMode, DEFAULT_JOURNAL_SIZE_LIMIT, DEFAULT_READ_POOL_SIZE,
   DEFAULT_STATEMENT_CACHE_CAPACITY, DEFAULT_WAL_AUTOCHECKPOINT, JournalMode, KeyHooks,
   KeyMaterial, MIN_READ_POOL_SIZE, PoolConfig, SyncMode, default_page_size,
};
pub use connection::{
   Connection, ConnectionMode, ExecuteResult, FillOutcome, InterruptHandle, WalCheckpoint,
};
pub use error::{Error, ErrorClass, Result};
pub use pool::{AccessMode, ConnectionPool, PoolStats, PooledConnection};
pub use statement_cache::StatementCacheStats;
