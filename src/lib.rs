//! Encrypted SQLite storage.
//!
//! [`Database`] wraps a connection pool with one writer and several WAL
//! readers. Results stream through fixed-size cursor windows, either all at
//! once ([`Database::fetch_all`]) or on demand through a [`Cursor`]. Committed
//! writes are announced to observers and subscribers.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlcipher_store::{Database, KeyMaterial, StoreConfig};
//!
//! # async fn example() -> sqlcipher_store::Result<()> {
//! let key = KeyMaterial::Passphrase("correct horse battery staple".into());
//! let db = Database::open("notes.db", Some(key), StoreConfig::default()).await?;
//!
//! db.execute("CREATE TABLE IF NOT EXISTS notes (body TEXT)", vec![]).await?;
//! db.execute("INSERT INTO notes (body) VALUES ($1)", vec![json!("hello")]).await?;
//!
//! let mut cursor = db.query("SELECT body FROM notes", vec![]).await?;
//! while cursor.move_to_next().await? {
//!    println!("{:?}", cursor.get_string(0)?);
//! }
//!
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod cursor;
mod database;
pub mod decode;
mod error;
mod registry;
mod transaction;

pub use config::{MIN_WINDOW_CAPACITY, StoreConfig};
pub use cursor::Cursor;
pub use database::{Database, WriteQueryResult};
pub use decode::Row;
pub use error::{Error, Result};
pub use registry::DatabaseRegistry;
pub use transaction::{Statement, Transaction};

pub use sqlcipher_window::{CellType, CursorWindow, Value, ValueRef};
pub use sqlx_sqlcipher_conn_mgr::{
   CheckpointMode, CheckpointOutcome, DeferReason, ErrorClass, JournalMode, KeyHooks, KeyMaterial,
   PoolConfig, PoolStats, SyncMode,
};
pub use sqlx_sqlcipher_observer::{
   ChangeEvent, ChangeNotice, ChangeStream, ObserverId, ObserverRegistry, Registration,
};
