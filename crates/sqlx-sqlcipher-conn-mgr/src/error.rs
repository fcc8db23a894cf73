//! Error types for sqlx-sqlcipher-conn-mgr

use std::path::PathBuf;
use std::time::Duration;

use libsqlite3_sys as ffi;
use sqlcipher_window::WindowError;
use thiserror::Error;

use crate::pool::AccessMode;

/// Errors that may occur when working with sqlx-sqlcipher-conn-mgr
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library that does not map to a more specific variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// Cursor window failure (row too large, out of range, type mismatch)
   #[error("Window error: {0}")]
   Window(#[from] WindowError),

   /// Pool has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// The key is wrong, or the file is encrypted and no key was given
   #[error("Wrong or missing encryption key for {path}")]
   Key { path: PathBuf },

   /// A key was given but the linked engine was built without encryption
   #[error("Encryption is not supported by the linked SQLite engine (database: {path})")]
   EncryptionUnsupported { path: PathBuf },

   /// The database file is corrupt or is not a database
   #[error("Database file is corrupt: {message}")]
   Corrupt { message: String },

   /// A lock held by another connection did not clear within the busy timeout
   #[error("Database is busy: {message} (sql: {sql})")]
   Busy {
      code: i32,
      message: String,
      sql: String,
   },

   /// No connection became free within the acquire timeout
   #[error("Timed out after {timeout:?} waiting for a {mode} connection")]
   AcquireTimeout { mode: AccessMode, timeout: Duration },

   /// A statement ran past its time limit and was aborted
   #[error("Statement exceeded its {timeout:?} limit (sql: {sql})")]
   StatementTimeout { timeout: Duration, sql: String },

   /// The disk is full
   #[error("Disk full: {message} (sql: {sql})")]
   DiskFull { message: String, sql: String },

   /// The engine failed to read or write the database files
   #[error("Disk I/O error {code}: {message} (sql: {sql})")]
   IoFailure {
      code: i32,
      message: String,
      sql: String,
   },

   /// The statement was interrupted through an `InterruptHandle`
   #[error("Statement was cancelled (sql: {sql})")]
   Cancelled { sql: String },

   /// The schema changed under a prepared statement and recompiling did not help
   #[error("Schema changed while running statement (sql: {sql})")]
   SchemaChanged { sql: String },

   /// Any other engine error
   #[error("SQLite error {code}: {message} (sql: {sql})")]
   Engine {
      code: i32,
      message: String,
      sql: String,
   },
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Broad outcome class of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
   /// Retrying the whole operation may succeed
   Recoverable,
   /// Needs a different key, a repaired file, or a code fix
   Fatal,
}

impl Error {
   /// Map an engine result code and message to the matching variant.
   pub fn from_engine(code: i32, message: impl Into<String>, sql: impl Into<String>) -> Self {
      let message = message.into();
      let sql = sql.into();
      match code & 0xff {
         ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => Error::Busy { code, message, sql },
         ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB => Error::Corrupt { message },
         ffi::SQLITE_FULL => Error::DiskFull { message, sql },
         ffi::SQLITE_IOERR | ffi::SQLITE_CANTOPEN => Error::IoFailure { code, message, sql },
         ffi::SQLITE_SCHEMA => Error::SchemaChanged { sql },
         ffi::SQLITE_INTERRUPT => Error::Cancelled { sql },
         _ => Error::Engine { code, message, sql },
      }
   }

   /// Classify a sqlx error raised while running `sql`.
   pub fn from_sqlx(err: sqlx::Error, sql: &str) -> Self {
      let code = err
         .as_database_error()
         .and_then(|db_err| db_err.code())
         .and_then(|code| code.parse::<i32>().ok());

      match (code, &err) {
         (Some(code), sqlx::Error::Database(db_err)) => {
            Error::from_engine(code, db_err.message().to_string(), sql)
         }
         _ => Error::Sqlx(err),
      }
   }

   /// The engine result code carried by this error, if any.
   pub fn engine_code(&self) -> Option<i32> {
      match self {
         Error::Busy { code, .. } | Error::IoFailure { code, .. } | Error::Engine { code, .. } => {
            Some(*code)
         }
         Error::Corrupt { .. } => Some(ffi::SQLITE_CORRUPT),
         Error::DiskFull { .. } => Some(ffi::SQLITE_FULL),
         Error::SchemaChanged { .. } => Some(ffi::SQLITE_SCHEMA),
         Error::Cancelled { .. } => Some(ffi::SQLITE_INTERRUPT),
         _ => None,
      }
   }

   pub fn class(&self) -> ErrorClass {
      match self {
         Error::Busy { .. }
         | Error::AcquireTimeout { .. }
         | Error::StatementTimeout { .. }
         | Error::DiskFull { .. }
         | Error::IoFailure { .. }
         | Error::Io(_)
         | Error::SchemaChanged { .. }
         | Error::Cancelled { .. }
         | Error::Window(WindowError::OutOfRange { .. }) => ErrorClass::Recoverable,
         _ => ErrorClass::Fatal,
      }
   }

   pub fn is_retryable(&self) -> bool {
      self.class() == ErrorClass::Recoverable
   }

   /// True when the native handle that produced this error should not be reused.
   pub fn poisons_connection(&self) -> bool {
      matches!(self, Error::Corrupt { .. } | Error::Key { .. })
   }

   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Window(WindowError::RowTooLarge { .. }) => "ROW_TOO_LARGE".to_string(),
         Error::Window(WindowError::OutOfRange { .. }) => "OUT_OF_RANGE".to_string(),
         Error::Window(_) => "WINDOW_ERROR".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::Key { .. } => "KEY_ERROR".to_string(),
         Error::EncryptionUnsupported { .. } => "ENCRYPTION_UNSUPPORTED".to_string(),
         Error::Corrupt { .. } => "CORRUPT".to_string(),
         Error::Busy { .. } => "BUSY".to_string(),
         Error::AcquireTimeout { .. } => "ACQUIRE_TIMEOUT".to_string(),
         Error::StatementTimeout { .. } => "STATEMENT_TIMEOUT".to_string(),
         Error::DiskFull { .. } => "DISK_FULL".to_string(),
         Error::IoFailure { code, .. } => format!("SQLITE_{}", code),
         Error::Cancelled { .. } => "CANCELLED".to_string(),
         Error::SchemaChanged { .. } => "SCHEMA_CHANGED".to_string(),
         Error::Engine { code, .. } => format!("SQLITE_{}", code),
      }
   }
}
