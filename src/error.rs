use sqlcipher_window::WindowError;
use sqlx_sqlcipher_conn_mgr::ErrorClass;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the connection manager.
   #[error(transparent)]
   ConnectionManager(#[from] sqlx_sqlcipher_conn_mgr::Error),

   /// Error reading a cell out of a cursor window.
   #[error(transparent)]
   Window(#[from] WindowError),

   /// Malformed configuration or row JSON.
   #[error("json error: {0}")]
   Json(#[from] serde_json::Error),

   /// I/O error when reading configuration files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Cell that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Multiple rows returned from a fetch_one query.
   #[error("fetch_one() query returned {0} rows, expected 0 or 1")]
   MultipleRowsReturned(usize),

   /// Transaction failed and rollback also failed.
   #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// No database is loaded under this name.
   #[error("database not loaded: {0}")]
   DatabaseNotLoaded(String),

   /// Cursor is not positioned on a row.
   #[error("cursor is not positioned on a row (position {position:?}, count {count})")]
   NoCurrentRow {
      position: Option<usize>,
      count: usize,
   },

   /// Column name not present in the result set.
   #[error("no column named '{0}'")]
   UnknownColumn(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::ConnectionManager(e) => e.error_code(),
         Error::Window(WindowError::RowTooLarge { .. }) => "ROW_TOO_LARGE".to_string(),
         Error::Window(WindowError::OutOfRange { .. }) => "OUT_OF_RANGE".to_string(),
         Error::Window(_) => "WINDOW_ERROR".to_string(),
         Error::Json(_) => "JSON_ERROR".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::MultipleRowsReturned(_) => "MULTIPLE_ROWS_RETURNED".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::DatabaseNotLoaded(_) => "DATABASE_NOT_LOADED".to_string(),
         Error::NoCurrentRow { .. } => "NO_CURRENT_ROW".to_string(),
         Error::UnknownColumn(_) => "UNKNOWN_COLUMN".to_string(),
      }
   }

   /// Whether retrying the operation may succeed.
   pub fn class(&self) -> ErrorClass {
      match self {
         Error::ConnectionManager(e) => e.class(),
         Error::Io(_) => ErrorClass::Recoverable,
         _ => ErrorClass::Fatal,
      }
   }
}
