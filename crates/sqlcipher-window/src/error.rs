//! Error types for sqlcipher-window

use thiserror::Error;

use crate::CellType;

/// Errors raised while filling or reading a cursor window
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
   /// A single row needs more bytes than the whole window can hold.
   #[error("row needs {required} bytes but the window capacity is {capacity} bytes")]
   RowTooLarge { required: usize, capacity: usize },

   /// The requested cell is not in the currently filled range. The caller
   /// has to refill the window around `row` before reading it.
   #[error("cell ({row}, {column}) is outside the window (rows {start}..{end}, {columns} columns)")]
   OutOfRange {
      row: usize,
      column: usize,
      start: usize,
      end: usize,
      columns: usize,
   },

   /// A row was pushed with a different number of cells than the window has columns.
   #[error("row has {actual} cells but the window has {expected} columns")]
   ColumnCountMismatch { expected: usize, actual: usize },

   /// The cell cannot be converted to the requested type.
   #[error("cannot read {found} cell at ({row}, {column}) as {requested}")]
   TypeMismatch {
      row: usize,
      column: usize,
      found: CellType,
      requested: &'static str,
   },

   /// A text cell does not hold valid UTF-8.
   #[error("text cell at ({row}, {column}) is not valid UTF-8")]
   InvalidText { row: usize, column: usize },
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, WindowError>;
