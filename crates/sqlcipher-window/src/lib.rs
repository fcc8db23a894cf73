//! # sqlcipher-window
//!
//! A fixed-capacity buffer holding a contiguous slice of a query's result
//! rows, addressable by absolute row index and zero-based column.
//!
//! ## Core Types
//!
//! - **[`CursorWindow`]**: The bounded row buffer
//! - **[`FillPass`]**: Staged writer used while a connection streams rows in
//! - **[`Value`] / [`ValueRef`]**: Owned and borrowed cell values
//! - **[`WindowError`]**: Error type for window operations
//!
//! ## Memory Accounting
//!
//! Every row costs [`ROW_SLOT_BYTES`], every cell [`CELL_SLOT_BYTES`], and
//! text/blob cells add their payload length. A fill stops at the first row
//! that would push the total past the window capacity, so rows are never
//! split between fills.

mod error;
mod value;
mod window;

pub use error::{Result, WindowError};
pub use value::{CellType, Value, ValueRef};
pub use window::{
   CELL_SLOT_BYTES, CursorWindow, DEFAULT_WINDOW_CAPACITY, FillPass, ROW_SLOT_BYTES, row_footprint,
};
