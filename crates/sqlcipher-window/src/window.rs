//! The cursor window buffer

use crate::error::{Result, WindowError};
use crate::value::{CellType, ValueRef};

/// Directory overhead charged for every row in the window.
pub const ROW_SLOT_BYTES: usize = 4;

/// Directory overhead charged for every cell: a type tag plus either the
/// inline 64-bit value or the offset/length of the payload.
pub const CELL_SLOT_BYTES: usize = 16;

/// Default window capacity (2 MiB).
pub const DEFAULT_WINDOW_CAPACITY: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum CellSlot {
   Null,
   Integer(i64),
   Float(f64),
   Text { offset: usize, len: usize },
   Blob { offset: usize, len: usize },
}

#[derive(Debug, Default)]
struct Rows {
   count: usize,
   slots: Vec<CellSlot>,
   data: Vec<u8>,
}

impl Rows {
   fn used_bytes(&self) -> usize {
      self.count * ROW_SLOT_BYTES + self.slots.len() * CELL_SLOT_BYTES + self.data.len()
   }

   fn push(&mut self, cells: &[ValueRef<'_>]) {
      for cell in cells {
         let slot = match *cell {
            ValueRef::Null => CellSlot::Null,
            ValueRef::Integer(v) => CellSlot::Integer(v),
            ValueRef::Float(v) => CellSlot::Float(v),
            ValueRef::Text(bytes) => {
               let offset = self.data.len();
               self.data.extend_from_slice(bytes);
               CellSlot::Text {
                  offset,
                  len: bytes.len(),
               }
            }
            ValueRef::Blob(bytes) => {
               let offset = self.data.len();
               self.data.extend_from_slice(bytes);
               CellSlot::Blob {
                  offset,
                  len: bytes.len(),
               }
            }
         };
         self.slots.push(slot);
      }
      self.count += 1;
   }
}

/// Bytes a row occupies in a window, directory overhead included.
pub fn row_footprint(cells: &[ValueRef<'_>]) -> usize {
   ROW_SLOT_BYTES
      + cells.len() * CELL_SLOT_BYTES
      + cells.iter().map(ValueRef::payload_len).sum::<usize>()
}

/// A bounded buffer holding rows `[start_row, start_row + num_rows)` of a
/// query result.
///
/// Rows are only written through a [`FillPass`], which stages its rows and
/// replaces the window content on [`FillPass::commit`]. Between fills the
/// window is read-only. The sum of payload bytes and directory overhead
/// never exceeds [`CursorWindow::capacity`].
#[derive(Debug)]
pub struct CursorWindow {
   capacity: usize,
   start_row: usize,
   num_columns: usize,
   rows: Rows,
}

impl Default for CursorWindow {
   fn default() -> Self {
      Self::new(DEFAULT_WINDOW_CAPACITY)
   }
}

impl CursorWindow {
   /// Create an empty window that can hold `capacity` bytes of rows.
   pub fn new(capacity: usize) -> Self {
      Self {
         capacity,
         start_row: 0,
         num_columns: 0,
         rows: Rows::default(),
      }
   }

   pub fn capacity(&self) -> usize {
      self.capacity
   }

   /// Absolute index of the first row held by the window.
   pub fn start_row(&self) -> usize {
      self.start_row
   }

   pub fn num_rows(&self) -> usize {
      self.rows.count
   }

   pub fn num_columns(&self) -> usize {
      self.num_columns
   }

   /// Absolute index one past the last row held by the window.
   pub fn end_row(&self) -> usize {
      self.start_row + self.rows.count
   }

   pub fn is_empty(&self) -> bool {
      self.rows.count == 0
   }

   pub fn contains_row(&self, row: usize) -> bool {
      row >= self.start_row && row < self.end_row()
   }

   /// Bytes currently used by rows, including directory overhead.
   pub fn used_bytes(&self) -> usize {
      self.rows.used_bytes()
   }

   pub fn free_bytes(&self) -> usize {
      self.capacity.saturating_sub(self.used_bytes())
   }

   /// Discard all rows and reset the start row to zero.
   pub fn clear(&mut self) {
      self.rows = Rows::default();
      self.start_row = 0;
      self.num_columns = 0;
   }

   /// Start a fill pass for rows beginning at `start_row`.
   ///
   /// The current content stays readable until the pass commits; dropping
   /// the pass without committing leaves the window untouched.
   pub fn begin_fill(&mut self, start_row: usize, num_columns: usize) -> FillPass<'_> {
      FillPass {
         window: self,
         start_row,
         num_columns,
         staged: Rows::default(),
      }
   }

   fn slot(&self, row: usize, column: usize) -> Result<CellSlot> {
      if !self.contains_row(row) || column >= self.num_columns {
         return Err(WindowError::OutOfRange {
            row,
            column,
            start: self.start_row,
            end: self.end_row(),
            columns: self.num_columns,
         });
      }
      let index = (row - self.start_row) * self.num_columns + column;
      Ok(self.rows.slots[index])
   }

   pub fn cell_type(&self, row: usize, column: usize) -> Result<CellType> {
      self.get(row, column).map(|cell| cell.cell_type())
   }

   /// Read the raw cell at absolute `row` and zero-based `column`.
   pub fn get(&self, row: usize, column: usize) -> Result<ValueRef<'_>> {
      let cell = match self.slot(row, column)? {
         CellSlot::Null => ValueRef::Null,
         CellSlot::Integer(v) => ValueRef::Integer(v),
         CellSlot::Float(v) => ValueRef::Float(v),
         CellSlot::Text { offset, len } => ValueRef::Text(&self.rows.data[offset..offset + len]),
         CellSlot::Blob { offset, len } => ValueRef::Blob(&self.rows.data[offset..offset + len]),
      };
      Ok(cell)
   }

   pub fn is_null(&self, row: usize, column: usize) -> Result<bool> {
      Ok(matches!(self.get(row, column)?, ValueRef::Null))
   }

   /// Read a cell as an integer. Null reads as 0, floats are truncated and
   /// text is parsed (0 when it is not numeric).
   pub fn get_i64(&self, row: usize, column: usize) -> Result<i64> {
      match self.get(row, column)? {
         ValueRef::Null => Ok(0),
         ValueRef::Integer(v) => Ok(v),
         ValueRef::Float(v) => Ok(v as i64),
         ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).unwrap_or_default().trim();
            Ok(text
               .parse::<i64>()
               .or_else(|_| text.parse::<f64>().map(|f| f as i64))
               .unwrap_or(0))
         }
         ValueRef::Blob(_) => Err(WindowError::TypeMismatch {
            row,
            column,
            found: CellType::Blob,
            requested: "integer",
         }),
      }
   }

   /// Read a cell as a float with the same coercions as [`Self::get_i64`].
   pub fn get_f64(&self, row: usize, column: usize) -> Result<f64> {
      match self.get(row, column)? {
         ValueRef::Null => Ok(0.0),
         ValueRef::Integer(v) => Ok(v as f64),
         ValueRef::Float(v) => Ok(v),
         ValueRef::Text(bytes) => Ok(std::str::from_utf8(bytes)
            .unwrap_or_default()
            .trim()
            .parse::<f64>()
            .unwrap_or(0.0)),
         ValueRef::Blob(_) => Err(WindowError::TypeMismatch {
            row,
            column,
            found: CellType::Blob,
            requested: "float",
         }),
      }
   }

   /// Read a cell as text. Null reads as `None`; numbers are rendered.
   pub fn get_string(&self, row: usize, column: usize) -> Result<Option<String>> {
      match self.get(row, column)? {
         ValueRef::Null => Ok(None),
         ValueRef::Integer(v) => Ok(Some(v.to_string())),
         ValueRef::Float(v) => Ok(Some(v.to_string())),
         ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|s| Some(s.to_owned()))
            .map_err(|_| WindowError::InvalidText { row, column }),
         ValueRef::Blob(_) => Err(WindowError::TypeMismatch {
            row,
            column,
            found: CellType::Blob,
            requested: "text",
         }),
      }
   }

   /// Read a blob or text cell as bytes. Null reads as `None`.
   pub fn get_blob(&self, row: usize, column: usize) -> Result<Option<&[u8]>> {
      match self.get(row, column)? {
         ValueRef::Null => Ok(None),
         ValueRef::Blob(bytes) | ValueRef::Text(bytes) => Ok(Some(bytes)),
         other => Err(WindowError::TypeMismatch {
            row,
            column,
            found: other.cell_type(),
            requested: "blob",
         }),
      }
   }
}

/// A staged fill of a [`CursorWindow`].
#[must_use = "rows pushed into a fill pass are discarded unless it is committed"]
pub struct FillPass<'w> {
   window: &'w mut CursorWindow,
   start_row: usize,
   num_columns: usize,
   staged: Rows,
}

impl FillPass<'_> {
   /// Number of rows staged so far.
   pub fn num_rows(&self) -> usize {
      self.staged.count
   }

   /// Append a whole row.
   ///
   /// Returns `Ok(false)` when the row does not fit in the remaining space;
   /// the pass should then be committed and the row carried over to the
   /// next fill. A row that cannot fit an empty window fails with
   /// [`WindowError::RowTooLarge`] when it is the first row of the pass.
   pub fn push_row(&mut self, cells: &[ValueRef<'_>]) -> Result<bool> {
      if cells.len() != self.num_columns {
         return Err(WindowError::ColumnCountMismatch {
            expected: self.num_columns,
            actual: cells.len(),
         });
      }

      let required = row_footprint(cells);
      let capacity = self.window.capacity;
      if self.staged.used_bytes() + required > capacity {
         if self.staged.count == 0 {
            return Err(WindowError::RowTooLarge { required, capacity });
         }
         return Ok(false);
      }

      self.staged.push(cells);
      Ok(true)
   }

   /// Replace the window content with the staged rows and return how many
   /// rows were committed.
   pub fn commit(self) -> usize {
      let filled = self.staged.count;
      self.window.rows = self.staged;
      self.window.start_row = self.start_row;
      self.window.num_columns = self.num_columns;
      filled
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::value::Value;

   fn fill_rows(window: &mut CursorWindow, start: usize, rows: &[Vec<Value>]) -> Result<usize> {
      let columns = rows.first().map_or(0, Vec::len);
      let mut pass = window.begin_fill(start, columns);
      for row in rows {
         let cells: Vec<ValueRef<'_>> = row.iter().map(Value::as_ref).collect();
         if !pass.push_row(&cells)? {
            break;
         }
      }
      Ok(pass.commit())
   }

   fn text_row(id: i64, text: &str) -> Vec<Value> {
      vec![Value::Integer(id), Value::Text(text.to_owned())]
   }

   #[test]
   fn cells_round_trip_through_window() {
      let mut window = CursorWindow::new(1024);
      let rows = vec![
         vec![
            Value::Null,
            Value::Integer(-7),
            Value::Float(2.5),
            Value::Text("héllo".into()),
            Value::Blob(vec![0, 1, 2]),
         ],
         vec![
            Value::Integer(1),
            Value::Null,
            Value::Text("".into()),
            Value::Null,
            Value::Blob(vec![]),
         ],
      ];

      assert_eq!(fill_rows(&mut window, 10, &rows).unwrap(), 2);
      assert_eq!((window.start_row(), window.end_row()), (10, 12));
      assert_eq!(window.num_columns(), 5);

      assert_eq!(window.get(10, 0).unwrap(), ValueRef::Null);
      assert_eq!(window.get(10, 1).unwrap(), ValueRef::Integer(-7));
      assert_eq!(window.get(10, 2).unwrap(), ValueRef::Float(2.5));
      assert_eq!(window.get(10, 3).unwrap().as_str(), Some("héllo"));
      assert_eq!(window.get(10, 4).unwrap(), ValueRef::Blob(&[0, 1, 2]));
      assert_eq!(window.cell_type(11, 2).unwrap(), CellType::Text);
      assert_eq!(window.get_blob(11, 4).unwrap(), Some(&[][..]));
   }

   #[test]
   fn fill_stops_before_overflowing_and_never_splits_rows() {
      let row = text_row(1, "0123456789");
      let footprint = row_footprint(&row.iter().map(Value::as_ref).collect::<Vec<_>>());
      let mut window = CursorWindow::new(footprint * 3 + footprint / 2);

      let rows: Vec<_> = (0..10).map(|i| text_row(i, "0123456789")).collect();
      let filled = fill_rows(&mut window, 0, &rows).unwrap();

      assert_eq!(filled, 3);
      assert!(window.used_bytes() <= window.capacity());
      assert_eq!(window.used_bytes(), footprint * 3);
   }

   #[test]
   fn used_bytes_never_exceeds_capacity() {
      for capacity in [64, 100, 257, 1000, 4096] {
         let mut window = CursorWindow::new(capacity);
         let rows: Vec<_> = (0..200)
            .map(|i| text_row(i, &"x".repeat((i as usize * 7) % 40)))
            .collect();
         let mut pass = window.begin_fill(0, 2);
         for row in &rows {
            let cells: Vec<_> = row.iter().map(Value::as_ref).collect();
            match pass.push_row(&cells) {
               Ok(true) => continue,
               Ok(false) | Err(WindowError::RowTooLarge { .. }) => break,
               Err(e) => panic!("unexpected error: {e}"),
            }
         }
         pass.commit();
         assert!(window.used_bytes() <= capacity, "capacity {capacity}");
      }
   }

   #[test]
   fn row_too_large_leaves_window_untouched() {
      let mut window = CursorWindow::new(256);
      fill_rows(&mut window, 4, &[text_row(1, "small")]).unwrap();
      let before = window.used_bytes();

      let huge = text_row(2, &"y".repeat(512));
      let err = fill_rows(&mut window, 0, &[huge]).unwrap_err();

      assert!(matches!(err, WindowError::RowTooLarge { capacity: 256, .. }));
      assert_eq!(window.start_row(), 4);
      assert_eq!(window.num_rows(), 1);
      assert_eq!(window.used_bytes(), before);
   }

   #[test]
   fn oversized_row_in_empty_window_reports_out_of_range_afterwards() {
      let mut window = CursorWindow::new(128);
      let huge = text_row(1, &"z".repeat(256));

      assert!(matches!(
         fill_rows(&mut window, 0, &[huge]),
         Err(WindowError::RowTooLarge { .. })
      ));
      for row in 0..3 {
         assert!(matches!(
            window.get(row, 0),
            Err(WindowError::OutOfRange { .. })
         ));
      }
   }

   #[test]
   fn oversized_row_after_other_rows_ends_the_pass() {
      let mut window = CursorWindow::new(128);
      let rows = vec![text_row(1, "a"), text_row(2, &"b".repeat(256))];

      assert_eq!(fill_rows(&mut window, 0, &rows).unwrap(), 1);
   }

   #[test]
   fn out_of_range_outside_filled_rows_and_columns() {
      let mut window = CursorWindow::new(1024);
      fill_rows(&mut window, 5, &[text_row(1, "a"), text_row(2, "b")]).unwrap();

      assert!(window.get(5, 1).is_ok());
      assert!(window.get(6, 1).is_ok());
      assert!(matches!(
         window.get(4, 0),
         Err(WindowError::OutOfRange { start: 5, end: 7, .. })
      ));
      assert!(matches!(window.get(7, 0), Err(WindowError::OutOfRange { .. })));
      assert!(matches!(
         window.get(5, 2),
         Err(WindowError::OutOfRange { columns: 2, .. })
      ));
   }

   #[test]
   fn clear_resets_start_row() {
      let mut window = CursorWindow::new(1024);
      fill_rows(&mut window, 40, &[text_row(1, "a")]).unwrap();
      window.clear();

      assert_eq!(window.start_row(), 0);
      assert!(window.is_empty());
      assert_eq!(window.used_bytes(), 0);
      assert!(window.get(40, 0).is_err());
   }

   #[test]
   fn column_count_mismatch_is_rejected() {
      let mut window = CursorWindow::new(1024);
      let mut pass = window.begin_fill(0, 3);
      let err = pass.push_row(&[ValueRef::Null]).unwrap_err();
      assert_eq!(
         err,
         WindowError::ColumnCountMismatch {
            expected: 3,
            actual: 1
         }
      );
   }

   #[test]
   fn typed_getters_coerce() {
      let mut window = CursorWindow::new(1024);
      let row = vec![
         Value::Null,
         Value::Float(3.9),
         Value::Text(" 42 ".into()),
         Value::Text("abc".into()),
         Value::Integer(9),
         Value::Blob(vec![1]),
      ];
      fill_rows(&mut window, 0, &[row]).unwrap();

      assert_eq!(window.get_i64(0, 0).unwrap(), 0);
      assert_eq!(window.get_i64(0, 1).unwrap(), 3);
      assert_eq!(window.get_i64(0, 2).unwrap(), 42);
      assert_eq!(window.get_i64(0, 3).unwrap(), 0);
      assert_eq!(window.get_f64(0, 4).unwrap(), 9.0);
      assert_eq!(window.get_string(0, 0).unwrap(), None);
      assert_eq!(window.get_string(0, 4).unwrap().as_deref(), Some("9"));
      assert!(window.is_null(0, 0).unwrap());
      assert!(matches!(
         window.get_i64(0, 5),
         Err(WindowError::TypeMismatch {
            found: CellType::Blob,
            ..
         })
      ));
      assert!(matches!(
         window.get_blob(0, 4),
         Err(WindowError::TypeMismatch { .. })
      ));
   }

   #[test]
   fn refill_after_clear_reproduces_cells() {
      let rows: Vec<_> = (0..5).map(|i| text_row(i, &format!("row {i}"))).collect();
      let mut window = CursorWindow::new(4096);

      fill_rows(&mut window, 0, &rows).unwrap();
      let first: Vec<_> = (0..5).map(|r| window.get_string(r, 1).unwrap()).collect();

      window.clear();
      fill_rows(&mut window, 0, &rows).unwrap();
      let second: Vec<_> = (0..5).map(|r| window.get_string(r, 1).unwrap()).collect();

      assert_eq!(first, second);
   }
}
