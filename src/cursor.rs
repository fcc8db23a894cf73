//! Random-access cursor over a query result

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use sqlcipher_window::{CellType, CursorWindow, Value};
use sqlx_sqlcipher_conn_mgr::ConnectionPool;
use sqlx_sqlcipher_observer::{ObserverRegistry, Registration};
use tracing::{debug, trace};

use crate::decode::{self, Row};
use crate::{Error, Result};

/// A scrollable view over the rows of one query.
///
/// Only one window of rows is held at a time. Moving outside it borrows a read
/// connection and refills the window so that the requested row sits about a
/// third of the way in, which keeps short scrolls in either direction cheap.
///
/// The cursor is marked stale when a write commits; [`requery`](Self::requery)
/// drops the cached rows so the next move sees the new data.
pub struct Cursor {
   pool: Arc<ConnectionPool>,
   sql: String,
   params: Vec<Value>,
   columns: Vec<String>,
   window: CursorWindow,
   count: Option<usize>,
   position: Option<usize>,
   rows_per_window: usize,
   stale: Arc<AtomicBool>,
   _registration: Registration,
}

impl Cursor {
   pub(crate) async fn open(
      pool: Arc<ConnectionPool>,
      observers: &Arc<ObserverRegistry>,
      sql: &str,
      params: Vec<Value>,
      window_capacity: usize,
   ) -> Result<Self> {
      let columns = {
         let mut reader = pool.acquire_reader().await?;
         reader.columns(sql).await?
      };

      let stale = Arc::new(AtomicBool::new(false));
      let flag = Arc::clone(&stale);
      let registration = observers.register_guard(move |_| flag.store(true, Ordering::SeqCst));

      debug!(observer = %registration.id(), sql, "opened cursor");

      Ok(Self {
         pool,
         sql: sql.to_string(),
         params,
         columns,
         window: CursorWindow::new(window_capacity),
         count: None,
         position: None,
         rows_per_window: 0,
         stale,
         _registration: registration,
      })
   }

   pub fn sql(&self) -> &str {
      &self.sql
   }

   pub fn column_names(&self) -> &[String] {
      &self.columns
   }

   pub fn column_count(&self) -> usize {
      self.columns.len()
   }

   /// Index of the column called `name`.
   pub fn column_index(&self, name: &str) -> Result<usize> {
      self
         .columns
         .iter()
         .position(|column| column == name)
         .ok_or_else(|| Error::UnknownColumn(name.to_string()))
   }

   /// The rows currently held.
   pub fn window(&self) -> &CursorWindow {
      &self.window
   }

   /// Current row, or `None` before the first move or past the end.
   pub fn position(&self) -> Option<usize> {
      self.position
   }

   /// True once a write has committed since the rows were loaded.
   pub fn is_stale(&self) -> bool {
      self.stale.load(Ordering::SeqCst)
   }

   /// Total number of rows, counted on the first call.
   pub async fn count(&mut self) -> Result<usize> {
      match self.count {
         Some(count) => Ok(count),
         None => self.fill(0, true).await,
      }
   }

   /// Move to `position`. Returns false (leaving no current row) when it is
   /// past the last row.
   pub async fn move_to(&mut self, position: usize) -> Result<bool> {
      let count = match self.count {
         Some(count) => count,
         None => self.fill(position, true).await?,
      };

      if position >= count {
         self.position = None;
         return Ok(false);
      }

      if !self.window.contains_row(position) {
         self.fill(position, false).await?;
      }
      self.position = Some(position);
      Ok(true)
   }

   pub async fn move_to_first(&mut self) -> Result<bool> {
      self.move_to(0).await
   }

   /// Move to the row after the current one, or to the first row before any move.
   pub async fn move_to_next(&mut self) -> Result<bool> {
      let next = self.position.map_or(0, |position| position + 1);
      self.move_to(next).await
   }

   pub async fn move_to_previous(&mut self) -> Result<bool> {
      match self.position {
         Some(position) if position > 0 => self.move_to(position - 1).await,
         _ => {
            self.position = None;
            Ok(false)
         }
      }
   }

   pub async fn move_to_last(&mut self) -> Result<bool> {
      let count = self.count().await?;
      match count.checked_sub(1) {
         Some(last) => self.move_to(last).await,
         None => Ok(false),
      }
   }

   /// Forget the loaded rows and the row count.
   pub fn requery(&mut self) {
      self.window.clear();
      self.count = None;
      self.position = None;
      self.stale.store(false, Ordering::SeqCst);
      trace!(sql = %self.sql, "cursor requeried");
   }

   fn row(&self) -> Result<usize> {
      self.position.ok_or(Error::NoCurrentRow {
         position: self.position,
         count: self.count.unwrap_or(0),
      })
   }

   pub fn cell_type(&self, column: usize) -> Result<CellType> {
      Ok(self.window.cell_type(self.row()?, column)?)
   }

   pub fn is_null(&self, column: usize) -> Result<bool> {
      Ok(self.window.is_null(self.row()?, column)?)
   }

   pub fn get_i64(&self, column: usize) -> Result<i64> {
      Ok(self.window.get_i64(self.row()?, column)?)
   }

   pub fn get_f64(&self, column: usize) -> Result<f64> {
      Ok(self.window.get_f64(self.row()?, column)?)
   }

   pub fn get_string(&self, column: usize) -> Result<Option<String>> {
      Ok(self.window.get_string(self.row()?, column)?)
   }

   pub fn get_blob(&self, column: usize) -> Result<Option<&[u8]>> {
      Ok(self.window.get_blob(self.row()?, column)?)
   }

   /// The current row as a JSON object.
   pub fn row_json(&self) -> Result<Row> {
      decode::window_row(&self.window, self.row()?, &self.columns)
   }

   /// Refill the window around `position`. With `counting`, also count every
   /// row of the result and return the total; otherwise return the known count.
   async fn fill(&mut self, position: usize, counting: bool) -> Result<usize> {
      let start = position.saturating_sub(self.rows_per_window / 3);
      let mut reader = self.pool.acquire_reader().await?;

      let count = if counting {
         let outcome = reader
            .fill_window_counting(&self.sql, &self.params, &mut self.window, start)
            .await?;
         self.rows_per_window = self.rows_per_window.max(outcome.filled_rows);
         let total = outcome.total_rows.unwrap_or(start + outcome.filled_rows);
         self.count = Some(total);
         total
      } else {
         let filled = reader
            .fill_window(&self.sql, &self.params, &mut self.window, start)
            .await?;
         self.rows_per_window = self.rows_per_window.max(filled);
         self.count.unwrap_or(start + filled)
      };

      // Wider rows than before can leave the target past the window end
      if position < count && !self.window.contains_row(position) {
         reader
            .fill_window(&self.sql, &self.params, &mut self.window, position)
            .await?;
      }

      trace!(
         start = self.window.start_row(),
         rows = self.window.num_rows(),
         count,
         "filled cursor window"
      );
      Ok(count)
   }
}

impl std::fmt::Debug for Cursor {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Cursor")
         .field("sql", &self.sql)
         .field("columns", &self.columns)
         .field("count", &self.count)
         .field("position", &self.position)
         .field("window_start", &self.window.start_row())
         .field("window_rows", &self.window.num_rows())
         .field("stale", &self.is_stale())
         .finish()
   }
}
