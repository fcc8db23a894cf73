//! Integration tests for window fills: resumption, carried-over rows, oversized rows,
//! cancellation and statement timeouts.

use std::sync::Arc;
use std::time::Duration;

use sqlcipher_window::{CursorWindow, Value, WindowError};
use sqlx_sqlcipher_conn_mgr::{ConnectionPool, Error, PoolConfig};
use tempfile::TempDir;

const ITEM_COUNT: usize = 1000;

/// Window large enough for exactly three single-integer rows
const THREE_INT_ROWS: usize = 3 * (4 + 16);

const ENDLESS_QUERY: &str =
   "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

struct TestPool {
   pool: Arc<ConnectionPool>,
   _dir: TempDir,
}

async fn open_pool(config: PoolConfig) -> TestPool {
   let dir = tempfile::tempdir().unwrap();
   let pool = ConnectionPool::open(dir.path().join("fill.db"), None, config)
      .await
      .unwrap();

   let mut writer = pool.acquire_writer().await.unwrap();
   writer
      .execute_batch(&format!(
         "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
          INSERT INTO items (id, name)
             WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {ITEM_COUNT})
             SELECT x, 'item-' || x FROM c;"
      ))
      .await
      .unwrap();
   drop(writer);

   TestPool { pool, _dir: dir }
}

// ============================================================================
// Sequential fills
// ============================================================================

#[tokio::test]
async fn test_sequential_fills_cover_every_row_once() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(1024);
   let sql = "SELECT id, name FROM items ORDER BY id";

   let mut start = 0;
   let mut seen = Vec::new();
   loop {
      let filled = reader.fill_window(sql, &[], &mut window, start).await.unwrap();
      if filled == 0 {
         break;
      }
      assert!(filled < ITEM_COUNT, "window should not hold every row");
      assert_eq!(window.start_row(), start);
      assert!(window.used_bytes() <= window.capacity());

      for row in start..start + filled {
         seen.push(window.get_i64(row, 0).unwrap());
      }
      start += filled;
   }

   let expected: Vec<i64> = (1..=ITEM_COUNT as i64).collect();
   assert_eq!(seen, expected);

   // Every fill after the first continued the cached statement
   let stats = reader.statement_cache_stats();
   assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_fill_from_arbitrary_start() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(1024);

   let filled = reader
      .fill_window("SELECT id, name FROM items ORDER BY id", &[], &mut window, 500)
      .await
      .unwrap();

   assert!(filled > 0);
   assert_eq!(window.start_row(), 500);
   assert_eq!(window.get_i64(500, 0).unwrap(), 501);
   assert_eq!(window.get_string(500, 1).unwrap().as_deref(), Some("item-501"));
   assert!(matches!(
      window.get_i64(499, 0),
      Err(WindowError::OutOfRange { .. })
   ));

   // Going backwards restarts the query
   let filled = reader
      .fill_window("SELECT id, name FROM items ORDER BY id", &[], &mut window, 10)
      .await
      .unwrap();
   assert!(filled > 0);
   assert_eq!(window.get_i64(10, 0).unwrap(), 11);
}

#[tokio::test]
async fn test_start_past_end_fills_nothing() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(1024);

   let filled = reader
      .fill_window("SELECT id FROM items", &[], &mut window, ITEM_COUNT + 5)
      .await
      .unwrap();

   assert_eq!(filled, 0);
   assert!(window.is_empty());
   assert_eq!(window.start_row(), ITEM_COUNT + 5);
}

#[tokio::test]
async fn test_carried_over_row_is_first_row_of_next_fill() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(THREE_INT_ROWS);
   let sql = "SELECT id FROM items WHERE id <= ? ORDER BY id";
   let params = [Value::from(7)];

   let filled = reader.fill_window(sql, &params, &mut window, 0).await.unwrap();
   assert_eq!(filled, 3);
   assert_eq!(window.free_bytes(), 0);

   let filled = reader.fill_window(sql, &params, &mut window, 3).await.unwrap();
   assert_eq!(filled, 3);
   assert_eq!(window.get_i64(3, 0).unwrap(), 4);
   assert_eq!(window.get_i64(5, 0).unwrap(), 6);

   let filled = reader.fill_window(sql, &params, &mut window, 6).await.unwrap();
   assert_eq!(filled, 1);
   assert_eq!(window.get_i64(6, 0).unwrap(), 7);
}

#[tokio::test]
async fn test_changed_parameters_restart_query() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(THREE_INT_ROWS);
   let sql = "SELECT id FROM items WHERE id > ? ORDER BY id";

   reader
      .fill_window(sql, &[Value::from(0)], &mut window, 0)
      .await
      .unwrap();
   assert_eq!(window.get_i64(0, 0).unwrap(), 1);

   reader
      .fill_window(sql, &[Value::from(100)], &mut window, 3)
      .await
      .unwrap();
   assert_eq!(window.get_i64(3, 0).unwrap(), 104);
}

#[tokio::test]
async fn test_counting_fill_reports_total_rows() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(1024);
   let sql = "SELECT id, name FROM items ORDER BY id";

   let outcome = reader
      .fill_window_counting(sql, &[], &mut window, 0)
      .await
      .unwrap();
   assert!(outcome.filled_rows > 0);
   assert_eq!(outcome.total_rows, Some(ITEM_COUNT));

   // The window still holds the rows of the fill, not the last rows counted
   assert_eq!(window.start_row(), 0);
   assert_eq!(window.get_i64(0, 0).unwrap(), 1);

   // The next fill restarts cleanly after counting consumed the query
   let next = reader
      .fill_window(sql, &[], &mut window, outcome.filled_rows)
      .await
      .unwrap();
   assert!(next > 0);
   assert_eq!(
      window.get_i64(outcome.filled_rows, 0).unwrap(),
      outcome.filled_rows as i64 + 1
   );
}

#[tokio::test]
async fn test_refill_after_clear_is_identical() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(512);
   let sql = "SELECT id, name FROM items ORDER BY id";

   let first = reader.fill_window(sql, &[], &mut window, 100).await.unwrap();
   let snapshot: Vec<(i64, Option<String>)> = (100..100 + first)
      .map(|row| (window.get_i64(row, 0).unwrap(), window.get_string(row, 1).unwrap()))
      .collect();

   window.clear();
   assert!(window.is_empty());

   let second = reader.fill_window(sql, &[], &mut window, 100).await.unwrap();
   let again: Vec<(i64, Option<String>)> = (100..100 + second)
      .map(|row| (window.get_i64(row, 0).unwrap(), window.get_string(row, 1).unwrap()))
      .collect();

   assert_eq!(first, second);
   assert_eq!(snapshot, again);
}

// ============================================================================
// Oversized rows
// ============================================================================

#[tokio::test]
async fn test_row_larger_than_window_fails_and_keeps_content() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let capacity = 256;
   let mut window = CursorWindow::new(capacity);

   reader
      .fill_window("SELECT id FROM items ORDER BY id", &[], &mut window, 0)
      .await
      .unwrap();
   let rows_before = window.num_rows();

   let err = reader
      .fill_window(
         "SELECT id, zeroblob(?) FROM items",
         &[Value::from((capacity * 2) as i64)],
         &mut window,
         0,
      )
      .await
      .unwrap_err();

   match err {
      Error::Window(WindowError::RowTooLarge { required, capacity: cap }) => {
         assert!(required > cap);
         assert_eq!(cap, capacity);
      }
      other => panic!("expected RowTooLarge, got {other:?}"),
   }
   assert_eq!(window.num_rows(), rows_before);
   assert_eq!(window.get_i64(0, 0).unwrap(), 1);

   // The connection moves on to other queries
   let filled = reader
      .fill_window("SELECT name FROM items WHERE id = 1", &[], &mut window, 0)
      .await
      .unwrap();
   assert_eq!(filled, 1);
}

// ============================================================================
// Cancellation and timeouts
// ============================================================================

#[tokio::test]
async fn test_interrupt_cancels_fill() {
   let test = open_pool(PoolConfig::default()).await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   let mut window = CursorWindow::new(1024);

   reader
      .fill_window("SELECT id FROM items WHERE id = 1", &[], &mut window, 0)
      .await
      .unwrap();

   let handle = reader.interrupt_handle();
   let canceller = std::thread::spawn(move || {
      std::thread::sleep(Duration::from_millis(100));
      handle.interrupt()
   });

   let err = reader
      .fill_window(ENDLESS_QUERY, &[], &mut window, 0)
      .await
      .unwrap_err();

   assert!(canceller.join().unwrap());
   assert!(matches!(err, Error::Cancelled { .. }), "got {err:?}");
   assert_eq!(err.error_code(), "CANCELLED");

   // The window kept the previous fill
   assert_eq!(window.num_rows(), 1);
   assert_eq!(window.get_i64(0, 0).unwrap(), 1);

   // And the connection is still usable
   let filled = reader
      .fill_window("SELECT count(*) FROM items", &[], &mut window, 0)
      .await
      .unwrap();
   assert_eq!(filled, 1);
   assert_eq!(window.get_i64(0, 0).unwrap(), ITEM_COUNT as i64);
}

#[tokio::test]
async fn test_statement_timeout_aborts_fill() {
   let test = open_pool(PoolConfig {
      statement_timeout: Some(Duration::from_millis(50)),
      ..Default::default()
   })
   .await;
   let mut reader = test.pool.acquire_reader().await.unwrap();
   assert_eq!(reader.statement_timeout(), Some(Duration::from_millis(50)));
   let mut window = CursorWindow::new(1024);

   let err = reader
      .fill_window(ENDLESS_QUERY, &[], &mut window, 0)
      .await
      .unwrap_err();

   match err {
      Error::StatementTimeout { timeout, sql } => {
         assert_eq!(timeout, Duration::from_millis(50));
         assert_eq!(sql, ENDLESS_QUERY);
      }
      other => panic!("expected StatementTimeout, got {other:?}"),
   }
   assert!(window.is_empty());

   // Short statements still finish under the limit
   reader.set_statement_timeout(Some(Duration::from_secs(5)));
   let filled = reader
      .fill_window("SELECT id FROM items WHERE id < 4", &[], &mut window, 0)
      .await
      .unwrap();
   assert_eq!(filled, 3);
}

#[tokio::test]
async fn test_interrupt_handle_is_inert_after_close() {
   let test = open_pool(PoolConfig::default()).await;
   let reader = test.pool.acquire_reader().await.unwrap();
   let handle = reader.interrupt_handle();
   drop(reader);

   test.pool.close().await.unwrap();
   assert!(!handle.interrupt());
}
