//! Integration tests for cursors: paging, positioning and staleness.

use serde_json::json;
use sqlcipher_store::{Database, Error, MIN_WINDOW_CAPACITY, StoreConfig};
use tempfile::TempDir;

const ROW_COUNT: usize = 3000;

struct TestDb {
   db: Database,
   _dir: TempDir,
}

async fn setup_test_db() -> TestDb {
   let dir = TempDir::new().unwrap();
   let config = StoreConfig {
      window_capacity: MIN_WINDOW_CAPACITY,
      ..Default::default()
   };
   let db = Database::open(dir.path().join("cursor.db"), None, config)
      .await
      .unwrap();

   db.execute_batch(&format!(
      "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT, weight REAL, payload BLOB);
       INSERT INTO items (id, label, weight, payload)
          WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < {ROW_COUNT})
          SELECT x, 'item-' || x, x * 0.5, CASE WHEN x % 2 = 0 THEN x'CAFE' END FROM c;"
   ))
   .await
   .unwrap();

   TestDb { db, _dir: dir }
}

#[tokio::test]
async fn test_walk_every_row_forwards() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id, label FROM items ORDER BY id", vec![])
      .await
      .unwrap();

   assert_eq!(cursor.column_names(), ["id", "label"]);
   assert_eq!(cursor.count().await.unwrap(), ROW_COUNT);

   let mut expected = 1;
   while cursor.move_to_next().await.unwrap() {
      assert_eq!(cursor.get_i64(0).unwrap(), expected);
      assert_eq!(
         cursor.get_string(1).unwrap(),
         Some(format!("item-{expected}"))
      );
      expected += 1;
   }

   assert_eq!(expected as usize, ROW_COUNT + 1);
   assert_eq!(cursor.position(), None);
}

#[tokio::test]
async fn test_window_holds_a_slice_of_the_result() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id, label FROM items ORDER BY id", vec![])
      .await
      .unwrap();

   assert!(cursor.move_to_first().await.unwrap());
   let rows_per_window = cursor.window().num_rows();
   assert!(rows_per_window > 3);
   assert!(rows_per_window < ROW_COUNT);

   // A jump refills with the target a third of the way into the window
   assert!(cursor.move_to(2000).await.unwrap());
   assert_eq!(cursor.window().start_row(), 2000 - rows_per_window / 3);
   assert_eq!(cursor.get_i64(0).unwrap(), 2001);

   // Stepping back inside the window needs no refill
   let start = cursor.window().start_row();
   assert!(cursor.move_to_previous().await.unwrap());
   assert_eq!(cursor.window().start_row(), start);
   assert_eq!(cursor.get_i64(0).unwrap(), 2000);
}

#[tokio::test]
async fn test_move_past_end_and_last() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id FROM items WHERE id <= $1", vec![json!(10)])
      .await
      .unwrap();

   assert!(!cursor.move_to(10).await.unwrap());
   assert_eq!(cursor.position(), None);

   assert!(cursor.move_to_last().await.unwrap());
   assert_eq!(cursor.position(), Some(9));
   assert_eq!(cursor.get_i64(0).unwrap(), 10);
}

#[tokio::test]
async fn test_empty_result() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id FROM items WHERE id < 0", vec![])
      .await
      .unwrap();

   assert_eq!(cursor.count().await.unwrap(), 0);
   assert!(!cursor.move_to_first().await.unwrap());
   assert!(!cursor.move_to_last().await.unwrap());
}

#[tokio::test]
async fn test_typed_getters_and_json_row() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query(
         "SELECT id, label, weight, payload FROM items WHERE id IN (1, 2) ORDER BY id",
         vec![],
      )
      .await
      .unwrap();

   let err = cursor.get_i64(0).unwrap_err();
   assert!(matches!(err, Error::NoCurrentRow { position: None, .. }));

   assert!(cursor.move_to_first().await.unwrap());
   assert!(cursor.is_null(3).unwrap());
   assert_eq!(cursor.get_f64(2).unwrap(), 0.5);
   assert_eq!(cursor.get_blob(3).unwrap(), None);

   assert!(cursor.move_to_next().await.unwrap());
   assert_eq!(cursor.get_blob(3).unwrap(), Some(&[0xca, 0xfe][..]));

   let row = cursor.row_json().unwrap();
   assert_eq!(row.get("id"), Some(&json!(2)));
   assert_eq!(row.get("label"), Some(&json!("item-2")));
   assert_eq!(row.get("payload"), Some(&json!("yv4=")));

   assert_eq!(cursor.column_index("weight").unwrap(), 2);
   assert!(matches!(
      cursor.column_index("missing"),
      Err(Error::UnknownColumn(_))
   ));
}

#[tokio::test]
async fn test_commit_marks_cursor_stale() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id FROM items ORDER BY id", vec![])
      .await
      .unwrap();
   assert_eq!(cursor.count().await.unwrap(), ROW_COUNT);
   assert!(!cursor.is_stale());

   // A cursor between moves holds no connection, so writes go through
   test
      .db
      .execute("DELETE FROM items WHERE id > $1", vec![json!(100)])
      .await
      .unwrap();

   assert!(cursor.is_stale());
   assert_eq!(cursor.count().await.unwrap(), ROW_COUNT);

   cursor.requery();
   assert!(!cursor.is_stale());
   assert_eq!(cursor.count().await.unwrap(), 100);
}

#[tokio::test]
async fn test_dropped_cursor_unregisters() {
   let test = setup_test_db().await;
   let cursor = test
      .db
      .query("SELECT id FROM items", vec![])
      .await
      .unwrap();
   assert_eq!(test.db.observers().len(), 1);

   drop(cursor);
   assert!(test.db.observers().is_empty());
}

#[tokio::test]
async fn test_cursor_after_close_fails() {
   let test = setup_test_db().await;
   let mut cursor = test
      .db
      .query("SELECT id FROM items", vec![])
      .await
      .unwrap();

   test.db.close().await.unwrap();

   let err = cursor.move_to_first().await.unwrap_err();
   assert_eq!(err.error_code(), "DATABASE_CLOSED");
}
