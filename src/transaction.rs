//! Explicit write transactions

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx_sqlcipher_conn_mgr::PooledConnection;
use sqlx_sqlcipher_observer::ObserverRegistry;
use tracing::debug;

use crate::database::{WriteQueryResult, finish_write, read_rows};
use crate::decode::{self, Row};
use crate::{Error, Result};

/// Statement in a transaction with query and bind values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
   pub query: String,
   #[serde(default)]
   pub values: Vec<JsonValue>,
}

/// A transaction holding the primary connection.
///
/// Observers hear about its changes once, after [`commit`](Self::commit).
/// Dropping it without committing rolls back when the connection returns to
/// the pool.
#[must_use = "if unused, the transaction is immediately rolled back"]
pub struct Transaction {
   writer: PooledConnection,
   observers: Arc<ObserverRegistry>,
   window_capacity: usize,
}

impl Transaction {
   pub(crate) async fn begin(
      mut writer: PooledConnection,
      observers: Arc<ObserverRegistry>,
      window_capacity: usize,
   ) -> Result<Self> {
      writer.execute("BEGIN IMMEDIATE", &[]).await?;
      debug!(connection = writer.id(), "transaction started");

      Ok(Self {
         writer,
         observers,
         window_capacity,
      })
   }

   pub async fn execute(&mut self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      let params = decode::bind_values(values);
      Ok(self.writer.execute(query, &params).await?.into())
   }

   /// Execute statements in order, stopping at the first failure.
   pub async fn execute_statements(
      &mut self,
      statements: Vec<Statement>,
   ) -> Result<Vec<WriteQueryResult>> {
      let mut results = Vec::with_capacity(statements.len());
      for statement in statements {
         results.push(self.execute(&statement.query, statement.values).await?);
      }
      Ok(results)
   }

   /// Execute a read query within this transaction, seeing its uncommitted writes.
   pub async fn read(&mut self, query: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      let params = decode::bind_values(values);
      read_rows(&mut self.writer, query, &params, self.window_capacity).await
   }

   /// Commit and notify observers. Returns the number of rows changed.
   ///
   /// If the commit fails the transaction is rolled back.
   pub async fn commit(mut self) -> Result<u64> {
      if let Err(err) = self.writer.execute("COMMIT", &[]).await {
         return Err(self.abort(err.into()).await);
      }

      let Self {
         writer, observers, ..
      } = self;
      let connection = writer.id();
      let changes = finish_write(writer, &observers).await;
      debug!(connection, changes, "transaction committed");
      Ok(changes)
   }

   pub async fn rollback(mut self) -> Result<()> {
      self.writer.execute("ROLLBACK", &[]).await?;
      self.writer.take_changes();
      debug!(connection = self.writer.id(), "transaction rolled back");
      Ok(())
   }

   /// Roll back after `err`, keeping `err` as the reported failure.
   pub(crate) async fn abort(mut self, err: Error) -> Error {
      // The engine already rolled back on some errors
      if !self.writer.in_transaction() {
         self.writer.take_changes();
         return err;
      }

      match self.writer.execute("ROLLBACK", &[]).await {
         Ok(_) => {
            self.writer.take_changes();
            err
         }
         Err(rollback_err) => Error::TransactionRollbackFailed {
            transaction_error: err.to_string(),
            rollback_error: rollback_err.to_string(),
         },
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{Database, StoreConfig};
   use serde_json::json;
   use tempfile::TempDir;

   async fn create_test_db() -> (Database, TempDir) {
      let temp_dir = TempDir::new().unwrap();
      let db = Database::open(temp_dir.path().join("tx.db"), None, StoreConfig::default())
         .await
         .unwrap();
      db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, val INTEGER)", vec![])
         .await
         .unwrap();
      (db, temp_dir)
   }

   #[tokio::test]
   async fn test_read_sees_uncommitted_writes() {
      let (db, _temp) = create_test_db().await;
      let mut tx = db.begin().await.unwrap();

      tx.execute("INSERT INTO t (val) VALUES ($1)", vec![json!(7)])
         .await
         .unwrap();
      let rows = tx.read("SELECT val FROM t", vec![]).await.unwrap();
      assert_eq!(rows[0].get("val"), Some(&json!(7)));

      // Readers on other connections do not see it yet
      assert!(db.fetch_all("SELECT val FROM t", vec![]).await.unwrap().is_empty());

      assert_eq!(tx.commit().await.unwrap(), 1);
      assert_eq!(db.fetch_all("SELECT val FROM t", vec![]).await.unwrap().len(), 1);
   }

   #[tokio::test]
   async fn test_dropped_transaction_rolls_back() {
      let (db, _temp) = create_test_db().await;

      let mut tx = db.begin().await.unwrap();
      tx.execute("INSERT INTO t (val) VALUES (1)", vec![])
         .await
         .unwrap();
      drop(tx);

      // The writer is free again and holds no open transaction
      db.execute("INSERT INTO t (val) VALUES (2)", vec![])
         .await
         .unwrap();
      let rows = db.fetch_all("SELECT val FROM t", vec![]).await.unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0].get("val"), Some(&json!(2)));
   }

   #[tokio::test]
   async fn test_explicit_rollback() {
      let (db, _temp) = create_test_db().await;
      let mut events = db.observers().subscribe();

      let mut tx = db.begin().await.unwrap();
      tx.execute("INSERT INTO t (val) VALUES (1)", vec![])
         .await
         .unwrap();
      tx.rollback().await.unwrap();

      assert!(db.fetch_all("SELECT val FROM t", vec![]).await.unwrap().is_empty());
      assert!(events.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_statement_deserializes_without_values() {
      let statement: Statement =
         serde_json::from_value(json!({ "query": "DELETE FROM t" })).unwrap();
      assert!(statement.values.is_empty());
   }
}
