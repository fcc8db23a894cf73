use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx_sqlcipher_conn_mgr::KeyMaterial;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{Database, Error, Result, StoreConfig};

/// Open databases, keyed by the name they were loaded under.
///
/// Names are paths relative to the registry's base directory, so the same name
/// always refers to the same file.
#[derive(Debug)]
pub struct DatabaseRegistry {
   base_dir: PathBuf,
   databases: RwLock<HashMap<String, Arc<Database>>>,
}

impl DatabaseRegistry {
   pub fn new(base_dir: impl Into<PathBuf>) -> Self {
      Self {
         base_dir: base_dir.into(),
         databases: RwLock::new(HashMap::new()),
      }
   }

   pub fn base_dir(&self) -> &Path {
      &self.base_dir
   }

   /// Open `name`, or return it if it is already open.
   ///
   /// `key` and `config` only apply when the database is not open yet.
   pub async fn load(
      &self,
      name: &str,
      key: Option<KeyMaterial>,
      config: StoreConfig,
   ) -> Result<Arc<Database>> {
      if let Some(db) = self.databases.read().await.get(name) {
         return Ok(Arc::clone(db));
      }

      let mut databases = self.databases.write().await;
      // Another task may have opened it while we waited for the lock
      if let Some(db) = databases.get(name) {
         return Ok(Arc::clone(db));
      }

      let db = Arc::new(Database::open(self.base_dir.join(name), key, config).await?);
      databases.insert(name.to_string(), Arc::clone(&db));
      debug!(name, "loaded database");
      Ok(db)
   }

   pub async fn get(&self, name: &str) -> Result<Arc<Database>> {
      self
         .databases
         .read()
         .await
         .get(name)
         .cloned()
         .ok_or_else(|| Error::DatabaseNotLoaded(name.to_string()))
   }

   /// Names of the open databases.
   pub async fn names(&self) -> Vec<String> {
      self.databases.read().await.keys().cloned().collect()
   }

   /// Close `name` and forget it.
   pub async fn close(&self, name: &str) -> Result<()> {
      let db = self.take(name).await?;
      db.close().await
   }

   /// Close every open database. Returns the first failure after trying all.
   pub async fn close_all(&self) -> Result<()> {
      let databases: Vec<(String, Arc<Database>)> =
         self.databases.write().await.drain().collect();

      let mut first_error = None;
      for (name, db) in databases {
         if let Err(err) = db.close().await {
            warn!(name, error = %err, "failed to close database");
            first_error.get_or_insert(err);
         }
      }

      match first_error {
         Some(err) => Err(err),
         None => Ok(()),
      }
   }

   /// Close `name` and delete its files.
   pub async fn remove(&self, name: &str) -> Result<()> {
      let db = self.take(name).await?;
      db.remove().await
   }

   async fn take(&self, name: &str) -> Result<Arc<Database>> {
      self
         .databases
         .write()
         .await
         .remove(name)
         .ok_or_else(|| Error::DatabaseNotLoaded(name.to_string()))
   }
}
