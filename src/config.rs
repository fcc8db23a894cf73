use std::path::Path;

use serde::{Deserialize, Serialize};
use sqlcipher_window::DEFAULT_WINDOW_CAPACITY;
use sqlx_sqlcipher_conn_mgr::PoolConfig;
use tracing::warn;

use crate::Result;

/// Smallest window accepted by [`StoreConfig::validated`].
pub const MIN_WINDOW_CAPACITY: usize = 4 * 1024;

/// Configuration for a [`Database`](crate::Database).
///
/// Pool settings sit at the top level of the JSON form:
///
/// ```
/// use sqlcipher_store::StoreConfig;
///
/// let config = StoreConfig::from_json_str(r#"{
///    "journal_mode": "WAL",
///    "read_pool_size": 3,
///    "window_capacity": 65536
/// }"#).unwrap();
///
/// assert_eq!(config.pool.read_pool_size, 3);
/// assert_eq!(config.window_capacity, 65536);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
   #[serde(flatten)]
   pub pool: PoolConfig,

   /// Byte capacity of the windows used by `fetch_all` and cursors.
   ///
   /// Default: 2 MiB
   pub window_capacity: usize,

   /// Buffered change notices per subscriber.
   ///
   /// Default: 256
   pub observer_channel_capacity: usize,
}

impl Default for StoreConfig {
   fn default() -> Self {
      Self {
         pool: PoolConfig::default(),
         window_capacity: DEFAULT_WINDOW_CAPACITY,
         observer_channel_capacity: 256,
      }
   }
}

impl StoreConfig {
   pub fn from_json_str(json: &str) -> Result<Self> {
      Ok(serde_json::from_str(json)?)
   }

   /// Read a JSON configuration file.
   pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
      let json = tokio::fs::read_to_string(path).await?;
      Self::from_json_str(&json)
   }

   /// Clamp values the store cannot honor.
   pub fn validated(mut self) -> Self {
      self.pool = self.pool.validated();
      if self.window_capacity < MIN_WINDOW_CAPACITY {
         warn!(
            value = self.window_capacity,
            min = MIN_WINDOW_CAPACITY,
            "window_capacity raised to minimum"
         );
         self.window_capacity = MIN_WINDOW_CAPACITY;
      }
      if self.observer_channel_capacity == 0 {
         warn!("observer_channel_capacity raised to 1");
         self.observer_channel_capacity = 1;
      }
      self
   }
}
