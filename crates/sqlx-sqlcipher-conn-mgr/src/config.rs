//! Configuration for encrypted SQLite connection pools

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default journal size limit in bytes. The journal (or WAL) file is
/// truncated back to this size after a commit or checkpoint.
pub const DEFAULT_JOURNAL_SIZE_LIMIT: i64 = 524_288;

/// Default WAL auto-checkpoint threshold in pages.
pub const DEFAULT_WAL_AUTOCHECKPOINT: u32 = 100;

/// Default number of read-only connections used under WAL.
pub const DEFAULT_READ_POOL_SIZE: u32 = 4;

/// Smallest read pool accepted by [`PoolConfig::validated`].
pub const MIN_READ_POOL_SIZE: u32 = 2;

/// Default number of prepared statements cached per connection.
pub const DEFAULT_STATEMENT_CACHE_CAPACITY: usize = 25;

/// Page size used when the host block size cannot be determined.
pub const FALLBACK_PAGE_SIZE: u32 = 4096;

/// Journal mode of the database file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
   Off,
   Delete,
   Truncate,
   Persist,
   Memory,
   #[default]
   Wal,
}

impl JournalMode {
   pub fn as_str(&self) -> &'static str {
      match self {
         JournalMode::Off => "OFF",
         JournalMode::Delete => "DELETE",
         JournalMode::Truncate => "TRUNCATE",
         JournalMode::Persist => "PERSIST",
         JournalMode::Memory => "MEMORY",
         JournalMode::Wal => "WAL",
      }
   }

   pub fn is_wal(&self) -> bool {
      matches!(self, JournalMode::Wal)
   }
}

impl fmt::Display for JournalMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

impl FromStr for JournalMode {
   type Err = String;

   /// Parses the value reported by `PRAGMA journal_mode` (case-insensitive).
   fn from_str(s: &str) -> Result<Self, Self::Err> {
      match s.trim().to_ascii_uppercase().as_str() {
         "OFF" => Ok(JournalMode::Off),
         "DELETE" => Ok(JournalMode::Delete),
         "TRUNCATE" => Ok(JournalMode::Truncate),
         "PERSIST" => Ok(JournalMode::Persist),
         "MEMORY" => Ok(JournalMode::Memory),
         "WAL" => Ok(JournalMode::Wal),
         other => Err(format!("unknown journal mode '{other}'")),
      }
   }
}

/// Value of `PRAGMA synchronous`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncMode {
   Off,
   Normal,
   #[default]
   Full,
}

impl SyncMode {
   pub fn as_str(&self) -> &'static str {
      match self {
         SyncMode::Off => "OFF",
         SyncMode::Normal => "NORMAL",
         SyncMode::Full => "FULL",
      }
   }
}

/// Mode passed to `PRAGMA wal_checkpoint`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckpointMode {
   /// Checkpoint as many frames as possible without waiting on readers or writers
   #[default]
   Passive,
   /// Wait for writers, then checkpoint everything
   Full,
   /// Like `Full`, then wait for readers so the next writer restarts the log
   Restart,
   /// Like `Restart`, then truncate the WAL file to zero bytes
   Truncate,
}

impl CheckpointMode {
   pub fn as_str(&self) -> &'static str {
      match self {
         CheckpointMode::Passive => "PASSIVE",
         CheckpointMode::Full => "FULL",
         CheckpointMode::Restart => "RESTART",
         CheckpointMode::Truncate => "TRUNCATE",
      }
   }
}

impl fmt::Display for CheckpointMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(self.as_str())
   }
}

/// SQL executed on every new connection around the moment the key is applied.
///
/// `pre_key` statements run before `PRAGMA key` (e.g. `PRAGMA cipher_default_kdf_iter`),
/// `post_key` statements run right after it (e.g. `PRAGMA cipher_compatibility = 3`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyHooks {
   pub pre_key: Vec<String>,
   pub post_key: Vec<String>,
}

/// Encryption key for the database file.
///
/// The key never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyMaterial {
   /// A passphrase run through the engine's key derivation
   Passphrase(String),
   /// Raw key bytes used as-is (`x'…'` form)
   Raw(Vec<u8>),
}

impl KeyMaterial {
   /// The right-hand side of a `PRAGMA key = …` statement.
   pub(crate) fn pragma_value(&self) -> String {
      match self {
         KeyMaterial::Passphrase(passphrase) => format!("'{}'", passphrase.replace('\'', "''")),
         KeyMaterial::Raw(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("\"x'{hex}'\"")
         }
      }
   }
}

impl fmt::Debug for KeyMaterial {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         KeyMaterial::Passphrase(_) => f.write_str("KeyMaterial::Passphrase(<redacted>)"),
         KeyMaterial::Raw(bytes) => write!(f, "KeyMaterial::Raw(<{} bytes redacted>)", bytes.len()),
      }
   }
}

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use sqlx_sqlcipher_conn_mgr::{JournalMode, PoolConfig};
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
/// assert_eq!(config.journal_mode, JournalMode::Wal);
///
/// // Override just a few fields
/// let config = PoolConfig {
///     read_pool_size: 6,
///     acquire_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// assert_eq!(config.read_pool_size, 6);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
   /// Journal mode requested for the database.
   ///
   /// Read-only connections are only pooled when the effective mode is WAL.
   ///
   /// Default: WAL
   pub journal_mode: JournalMode,

   /// `PRAGMA synchronous` when the journal mode is not WAL.
   ///
   /// Default: FULL
   pub synchronous: SyncMode,

   /// `PRAGMA synchronous` when the journal mode is WAL.
   ///
   /// Default: FULL
   pub wal_synchronous: SyncMode,

   /// Page size for newly created database files, in bytes.
   ///
   /// Default: block size of the filesystem holding the database
   pub page_size: Option<u32>,

   /// Number of WAL pages after which the primary connection checkpoints
   /// when it is released.
   ///
   /// Default: 100
   pub wal_autocheckpoint: u32,

   /// Checkpoint mode used by the checkpoint coordinator.
   ///
   /// Default: PASSIVE
   pub checkpoint_mode: CheckpointMode,

   /// Number of read-only connections kept under WAL.
   ///
   /// Default: 4
   pub read_pool_size: u32,

   /// Prepared statements cached per connection.
   ///
   /// Default: 25
   pub statement_cache_capacity: usize,

   /// `PRAGMA journal_size_limit`, in bytes. Negative disables the limit.
   ///
   /// Default: 524288
   pub journal_size_limit: i64,

   /// How long `acquire_writer`/`acquire_reader` wait for a free connection.
   ///
   /// Default: 30 seconds
   pub acquire_timeout: Duration,

   /// How long the engine retries a locked database before reporting busy.
   ///
   /// Default: 5 seconds
   pub busy_timeout: Duration,

   /// Upper bound on a single statement execution or window fill.
   ///
   /// Default: none
   pub statement_timeout: Option<Duration>,

   /// SQL run before and after the key is applied.
   pub key_hooks: KeyHooks,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         journal_mode: JournalMode::Wal,
         synchronous: SyncMode::Full,
         wal_synchronous: SyncMode::Full,
         page_size: None,
         wal_autocheckpoint: DEFAULT_WAL_AUTOCHECKPOINT,
         checkpoint_mode: CheckpointMode::Passive,
         read_pool_size: DEFAULT_READ_POOL_SIZE,
         statement_cache_capacity: DEFAULT_STATEMENT_CACHE_CAPACITY,
         journal_size_limit: DEFAULT_JOURNAL_SIZE_LIMIT,
         acquire_timeout: Duration::from_secs(30),
         busy_timeout: Duration::from_secs(5),
         statement_timeout: None,
         key_hooks: KeyHooks::default(),
      }
   }
}

impl PoolConfig {
   /// Clamp values the engine or the pool cannot honor.
   pub fn validated(mut self) -> Self {
      if self.wal_autocheckpoint < 1 {
         warn!(value = self.wal_autocheckpoint, "wal_autocheckpoint raised to 1");
         self.wal_autocheckpoint = 1;
      }
      if self.read_pool_size < MIN_READ_POOL_SIZE {
         warn!(
            value = self.read_pool_size,
            min = MIN_READ_POOL_SIZE,
            "read_pool_size raised to minimum"
         );
         self.read_pool_size = MIN_READ_POOL_SIZE;
      }
      if self.statement_cache_capacity < 1 {
         warn!("statement_cache_capacity raised to 1");
         self.statement_cache_capacity = 1;
      }
      if let Some(size) = self.page_size
         && !is_valid_page_size(size)
      {
         warn!(value = size, "invalid page_size ignored");
         self.page_size = None;
      }
      self
   }

   /// `PRAGMA synchronous` value for the given effective journal mode.
   pub fn synchronous_for(&self, mode: JournalMode) -> SyncMode {
      if mode.is_wal() {
         self.wal_synchronous
      } else {
         self.synchronous
      }
   }
}

fn is_valid_page_size(size: u32) -> bool {
   (512..=65536).contains(&size) && size.is_power_of_two()
}

/// Page size for a new database at `path`: the block size of the
/// filesystem holding it, or [`FALLBACK_PAGE_SIZE`].
pub fn default_page_size(path: &Path) -> u32 {
   let dir = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| Path::new("."));

   block_size(dir)
      .filter(|size| is_valid_page_size(*size))
      .unwrap_or(FALLBACK_PAGE_SIZE)
}

#[cfg(unix)]
fn block_size(dir: &Path) -> Option<u32> {
   use std::os::unix::fs::MetadataExt;
   std::fs::metadata(dir)
      .ok()
      .and_then(|m| u32::try_from(m.blksize()).ok())
}

#[cfg(not(unix))]
fn block_size(_dir: &Path) -> Option<u32> {
   None
}
