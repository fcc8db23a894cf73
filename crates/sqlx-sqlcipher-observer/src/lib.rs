//! Commit notifications for encrypted SQLite databases.
//!
//! An [`ObserverRegistry`] hands out generation-checked [`ObserverId`]s for
//! callbacks and fans every committed change out to them, and to any number of
//! broadcast subscribers. Ids of removed observers are never confused with ids
//! issued later for the same slot, so a stale id cannot unregister a newcomer.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use sqlx_sqlcipher_observer::ObserverRegistry;
//!
//! let registry = ObserverRegistry::new(16);
//! let rows = Arc::new(AtomicU64::new(0));
//!
//! let seen = Arc::clone(&rows);
//! let registration = registry.register_guard(move |notice| {
//!    seen.fetch_add(notice.rows_affected, Ordering::SeqCst);
//! });
//!
//! registry.dispatch(3, None);
//! assert_eq!(rows.load(Ordering::SeqCst), 3);
//!
//! // Dropping the guard unregisters the callback
//! drop(registration);
//! assert_eq!(registry.dispatch(5, None), 0);
//! ```

mod registry;
mod stream;

pub use registry::{ChangeNotice, ObserverConfig, ObserverId, ObserverRegistry, Registration};
pub use stream::{ChangeEvent, ChangeStream, ChangeStreamExt};
