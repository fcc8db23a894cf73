//! WAL checkpoint scheduling
//!
//! The primary connection registers a WAL hook that records the size of the
//! write-ahead log after every commit. When the primary is released back to
//! the pool, [`CheckpointCoordinator::maybe_checkpoint`] compares that size
//! against the configured threshold and runs a checkpoint if needed. A
//! checkpoint that cannot complete (a reader still needs old frames) is
//! deferred and retried on a later release.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::config::CheckpointMode;
use crate::connection::Connection;
use crate::error::{Error, Result};

/// Why a checkpoint did not finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
   /// Another connection held a lock the checkpoint needed
   Busy,
   /// A reader still uses frames that could not be copied back
   ReadersActive,
}

/// Result of a checkpoint attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
   /// The WAL is below the threshold
   NotNeeded { pages: u32 },
   /// Every frame in the WAL was copied back into the database file
   Checkpointed {
      log_frames: i64,
      checkpointed_frames: i64,
   },
   /// The checkpoint will be retried on a later release
   Deferred { pages: u32, reason: DeferReason },
}

impl CheckpointOutcome {
   pub fn is_deferred(&self) -> bool {
      matches!(self, CheckpointOutcome::Deferred { .. })
   }
}

/// Counters describing checkpoint activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
   pub completed: u64,
   pub deferred: u64,
}

#[derive(Debug)]
pub struct CheckpointCoordinator {
   threshold: u32,
   mode: CheckpointMode,
   wal_pages: Arc<AtomicU32>,
   completed: AtomicU64,
   deferred: AtomicU64,
}

impl CheckpointCoordinator {
   pub(crate) fn new(threshold: u32, mode: CheckpointMode) -> Self {
      Self {
         threshold,
         mode,
         wal_pages: Arc::new(AtomicU32::new(0)),
         completed: AtomicU64::new(0),
         deferred: AtomicU64::new(0),
      }
   }

   /// WAL size in pages at which a release triggers a checkpoint.
   pub fn threshold(&self) -> u32 {
      self.threshold
   }

   pub fn mode(&self) -> CheckpointMode {
      self.mode
   }

   /// WAL size in pages as of the last commit on the primary.
   pub fn wal_pages(&self) -> u32 {
      self.wal_pages.load(Ordering::Acquire)
   }

   /// The counter the primary's WAL hook writes into.
   pub(crate) fn page_counter(&self) -> Arc<AtomicU32> {
      Arc::clone(&self.wal_pages)
   }

   pub fn stats(&self) -> CheckpointStats {
      CheckpointStats {
         completed: self.completed.load(Ordering::Relaxed),
         deferred: self.deferred.load(Ordering::Relaxed),
      }
   }

   /// Checkpoint through `conn` if the WAL has reached the threshold.
   pub async fn maybe_checkpoint(&self, conn: &mut Connection) -> Result<CheckpointOutcome> {
      let pages = self.wal_pages();
      if pages < self.threshold || !conn.is_primary() {
         return Ok(CheckpointOutcome::NotNeeded { pages });
      }
      self.checkpoint(conn, self.mode).await
   }

   /// Run a checkpoint now, whatever the WAL size.
   pub async fn checkpoint(
      &self,
      conn: &mut Connection,
      mode: CheckpointMode,
   ) -> Result<CheckpointOutcome> {
      let pages = self.wal_pages();

      let result = match conn.wal_checkpoint(mode).await {
         Ok(result) => result,
         Err(Error::Busy { message, .. }) => {
            trace!(pages, %message, "checkpoint blocked by lock");
            return Ok(self.defer(pages, DeferReason::Busy));
         }
         Err(err) => return Err(err),
      };

      if result.busy {
         return Ok(self.defer(pages, DeferReason::Busy));
      }
      if result.checkpointed_frames < result.log_frames {
         return Ok(self.defer(pages, DeferReason::ReadersActive));
      }

      self.wal_pages.store(0, Ordering::Release);
      self.completed.fetch_add(1, Ordering::Relaxed);
      debug!(
         %mode,
         log_frames = result.log_frames,
         checkpointed_frames = result.checkpointed_frames,
         "checkpointed WAL"
      );
      Ok(CheckpointOutcome::Checkpointed {
         log_frames: result.log_frames,
         checkpointed_frames: result.checkpointed_frames,
      })
   }

   fn defer(&self, pages: u32, reason: DeferReason) -> CheckpointOutcome {
      self.deferred.fetch_add(1, Ordering::Relaxed);
      debug!(pages, ?reason, "checkpoint deferred");
      CheckpointOutcome::Deferred { pages, reason }
   }
}
