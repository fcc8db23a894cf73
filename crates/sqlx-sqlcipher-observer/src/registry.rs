use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::stream::ChangeStream;

/// Observer settings.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
   /// Buffered notices per broadcast subscriber before it lags
   pub channel_capacity: usize,
}

impl Default for ObserverConfig {
   fn default() -> Self {
      Self {
         channel_capacity: 256,
      }
   }
}

impl ObserverConfig {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
      self.channel_capacity = capacity;
      self
   }
}

/// Handle for a registered observer.
///
/// The generation changes every time a slot is reused, so an id kept after
/// [`ObserverRegistry::unregister`] never matches a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId {
   index: u32,
   generation: u32,
}

impl ObserverId {
   pub fn index(&self) -> u32 {
      self.index
   }

   pub fn generation(&self) -> u32 {
      self.generation
   }
}

impl fmt::Display for ObserverId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{}#{}", self.index, self.generation)
   }
}

/// A committed change, as seen by observers.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
   /// Increases by one per dispatch, starting at 1
   pub sequence: u64,
   /// Rows inserted, updated or deleted by the commit
   pub rows_affected: u64,
   /// Observer that made the change, skipped during dispatch
   pub origin: Option<ObserverId>,
   pub timestamp: Instant,
}

type Callback = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

struct Slot {
   generation: u32,
   callback: Option<Callback>,
}

#[derive(Default)]
struct Slots {
   entries: Vec<Slot>,
   free: Vec<u32>,
   live: usize,
}

impl Slots {
   fn get(&self, id: ObserverId) -> Option<&Slot> {
      self
         .entries
         .get(id.index as usize)
         .filter(|slot| slot.generation == id.generation && slot.callback.is_some())
   }
}

/// Registry of change observers for one database.
///
/// Callbacks run on the task that dispatched the change, after the registry
/// lock is released, so a callback may register or unregister observers
/// (itself included). Broadcast subscribers receive every notice regardless of
/// origin.
pub struct ObserverRegistry {
   slots: RwLock<Slots>,
   sender: broadcast::Sender<ChangeNotice>,
   sequence: AtomicU64,
}

impl ObserverRegistry {
   pub fn new(channel_capacity: usize) -> Arc<Self> {
      let (sender, _) = broadcast::channel(channel_capacity.max(1));
      Arc::new(Self {
         slots: RwLock::new(Slots::default()),
         sender,
         sequence: AtomicU64::new(0),
      })
   }

   pub fn with_config(config: &ObserverConfig) -> Arc<Self> {
      Self::new(config.channel_capacity)
   }

   /// Add a callback and return its id.
   pub fn register<F>(&self, callback: F) -> ObserverId
   where
      F: Fn(&ChangeNotice) + Send + Sync + 'static,
   {
      let mut slots = self.slots.write();
      let callback: Callback = Arc::new(callback);

      let id = match slots.free.pop() {
         Some(index) => {
            let slot = &mut slots.entries[index as usize];
            slot.callback = Some(callback);
            ObserverId {
               index,
               generation: slot.generation,
            }
         }
         None => {
            let index = slots.entries.len() as u32;
            slots.entries.push(Slot {
               generation: 0,
               callback: Some(callback),
            });
            ObserverId {
               index,
               generation: 0,
            }
         }
      };
      slots.live += 1;

      trace!(observer = %id, "registered observer");
      id
   }

   /// Add a callback that stays registered until the returned guard drops.
   pub fn register_guard<F>(self: &Arc<Self>, callback: F) -> Registration
   where
      F: Fn(&ChangeNotice) + Send + Sync + 'static,
   {
      let id = self.register(callback);
      Registration {
         registry: Arc::downgrade(self),
         id,
      }
   }

   /// Remove an observer. Returns false if the id is stale or unknown.
   pub fn unregister(&self, id: ObserverId) -> bool {
      let mut slots = self.slots.write();
      if slots.get(id).is_none() {
         return false;
      }

      let slot = &mut slots.entries[id.index as usize];
      slot.callback = None;
      slot.generation = slot.generation.wrapping_add(1);
      slots.free.push(id.index);
      slots.live -= 1;

      trace!(observer = %id, "unregistered observer");
      true
   }

   pub fn is_registered(&self, id: ObserverId) -> bool {
      self.slots.read().get(id).is_some()
   }

   /// Number of live observers.
   pub fn len(&self) -> usize {
      self.slots.read().live
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }

   /// Tell every observer except `origin` about a commit.
   ///
   /// Returns how many callbacks ran. An observer unregistered by an earlier
   /// callback in the same dispatch is skipped.
   pub fn dispatch(&self, rows_affected: u64, origin: Option<ObserverId>) -> usize {
      let notice = ChangeNotice {
         sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
         rows_affected,
         origin,
         timestamp: Instant::now(),
      };

      let snapshot: Vec<(ObserverId, Callback)> = {
         let slots = self.slots.read();
         slots
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
               slot.callback.as_ref().map(|callback| {
                  let id = ObserverId {
                     index: index as u32,
                     generation: slot.generation,
                  };
                  (id, Arc::clone(callback))
               })
            })
            .collect()
      };

      let mut delivered = 0;
      for (id, callback) in snapshot {
         if Some(id) == origin || !self.is_registered(id) {
            continue;
         }
         callback(&notice);
         delivered += 1;
      }

      // No receivers is not an error
      let subscribers = self.sender.send(notice.clone()).unwrap_or(0);

      debug!(
         sequence = notice.sequence,
         rows_affected,
         delivered,
         subscribers,
         "dispatched change notice"
      );
      delivered
   }

   /// Receive every notice dispatched from now on.
   pub fn subscribe(&self) -> broadcast::Receiver<ChangeNotice> {
      self.sender.subscribe()
   }

   /// Like [`subscribe`](Self::subscribe), as a `Stream`.
   pub fn subscribe_stream(&self) -> ChangeStream {
      ChangeStream::new(self.subscribe())
   }
}

impl fmt::Debug for ObserverRegistry {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ObserverRegistry")
         .field("observers", &self.len())
         .field("subscribers", &self.sender.receiver_count())
         .field("sequence", &self.sequence.load(Ordering::SeqCst))
         .finish()
   }
}

/// Keeps an observer registered; unregisters it on drop.
#[must_use = "the observer is unregistered when the registration is dropped"]
#[derive(Debug)]
pub struct Registration {
   registry: Weak<ObserverRegistry>,
   id: ObserverId,
}

impl Registration {
   pub fn id(&self) -> ObserverId {
      self.id
   }
}

impl Drop for Registration {
   fn drop(&mut self) {
      if let Some(registry) = self.registry.upgrade() {
         registry.unregister(self.id);
      }
   }
}
