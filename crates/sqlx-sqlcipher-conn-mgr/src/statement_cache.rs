//! Per-connection LRU cache of prepared statements

use indexmap::IndexMap;
use sqlcipher_window::Value;
use tracing::trace;

use crate::ffi::RawStatement;

/// Counters describing how a statement cache has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementCacheStats {
   pub hits: u64,
   pub misses: u64,
   pub evictions: u64,
   pub invalidations: u64,
}

/// LRU map from exact SQL text to a compiled statement.
///
/// The key is the SQL string byte for byte; `"SELECT 1"` and `"SELECT  1"`
/// are different entries. Entries are ordered oldest-used first, so the
/// entry at index 0 is the next one evicted.
#[derive(Debug)]
pub(crate) struct StatementCache<S> {
   capacity: usize,
   entries: IndexMap<String, S>,
   stats: StatementCacheStats,
}

impl<S> StatementCache<S> {
   pub(crate) fn new(capacity: usize) -> Self {
      Self {
         capacity: capacity.max(1),
         entries: IndexMap::with_capacity(capacity.max(1)),
         stats: StatementCacheStats::default(),
      }
   }

   /// Return the cached statement for `sql`, compiling and inserting it on a miss.
   ///
   /// A hit marks the entry most recently used. A miss at capacity evicts
   /// (and drops) the least recently used entry.
   pub(crate) fn get_or_insert_with<E>(
      &mut self,
      sql: &str,
      compile: impl FnOnce(&str) -> Result<S, E>,
   ) -> Result<&mut S, E> {
      if let Some(index) = self.entries.get_index_of(sql) {
         self.stats.hits += 1;
         let last = self.entries.len() - 1;
         self.entries.move_index(index, last);
         return Ok(&mut self.entries[last]);
      }

      self.stats.misses += 1;
      let statement = compile(sql)?;

      while self.entries.len() >= self.capacity {
         if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
            self.stats.evictions += 1;
            trace!(sql = %evicted, "evicted least recently used statement");
         }
      }

      let (index, _) = self.entries.insert_full(sql.to_owned(), statement);
      Ok(&mut self.entries[index])
   }

   #[cfg(test)]
   fn contains(&self, sql: &str) -> bool {
      self.entries.contains_key(sql)
   }

   pub(crate) fn len(&self) -> usize {
      self.entries.len()
   }

   pub(crate) fn capacity(&self) -> usize {
      self.capacity
   }

   pub(crate) fn stats(&self) -> StatementCacheStats {
      self.stats
   }

   /// Cached SQL texts, least recently used first.
   pub(crate) fn keys(&self) -> impl Iterator<Item = &str> {
      self.entries.keys().map(String::as_str)
   }

   pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut S> {
      self.entries.values_mut()
   }

   /// Drop every entry. Used on schema change and on close.
   pub(crate) fn invalidate_all(&mut self) {
      if self.entries.is_empty() {
         return;
      }
      self.stats.invalidations += self.entries.len() as u64;
      trace!(count = self.entries.len(), "invalidating statement cache");
      self.entries.clear();
   }
}

/// A cached statement plus the position of the query it is currently running.
///
/// Keeping the position lets consecutive window fills resume stepping
/// instead of re-running the query and skipping rows.
#[derive(Debug)]
pub(crate) struct PreparedStatement {
   pub(crate) raw: RawStatement,
   /// Parameters bound for the active query; `None` when no query is active
   pub(crate) bound: Option<Vec<Value>>,
   /// Rows stepped since the last reset
   pub(crate) position: usize,
   /// The row at `position - 1`, stepped but not stored because the window was full
   pub(crate) pending: Option<Vec<Value>>,
   /// The engine reported the end of the result
   pub(crate) exhausted: bool,
}

impl PreparedStatement {
   pub(crate) fn new(raw: RawStatement) -> Self {
      Self {
         raw,
         bound: None,
         position: 0,
         pending: None,
         exhausted: false,
      }
   }

   /// Reset the engine cursor and forget the active query.
   pub(crate) fn reset(&mut self) {
      self.raw.reset();
      self.bound = None;
      self.position = 0;
      self.pending = None;
      self.exhausted = false;
   }

   /// Bind `params` and start a fresh query.
   pub(crate) fn start(&mut self, params: &[Value]) -> crate::ffi::EngineResult<()> {
      self.reset();
      self.raw.bind_all(params)?;
      self.bound = Some(params.to_vec());
      Ok(())
   }

   /// Whether a fill starting at `start_row` can continue the active query.
   pub(crate) fn can_resume(&self, params: &[Value], start_row: usize) -> bool {
      if self.bound.as_deref() != Some(params) {
         return false;
      }
      match self.pending {
         Some(_) => self.position - 1 <= start_row,
         None => self.position <= start_row,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   /// Compile function that counts how many times each SQL text was compiled
   fn compile_counter(log: &mut Vec<String>) -> impl FnOnce(&str) -> Result<String, ()> + '_ {
      move |sql| {
         log.push(sql.to_owned());
         Ok(format!("plan:{sql}"))
      }
   }

   #[test]
   fn miss_compiles_and_hit_reuses() {
      let mut cache = StatementCache::new(3);
      let mut compiled = Vec::new();

      cache
         .get_or_insert_with("SELECT 1", compile_counter(&mut compiled))
         .unwrap();
      let plan = cache
         .get_or_insert_with("SELECT 1", compile_counter(&mut compiled))
         .unwrap();

      assert_eq!(plan.as_str(), "plan:SELECT 1");
      assert_eq!(compiled, vec!["SELECT 1"]);
      assert_eq!(cache.stats().hits, 1);
      assert_eq!(cache.stats().misses, 1);
   }

   #[test]
   fn key_is_exact_sql_text() {
      let mut cache = StatementCache::new(3);
      let mut compiled = Vec::new();

      cache
         .get_or_insert_with("SELECT 1", compile_counter(&mut compiled))
         .unwrap();
      cache
         .get_or_insert_with("SELECT  1", compile_counter(&mut compiled))
         .unwrap();
      cache
         .get_or_insert_with("select 1", compile_counter(&mut compiled))
         .unwrap();

      assert_eq!(compiled.len(), 3);
      assert_eq!(cache.len(), 3);
   }

   #[test]
   fn evicts_least_recently_used() {
      let mut cache = StatementCache::new(3);
      let mut compiled = Vec::new();

      for sql in ["a", "b", "c"] {
         cache
            .get_or_insert_with(sql, compile_counter(&mut compiled))
            .unwrap();
      }
      // Touch "a" so "b" becomes the oldest
      cache
         .get_or_insert_with("a", compile_counter(&mut compiled))
         .unwrap();
      cache
         .get_or_insert_with("d", compile_counter(&mut compiled))
         .unwrap();

      assert!(!cache.contains("b"));
      assert_eq!(cache.keys().collect::<Vec<_>>(), vec!["c", "a", "d"]);
      assert_eq!(cache.stats().evictions, 1);

      // The evicted SQL is compiled again rather than served stale
      compiled.clear();
      cache
         .get_or_insert_with("b", compile_counter(&mut compiled))
         .unwrap();
      assert_eq!(compiled, vec!["b"]);
      assert!(!cache.contains("c"));
   }

   #[test]
   fn eviction_order_follows_access_order_for_long_sequences() {
      let capacity = 4;
      let mut cache = StatementCache::new(capacity);
      let mut reference: Vec<String> = Vec::new();

      // Deterministic access pattern with repeats
      for i in 0..200usize {
         let sql = format!("q{}", (i * 7 + i / 3) % 9);
         let mut compiled = Vec::new();
         cache
            .get_or_insert_with(&sql, compile_counter(&mut compiled))
            .unwrap();

         let was_cached = reference.iter().any(|s| *s == sql);
         assert_eq!(compiled.is_empty(), was_cached, "access {i} of {sql}");

         reference.retain(|s| *s != sql);
         if reference.len() == capacity {
            reference.remove(0);
         }
         reference.push(sql);

         assert_eq!(cache.keys().collect::<Vec<_>>(), reference);
      }
   }

   #[test]
   fn compile_failure_leaves_cache_unchanged() {
      let mut cache: StatementCache<String> = StatementCache::new(1);
      let mut compiled = Vec::new();
      cache
         .get_or_insert_with("ok", compile_counter(&mut compiled))
         .unwrap();

      let result = cache.get_or_insert_with("broken", |_| Err::<String, _>("syntax error"));

      assert_eq!(result.unwrap_err(), "syntax error");
      assert!(cache.contains("ok"));
      assert_eq!(cache.stats().evictions, 0);
   }

   #[test]
   fn invalidate_all_forces_recompile() {
      let mut cache = StatementCache::new(5);
      let mut compiled = Vec::new();
      for sql in ["a", "b"] {
         cache
            .get_or_insert_with(sql, compile_counter(&mut compiled))
            .unwrap();
      }

      cache.invalidate_all();
      assert_eq!(cache.len(), 0);
      assert_eq!(cache.stats().invalidations, 2);

      compiled.clear();
      cache
         .get_or_insert_with("a", compile_counter(&mut compiled))
         .unwrap();
      assert_eq!(compiled, vec!["a"]);
   }
}
