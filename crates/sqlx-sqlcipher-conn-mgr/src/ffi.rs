//! Raw engine calls.
//!
//! This is the only module with `unsafe` code. SQLx owns the `sqlite3`
//! connection handle; this module wraps the statement handles we compile
//! on top of it plus the hooks SQLx does not expose (WAL hook, progress
//! handler, interrupt).
//!
//! Connections are opened in serialized threading mode, so calls on a
//! [`RawDb`] from another thread (interrupt, hook removal) are safe.

use std::cell::Cell;
use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use libsqlite3_sys as ffi;
use sqlcipher_window::{Value, ValueRef};

/// VM instructions between progress handler calls.
const PROGRESS_OPS: c_int = 1000;

/// An engine result code with its message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EngineError {
   pub code: i32,
   pub message: String,
}

impl EngineError {
   pub(crate) fn new(code: i32, message: impl Into<String>) -> Self {
      Self {
         code,
         message: message.into(),
      }
   }

   pub(crate) fn is_schema_change(&self) -> bool {
      self.code & 0xff == ffi::SQLITE_SCHEMA
   }

   pub(crate) fn is_interrupt(&self) -> bool {
      self.code & 0xff == ffi::SQLITE_INTERRUPT
   }

   pub(crate) fn into_error(self, sql: &str) -> crate::Error {
      crate::Error::from_engine(self.code, self.message, sql)
   }
}

pub(crate) type EngineResult<T> = std::result::Result<T, EngineError>;

/// Borrowed `sqlite3` connection pointer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawDb(NonNull<ffi::sqlite3>);

// SAFETY: connections are opened with SQLITE_OPEN_FULLMUTEX (sqlx `serialized(true)`),
// so the engine serializes every call made through this pointer.
unsafe impl Send for RawDb {}
unsafe impl Sync for RawDb {}

impl RawDb {
   pub(crate) fn new(handle: NonNull<ffi::sqlite3>) -> Self {
      Self(handle)
   }

   fn as_ptr(&self) -> *mut ffi::sqlite3 {
      self.0.as_ptr()
   }

   fn last_error(&self) -> EngineError {
      // SAFETY: the handle is open for as long as a RawDb for it is in use.
      unsafe {
         let code = ffi::sqlite3_extended_errcode(self.as_ptr());
         let message = ffi::sqlite3_errmsg(self.as_ptr());
         let message = if message.is_null() {
            String::from("unknown error")
         } else {
            CStr::from_ptr(message).to_string_lossy().into_owned()
         };
         EngineError::new(code, message)
      }
   }

   /// Rows changed by INSERT, UPDATE or DELETE since the connection opened.
   ///
   /// Unlike `sqlite3_changes`, DDL statements leave this count untouched.
   pub(crate) fn total_changes(&self) -> u64 {
      // SAFETY: see last_error.
      let changes = unsafe { ffi::sqlite3_total_changes64(self.as_ptr()) };
      u64::try_from(changes).unwrap_or(0)
   }

   pub(crate) fn last_insert_rowid(&self) -> i64 {
      // SAFETY: see last_error.
      unsafe { ffi::sqlite3_last_insert_rowid(self.as_ptr()) }
   }

   /// False while a transaction is open on this connection.
   pub(crate) fn is_autocommit(&self) -> bool {
      // SAFETY: see last_error.
      unsafe { ffi::sqlite3_get_autocommit(self.as_ptr()) != 0 }
   }

   /// Ask the engine to abort the running statement at its next safe point.
   pub(crate) fn interrupt(&self) {
      // SAFETY: sqlite3_interrupt may be called from any thread while the
      // connection is open; InterruptSlot guarantees the latter.
      unsafe { ffi::sqlite3_interrupt(self.as_ptr()) }
   }

   /// Free as much of this connection's page cache as possible.
   pub(crate) fn release_memory(&self) -> i32 {
      // SAFETY: see last_error.
      unsafe { ffi::sqlite3_db_release_memory(self.as_ptr()) }
   }

   /// Compile a single statement.
   pub(crate) fn prepare(&self, sql: &str) -> EngineResult<RawStatement> {
      let len = c_int::try_from(sql.len())
         .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "SQL text too long"))?;
      let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
      let mut tail: *const c_char = ptr::null();

      // SAFETY: `sql` outlives the call and its length is passed explicitly.
      let rc = unsafe {
         ffi::sqlite3_prepare_v3(
            self.as_ptr(),
            sql.as_ptr().cast::<c_char>(),
            len,
            ffi::SQLITE_PREPARE_PERSISTENT as c_uint,
            &mut stmt,
            &mut tail,
         )
      };
      if rc != ffi::SQLITE_OK {
         return Err(self.last_error());
      }

      let Some(stmt) = NonNull::new(stmt) else {
         return Err(EngineError::new(
            ffi::SQLITE_MISUSE,
            "SQL text contains no statement",
         ));
      };
      let statement = RawStatement::new(stmt);

      // SAFETY: tail points into `sql` (or one past its end).
      let consumed = unsafe { tail.offset_from(sql.as_ptr().cast::<c_char>()) };
      let rest = usize::try_from(consumed)
         .ok()
         .and_then(|offset| sql.get(offset..))
         .unwrap_or_default();
      if !rest.trim_matches(|c: char| c.is_whitespace() || c == ';').is_empty() {
         return Err(EngineError::new(
            ffi::SQLITE_MISUSE,
            "multiple statements are not supported here; use execute_batch",
         ));
      }

      Ok(statement)
   }
}

/// Outcome of a single `sqlite3_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
   Row,
   Done,
}

/// A compiled statement, finalized on drop.
///
/// Must be dropped before the connection it was compiled on closes.
#[derive(Debug)]
pub(crate) struct RawStatement {
   stmt: NonNull<ffi::sqlite3_stmt>,
   param_count: usize,
}

// SAFETY: the statement is only touched by the owner of its Connection, and
// the connection runs in serialized mode.
unsafe impl Send for RawStatement {}

impl RawStatement {
   fn new(stmt: NonNull<ffi::sqlite3_stmt>) -> Self {
      // SAFETY: stmt was just returned by a successful prepare.
      let param_count = unsafe { ffi::sqlite3_bind_parameter_count(stmt.as_ptr()) };
      Self {
         stmt,
         param_count: usize::try_from(param_count).unwrap_or(0),
      }
   }

   fn as_ptr(&self) -> *mut ffi::sqlite3_stmt {
      self.stmt.as_ptr()
   }

   fn db_error(&self) -> EngineError {
      // SAFETY: a live statement always has a live owning connection.
      let db = unsafe { ffi::sqlite3_db_handle(self.as_ptr()) };
      match NonNull::new(db) {
         Some(db) => RawDb::new(db).last_error(),
         None => EngineError::new(ffi::SQLITE_MISUSE, "statement has no connection"),
      }
   }

   /// Result columns. Read live since the engine may recompile the
   /// statement after a schema change.
   pub(crate) fn column_count(&self) -> usize {
      // SAFETY: valid statement.
      let count = unsafe { ffi::sqlite3_column_count(self.as_ptr()) };
      usize::try_from(count).unwrap_or(0)
   }

   pub(crate) fn column_names(&self) -> Vec<String> {
      (0..self.column_count())
         .map(|i| {
            // SAFETY: i < column_count; the returned string lives until the next
            // prepare/finalize and is copied immediately.
            unsafe {
               let name = ffi::sqlite3_column_name(self.as_ptr(), i as c_int);
               if name.is_null() {
                  String::new()
               } else {
                  CStr::from_ptr(name).to_string_lossy().into_owned()
               }
            }
         })
         .collect()
   }

   /// Reset to the beginning of the result; bindings are kept.
   pub(crate) fn reset(&mut self) {
      // SAFETY: valid statement. The return code repeats the last step error,
      // which was already reported.
      unsafe {
         ffi::sqlite3_reset(self.as_ptr());
      }
   }

   /// Bind positional parameters, replacing any previous bindings.
   pub(crate) fn bind_all(&mut self, params: &[Value]) -> EngineResult<()> {
      if params.len() != self.param_count {
         return Err(EngineError::new(
            ffi::SQLITE_RANGE,
            format!(
               "expected {} bind arguments but {} were provided",
               self.param_count,
               params.len()
            ),
         ));
      }

      // SAFETY: valid statement; SQLITE_TRANSIENT makes the engine copy text and blobs.
      unsafe {
         ffi::sqlite3_clear_bindings(self.as_ptr());
      }
      for (i, value) in params.iter().enumerate() {
         let index = (i + 1) as c_int;
         let rc = unsafe {
            match value {
               Value::Null => ffi::sqlite3_bind_null(self.as_ptr(), index),
               Value::Integer(v) => ffi::sqlite3_bind_int64(self.as_ptr(), index, *v),
               Value::Float(v) => ffi::sqlite3_bind_double(self.as_ptr(), index, *v),
               Value::Text(s) => {
                  let len = c_int::try_from(s.len())
                     .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "text parameter too long"))?;
                  ffi::sqlite3_bind_text(
                     self.as_ptr(),
                     index,
                     s.as_ptr().cast::<c_char>(),
                     len,
                     ffi::SQLITE_TRANSIENT(),
                  )
               }
               Value::Blob(b) if b.is_empty() => ffi::sqlite3_bind_zeroblob(self.as_ptr(), index, 0),
               Value::Blob(b) => {
                  let len = c_int::try_from(b.len())
                     .map_err(|_| EngineError::new(ffi::SQLITE_TOOBIG, "blob parameter too long"))?;
                  ffi::sqlite3_bind_blob(
                     self.as_ptr(),
                     index,
                     b.as_ptr().cast::<c_void>(),
                     len,
                     ffi::SQLITE_TRANSIENT(),
                  )
               }
            }
         };
         if rc != ffi::SQLITE_OK {
            return Err(self.db_error());
         }
      }
      Ok(())
   }

   pub(crate) fn step(&mut self) -> EngineResult<Step> {
      // SAFETY: valid statement.
      match unsafe { ffi::sqlite3_step(self.as_ptr()) } {
         ffi::SQLITE_ROW => Ok(Step::Row),
         ffi::SQLITE_DONE => Ok(Step::Done),
         _ => Err(self.db_error()),
      }
   }

   /// Read a column of the current row. Valid until the next step or reset.
   pub(crate) fn column(&self, index: usize) -> ValueRef<'_> {
      let i = index as c_int;
      // SAFETY: called only after step() returned Row and index < column_count.
      // Text/blob pointers stay valid until the next step/reset, which need &mut self.
      unsafe {
         match ffi::sqlite3_column_type(self.as_ptr(), i) {
            ffi::SQLITE_INTEGER => ValueRef::Integer(ffi::sqlite3_column_int64(self.as_ptr(), i)),
            ffi::SQLITE_FLOAT => ValueRef::Float(ffi::sqlite3_column_double(self.as_ptr(), i)),
            ffi::SQLITE_TEXT => {
               let text = ffi::sqlite3_column_text(self.as_ptr(), i);
               let len = ffi::sqlite3_column_bytes(self.as_ptr(), i);
               ValueRef::Text(raw_slice(text, len))
            }
            ffi::SQLITE_BLOB => {
               let blob = ffi::sqlite3_column_blob(self.as_ptr(), i).cast::<u8>();
               let len = ffi::sqlite3_column_bytes(self.as_ptr(), i);
               ValueRef::Blob(raw_slice(blob, len))
            }
            _ => ValueRef::Null,
         }
      }
   }
}

unsafe fn raw_slice<'a>(data: *const u8, len: c_int) -> &'a [u8] {
   match usize::try_from(len) {
      Ok(len) if len > 0 && !data.is_null() => unsafe { std::slice::from_raw_parts(data, len) },
      _ => &[],
   }
}

impl Drop for RawStatement {
   fn drop(&mut self) {
      // SAFETY: finalize exactly once; the owning connection is still open
      // because Connection drops its statement cache before the sqlx handle.
      unsafe {
         ffi::sqlite3_finalize(self.as_ptr());
      }
   }
}

struct Deadline {
   at: Instant,
   expired: Cell<bool>,
}

unsafe extern "C" fn progress_callback(arg: *mut c_void) -> c_int {
   // SAFETY: arg is the Deadline boxed in ProgressGuard, alive while registered.
   let deadline = unsafe { &*arg.cast::<Deadline>() };
   if Instant::now() >= deadline.at {
      deadline.expired.set(true);
      1
   } else {
      0
   }
}

/// Aborts statements that run past a deadline. Removed on drop.
pub(crate) struct ProgressGuard {
   db: RawDb,
   deadline: Box<Deadline>,
}

impl ProgressGuard {
   pub(crate) fn install(db: RawDb, at: Instant) -> Self {
      let deadline = Box::new(Deadline {
         at,
         expired: Cell::new(false),
      });
      let arg = ptr::from_ref::<Deadline>(deadline.as_ref())
         .cast_mut()
         .cast::<c_void>();
      // SAFETY: the box outlives the registration; Drop removes the handler first.
      unsafe {
         ffi::sqlite3_progress_handler(db.as_ptr(), PROGRESS_OPS, Some(progress_callback), arg);
      }
      Self { db, deadline }
   }

   pub(crate) fn expired(&self) -> bool {
      self.deadline.expired.get()
   }
}

impl Drop for ProgressGuard {
   fn drop(&mut self) {
      // SAFETY: removing the handler before the Deadline box is freed.
      unsafe {
         ffi::sqlite3_progress_handler(self.db.as_ptr(), 0, None, ptr::null_mut());
      }
   }
}

unsafe extern "C" fn wal_hook_callback(
   arg: *mut c_void,
   _db: *mut ffi::sqlite3,
   _name: *const c_char,
   pages: c_int,
) -> c_int {
   // SAFETY: arg is the AtomicU32 kept alive by WalHookRegistration.
   let counter = unsafe { &*arg.cast::<AtomicU32>() };
   counter.store(u32::try_from(pages).unwrap_or(0), Ordering::Release);
   ffi::SQLITE_OK
}

/// Records the WAL size in pages after every commit.
///
/// Registering a WAL hook replaces the engine's built-in auto-checkpoint;
/// the checkpoint coordinator takes over that job.
pub(crate) struct WalHookRegistration {
   db: RawDb,
   counter: *const AtomicU32,
}

// SAFETY: the counter is an Arc'd atomic and the db pointer is serialized.
unsafe impl Send for WalHookRegistration {}

impl WalHookRegistration {
   pub(crate) fn register(db: RawDb, counter: Arc<AtomicU32>) -> Self {
      let counter = Arc::into_raw(counter);
      // SAFETY: the Arc reference leaked above keeps the counter alive until Drop.
      unsafe {
         ffi::sqlite3_wal_hook(
            db.as_ptr(),
            Some(wal_hook_callback),
            counter.cast_mut().cast::<c_void>(),
         );
      }
      Self { db, counter }
   }
}

impl Drop for WalHookRegistration {
   fn drop(&mut self) {
      // SAFETY: unhook before releasing the counter. The connection is still
      // open because Connection drops this before its sqlx handle.
      unsafe {
         ffi::sqlite3_wal_hook(self.db.as_ptr(), None, ptr::null_mut());
         drop(Arc::from_raw(self.counter));
      }
   }
}

/// Ask the engine to release unused heap memory held by any connection.
pub(crate) fn release_memory(bytes: i32) -> i32 {
   // SAFETY: global call, thread-safe.
   unsafe { ffi::sqlite3_release_memory(bytes) }
}
