//! SQLite native hook registration for detecting changes to watched rows.
//!
//! Three callbacks are installed per observed connection: the preupdate hook
//! copies row images of tables with pending registrations into the
//! [`NotificationBroker`], the commit hook dispatches them and the rollback hook
//! throws them away.
//!
//! Nothing fires unless the linked SQLite defines `SQLITE_ENABLE_PREUPDATE_HOOK`;
//! [`is_preupdate_hook_enabled()`] reports whether it does.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::panic::catch_unwind;
use std::ptr;
use std::sync::Arc;

use libsqlite3_sys::{
   SQLITE_BLOB, SQLITE_DELETE, SQLITE_FLOAT, SQLITE_INSERT, SQLITE_INTEGER, SQLITE_NULL,
   SQLITE_TEXT, SQLITE_UPDATE, sqlite3, sqlite3_commit_hook, sqlite3_compileoption_used,
   sqlite3_preupdate_count, sqlite3_preupdate_hook, sqlite3_preupdate_new, sqlite3_preupdate_old,
   sqlite3_rollback_hook, sqlite3_value, sqlite3_value_blob, sqlite3_value_bytes,
   sqlite3_value_double, sqlite3_value_int64, sqlite3_value_text, sqlite3_value_type,
};
use tracing::{debug, error, trace};

use crate::broker::NotificationBroker;

/// Kind of row-level change reported by the preupdate hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowOperation {
   Insert,
   Update,
   Delete,
}

/// A SQLite value read from a row image in the preupdate hook.
#[derive(Debug, Clone, PartialEq)]
pub enum SqliteValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl SqliteValue {
   pub fn is_null(&self) -> bool {
      matches!(self, SqliteValue::Null)
   }

   /// Copies a column value out of SQLite-owned memory.
   ///
   /// # Safety
   ///
   /// The pointer must be null or point to a properly initialized sqlite3_value.
   unsafe fn from_raw(value: *mut sqlite3_value) -> Self {
      if value.is_null() {
         return SqliteValue::Null;
      }

      // SAFETY: non-null, and SQLite keeps it alive until the callback returns.
      match unsafe { sqlite3_value_type(value) } {
         SQLITE_NULL => SqliteValue::Null,
         SQLITE_INTEGER => SqliteValue::Integer(unsafe { sqlite3_value_int64(value) }),
         SQLITE_FLOAT => SqliteValue::Real(unsafe { sqlite3_value_double(value) }),
         SQLITE_TEXT => {
            let text_ptr = unsafe { sqlite3_value_text(value) };
            if text_ptr.is_null() {
               SqliteValue::Null
            } else {
               // SAFETY: SQLite returns a NUL-terminated buffer valid for this callback
               let cstr = unsafe { CStr::from_ptr(text_ptr as *const c_char) };
               SqliteValue::Text(cstr.to_string_lossy().into_owned())
            }
         }
         SQLITE_BLOB => {
            let blob_ptr = unsafe { sqlite3_value_blob(value) };
            let len = unsafe { sqlite3_value_bytes(value) } as usize;
            if blob_ptr.is_null() || len == 0 {
               SqliteValue::Blob(Vec::new())
            } else {
               // SAFETY: SQLite reported len readable bytes at blob_ptr
               let slice = unsafe { std::slice::from_raw_parts(blob_ptr as *const u8, len) };
               SqliteValue::Blob(slice.to_vec())
            }
         }
         _ => SqliteValue::Null,
      }
   }
}

/// Row change captured by the preupdate hook, held until the transaction ends.
#[derive(Debug, Clone)]
pub struct RowEvent {
   pub schema: String,
   pub table: String,
   pub operation: RowOperation,
   pub rowid: i64,
   /// Row image before the change (UPDATE and DELETE).
   pub old_values: Option<Vec<SqliteValue>>,
   /// Row image after the change (INSERT and UPDATE).
   pub new_values: Option<Vec<SqliteValue>>,
}

/// Boxed state shared by the three callbacks of one connection.
///
/// Stored as the user_data pointer of all three hooks. The Arc keeps the broker
/// alive for as long as the hooks are registered.
struct HookContext {
   broker: Arc<NotificationBroker>,
}

type ImageReader = unsafe extern "C" fn(*mut sqlite3, c_int, *mut *mut sqlite3_value) -> c_int;

/// Whether the linked SQLite defines `SQLITE_ENABLE_PREUPDATE_HOOK`.
///
/// ```rust
/// use sqlx_sqlite_notify::is_preupdate_hook_enabled;
///
/// if !is_preupdate_hook_enabled() {
///     eprintln!("push notifications unavailable; fall back to polling");
/// }
/// ```
pub fn is_preupdate_hook_enabled() -> bool {
   // SAFETY: the argument is a static NUL-terminated string.
   unsafe { sqlite3_compileoption_used(c"ENABLE_PREUPDATE_HOOK".as_ptr()) == 1 }
}

/// Registers the notification hooks on a raw SQLite connection.
///
/// # Safety
///
/// - `db` points to an open connection that outlives the registration
/// - Must be paired with exactly one [`unregister_hooks`] call before the
///   connection is handed to another owner
/// - Must not be called concurrently with statements running on `db`
///
/// # Errors
///
/// Returns an error if the linked SQLite library lacks preupdate hook support.
pub unsafe fn register_hooks(
   db: *mut sqlite3,
   broker: Arc<NotificationBroker>,
) -> crate::Result<()> {
   if !is_preupdate_hook_enabled() {
      return Err(crate::Error::HookRegistration(
         "SQLite was not compiled with SQLITE_ENABLE_PREUPDATE_HOOK. \
             Enable the 'bundled' feature or link a SQLite build with preupdate hook support."
            .to_string(),
      ));
   }

   debug!("Registering SQLite notification hooks");

   // The same pointer is handed to all three hooks. It is reclaimed by
   // `unregister_hooks` through the previous user_data returned by SQLite.
   let context_ptr = Box::into_raw(Box::new(HookContext { broker })) as *mut c_void;

   // SAFETY: db is a valid sqlite3 pointer (guaranteed by caller) and
   // context_ptr stays valid until unregister_hooks.
   unsafe {
      sqlite3_preupdate_hook(db, Some(preupdate_callback), context_ptr);
      sqlite3_commit_hook(db, Some(commit_callback), context_ptr);
      sqlite3_rollback_hook(db, Some(rollback_callback), context_ptr);
   }

   trace!("SQLite hooks registered");
   Ok(())
}

/// Removes the notification hooks and frees their shared context.
///
/// # Safety
///
/// - `db` must be the pointer previously passed to [`register_hooks`]
/// - No callback may be running on `db` while this executes
pub unsafe fn unregister_hooks(db: *mut sqlite3) {
   // SAFETY: clearing a hook returns the previous user_data, which is the
   // HookContext leaked in register_hooks.
   let prev_user_data = unsafe { sqlite3_preupdate_hook(db, None, ptr::null_mut()) };
   unsafe {
      sqlite3_commit_hook(db, None, ptr::null_mut());
      sqlite3_rollback_hook(db, None, ptr::null_mut());
   }

   if !prev_user_data.is_null() {
      // SAFETY: prev_user_data was created by Box::into_raw in register_hooks
      drop(unsafe { Box::from_raw(prev_user_data as *mut HookContext) });
      trace!("SQLite hooks unregistered and context freed");
   }
}

/// Reads one full row image through `sqlite3_preupdate_old` or `sqlite3_preupdate_new`.
///
/// # Safety
///
/// Must only be called from inside a preupdate callback for `db`.
unsafe fn read_row_image(db: *mut sqlite3, column_count: c_int, reader: ImageReader) -> Vec<SqliteValue> {
   (0..column_count)
      .map(|column| {
         let mut value: *mut sqlite3_value = ptr::null_mut();
         // SAFETY: column is in [0, column_count) and we are inside the callback
         if unsafe { reader(db, column, &mut value) } == 0 {
            unsafe { SqliteValue::from_raw(value) }
         } else {
            SqliteValue::Null
         }
      })
      .collect()
}

/// Preupdate hook callback - captures row images of watched tables.
unsafe extern "C" fn preupdate_callback(
   user_data: *mut c_void,
   db: *mut sqlite3,
   op: c_int,
   database: *const c_char,
   table: *const c_char,
   old_rowid: i64,
   new_rowid: i64,
) {
   if user_data.is_null() || table.is_null() || database.is_null() {
      return;
   }

   // A panic must not unwind into SQLite.
   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext installed by register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };

      // SAFETY: both names are NUL-terminated strings owned by SQLite for this call.
      let (Ok(schema), Ok(table)) = (
         unsafe { CStr::from_ptr(database) }.to_str(),
         unsafe { CStr::from_ptr(table) }.to_str(),
      ) else {
         return;
      };

      if !context.broker.is_table_watched(schema, table) {
         return;
      }

      let (operation, rowid) = match op {
         SQLITE_INSERT => (RowOperation::Insert, new_rowid),
         SQLITE_UPDATE => (RowOperation::Update, new_rowid),
         SQLITE_DELETE => (RowOperation::Delete, old_rowid),
         _ => return,
      };

      // SAFETY: db is the connection this callback fired for.
      let column_count = unsafe { sqlite3_preupdate_count(db) };
      if column_count < 0 {
         error!(table = %table, "Failed to get column count in preupdate hook");
         return;
      }

      let old_values = matches!(operation, RowOperation::Update | RowOperation::Delete)
         .then(|| unsafe { read_row_image(db, column_count, sqlite3_preupdate_old) });
      let new_values = matches!(operation, RowOperation::Insert | RowOperation::Update)
         .then(|| unsafe { read_row_image(db, column_count, sqlite3_preupdate_new) });

      trace!(schema = %schema, table = %table, ?operation, rowid, "Preupdate hook captured row");

      context.broker.on_preupdate(RowEvent {
         schema: schema.to_string(),
         table: table.to_string(),
         operation,
         rowid,
         old_values,
         new_values,
      });
   });

   if result.is_err() {
      // Tracing may have been the source of the panic, so stay on stderr.
      eprintln!("sqlx-sqlite-notify: panic in preupdate_callback (absorbed to prevent UB)");
   }
}

/// Commit hook callback - dispatches notifications for the committing transaction.
///
/// Returning 0 lets the commit proceed.
unsafe extern "C" fn commit_callback(user_data: *mut c_void) -> c_int {
   if user_data.is_null() {
      return 0;
   }

   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext installed by register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };
      context.broker.on_commit();
   });

   if result.is_err() {
      eprintln!("sqlx-sqlite-notify: panic in commit_callback (absorbed to prevent UB)");
   }

   0
}

/// Rollback hook callback - discards buffered row changes.
unsafe extern "C" fn rollback_callback(user_data: *mut c_void) {
   if user_data.is_null() {
      return;
   }

   let result = catch_unwind(|| {
      // SAFETY: user_data is the HookContext installed by register_hooks.
      let context = unsafe { &*(user_data as *const HookContext) };
      context.broker.on_rollback();
   });

   if result.is_err() {
      eprintln!("sqlx-sqlite-notify: panic in rollback_callback (absorbed to prevent UB)");
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_sqlite_value_from_null_pointer() {
      let value = unsafe { SqliteValue::from_raw(ptr::null_mut()) };
      assert_eq!(value, SqliteValue::Null);
      assert!(value.is_null());
   }

   #[test]
   fn test_bundled_sqlite_supports_preupdate_hook() {
      assert!(is_preupdate_hook_enabled());
   }
}
