//! Connection wrapper that carries the notification hooks.
//!
//! Hooks are installed when the wrapper is created and removed when it is
//! dropped or unwrapped, so a pooled connection never outlives its hooks'
//! context or reaches another owner with them still attached.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use libsqlite3_sys::sqlite3;
use sqlx::Sqlite;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::SqliteConnection;
use tracing::trace;

use crate::Result;
use crate::broker::NotificationBroker;
use crate::hooks;

/// A pool connection whose committed changes are matched against pending
/// registrations.
///
/// Derefs to `SqliteConnection`, so `&mut *conn` can be passed to sqlx queries.
pub struct ObservableConnection {
   conn: Option<PoolConnection<Sqlite>>,
   /// Raw handle cached at registration so Drop can unregister synchronously.
   raw_db: Option<*mut sqlite3>,
}

// SAFETY: raw_db is only used to install and remove hooks by the single owner
// of this wrapper. The underlying connection is already Send via PoolConnection.
unsafe impl Send for ObservableConnection {}

impl ObservableConnection {
   pub(crate) async fn new(
      mut conn: PoolConnection<Sqlite>,
      broker: Arc<NotificationBroker>,
   ) -> Result<Self> {
      let mut handle = conn.lock_handle().await?;
      let db: *mut sqlite3 = handle.as_raw_handle().as_ptr();

      // SAFETY: db belongs to the connection we own and no statement is running on it.
      unsafe {
         hooks::register_hooks(db, broker)?;
      }
      drop(handle);

      Ok(Self {
         conn: Some(conn),
         raw_db: Some(db),
      })
   }

   fn release_hooks(&mut self) {
      if let Some(db) = self.raw_db.take() {
         // SAFETY: db was registered in new() and is still owned through self.conn.
         unsafe {
            hooks::unregister_hooks(db);
         }
         trace!("Notification hooks removed from connection");
      }
   }

   /// Removes the hooks and returns the plain pool connection.
   pub fn into_inner(mut self) -> PoolConnection<Sqlite> {
      self.release_hooks();
      self
         .conn
         .take()
         .expect("connection is present until into_inner or drop")
   }
}

impl Drop for ObservableConnection {
   fn drop(&mut self) {
      self.release_hooks();
   }
}

impl Deref for ObservableConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      self
         .conn
         .as_deref()
         .expect("connection is present until into_inner or drop")
   }
}

impl DerefMut for ObservableConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self
         .conn
         .as_deref_mut()
         .expect("connection is present until into_inner or drop")
   }
}
