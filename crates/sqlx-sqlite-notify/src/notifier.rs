//! Listener and registration management for a single database.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use tracing::{debug, trace};

use crate::Result;
use crate::broker::NotificationBroker;
use crate::connection::ObservableConnection;
use crate::error::Error;
use crate::hooks::is_preupdate_hook_enabled;
use crate::notification::{
   Notification, NotificationCallback, NotificationPhase, NotificationReason, RegistrationId,
   WatchCommand,
};

/// Single-fire change notifications for one SQLite database.
///
/// Registrations are grouped by queue. A queue accepts registrations only while
/// at least one listener is running on it; listeners are reference counted, and
/// stopping the last one drops the queue's pending registrations.
pub struct SqliteNotifier {
   pool: SqlitePool,
   broker: Arc<NotificationBroker>,
   listeners: Mutex<HashMap<String, usize>>,
}

impl SqliteNotifier {
   /// Creates a notifier. `pool` is only used to inspect the schema.
   pub fn new(pool: SqlitePool) -> Self {
      Self {
         pool,
         broker: NotificationBroker::new(),
         listeners: Mutex::new(HashMap::new()),
      }
   }

   /// Whether the linked SQLite library can deliver notifications at all.
   pub fn is_supported() -> bool {
      is_preupdate_hook_enabled()
   }

   /// Starts (or joins) the listener for `queue`. Returns the listener count.
   pub fn start_listener(&self, queue: &str) -> usize {
      let mut listeners = self.listeners.lock();
      let count = listeners.entry(queue.to_string()).or_insert(0);
      *count += 1;
      debug!(queue = %queue, listeners = *count, "Listener started");
      *count
   }

   /// Leaves the listener for `queue`. Returns true when the last listener stopped.
   pub fn stop_listener(&self, queue: &str) -> bool {
      let mut listeners = self.listeners.lock();
      let Some(count) = listeners.get_mut(queue) else {
         return false;
      };

      *count -= 1;
      if *count > 0 {
         debug!(queue = %queue, listeners = *count, "Listener released");
         return false;
      }

      listeners.remove(queue);
      drop(listeners);
      let dropped = self.broker.remove_queue(queue);
      debug!(queue = %queue, dropped, "Listener stopped");
      true
   }

   pub fn is_listening(&self, queue: &str) -> bool {
      self.listeners.lock().contains_key(queue)
   }

   /// Registers a single-fire callback for the row described by `command`.
   ///
   /// If the watched table does not exist the callback fires immediately with
   /// [`NotificationReason::Invalid`] in the [`NotificationPhase::Subscribe`]
   /// phase, and nothing stays registered.
   pub async fn register(
      &self,
      queue: &str,
      command: WatchCommand,
      callback: NotificationCallback,
   ) -> Result<RegistrationId> {
      if !self.is_listening(queue) {
         return Err(Error::ListenerNotStarted(queue.to_string()));
      }

      let id = self.broker.next_id();
      if !self.table_exists(&command.schema, &command.table).await? {
         debug!(%id, table = %command.table, "Watched table missing; registration invalid");
         callback(Notification::new(
            id,
            NotificationReason::Invalid,
            NotificationPhase::Subscribe,
         ));
         return Ok(id);
      }

      self.broker.insert(id, queue, command, callback);
      Ok(id)
   }

   /// Cancels a registration. Returns false if it already fired or never existed.
   pub fn unregister(&self, id: RegistrationId) -> bool {
      let removed = self.broker.remove(id);
      trace!(%id, removed, "Unregister");
      removed
   }

   /// Wraps a connection so its committed writes are matched against registrations.
   pub async fn observe(&self, conn: PoolConnection<Sqlite>) -> Result<ObservableConnection> {
      ObservableConnection::new(conn, Arc::clone(&self.broker)).await
   }

   /// Number of registrations waiting for a change.
   pub fn pending_registrations(&self) -> usize {
      self.broker.pending()
   }

   pub fn broker(&self) -> &Arc<NotificationBroker> {
      &self.broker
   }

   async fn table_exists(&self, schema: &str, table: &str) -> Result<bool> {
      let sql = format!(
         "SELECT COUNT(*) FROM \"{}\".sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
         schema.replace('"', "\"\"")
      );
      let (count,): (i64,) = sqlx::query_as(&sql).bind(table).fetch_one(&self.pool).await?;
      Ok(count > 0)
   }
}

impl std::fmt::Debug for SqliteNotifier {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SqliteNotifier")
         .field("broker", &self.broker)
         .field("listeners", &self.listeners.lock().len())
         .finish()
   }
}
