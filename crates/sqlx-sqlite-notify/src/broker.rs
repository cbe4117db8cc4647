//! Transaction-aware dispatch of single-fire notifications.
//!
//! Row changes captured by the preupdate hook are buffered until the
//! transaction (explicit or implicit) completes. On commit the buffer is folded
//! into one net change per row, each matching registration is removed and its
//! callback invoked once. On rollback the buffer is discarded.
//!
//! ```text
//! preupdate_hook ──► buffer ──► COMMIT ──► fold per row ──► take matching registrations ──► callbacks
//!                         └───► ROLLBACK ──► clear
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::hooks::{RowEvent, RowOperation, SqliteValue};
use crate::notification::{
   Notification, NotificationCallback, NotificationPhase, RegistrationId, WatchCommand, table_key,
};

/// Net effect of one transaction on one row.
#[derive(Debug, Clone)]
pub(crate) struct NetChange {
   pub schema: String,
   pub table: String,
   pub rowid: i64,
   pub operation: RowOperation,
   /// Image before the first change in the transaction.
   pub old_values: Option<Vec<SqliteValue>>,
   /// Image after the last change in the transaction.
   pub new_values: Option<Vec<SqliteValue>>,
}

struct Registration {
   queue: String,
   command: WatchCommand,
   callback: NotificationCallback,
}

/// Holds pending registrations and the per-transaction change buffer.
pub struct NotificationBroker {
   buffer: Mutex<Vec<RowEvent>>,
   registrations: Mutex<HashMap<RegistrationId, Registration>>,
   /// Lower-cased `schema.table` -> number of pending registrations on it.
   watched_tables: RwLock<HashMap<String, usize>>,
   next_id: AtomicU64,
}

impl NotificationBroker {
   pub fn new() -> Arc<Self> {
      Arc::new(Self {
         buffer: Mutex::new(Vec::new()),
         registrations: Mutex::new(HashMap::new()),
         watched_tables: RwLock::new(HashMap::new()),
         next_id: AtomicU64::new(1),
      })
   }

   /// Checks whether any pending registration targets the table.
   pub fn is_table_watched(&self, schema: &str, table: &str) -> bool {
      self
         .watched_tables
         .read()
         .contains_key(&table_key(schema, table))
   }

   /// Number of registrations that have not fired yet.
   pub fn pending(&self) -> usize {
      self.registrations.lock().len()
   }

   pub(crate) fn next_id(&self) -> RegistrationId {
      RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed))
   }

   pub(crate) fn insert(
      &self,
      id: RegistrationId,
      queue: &str,
      command: WatchCommand,
      callback: NotificationCallback,
   ) {
      trace!(%id, table = %command.table, rowid = command.rowid, "Adding registration");
      let key = command.table_key();
      let mut registrations = self.registrations.lock();
      registrations.insert(
         id,
         Registration {
            queue: queue.to_string(),
            command,
            callback,
         },
      );
      *self.watched_tables.write().entry(key).or_insert(0) += 1;
   }

   /// Removes a registration without firing it. Returns false if it already fired.
   pub fn remove(&self, id: RegistrationId) -> bool {
      let mut registrations = self.registrations.lock();
      match registrations.remove(&id) {
         Some(registration) => {
            self.unwatch(&registration.command);
            true
         }
         None => false,
      }
   }

   /// Drops every registration made on `queue` without firing them.
   pub(crate) fn remove_queue(&self, queue: &str) -> usize {
      let mut registrations = self.registrations.lock();
      let ids: Vec<RegistrationId> = registrations
         .iter()
         .filter(|(_, r)| r.queue == queue)
         .map(|(id, _)| *id)
         .collect();

      for id in &ids {
         if let Some(registration) = registrations.remove(id) {
            self.unwatch(&registration.command);
         }
      }
      ids.len()
   }

   fn unwatch(&self, command: &WatchCommand) {
      let mut watched = self.watched_tables.write();
      let key = command.table_key();
      if let Some(count) = watched.get_mut(&key) {
         *count -= 1;
         if *count == 0 {
            watched.remove(&key);
         }
      }
   }

   /// Called by preupdate_hook - buffers the row change until commit or rollback.
   pub fn on_preupdate(&self, event: RowEvent) {
      self.buffer.lock().push(event);
   }

   /// Called by commit_hook - fires every registration whose row changed.
   ///
   /// Callbacks run after all locks are released so they may register again.
   pub fn on_commit(&self) {
      let events = std::mem::take(&mut *self.buffer.lock());
      if events.is_empty() {
         return;
      }

      let changes = fold_changes(events);
      let fired: Vec<(NotificationCallback, Notification)> = {
         let mut registrations = self.registrations.lock();
         let mut fired = Vec::new();
         for change in &changes {
            let matching: Vec<RegistrationId> = registrations
               .iter()
               .filter(|(_, r)| r.command.matches(change))
               .map(|(id, _)| *id)
               .collect();

            for id in matching {
               if let Some(registration) = registrations.remove(&id) {
                  self.unwatch(&registration.command);
                  let reason = registration.command.reason_for(change);
                  fired.push((
                     registration.callback,
                     Notification::new(id, reason, NotificationPhase::Change),
                  ));
               }
            }
         }
         fired
      };

      if fired.is_empty() {
         return;
      }

      debug!(count = fired.len(), "Dispatching notifications on commit");
      for (callback, notification) in fired {
         callback(notification);
      }
   }

   /// Called by rollback_hook - discards buffered row changes.
   pub fn on_rollback(&self) {
      let count = {
         let mut buffer = self.buffer.lock();
         let count = buffer.len();
         buffer.clear();
         count
      };

      if count > 0 {
         debug!(count, "Discarding buffered row changes on rollback");
      }
   }
}

/// Folds a transaction's row events into one net change per row, in order of
/// first appearance. A row inserted and deleted in the same transaction has no
/// net change.
pub(crate) fn fold_changes(events: Vec<RowEvent>) -> Vec<NetChange> {
   let mut order: Vec<(String, i64)> = Vec::new();
   let mut folded: HashMap<(String, i64), (RowOperation, NetChange)> = HashMap::new();

   for event in events {
      let key = (table_key(&event.schema, &event.table), event.rowid);
      match folded.get_mut(&key) {
         Some((_, net)) => {
            net.operation = event.operation;
            net.new_values = event.new_values;
         }
         None => {
            order.push(key.clone());
            folded.insert(
               key,
               (
                  event.operation,
                  NetChange {
                     schema: event.schema,
                     table: event.table,
                     rowid: event.rowid,
                     operation: event.operation,
                     old_values: event.old_values,
                     new_values: event.new_values,
                  },
               ),
            );
         }
      }
   }

   order
      .into_iter()
      .filter_map(|key| folded.remove(&key))
      .filter_map(|(first, mut net)| {
         net.operation = match (first, net.operation) {
            (RowOperation::Insert, RowOperation::Delete) => return None,
            (RowOperation::Insert, _) => RowOperation::Insert,
            (_, RowOperation::Delete) => RowOperation::Delete,
            _ => RowOperation::Update,
         };
         Some(net)
      })
      .collect()
}

impl std::fmt::Debug for NotificationBroker {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("NotificationBroker")
         .field("buffer_len", &self.buffer.lock().len())
         .field("registrations", &self.registrations.lock().len())
         .finish()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::notification::NotificationReason;
   use std::sync::mpsc;

   fn event(operation: RowOperation, rowid: i64, old: Option<Vec<SqliteValue>>, new: Option<Vec<SqliteValue>>) -> RowEvent {
      RowEvent {
         schema: "main".into(),
         table: "ledger".into(),
         operation,
         rowid,
         old_values: old,
         new_values: new,
      }
   }

   fn stamp(value: &str) -> SqliteValue {
      SqliteValue::Text(value.into())
   }

   #[test]
   fn test_fold_insert_then_update_is_insert() {
      let changes = fold_changes(vec![
         event(RowOperation::Insert, 7, None, Some(vec![SqliteValue::Null])),
         event(RowOperation::Update, 7, Some(vec![SqliteValue::Null]), Some(vec![stamp("t1")])),
      ]);

      assert_eq!(changes.len(), 1);
      assert_eq!(changes[0].operation, RowOperation::Insert);
      assert!(changes[0].old_values.is_none());
      assert_eq!(changes[0].new_values, Some(vec![stamp("t1")]));
   }

   #[test]
   fn test_fold_insert_then_delete_has_no_net_change() {
      let changes = fold_changes(vec![
         event(RowOperation::Insert, 1, None, Some(vec![])),
         event(RowOperation::Delete, 1, Some(vec![]), None),
      ]);
      assert!(changes.is_empty());
   }

   #[test]
   fn test_fold_keeps_rows_apart() {
      let changes = fold_changes(vec![
         event(RowOperation::Update, 2, Some(vec![]), Some(vec![])),
         event(RowOperation::Delete, 3, Some(vec![]), None),
         event(RowOperation::Update, 2, Some(vec![]), Some(vec![])),
      ]);

      assert_eq!(changes.len(), 2);
      assert_eq!((changes[0].rowid, changes[0].operation), (2, RowOperation::Update));
      assert_eq!((changes[1].rowid, changes[1].operation), (3, RowOperation::Delete));
   }

   #[test]
   fn test_commit_fires_matching_registration_once() {
      let broker = NotificationBroker::new();
      let (tx, rx) = mpsc::channel();
      let id = broker.next_id();
      let command = WatchCommand::new("main", "ledger", 5)
         .with_reason_column(0, NotificationReason::Delete);
      broker.insert(id, "q", command, Box::new(move |n| tx.send(n).unwrap()));
      assert!(broker.is_table_watched("MAIN", "Ledger"));

      broker.on_preupdate(event(
         RowOperation::Update,
         5,
         Some(vec![SqliteValue::Null]),
         Some(vec![stamp("t2")]),
      ));
      broker.on_commit();

      let notification = rx.try_recv().unwrap();
      assert_eq!(notification.registration, id);
      assert_eq!(notification.reason, NotificationReason::Delete);
      assert_eq!(notification.phase, NotificationPhase::Change);
      assert_eq!(broker.pending(), 0);
      assert!(!broker.is_table_watched("main", "ledger"));

      broker.on_preupdate(event(RowOperation::Update, 5, Some(vec![]), Some(vec![])));
      broker.on_commit();
      assert!(rx.try_recv().is_err(), "registration must be single-fire");
   }

   #[test]
   fn test_rollback_discards_buffer() {
      let broker = NotificationBroker::new();
      let (tx, rx) = mpsc::channel();
      let id = broker.next_id();
      broker.insert(
         id,
         "q",
         WatchCommand::new("main", "ledger", 5),
         Box::new(move |n| tx.send(n).unwrap()),
      );

      broker.on_preupdate(event(RowOperation::Update, 5, Some(vec![]), Some(vec![])));
      broker.on_rollback();
      broker.on_commit();

      assert!(rx.try_recv().is_err());
      assert_eq!(broker.pending(), 1);
   }

   #[test]
   fn test_remove_queue_only_drops_that_queue() {
      let broker = NotificationBroker::new();
      let a = broker.next_id();
      let b = broker.next_id();
      broker.insert(a, "first", WatchCommand::new("main", "ledger", 1), Box::new(|_| {}));
      broker.insert(b, "second", WatchCommand::new("main", "ledger", 2), Box::new(|_| {}));

      assert_eq!(broker.remove_queue("first"), 1);
      assert!(!broker.remove(a));
      assert!(broker.remove(b));
      assert!(!broker.is_table_watched("main", "ledger"));
   }
}
