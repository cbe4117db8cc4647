use std::fmt;
use std::time::Instant;

use crate::broker::NetChange;
use crate::hooks::{RowOperation, SqliteValue};

/// Why a notification was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationReason {
   Insert,
   Update,
   Delete,
   /// The registration could not be honoured (e.g. the watched table is missing).
   Invalid,
}

impl From<RowOperation> for NotificationReason {
   fn from(operation: RowOperation) -> Self {
      match operation {
         RowOperation::Insert => NotificationReason::Insert,
         RowOperation::Update => NotificationReason::Update,
         RowOperation::Delete => NotificationReason::Delete,
      }
   }
}

/// When a notification was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationPhase {
   /// While the registration was being set up; no data changed.
   Subscribe,
   /// After a committed change to the watched row.
   Change,
}

/// Identifier handed out for each registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub(crate) u64);

impl RegistrationId {
   pub fn new(id: u64) -> Self {
      Self(id)
   }

   pub fn get(self) -> u64 {
      self.0
   }
}

impl fmt::Display for RegistrationId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Payload passed to a registration's callback.
#[derive(Debug, Clone)]
pub struct Notification {
   pub registration: RegistrationId,
   pub reason: NotificationReason,
   pub phase: NotificationPhase,
   pub timestamp: Instant,
}

impl Notification {
   /// A notification stamped with the current instant.
   pub fn new(
      registration: RegistrationId,
      reason: NotificationReason,
      phase: NotificationPhase,
   ) -> Self {
      Self {
         registration,
         reason,
         phase,
         timestamp: Instant::now(),
      }
   }
}

/// Callback invoked at most once per registration.
///
/// Runs on the thread that committed the change (inside SQLite's commit hook),
/// so it must not block or perform database I/O on that connection.
pub type NotificationCallback = Box<dyn FnOnce(Notification) + Send + 'static>;

/// Describes the row a registration watches.
///
/// By default the reason reported is the net row operation of the committing
/// transaction. Reason columns refine this: the first listed column whose
/// value moved to a new non-null value decides the reason instead.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchCommand {
   pub schema: String,
   pub table: String,
   pub rowid: i64,
   pub reason_columns: Vec<(usize, NotificationReason)>,
}

impl WatchCommand {
   pub fn new(schema: impl Into<String>, table: impl Into<String>, rowid: i64) -> Self {
      Self {
         schema: schema.into(),
         table: table.into(),
         rowid,
         reason_columns: Vec::new(),
      }
   }

   /// Reports `reason` when column `index` of the watched row changes.
   pub fn with_reason_column(mut self, index: usize, reason: NotificationReason) -> Self {
      self.reason_columns.push((index, reason));
      self
   }

   /// Lower-cased `schema.table` used to filter hook events.
   pub(crate) fn table_key(&self) -> String {
      table_key(&self.schema, &self.table)
   }

   pub(crate) fn matches(&self, change: &NetChange) -> bool {
      self.rowid == change.rowid
         && self.table.eq_ignore_ascii_case(&change.table)
         && self.schema.eq_ignore_ascii_case(&change.schema)
   }

   pub(crate) fn reason_for(&self, change: &NetChange) -> NotificationReason {
      let old = change.old_values.as_deref().unwrap_or_default();
      let new = change.new_values.as_deref().unwrap_or_default();

      for &(index, reason) in &self.reason_columns {
         let after = new.get(index).unwrap_or(&SqliteValue::Null);
         let before = old.get(index).unwrap_or(&SqliteValue::Null);
         if !after.is_null() && after != before {
            return reason;
         }
      }

      change.operation.into()
   }
}

pub(crate) fn table_key(schema: &str, table: &str) -> String {
   format!("{}.{}", schema.to_ascii_lowercase(), table.to_ascii_lowercase())
}
