//! Events raised by a watch session and their fan-out.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::change::ChangeKinds;
use crate::error::Error;
use crate::table::QualifiedTable;

/// A watched table changed in the listed ways since it was last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableChanged {
   pub table: QualifiedTable,
   pub kinds: ChangeKinds,
   /// Session that detected the change.
   pub session: Uuid,
}

/// A recoverable failure.
///
/// `ignore` starts out `true`. A handler that sets it to `false` ends the
/// session: the error is raised again as a [`FatalErrorEvent`].
#[derive(Debug)]
pub struct ErrorEvent {
   pub error: Arc<Error>,
   pub ignore: bool,
   pub session: Uuid,
}

/// A failure that ended the session.
#[derive(Debug, Clone)]
pub struct FatalErrorEvent {
   pub error: Arc<Error>,
   pub session: Uuid,
}

type ChangeHandler = Arc<dyn Fn(&TableChanged) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&mut ErrorEvent) + Send + Sync>;
type FatalHandler = Arc<dyn Fn(&FatalErrorEvent) + Send + Sync>;

/// Per-session event dispatch: registered handlers plus a broadcast channel of
/// change events.
pub struct EventHub {
   session: Uuid,
   changes: broadcast::Sender<TableChanged>,
   change_handlers: RwLock<Vec<ChangeHandler>>,
   error_handlers: RwLock<Vec<ErrorHandler>>,
   fatal_handlers: RwLock<Vec<FatalHandler>>,
}

impl EventHub {
   pub fn new(session: Uuid, channel_capacity: usize) -> Self {
      let (changes, _) = broadcast::channel(channel_capacity.max(1));
      Self {
         session,
         changes,
         change_handlers: RwLock::new(Vec::new()),
         error_handlers: RwLock::new(Vec::new()),
         fatal_handlers: RwLock::new(Vec::new()),
      }
   }

   pub fn session(&self) -> Uuid {
      self.session
   }

   pub fn on_change<F>(&self, handler: F)
   where
      F: Fn(&TableChanged) + Send + Sync + 'static,
   {
      self.change_handlers.write().push(Arc::new(handler));
   }

   pub fn on_error<F>(&self, handler: F)
   where
      F: Fn(&mut ErrorEvent) + Send + Sync + 'static,
   {
      self.error_handlers.write().push(Arc::new(handler));
   }

   pub fn on_fatal<F>(&self, handler: F)
   where
      F: Fn(&FatalErrorEvent) + Send + Sync + 'static,
   {
      self.fatal_handlers.write().push(Arc::new(handler));
   }

   pub fn subscribe(&self) -> broadcast::Receiver<TableChanged> {
      self.changes.subscribe()
   }

   pub fn raise_changed(&self, table: QualifiedTable, kinds: ChangeKinds) {
      let event = TableChanged {
         table,
         kinds,
         session: self.session,
      };
      debug!(session = %self.session, table = %event.table, kinds = %event.kinds, "Table changed");

      // Handlers run outside the lock so they may register more handlers.
      let handlers = self.change_handlers.read().clone();
      for handler in handlers {
         handler(&event);
      }
      // No receivers is fine.
      let _ = self.changes.send(event);
   }

   /// Raises a recoverable error. Returns true when the session may go on;
   /// otherwise the error has been raised as fatal.
   ///
   /// With no error handler registered nobody can opt in to continuing, so the
   /// error is treated as not ignored.
   pub fn raise_error(&self, error: Error) -> bool {
      let error = Arc::new(error);
      let handlers = self.error_handlers.read().clone();
      if handlers.is_empty() {
         warn!(session = %self.session, error = %error, "Unhandled error");
         self.raise_fatal(error);
         return false;
      }

      let mut event = ErrorEvent {
         error,
         ignore: true,
         session: self.session,
      };
      for handler in handlers {
         handler(&mut event);
      }

      if event.ignore {
         debug!(session = %self.session, error = %event.error, "Error ignored by handler");
         return true;
      }
      self.raise_fatal(event.error);
      false
   }

   /// Raises an error from teardown. Handlers see it, but nothing they do
   /// escalates it; without handlers it is only logged.
   pub fn report_error(&self, error: Error) {
      let handlers = self.error_handlers.read().clone();
      if handlers.is_empty() {
         warn!(session = %self.session, error = %error, "Teardown error");
         return;
      }

      let mut event = ErrorEvent {
         error: Arc::new(error),
         ignore: true,
         session: self.session,
      };
      for handler in handlers {
         handler(&mut event);
      }
   }

   pub fn raise_fatal(&self, error: Arc<Error>) {
      error!(session = %self.session, error = %error, "Fatal watch error");
      let event = FatalErrorEvent {
         error,
         session: self.session,
      };
      let handlers = self.fatal_handlers.read().clone();
      for handler in handlers {
         handler(&event);
      }
   }
}

impl std::fmt::Debug for EventHub {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("EventHub")
         .field("session", &self.session)
         .field("receivers", &self.changes.receiver_count())
         .field("change_handlers", &self.change_handlers.read().len())
         .field("error_handlers", &self.error_handlers.read().len())
         .field("fatal_handlers", &self.fatal_handlers.read().len())
         .finish()
   }
}
