//! Push detection: single-fire notifications on each table's ledger row,
//! re-armed after every firing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx_sqlite_notify::{
   Notification, NotificationCallback, NotificationPhase, NotificationReason, RegistrationId,
   SqliteNotifier, WatchCommand,
};
use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::Result;
use crate::change::ChangeKind;
use crate::ledger::{DELETE_DATE_COLUMN, INSERT_DATE_COLUMN, UPDATE_DATE_COLUMN};
use crate::provider::{Detection, DetectionContext};
use crate::table::QualifiedTable;

/// The native single-fire notification primitive push detection runs on.
///
/// Listeners are reference counted per queue: every `start_listener` must be
/// matched by one `stop_listener`. A registration delivers at most one
/// [`Notification`]; a registration that cannot be set up is answered with
/// [`NotificationReason::Invalid`] in the [`NotificationPhase::Subscribe`] phase.
#[async_trait]
pub trait NotificationSource: Send + Sync {
   /// Whether notifications can be delivered at all.
   fn is_available(&self) -> bool;

   fn start_listener(&self, queue: &str);

   fn stop_listener(&self, queue: &str);

   async fn register(
      &self,
      queue: &str,
      command: WatchCommand,
      callback: NotificationCallback,
   ) -> Result<RegistrationId>;

   /// Cancels a registration that has not fired yet.
   fn unregister(&self, id: RegistrationId) -> bool;
}

#[async_trait]
impl NotificationSource for SqliteNotifier {
   fn is_available(&self) -> bool {
      SqliteNotifier::is_supported()
   }

   fn start_listener(&self, queue: &str) {
      SqliteNotifier::start_listener(self, queue);
   }

   fn stop_listener(&self, queue: &str) {
      SqliteNotifier::stop_listener(self, queue);
   }

   async fn register(
      &self,
      queue: &str,
      command: WatchCommand,
      callback: NotificationCallback,
   ) -> Result<RegistrationId> {
      Ok(SqliteNotifier::register(self, queue, command, callback).await?)
   }

   fn unregister(&self, id: RegistrationId) -> bool {
      SqliteNotifier::unregister(self, id)
   }
}

fn change_kind(reason: NotificationReason) -> Option<ChangeKind> {
   match reason {
      NotificationReason::Insert => Some(ChangeKind::Insert),
      NotificationReason::Update => Some(ChangeKind::Update),
      NotificationReason::Delete => Some(ChangeKind::Delete),
      NotificationReason::Invalid => None,
   }
}

#[derive(Default)]
struct Subscriptions {
   active: HashMap<QualifiedTable, RegistrationId>,
   /// Registrations that fired before `register` returned their id.
   fired_early: HashSet<RegistrationId>,
}

/// State of one started push session. Callbacks only hold it weakly.
struct PushSession {
   source: Arc<dyn NotificationSource>,
   ctx: DetectionContext,
   queue: String,
   subscriptions: Mutex<Subscriptions>,
   exiting: AtomicBool,
   runtime: Handle,
}

impl PushSession {
   /// Registers a single-fire watch on `table`'s ledger row.
   async fn subscribe(self: &Arc<Self>, table: QualifiedTable) -> Result<()> {
      let options = &self.ctx.params.options;
      let command = WatchCommand::new(
         options.schema.clone(),
         options.ledger_table_name(),
         table.object_id(),
      )
      .with_reason_column(INSERT_DATE_COLUMN, NotificationReason::Insert)
      .with_reason_column(UPDATE_DATE_COLUMN, NotificationReason::Update)
      .with_reason_column(DELETE_DATE_COLUMN, NotificationReason::Delete);

      let session = Arc::downgrade(self);
      let key = table.clone();
      let callback: NotificationCallback = Box::new(move |notification| {
         if let Some(session) = session.upgrade() {
            session.on_notification(key, notification);
         }
      });

      let id = self.source.register(&self.queue, command, callback).await?;

      let mut subscriptions = self.subscriptions.lock();
      if subscriptions.fired_early.remove(&id) {
         return Ok(());
      }
      if self.exiting.load(Ordering::SeqCst) {
         drop(subscriptions);
         self.source.unregister(id);
         return Ok(());
      }
      subscriptions.active.insert(table.clone(), id);
      trace!(session = %self.ctx.session, table = %table, registration = %id, "Subscribed");
      Ok(())
   }

   fn on_notification(self: &Arc<Self>, table: QualifiedTable, notification: Notification) {
      {
         let mut subscriptions = self.subscriptions.lock();
         match subscriptions.active.get(&table) {
            Some(id) if *id == notification.registration => {
               subscriptions.active.remove(&table);
            }
            Some(_) => {
               trace!(table = %table, registration = %notification.registration, "Stale notification");
               return;
            }
            None => {
               subscriptions.fired_early.insert(notification.registration);
            }
         }
      }

      if notification.reason == NotificationReason::Invalid
         && notification.phase == NotificationPhase::Subscribe
      {
         debug!(session = %self.ctx.session, table = %table, "Subscription rejected; not re-arming");
         return;
      }

      if self.exiting.load(Ordering::SeqCst) {
         return;
      }

      for kind in self.ctx.params.kinds.iter() {
         if change_kind(notification.reason) == Some(kind) {
            self.ctx.events.raise_changed(table.clone(), kind.into());
         }
      }

      let session = Arc::clone(self);
      self.runtime.spawn(async move {
         if session.exiting.load(Ordering::SeqCst) {
            return;
         }
         if let Err(e) = session.subscribe(table).await {
            // A shutdown that raced the re-arm also stops the listener.
            if session.exiting.load(Ordering::SeqCst) {
               trace!(session = %session.ctx.session, error = %e, "Re-arm failed during shutdown");
               return;
            }
            if !session.ctx.events.raise_error(e) {
               session.ctx.request_stop();
            }
         }
      });
   }

   /// Marks the session as exiting, cancels every pending registration and
   /// leaves the listener.
   fn shutdown(&self) {
      self.exiting.store(true, Ordering::SeqCst);
      let active: Vec<RegistrationId> = {
         let mut subscriptions = self.subscriptions.lock();
         subscriptions.fired_early.clear();
         subscriptions.active.drain().map(|(_, id)| id).collect()
      };
      for id in &active {
         self.source.unregister(*id);
      }
      self.source.stop_listener(&self.queue);
      debug!(
         session = %self.ctx.session,
         unregistered = active.len(),
         "Push detection stopped"
      );
   }
}

/// Push detection over a [`NotificationSource`].
pub struct PushDetector {
   source: Arc<dyn NotificationSource>,
   session: Mutex<Option<Arc<PushSession>>>,
}

impl PushDetector {
   pub fn new(source: Arc<dyn NotificationSource>) -> Self {
      Self {
         source,
         session: Mutex::new(None),
      }
   }

   fn take_session(&self) -> Option<Arc<PushSession>> {
      self.session.lock().take()
   }
}

impl Detection for PushDetector {
   async fn start(&self, ctx: DetectionContext) -> Result<()> {
      let queue = ctx.params.options.queue();
      let tables: Vec<QualifiedTable> = ctx.params.tables.iter().cloned().collect();
      let session = Arc::new(PushSession {
         source: Arc::clone(&self.source),
         ctx,
         queue,
         subscriptions: Mutex::new(Subscriptions::default()),
         exiting: AtomicBool::new(false),
         runtime: Handle::current(),
      });

      session.source.start_listener(&session.queue);
      // Stored before subscribing so cleanup finds it if a subscription fails.
      if let Some(previous) = self.session.lock().replace(Arc::clone(&session)) {
         previous.shutdown();
      }

      for table in tables {
         session.subscribe(table).await?;
      }

      debug!(
         session = %session.ctx.session,
         queue = %session.queue,
         "Push detection started"
      );
      Ok(())
   }

   async fn stop(&self) -> Result<()> {
      if let Some(session) = self.take_session() {
         session.shutdown();
      }
      Ok(())
   }

   async fn cleanup(&self) {
      if let Some(session) = self.take_session() {
         session.shutdown();
      }
   }

   fn abandon(&self) {
      if let Some(session) = self.take_session() {
         session.shutdown();
      }
   }
}
