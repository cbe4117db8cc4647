//! Push sessions over a scripted notification source and over the real
//! SQLite notifier.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{
   assert_quiet, create_test_db, customers, fast_options, ledger_exists, next_event, orders, wait_until,
};
use sqlx_sqlite_watch::{
   ChangeKinds, Error, Notification, NotificationCallback, NotificationPhase, NotificationReason,
   NotificationSource, RegistrationId, ResourceManager, StrategyKind, WatchCommand, WatchMode,
   WatchProvider,
};

/// A notification source driven by the test.
#[derive(Default)]
struct ScriptedSource {
   unavailable: bool,
   /// Answer every registration with Invalid/Subscribe.
   reject: AtomicBool,
   /// Never complete a registration.
   stall: AtomicBool,
   /// Hold registrations until `release` is notified, then fail them.
   gate: AtomicBool,
   release: tokio::sync::Notify,
   next_id: AtomicU64,
   registrations: AtomicUsize,
   unregistrations: AtomicUsize,
   listeners: AtomicI64,
   pending: Mutex<Vec<(RegistrationId, WatchCommand, NotificationCallback)>>,
}

impl ScriptedSource {
   fn rejecting() -> Self {
      Self {
         reject: AtomicBool::new(true),
         ..Default::default()
      }
   }

   fn registrations(&self) -> usize {
      self.registrations.load(Ordering::SeqCst)
   }

   fn pending(&self) -> usize {
      self.pending.lock().unwrap().len()
   }

   /// Fires the pending registration for `object_id`. Returns false if none.
   fn fire(&self, object_id: i64, reason: NotificationReason, phase: NotificationPhase) -> bool {
      let entry = {
         let mut pending = self.pending.lock().unwrap();
         let index = pending.iter().position(|(_, cmd, _)| cmd.rowid == object_id);
         index.map(|i| pending.remove(i))
      };
      match entry {
         Some((id, _, callback)) => {
            callback(Notification {
               registration: id,
               reason,
               phase,
               timestamp: std::time::Instant::now(),
            });
            true
         }
         None => false,
      }
   }
}

#[async_trait]
impl NotificationSource for ScriptedSource {
   fn is_available(&self) -> bool {
      !self.unavailable
   }

   fn start_listener(&self, _queue: &str) {
      self.listeners.fetch_add(1, Ordering::SeqCst);
   }

   fn stop_listener(&self, _queue: &str) {
      self.listeners.fetch_sub(1, Ordering::SeqCst);
   }

   async fn register(
      &self,
      _queue: &str,
      command: WatchCommand,
      callback: NotificationCallback,
   ) -> sqlx_sqlite_watch::Result<RegistrationId> {
      self.registrations.fetch_add(1, Ordering::SeqCst);
      if self.stall.load(Ordering::SeqCst) {
         std::future::pending::<()>().await;
      }
      if self.gate.load(Ordering::SeqCst) {
         self.release.notified().await;
         return Err(Error::PushUnavailable("listener stopped".to_string()));
      }
      let id = RegistrationId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
      if self.reject.load(Ordering::SeqCst) {
         callback(Notification::new(
            id,
            NotificationReason::Invalid,
            NotificationPhase::Subscribe,
         ));
      } else {
         self.pending.lock().unwrap().push((id, command, callback));
      }
      Ok(id)
   }

   fn unregister(&self, id: RegistrationId) -> bool {
      let mut pending = self.pending.lock().unwrap();
      let before = pending.len();
      pending.retain(|(pending_id, _, _)| *pending_id != id);
      let removed = pending.len() < before;
      if removed {
         self.unregistrations.fetch_add(1, Ordering::SeqCst);
      }
      removed
   }
}

async fn scripted_provider(
   path: &std::path::Path,
   kinds: ChangeKinds,
   source: &Arc<ScriptedSource>,
) -> WatchProvider {
   WatchProvider::builder(path)
      .tables(["Orders", "Customers"])
      .kinds(kinds)
      .options(fast_options())
      .mode(WatchMode::Push)
      .notification_source(Arc::clone(source) as Arc<dyn NotificationSource>)
      .resource_manager(ResourceManager::new())
      .build()
      .await
      .unwrap()
}

// ============================================================================
// Scripted source
// ============================================================================

#[tokio::test]
async fn test_rejected_subscription_is_dropped_without_rearm() {
   let (_db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::rejecting());
   let provider = scripted_provider(&path, ChangeKinds::ALL, &source).await;
   let mut rx = provider.subscribe();

   provider.start().await.unwrap();
   assert_eq!(provider.strategy_kind(), StrategyKind::Push);
   assert_eq!(source.registrations(), 2);

   assert_quiet(&mut rx).await;
   assert_eq!(source.registrations(), 2);

   provider.dispose().await;
   assert_eq!(source.listeners.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_update_raises_one_event_and_rearms_once() {
   let (_db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::default());
   let provider =
      scripted_provider(&path, ChangeKinds::INSERT | ChangeKinds::UPDATE, &source).await;
   let mut rx = provider.subscribe();

   provider.start().await.unwrap();
   assert_eq!(source.registrations(), 2);
   assert_eq!(source.listeners.load(Ordering::SeqCst), 1);

   assert!(source.fire(
      orders().object_id(),
      NotificationReason::Update,
      NotificationPhase::Change
   ));

   let event = next_event(&mut rx).await;
   assert_eq!(event.table, orders());
   assert_eq!(event.kinds, ChangeKinds::UPDATE);

   assert!(wait_until(|| async { source.registrations() == 3 }).await);
   assert_quiet(&mut rx).await;
   assert_eq!(source.registrations(), 3);
   assert_eq!(source.pending(), 2);

   provider.dispose().await;
}

#[tokio::test]
async fn test_reason_outside_mask_rearms_silently() {
   let (_db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::default());
   let provider =
      scripted_provider(&path, ChangeKinds::INSERT | ChangeKinds::UPDATE, &source).await;
   let mut rx = provider.subscribe();
   provider.start().await.unwrap();

   assert!(source.fire(
      customers().object_id(),
      NotificationReason::Delete,
      NotificationPhase::Change
   ));

   assert!(wait_until(|| async { source.registrations() == 3 }).await);
   assert_quiet(&mut rx).await;

   provider.dispose().await;
}

#[tokio::test]
async fn test_stop_unregisters_and_leaves_listener() {
   let (_db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::default());
   let provider = scripted_provider(&path, ChangeKinds::ALL, &source).await;
   let mut rx = provider.subscribe();
   provider.start().await.unwrap();

   provider.stop().await;

   assert_eq!(source.unregistrations.load(Ordering::SeqCst), 2);
   assert_eq!(source.pending(), 0);
   assert_eq!(source.listeners.load(Ordering::SeqCst), 0);
   assert!(!source.fire(
      orders().object_id(),
      NotificationReason::Insert,
      NotificationPhase::Change
   ));
   assert_quiet(&mut rx).await;

   provider.dispose().await;
}

#[tokio::test]
async fn test_abandoned_start_releases_objects_and_listener() {
   let (db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource {
      stall: AtomicBool::new(true),
      ..Default::default()
   });
   let manager = ResourceManager::new();
   let provider = WatchProvider::builder(&path)
      .tables(["Orders", "Customers"])
      .options(fast_options())
      .mode(WatchMode::Push)
      .notification_source(Arc::clone(&source) as Arc<dyn NotificationSource>)
      .resource_manager(Arc::clone(&manager))
      .build()
      .await
      .unwrap();

   let result = tokio::time::timeout(Duration::from_millis(200), provider.start()).await;
   assert!(result.is_err(), "start should still be waiting on the source");

   assert!(wait_until(|| async { manager.snapshot().await.is_empty() }).await);
   assert_eq!(source.listeners.load(Ordering::SeqCst), 0);
   assert!(!ledger_exists(&db).await);
   assert!(!provider.is_started().await);

   source.stall.store(false, Ordering::SeqCst);
   provider.start().await.unwrap();
   assert!(provider.is_started().await);
   assert_eq!(source.listeners.load(Ordering::SeqCst), 1);
   assert!(ledger_exists(&db).await);

   provider.dispose().await;
   assert!(manager.snapshot().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rearm_failing_during_stop_is_not_reported() {
   let (_db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::default());
   let provider = scripted_provider(&path, ChangeKinds::ALL, &source).await;

   let errors = Arc::new(AtomicUsize::new(0));
   let fatals = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&errors);
   provider.on_error(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
   });
   let counter = Arc::clone(&fatals);
   provider.on_fatal(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
   });
   provider.start().await.unwrap();
   assert_eq!(source.registrations(), 2);

   source.gate.store(true, Ordering::SeqCst);
   assert!(source.fire(
      orders().object_id(),
      NotificationReason::Update,
      NotificationPhase::Change
   ));
   // The re-arm is now parked inside the source.
   assert!(wait_until(|| async { source.registrations() == 3 }).await);

   provider.stop().await;
   source.release.notify_one();
   tokio::time::sleep(common::QUIET_PERIOD).await;

   assert_eq!(errors.load(Ordering::SeqCst), 0);
   assert_eq!(fatals.load(Ordering::SeqCst), 0);
   assert!(!provider.is_started().await);

   provider.dispose().await;
}

#[tokio::test]
async fn test_teardown_failure_on_stop_is_never_fatal() {
   let (db, path, _temp) = create_test_db().await;
   let source = Arc::new(ScriptedSource::default());
   let provider = scripted_provider(&path, ChangeKinds::ALL, &source).await;

   let fatals = Arc::new(AtomicUsize::new(0));
   let counter = Arc::clone(&fatals);
   provider.on_fatal(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
   });
   provider.start().await.unwrap();

   // Deprovisioning needs the writer, which a closed database refuses.
   Arc::clone(&db).close().await.unwrap();
   provider.stop().await;

   assert!(!provider.is_started().await);
   assert_eq!(source.listeners.load(Ordering::SeqCst), 0);
   assert_eq!(fatals.load(Ordering::SeqCst), 0);

   provider.dispose().await;
   assert_eq!(fatals.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Strategy selection
// ============================================================================

#[tokio::test]
async fn test_auto_mode_prefers_available_source() {
   let (_db, path, _temp) = create_test_db().await;

   let polling = WatchProvider::builder(&path)
      .tables(["Orders"])
      .build()
      .await
      .unwrap();
   assert_eq!(polling.strategy_kind(), StrategyKind::Polling);

   let push = WatchProvider::builder(&path)
      .tables(["Orders"])
      .notification_source(Arc::new(ScriptedSource::default()))
      .build()
      .await
      .unwrap();
   assert_eq!(push.strategy_kind(), StrategyKind::Push);

   let fallback = WatchProvider::builder(&path)
      .tables(["Orders"])
      .notification_source(Arc::new(ScriptedSource {
         unavailable: true,
         ..Default::default()
      }))
      .build()
      .await
      .unwrap();
   assert_eq!(fallback.strategy_kind(), StrategyKind::Polling);
}

#[tokio::test]
async fn test_push_mode_requires_available_source() {
   let (_db, path, _temp) = create_test_db().await;
   let result = WatchProvider::builder(&path)
      .tables(["Orders"])
      .mode(WatchMode::Push)
      .notification_source(Arc::new(ScriptedSource {
         unavailable: true,
         ..Default::default()
      }))
      .build()
      .await;
   assert!(matches!(result, Err(Error::PushUnavailable(_))));
}

// ============================================================================
// SQLite notifier
// ============================================================================

#[tokio::test]
async fn test_observed_writes_raise_events() {
   let (db, path, _temp) = create_test_db().await;
   let provider = WatchProvider::builder(&path)
      .tables(["Orders", "Customers"])
      .kinds(ChangeKinds::ALL)
      .options(fast_options())
      .mode(WatchMode::Push)
      .resource_manager(ResourceManager::new())
      .build()
      .await
      .unwrap();
   let mut rx = provider.subscribe();
   provider.start().await.unwrap();

   let notifier = db.notifier();
   assert_eq!(notifier.pending_registrations(), 2);

   {
      let mut writer = db.acquire_observable_writer().await.unwrap();
      sqlx::query("INSERT INTO Orders (id, customer_id, total) VALUES (1, 3, 4.5)")
         .execute(&mut *writer)
         .await
         .unwrap();
   }

   let event = next_event(&mut rx).await;
   assert_eq!(event.table, orders());
   assert_eq!(event.kinds, ChangeKinds::INSERT);

   // Wait for the re-arm before writing again.
   assert!(wait_until(|| async { notifier.pending_registrations() == 2 }).await);

   {
      let mut writer = db.acquire_observable_writer().await.unwrap();
      sqlx::query("UPDATE Orders SET total = 5.5 WHERE id = 1")
         .execute(&mut *writer)
         .await
         .unwrap();
   }

   let event = next_event(&mut rx).await;
   assert_eq!(event.table, orders());
   assert_eq!(event.kinds, ChangeKinds::UPDATE);
   assert_quiet(&mut rx).await;

   provider.dispose().await;
   assert_eq!(notifier.pending_registrations(), 0);
}

#[tokio::test]
async fn test_observed_insert_after_pinned_stamp_reports_insert() {
   let (db, path, _temp) = create_test_db().await;
   let provider = WatchProvider::builder(&path)
      .tables(["Orders"])
      .kinds(ChangeKinds::INSERT)
      .options(fast_options())
      .mode(WatchMode::Push)
      .resource_manager(ResourceManager::new())
      .build()
      .await
      .unwrap();
   provider.start().await.unwrap();

   // Unobserved writes: create the ledger row and pin its stamp ahead of the clock.
   common::execute(&db, "INSERT INTO Orders (id, customer_id, total) VALUES (1, 3, 4.5)").await;
   common::execute(
      &db,
      &format!(
         "UPDATE tw_ChangeLedger SET LastInsertDate = '2999-01-01T00:00:00.000Z' WHERE ObjectId = {}",
         orders().object_id()
      ),
   )
   .await;

   let mut rx = provider.subscribe();
   {
      let mut writer = db.acquire_observable_writer().await.unwrap();
      sqlx::query("INSERT INTO Orders (id, customer_id, total) VALUES (2, 3, 1.0)")
         .execute(&mut *writer)
         .await
         .unwrap();
   }

   let event = next_event(&mut rx).await;
   assert_eq!(event.table, orders());
   assert_eq!(event.kinds, ChangeKinds::INSERT);

   provider.dispose().await;
}
