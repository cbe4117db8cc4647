//! Watch session lifecycle shared by both detection strategies.
//!
//! A [`WatchProvider`] moves between not-started and started under a private
//! lock: `start` provisions the ledger and triggers and then starts detection;
//! `stop` ends detection and releases the provisioned objects; `dispose` stops
//! once and refuses any later start. Detection itself is delegated to a
//! [`Strategy`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Result;
use crate::database::WatchDatabase;
use crate::error::Error;
use crate::events::{ErrorEvent, EventHub, FatalErrorEvent, TableChanged};
use crate::factory::WatchBuilder;
use crate::params::WatchParameters;
use crate::polling::PollingDetector;
use crate::push::PushDetector;
use crate::resources::ResourceManager;
use crate::stream::TableChangedStream;
use crate::table::QualifiedTable;

/// Which detection strategy a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
   Polling,
   Push,
}

/// What a session hands to its detector on start.
#[derive(Clone)]
pub(crate) struct DetectionContext {
   pub session: Uuid,
   pub database: Arc<WatchDatabase>,
   pub params: Arc<WatchParameters>,
   pub events: Arc<EventHub>,
   provider: Weak<ProviderInner>,
   generation: u64,
}

impl DetectionContext {
   /// Stops the session from inside detection, e.g. after an error nobody
   /// chose to ignore. Has no effect if the session was restarted meanwhile.
   pub fn request_stop(&self) {
      let Some(inner) = self.provider.upgrade() else {
         return;
      };
      let generation = self.generation;
      tokio::spawn(async move {
         inner.stop_generation(Some(generation)).await;
      });
   }
}

/// Start, stop and cleanup of one detection strategy.
///
/// `cleanup` releases whatever a failed `start` left behind. `abandon` is the
/// synchronous last resort used when a running session is dropped.
pub(crate) trait Detection {
   fn start(&self, ctx: DetectionContext) -> impl Future<Output = Result<()>> + Send;
   fn stop(&self) -> impl Future<Output = Result<()>> + Send;
   fn cleanup(&self) -> impl Future<Output = ()> + Send;
   fn abandon(&self);
}

pub(crate) enum Strategy {
   Polling(PollingDetector),
   Push(PushDetector),
}

impl Strategy {
   pub fn kind(&self) -> StrategyKind {
      match self {
         Strategy::Polling(_) => StrategyKind::Polling,
         Strategy::Push(_) => StrategyKind::Push,
      }
   }

   async fn start(&self, ctx: DetectionContext) -> Result<()> {
      match self {
         Strategy::Polling(d) => d.start(ctx).await,
         Strategy::Push(d) => d.start(ctx).await,
      }
   }

   async fn stop(&self) -> Result<()> {
      match self {
         Strategy::Polling(d) => d.stop().await,
         Strategy::Push(d) => d.stop().await,
      }
   }

   async fn cleanup(&self) {
      match self {
         Strategy::Polling(d) => d.cleanup().await,
         Strategy::Push(d) => d.cleanup().await,
      }
   }

   fn abandon(&self) {
      match self {
         Strategy::Polling(d) => d.abandon(),
         Strategy::Push(d) => d.abandon(),
      }
   }
}

#[derive(Debug, Default)]
struct State {
   started: bool,
   disposed: bool,
   /// Bumped on every successful start.
   generation: u64,
}

pub(crate) struct ProviderInner {
   session: Uuid,
   database: Arc<WatchDatabase>,
   params: Arc<WatchParameters>,
   events: Arc<EventHub>,
   resources: Arc<ResourceManager>,
   strategy: Strategy,
   state: Mutex<State>,
}

impl ProviderInner {
   fn context(self: &Arc<Self>, generation: u64) -> DetectionContext {
      DetectionContext {
         session: self.session,
         database: Arc::clone(&self.database),
         params: Arc::clone(&self.params),
         events: Arc::clone(&self.events),
         provider: Arc::downgrade(self),
         generation,
      }
   }

   async fn start(self: &Arc<Self>) -> Result<()> {
      let mut state = self.state.lock().await;
      if state.disposed {
         return Err(Error::Disposed);
      }
      if state.started {
         return Err(Error::AlreadyStarted);
      }

      debug!(
         session = %self.session,
         strategy = ?self.strategy.kind(),
         tables = self.params.tables.len(),
         "Starting watch session"
      );

      if let Err(e) = self.resources.provision(&self.database, &self.params).await {
         return Err(self.fail_start(e, None).await);
      }

      // Until the start completes, dropping this future must undo it.
      let mut guard = StartGuard {
         inner: self.as_ref(),
         armed: true,
      };

      let generation = state.generation + 1;
      if let Err(e) = self.strategy.start(self.context(generation)).await {
         return Err(self.fail_start(e, Some(&mut guard)).await);
      }
      guard.armed = false;

      state.generation = generation;
      state.started = true;
      debug!(session = %self.session, "Watch session started");
      Ok(())
   }

   /// Raises the failure as fatal and undoes whatever the start got done.
   ///
   /// `guard` is present once provisioning succeeded; it stays armed until the
   /// deprovision has run.
   async fn fail_start(&self, error: Error, guard: Option<&mut StartGuard<'_>>) -> Error {
      let error = Arc::new(error);
      self.events.raise_fatal(Arc::clone(&error));

      self.strategy.cleanup().await;
      if let Some(guard) = guard {
         let result = self.resources.deprovision(&self.database, &self.params).await;
         guard.armed = false;
         if let Err(e) = result {
            warn!(session = %self.session, error = %e, "Cleanup after failed start could not deprovision");
         }
      }

      Error::StartFailed(error)
   }

   /// Stops detection on the spot and releases the provisioned objects on a
   /// background task.
   fn release_detached(&self) {
      self.strategy.abandon();

      let Ok(runtime) = tokio::runtime::Handle::try_current() else {
         warn!(session = %self.session, "No runtime available; generated objects stay referenced");
         return;
      };
      let resources = Arc::clone(&self.resources);
      let database = Arc::clone(&self.database);
      let params = Arc::clone(&self.params);
      let session = self.session;
      runtime.spawn(async move {
         if let Err(e) = resources.deprovision(&database, &params).await {
            warn!(session = %session, error = %e, "Background deprovision failed");
         }
      });
   }

   /// Stops the session. With `Some(generation)`, only if that start is
   /// still the current one.
   async fn stop_generation(&self, generation: Option<u64>) {
      let mut state = self.state.lock().await;
      if generation.is_some_and(|g| g != state.generation) {
         return;
      }
      self.stop_locked(&mut state).await;
   }

   async fn stop_locked(&self, state: &mut State) {
      if !state.started {
         return;
      }
      state.started = false;
      debug!(session = %self.session, "Stopping watch session");

      // Teardown always completes; its errors are reported, never escalated.
      if let Err(e) = self.strategy.stop().await {
         self.events.report_error(e);
      }
      if let Err(e) = self.resources.deprovision(&self.database, &self.params).await {
         self.events.report_error(e);
      }

      debug!(session = %self.session, "Watch session stopped");
   }

   async fn dispose(&self) {
      let mut state = self.state.lock().await;
      if state.disposed {
         return;
      }
      self.stop_locked(&mut state).await;
      state.disposed = true;
   }
}

impl Drop for ProviderInner {
   fn drop(&mut self) {
      let state = self.state.get_mut();
      if state.disposed || !state.started {
         return;
      }

      warn!(
         session = %self.session,
         "Watch session dropped while running; call dispose() to tear it down deterministically"
      );
      self.release_detached();
   }
}

/// Armed between a successful provision and a completed start.
struct StartGuard<'a> {
   inner: &'a ProviderInner,
   armed: bool,
}

impl Drop for StartGuard<'_> {
   fn drop(&mut self) {
      if self.armed {
         debug!(session = %self.inner.session, "Start abandoned midway; releasing");
         self.inner.release_detached();
      }
   }
}

/// A watch session over a set of tables.
///
/// Build one with [`WatchProvider::builder`]. Sessions start stopped.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_watch::{ChangeKinds, WatchProvider};
///
/// # async fn example() -> sqlx_sqlite_watch::Result<()> {
/// let provider = WatchProvider::builder("app.db")
///    .tables(["Orders", "Customers"])
///    .kinds(ChangeKinds::INSERT | ChangeKinds::UPDATE)
///    .build()
///    .await?;
///
/// provider.on_change(|event| println!("{} changed: {}", event.table, event.kinds));
/// provider.start().await?;
/// // ...
/// provider.dispose().await;
/// # Ok(())
/// # }
/// ```
pub struct WatchProvider {
   inner: Arc<ProviderInner>,
}

impl WatchProvider {
   /// Starts configuring a session on the database at `database`.
   pub fn builder(database: impl Into<PathBuf>) -> WatchBuilder {
      WatchBuilder::new(database)
   }

   pub(crate) fn new(
      database: Arc<WatchDatabase>,
      params: WatchParameters,
      strategy: Strategy,
      resources: Arc<ResourceManager>,
   ) -> Self {
      let session = Uuid::new_v4();
      let events = Arc::new(EventHub::new(session, params.options.channel_capacity));
      Self {
         inner: Arc::new(ProviderInner {
            session,
            database,
            params: Arc::new(params),
            events,
            resources,
            strategy,
            state: Mutex::new(State::default()),
         }),
      }
   }

   /// Provisions change tracking and starts detection.
   ///
   /// Fails with [`Error::AlreadyStarted`] or [`Error::Disposed`] without side
   /// effects. Any other failure is raised as a fatal event, rolled back, and
   /// returned as [`Error::StartFailed`].
   pub async fn start(&self) -> Result<()> {
      self.inner.start().await
   }

   /// Stops detection and releases provisioned objects. Does nothing when not
   /// started. Teardown failures reach the error event handlers but never end
   /// in a fatal event, whatever the handlers set `ignore` to.
   pub async fn stop(&self) {
      self.inner.stop_generation(None).await;
   }

   /// Stops the session if needed and prevents any further start.
   pub async fn dispose(&self) {
      self.inner.dispose().await;
   }

   pub async fn is_started(&self) -> bool {
      self.inner.state.lock().await.started
   }

   pub async fn is_disposed(&self) -> bool {
      self.inner.state.lock().await.disposed
   }

   pub fn session_id(&self) -> Uuid {
      self.inner.session
   }

   pub fn strategy_kind(&self) -> StrategyKind {
      self.inner.strategy.kind()
   }

   /// The session's own copy of its parameters.
   pub fn parameters(&self) -> &WatchParameters {
      &self.inner.params
   }

   pub fn database(&self) -> &Arc<WatchDatabase> {
      &self.inner.database
   }

   /// Registers a change handler. Push sessions call it on the thread that
   /// committed the change, so it must not block.
   pub fn on_change<F>(&self, handler: F)
   where
      F: Fn(&TableChanged) + Send + Sync + 'static,
   {
      self.inner.events.on_change(handler);
   }

   /// Registers a handler for recoverable errors. Leave `ignore` set to keep
   /// the session running; clear it to end the session.
   pub fn on_error<F>(&self, handler: F)
   where
      F: Fn(&mut ErrorEvent) + Send + Sync + 'static,
   {
      self.inner.events.on_error(handler);
   }

   pub fn on_fatal<F>(&self, handler: F)
   where
      F: Fn(&FatalErrorEvent) + Send + Sync + 'static,
   {
      self.inner.events.on_fatal(handler);
   }

   pub fn subscribe(&self) -> broadcast::Receiver<TableChanged> {
      self.inner.events.subscribe()
   }

   /// Change events as a stream, limited to `tables` unless it is empty.
   pub fn subscribe_stream<I>(&self, tables: I) -> TableChangedStream
   where
      I: IntoIterator<Item = QualifiedTable>,
   {
      let tables: Vec<QualifiedTable> = tables.into_iter().collect();
      let stream = TableChangedStream::new(self.subscribe());
      if tables.is_empty() {
         stream
      } else {
         stream.filter_tables(tables)
      }
   }
}

impl std::fmt::Debug for WatchProvider {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WatchProvider")
         .field("session", &self.inner.session)
         .field("strategy", &self.inner.strategy.kind())
         .field("database", &self.inner.database.path())
         .field("tables", &self.inner.params.tables)
         .finish()
   }
}
