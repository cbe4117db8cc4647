//! Building watch sessions: parameter checks, database open and strategy choice.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::change::ChangeKinds;
use crate::config::WatchOptions;
use crate::database::WatchDatabase;
use crate::error::Error;
use crate::params::WatchParameters;
use crate::polling::PollingDetector;
use crate::provider::{Strategy, WatchProvider};
use crate::push::{NotificationSource, PushDetector};
use crate::resources::ResourceManager;
use crate::table::QualifiedTable;

/// Requested detection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchMode {
   /// Push when a notification source was supplied and is available,
   /// polling otherwise.
   ///
   /// The database's built-in notifier is never picked here even when the
   /// linked SQLite supports it: it only sees writes made through
   /// [`WatchDatabase::acquire_observable_writer`] in this process, while
   /// polling sees every committed write, including other processes'. Use
   /// [`WatchMode::Push`] to opt in to the built-in notifier.
   #[default]
   Auto,
   Polling,
   /// Push only. Uses the database's own notifier unless a source was
   /// supplied, and fails with [`Error::PushUnavailable`] if it cannot run.
   Push,
}

/// Configures and builds a [`WatchProvider`].
pub struct WatchBuilder {
   params: WatchParameters,
   mode: WatchMode,
   source: Option<Arc<dyn NotificationSource>>,
   resources: Option<Arc<ResourceManager>>,
}

impl WatchBuilder {
   pub fn new(database: impl Into<PathBuf>) -> Self {
      Self::from_parameters(WatchParameters::new(database))
   }

   /// Starts from existing parameters. The session keeps its own copy.
   pub fn from_parameters(params: WatchParameters) -> Self {
      Self {
         params,
         mode: WatchMode::default(),
         source: None,
         resources: None,
      }
   }

   pub fn table(mut self, table: QualifiedTable) -> Self {
      self.params = self.params.with_table(table);
      self
   }

   /// Adds tables by name; names that do not parse are skipped.
   pub fn tables<I, S>(mut self, names: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      self.params = self.params.with_table_names(names);
      self
   }

   pub fn kinds(mut self, kinds: ChangeKinds) -> Self {
      self.params = self.params.with_kinds(kinds);
      self
   }

   pub fn options(mut self, options: WatchOptions) -> Self {
      self.params = self.params.with_options(options);
      self
   }

   pub fn mode(mut self, mode: WatchMode) -> Self {
      self.mode = mode;
      self
   }

   pub fn notification_source(mut self, source: Arc<dyn NotificationSource>) -> Self {
      self.source = Some(source);
      self
   }

   /// Counts provisioned objects in `resources` instead of the process-wide manager.
   pub fn resource_manager(mut self, resources: Arc<ResourceManager>) -> Self {
      self.resources = Some(resources);
      self
   }

   /// Validates the parameters, opens the database and picks the strategy.
   ///
   /// Parameter errors are reported before any database I/O.
   pub async fn build(self) -> Result<WatchProvider> {
      let Self {
         params,
         mode,
         source,
         resources,
      } = self;

      params.validate_shape()?;
      let db = WatchDatabase::connect(&params.database, &params.options.retry).await?;
      params.validate(&db).await?;

      let strategy = match mode {
         WatchMode::Polling => Strategy::Polling(PollingDetector::new()),
         WatchMode::Push => {
            let source = source.unwrap_or_else(|| db.notifier() as Arc<dyn NotificationSource>);
            if !source.is_available() {
               return Err(Error::PushUnavailable(
                  "notification source is not available on this platform".to_string(),
               ));
            }
            Strategy::Push(PushDetector::new(source))
         }
         WatchMode::Auto => match source {
            Some(source) if source.is_available() => Strategy::Push(PushDetector::new(source)),
            _ => Strategy::Polling(PollingDetector::new()),
         },
      };

      debug!(
         database = %db.path().display(),
         ?mode,
         strategy = ?strategy.kind(),
         "Watch session built"
      );

      let resources = resources.unwrap_or_else(ResourceManager::global);
      Ok(WatchProvider::new(db, params, strategy, resources))
   }
}
