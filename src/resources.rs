//! Reference-counted provisioning of the ledger and trigger groups.
//!
//! Sessions that share a database share its generated objects. Each object is
//! created by the first session that needs it and dropped by the last one to
//! let go. Provisioning and teardown run one at a time process-wide, each in a
//! single `BEGIN IMMEDIATE` transaction on the writer connection. Counts are
//! only published after the commit, so a failure or a dropped future leaves
//! both the database and the counts as they were.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::Mutex;
use tracing::{debug, error, trace};

use crate::Result;
use crate::database::WatchDatabase;
use crate::ledger;
use crate::params::WatchParameters;
use crate::table::QualifiedTable;

/// A generated object in a specific database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
   pub database: PathBuf,
   /// Lower-cased `[schema].[name]` of the object.
   pub object: String,
}

impl ResourceKey {
   pub fn new(database: &Path, object: &QualifiedTable) -> Self {
      Self {
         database: database.to_path_buf(),
         object: object.full_name().to_ascii_lowercase(),
      }
   }
}

static GLOBAL: OnceLock<Arc<ResourceManager>> = OnceLock::new();

/// Reference counts of generated objects.
///
/// The count map lives behind the provisioning lock, so counts are only ever
/// read or changed while no other provisioning runs.
#[derive(Debug, Default)]
pub struct ResourceManager {
   counts: Mutex<HashMap<ResourceKey, i64>>,
}

impl ResourceManager {
   /// An isolated manager, for tests or hosts that scope sessions themselves.
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// The process-wide manager used by sessions unless another is injected.
   pub fn global() -> Arc<Self> {
      Arc::clone(GLOBAL.get_or_init(ResourceManager::new))
   }

   /// Current count for `object` in `database` (zero when untracked).
   pub async fn ref_count(&self, database: &Path, object: &QualifiedTable) -> i64 {
      let counts = self.counts.lock().await;
      counts
         .get(&ResourceKey::new(database, object))
         .copied()
         .unwrap_or(0)
   }

   pub async fn snapshot(&self) -> HashMap<ResourceKey, i64> {
      self.counts.lock().await.clone()
   }

   /// Creates the ledger and every missing trigger group, taking one reference
   /// on each.
   pub async fn provision(&self, db: &WatchDatabase, params: &WatchParameters) -> Result<()> {
      let mut counts = self.counts.lock().await;
      // Counts change on a copy that replaces the map only once COMMIT returned.
      let mut next = counts.clone();

      let mut writer = db.acquire_writer().await?;
      let result: Result<()> = async {
         let mut tx = writer.begin_with("BEGIN IMMEDIATE").await?;
         provision_objects(&mut tx, &mut next, db.path(), params).await?;
         tx.commit().await?;
         Ok(())
      }
      .await;

      if let Err(e) = result {
         error!(database = %db.path().display(), error = %e, "Provisioning rolled back");
         return Err(e);
      }
      *counts = next;

      debug!(
         database = %db.path().display(),
         tables = params.tables.len(),
         "Change tracking provisioned"
      );
      Ok(())
   }

   /// Releases one reference on every trigger group and then the ledger,
   /// dropping each object whose count reaches zero.
   pub async fn deprovision(&self, db: &WatchDatabase, params: &WatchParameters) -> Result<()> {
      let mut counts = self.counts.lock().await;
      let mut next = counts.clone();

      let mut writer = db.acquire_writer().await?;
      let result: Result<()> = async {
         let mut tx = writer.begin_with("BEGIN IMMEDIATE").await?;
         deprovision_objects(&mut tx, &mut next, db.path(), params).await?;
         tx.commit().await?;
         Ok(())
      }
      .await;

      if let Err(e) = result {
         error!(database = %db.path().display(), error = %e, "Deprovisioning rolled back");
         return Err(e);
      }
      *counts = next;

      debug!(
         database = %db.path().display(),
         tables = params.tables.len(),
         "Change tracking deprovisioned"
      );
      Ok(())
   }
}

async fn provision_objects(
   conn: &mut SqliteConnection,
   counts: &mut HashMap<ResourceKey, i64>,
   database: &Path,
   params: &WatchParameters,
) -> Result<()> {
   let options = &params.options;

   sqlx::query(&ledger::create_ledger_sql(options))
      .execute(&mut *conn)
      .await?;
   let count = acquire(counts, ResourceKey::new(database, &options.ledger_table()));
   trace!(object = %options.ledger_table(), count, "Ledger referenced");

   for table in &params.tables {
      let members = ledger::trigger_members(options, table);
      let existing = ledger::existing_trigger_members(&mut *conn, options, &members).await?;

      for member in &members {
         if existing.contains(&member.name.to_ascii_lowercase()) {
            continue;
         }
         sqlx::query(&ledger::create_trigger_sql(options, table, member))
            .execute(&mut *conn)
            .await?;
         trace!(trigger = %member.name, table = %table, "Trigger created");
      }

      let group = options.trigger_group(table);
      let count = acquire(counts, ResourceKey::new(database, &group));
      trace!(object = %group, count, "Trigger group referenced");
   }

   Ok(())
}

async fn deprovision_objects(
   conn: &mut SqliteConnection,
   counts: &mut HashMap<ResourceKey, i64>,
   database: &Path,
   params: &WatchParameters,
) -> Result<()> {
   let options = &params.options;

   // Triggers write to the ledger, so they go first.
   for table in &params.tables {
      let group = options.trigger_group(table);
      if release(counts, ResourceKey::new(database, &group)) > 0 {
         continue;
      }
      for member in ledger::trigger_members(options, table) {
         sqlx::query(&ledger::drop_trigger_sql(options, &member))
            .execute(&mut *conn)
            .await?;
      }
      trace!(object = %group, "Trigger group dropped");
   }

   if release(counts, ResourceKey::new(database, &options.ledger_table())) <= 0 {
      sqlx::query(&ledger::drop_ledger_sql(options))
         .execute(&mut *conn)
         .await?;
      trace!(object = %options.ledger_table(), "Ledger dropped");
   }

   Ok(())
}

fn acquire(counts: &mut HashMap<ResourceKey, i64>, key: ResourceKey) -> i64 {
   let count = counts.entry(key).or_insert(0);
   *count += 1;
   *count
}

/// Decrements `key`, removing the entry once nothing references it.
fn release(counts: &mut HashMap<ResourceKey, i64>, key: ResourceKey) -> i64 {
   let remaining = counts.get(&key).copied().unwrap_or(0) - 1;
   if remaining <= 0 {
      counts.remove(&key);
   } else {
      counts.insert(key, remaining);
   }
   remaining
}

#[cfg(test)]
mod tests {
   use super::*;

   fn key(object: &str) -> ResourceKey {
      ResourceKey {
         database: PathBuf::from("/tmp/a.db"),
         object: object.to_string(),
      }
   }

   #[test]
   fn test_release_never_goes_negative() {
      let mut counts = HashMap::new();
      assert_eq!(acquire(&mut counts, key("x")), 1);
      assert_eq!(acquire(&mut counts, key("x")), 2);
      assert_eq!(release(&mut counts, key("x")), 1);
      assert_eq!(release(&mut counts, key("x")), 0);
      assert!(counts.is_empty());

      assert!(release(&mut counts, key("x")) <= 0);
      assert!(counts.is_empty());
   }

   #[test]
   fn test_keys_ignore_case_and_separate_databases() {
      let a = ResourceKey::new(Path::new("/tmp/a.db"), &QualifiedTable::unqualified("Orders"));
      let b = ResourceKey::new(Path::new("/tmp/a.db"), &QualifiedTable::new("MAIN", "orders"));
      let c = ResourceKey::new(Path::new("/tmp/b.db"), &QualifiedTable::unqualified("Orders"));
      assert_eq!(a, b);
      assert_ne!(a, c);
   }
}
