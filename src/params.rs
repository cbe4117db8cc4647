//! Parameters of a watch session and their validation.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::change::ChangeKinds;
use crate::config::WatchOptions;
use crate::database::{WatchDatabase, check_database_path};
use crate::error::Error;
use crate::table::{DEFAULT_SCHEMA, QualifiedTable};

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
   Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern is valid")
});

static PREFIX: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]*$").expect("prefix pattern is valid"));

/// What a watch session observes.
///
/// Tables are kept deduplicated and sorted (schema, then name, ignoring case).
/// Sessions clone the parameters when built, so later changes to the
/// caller's copy have no effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchParameters {
   /// Database file to watch.
   pub database: PathBuf,
   pub tables: BTreeSet<QualifiedTable>,
   /// Change kinds reported to subscribers.
   pub kinds: ChangeKinds,
   #[serde(default)]
   pub options: WatchOptions,
}

impl WatchParameters {
   pub fn new(database: impl Into<PathBuf>) -> Self {
      Self {
         database: database.into(),
         tables: BTreeSet::new(),
         kinds: ChangeKinds::ALL,
         options: WatchOptions::default(),
      }
   }

   pub fn with_table(mut self, table: QualifiedTable) -> Self {
      self.tables.insert(table);
      self
   }

   /// Adds tables by name. Names that do not parse are skipped with a warning,
   /// so an all-invalid list fails validation as an empty table set.
   pub fn with_table_names<I, S>(mut self, names: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: AsRef<str>,
   {
      for name in names {
         match QualifiedTable::parse(name.as_ref()) {
            Ok(table) => {
               self.tables.insert(table);
            }
            Err(e) => warn!(name = name.as_ref(), error = %e, "Skipping invalid table name"),
         }
      }
      self
   }

   pub fn with_kinds(mut self, kinds: ChangeKinds) -> Self {
      self.kinds = kinds;
      self
   }

   pub fn with_options(mut self, options: WatchOptions) -> Self {
      self.options = options;
      self
   }

   /// Checks everything that does not need the database.
   pub fn validate_shape(&self) -> Result<()> {
      check_database_path(&self.database)?;

      if self.tables.is_empty() {
         return Err(Error::InvalidParameters(
            "no valid tables to watch".to_string(),
         ));
      }
      if self.kinds.is_empty() {
         return Err(Error::InvalidParameters(
            "change mask selects no change kinds".to_string(),
         ));
      }

      let options = &self.options;
      for (field, value) in [
         ("schema", options.schema.as_str()),
         ("ledger_name", options.ledger_name.as_str()),
         ("trigger_name", options.trigger_name.as_str()),
      ] {
         if !IDENTIFIER.is_match(value) {
            return Err(Error::InvalidIdentifier(format!("{field} '{value}'")));
         }
      }
      // Connections carry no attached databases, so only `main` is reachable.
      if !options.schema.eq_ignore_ascii_case(DEFAULT_SCHEMA) {
         return Err(Error::InvalidParameters(format!(
            "schema '{}' is not available; generated objects live in '{DEFAULT_SCHEMA}'",
            options.schema
         )));
      }
      if !PREFIX.is_match(&options.prefix) {
         return Err(Error::InvalidIdentifier(format!("prefix '{}'", options.prefix)));
      }
      if let Some(queue) = &options.queue_name
         && !IDENTIFIER.is_match(queue)
      {
         return Err(Error::InvalidIdentifier(format!("queue_name '{queue}'")));
      }

      let ledger = options.ledger_table();
      for table in &self.tables {
         // Triggers may only write to tables in their own schema.
         if !table.schema().eq_ignore_ascii_case(&options.schema) {
            return Err(Error::InvalidParameters(format!(
               "{table} is outside schema '{}'",
               options.schema
            )));
         }
         if *table == ledger {
            return Err(Error::InvalidParameters(format!(
               "{table} is the change ledger and cannot be watched"
            )));
         }
      }

      Ok(())
   }

   /// Full validation, including a live check that every table exists.
   pub async fn validate(&self, db: &WatchDatabase) -> Result<()> {
      self.validate_shape()?;

      let pool = db.read_pool()?;
      let sql = format!(
         "SELECT COUNT(*) FROM \"{}\".sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
         self.options.schema
      );
      for table in &self.tables {
         let (count,): (i64,) = sqlx::query_as(&sql)
            .bind(table.name())
            .fetch_one(pool)
            .await?;
         if count == 0 {
            return Err(Error::TableNotFound(table.full_name()));
         }
      }

      Ok(())
   }
}
