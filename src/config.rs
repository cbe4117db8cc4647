//! Configuration for watch sessions

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::table::{DEFAULT_SCHEMA, QualifiedTable};

/// Fixed-backoff retry policy for transient database failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
   /// Total attempts, including the first one. Zero behaves like one.
   ///
   /// Default: 3
   pub max_attempts: u32,

   /// Delay between attempts (in milliseconds)
   ///
   /// Default: 500
   pub backoff_ms: u64,
}

impl RetryPolicy {
   pub fn backoff(&self) -> Duration {
      Duration::from_millis(self.backoff_ms)
   }

   /// A policy that never retries.
   pub fn none() -> Self {
      Self {
         max_attempts: 1,
         backoff_ms: 0,
      }
   }
}

impl Default for RetryPolicy {
   fn default() -> Self {
      Self {
         max_attempts: 3,
         backoff_ms: 500,
      }
   }
}

/// Naming and timing options of a watch session.
///
/// Generated objects are named `[schema].[prefix + ledger_name]` for the
/// ledger and `[schema].[prefix + trigger_name + "_" + table]` for each
/// table's trigger group.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_watch::WatchOptions;
///
/// let options = WatchOptions::default()
///    .with_prefix("app_")
///    .with_polling_interval_ms(250);
/// assert_eq!(options.ledger_table_name(), "app_ChangeLedger");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
   /// Schema holding the ledger and triggers. Monitored tables must live here.
   /// Connections are opened without attached databases, so validation only
   /// accepts `main` (in any case).
   ///
   /// Default: "main"
   pub schema: String,

   /// Prefix of every generated object name.
   ///
   /// Default: "tw_"
   pub prefix: String,

   /// Base name of the ledger table.
   ///
   /// Default: "ChangeLedger"
   pub ledger_name: String,

   /// Base name of the per-table triggers.
   ///
   /// Default: "ChangeTrigger"
   pub trigger_name: String,

   /// Listener queue for push notifications. Falls back to the ledger table name.
   ///
   /// Default: None
   pub queue_name: Option<String>,

   /// Delay between two polls of the ledger (in milliseconds)
   ///
   /// Default: 1000
   pub polling_interval_ms: u64,

   /// How long stop waits for the polling task before aborting it (in milliseconds)
   ///
   /// Default: 5000
   pub stop_grace_period_ms: u64,

   /// Retry policy for opening the database and acquiring connections.
   pub retry: RetryPolicy,

   /// Capacity of the broadcast channel behind `subscribe()`.
   ///
   /// Default: 256
   pub channel_capacity: usize,
}

impl Default for WatchOptions {
   fn default() -> Self {
      Self {
         schema: DEFAULT_SCHEMA.to_string(),
         prefix: "tw_".to_string(),
         ledger_name: "ChangeLedger".to_string(),
         trigger_name: "ChangeTrigger".to_string(),
         queue_name: None,
         polling_interval_ms: 1000,
         stop_grace_period_ms: 5000,
         retry: RetryPolicy::default(),
         channel_capacity: 256,
      }
   }
}

impl WatchOptions {
   pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
      self.schema = schema.into();
      self
   }

   pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
      self.prefix = prefix.into();
      self
   }

   pub fn with_ledger_name(mut self, name: impl Into<String>) -> Self {
      self.ledger_name = name.into();
      self
   }

   pub fn with_trigger_name(mut self, name: impl Into<String>) -> Self {
      self.trigger_name = name.into();
      self
   }

   pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
      self.queue_name = Some(name.into());
      self
   }

   pub fn with_polling_interval_ms(mut self, ms: u64) -> Self {
      self.polling_interval_ms = ms;
      self
   }

   pub fn with_stop_grace_period_ms(mut self, ms: u64) -> Self {
      self.stop_grace_period_ms = ms;
      self
   }

   pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
      self.retry = retry;
      self
   }

   pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
      self.channel_capacity = capacity;
      self
   }

   pub fn polling_interval(&self) -> Duration {
      Duration::from_millis(self.polling_interval_ms)
   }

   pub fn stop_grace_period(&self) -> Duration {
      Duration::from_millis(self.stop_grace_period_ms)
   }

   /// Unqualified ledger table name.
   pub fn ledger_table_name(&self) -> String {
      format!("{}{}", self.prefix, self.ledger_name)
   }

   pub fn ledger_table(&self) -> QualifiedTable {
      QualifiedTable::new(self.schema.clone(), self.ledger_table_name())
   }

   /// Unqualified base name of the trigger group watching `table`.
   pub fn trigger_group_name(&self, table: &QualifiedTable) -> String {
      format!("{}{}_{}", self.prefix, self.trigger_name, table.name())
   }

   pub fn trigger_group(&self, table: &QualifiedTable) -> QualifiedTable {
      QualifiedTable::new(self.schema.clone(), self.trigger_group_name(table))
   }

   pub fn queue(&self) -> String {
      self
         .queue_name
         .clone()
         .unwrap_or_else(|| self.ledger_table_name())
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_default_names() {
      let options = WatchOptions::default();
      assert_eq!(options.ledger_table().full_name(), "[main].[tw_ChangeLedger]");
      assert_eq!(
         options
            .trigger_group(&QualifiedTable::unqualified("Orders"))
            .full_name(),
         "[main].[tw_ChangeTrigger_Orders]"
      );
      assert_eq!(options.queue(), "tw_ChangeLedger");
      assert_eq!(options.polling_interval(), Duration::from_secs(1));
      assert_eq!(options.stop_grace_period(), Duration::from_secs(5));
   }

   #[test]
   fn test_partial_json_uses_defaults() {
      let options: WatchOptions =
         serde_json::from_str(r#"{"prefix":"x_","retry":{"max_attempts":5}}"#).unwrap();
      assert_eq!(options.prefix, "x_");
      assert_eq!(options.ledger_name, "ChangeLedger");
      assert_eq!(options.retry.max_attempts, 5);
      assert_eq!(options.retry.backoff_ms, 500);
      assert_eq!(options.channel_capacity, 256);
   }
}
