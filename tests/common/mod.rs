#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx_sqlite_watch::{QualifiedTable, RetryPolicy, TableChanged, WatchDatabase, WatchOptions};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing_subscriber::filter::LevelFilter;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(3);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Routes the crate's logs through the test harness's captured output.
pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_test_writer()
      .with_max_level(LevelFilter::DEBUG)
      .try_init();
}

/// Temp database with `Orders` and `Customers` tables.
pub async fn create_test_db() -> (Arc<WatchDatabase>, PathBuf, TempDir) {
   init_tracing();
   let temp_dir = TempDir::new().expect("Failed to create temp directory");
   let path = temp_dir.path().join("watch.db");
   let db = WatchDatabase::connect(&path, &RetryPolicy::none())
      .await
      .expect("Failed to connect to test database");

   execute(
      &db,
      "CREATE TABLE Orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL)",
   )
   .await;
   execute(
      &db,
      "CREATE TABLE Customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
   )
   .await;

   (db, path, temp_dir)
}

pub fn fast_options() -> WatchOptions {
   WatchOptions::default()
      .with_polling_interval_ms(50)
      .with_stop_grace_period_ms(2000)
      .with_retry(RetryPolicy {
         max_attempts: 2,
         backoff_ms: 10,
      })
}

pub async fn execute(db: &WatchDatabase, sql: &str) {
   let mut writer = db.acquire_writer().await.unwrap();
   sqlx::query(sql).execute(&mut *writer).await.unwrap();
}

pub fn orders() -> QualifiedTable {
   QualifiedTable::unqualified("Orders")
}

pub fn customers() -> QualifiedTable {
   QualifiedTable::unqualified("Customers")
}

pub async fn count_objects(db: &WatchDatabase, kind: &str, name_like: &str) -> i64 {
   let (count,): (i64,) =
      sqlx::query_as("SELECT COUNT(*) FROM sqlite_master WHERE type = ?1 AND name LIKE ?2")
         .bind(kind)
         .bind(name_like)
         .fetch_one(db.read_pool().unwrap())
         .await
         .unwrap();
   count
}

pub async fn ledger_exists(db: &WatchDatabase) -> bool {
   count_objects(db, "table", "tw_ChangeLedger").await == 1
}

/// Next change event, failing the test if none arrives in time.
pub async fn next_event(rx: &mut broadcast::Receiver<TableChanged>) -> TableChanged {
   tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
      .await
      .expect("timed out waiting for a change event")
      .expect("change channel closed")
}

/// Asserts that no change event arrives during the quiet period.
pub async fn assert_quiet(rx: &mut broadcast::Receiver<TableChanged>) {
   if let Ok(event) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
      panic!("unexpected change event: {event:?}");
   }
}

/// Waits until `condition` holds, checking every 10ms.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
   F: FnMut() -> Fut,
   Fut: std::future::Future<Output = bool>,
{
   let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
   while tokio::time::Instant::now() < deadline {
      if condition().await {
         return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
   }
   false
}
