//! Shared database handle: a read-only pool plus a single writer connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, OnceLock, Weak};

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions, Pool, Sqlite};
use sqlx_sqlite_notify::{ObservableConnection, SqliteNotifier};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::Result;
use crate::config::RetryPolicy;
use crate::error::Error;
use crate::retry::with_retry;

const MAX_READ_CONNECTIONS: u32 = 4;
const IDLE_TIMEOUT_SECS: u64 = 30;

/// Open databases by absolute path. Entries are weak so a database is freed
/// once the last session and caller drop it.
static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, Weak<WatchDatabase>>>> =
   LazyLock::new(|| Mutex::new(HashMap::new()));

/// A SQLite database shared by every watch session on the same file.
///
/// Reads (ledger polling, catalog lookups) use a pool of read-only
/// connections. Provisioning and application writes go through a single
/// read-write connection, which enables WAL mode on first use.
///
/// Writes only reach push subscribers when they are made through
/// [`WatchDatabase::acquire_observable_writer`].
#[derive(Debug)]
pub struct WatchDatabase {
   read_pool: Pool<Sqlite>,
   write_conn: Pool<Sqlite>,
   wal_initialized: AtomicBool,
   closed: AtomicBool,
   path: PathBuf,
   notifier: OnceLock<Arc<SqliteNotifier>>,
}

/// Rejects descriptors that cannot be shared between connections.
pub(crate) fn check_database_path(path: &Path) -> Result<()> {
   let raw = path.to_string_lossy();
   if raw.trim().is_empty() {
      return Err(Error::InvalidParameters(
         "database path cannot be empty".to_string(),
      ));
   }
   if raw == ":memory:" || raw.starts_with("file::memory:") || raw.contains("mode=memory") {
      return Err(Error::InvalidParameters(
         "in-memory databases cannot be watched".to_string(),
      ));
   }
   Ok(())
}

impl WatchDatabase {
   /// Opens the database at `path`, or returns the instance already open for it.
   ///
   /// The file is created when missing. Transient open failures are retried
   /// according to `retry`; non-retryable failures return immediately.
   pub async fn connect(path: impl AsRef<Path>, retry: &RetryPolicy) -> Result<Arc<Self>> {
      let path = path.as_ref();
      check_database_path(path)?;
      let path = std::path::absolute(path)?;

      let mut registry = REGISTRY.lock().await;
      if let Some(db) = registry.get(&path).and_then(Weak::upgrade)
         && !db.closed.load(Ordering::SeqCst)
      {
         return Ok(db);
      }

      let db = Arc::new(with_retry(retry, "open database", || Self::open(path.clone())).await?);
      registry.retain(|_, weak| weak.strong_count() > 0);
      registry.insert(path, Arc::downgrade(&db));
      Ok(db)
   }

   async fn open(path: PathBuf) -> Result<Self> {
      // Read-only connections cannot create the file, so do it up front.
      if !path.exists() {
         let conn = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .read_only(false)
            .connect()
            .await?;
         drop(conn);
      }

      let read_options = SqliteConnectOptions::new().filename(&path).read_only(true);
      let read_pool = SqlitePoolOptions::new()
         .max_connections(MAX_READ_CONNECTIONS)
         .min_connections(0)
         .idle_timeout(Some(std::time::Duration::from_secs(IDLE_TIMEOUT_SECS)))
         .connect_with(read_options)
         .await?;

      let write_options = SqliteConnectOptions::new().filename(&path).read_only(false);
      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(std::time::Duration::from_secs(IDLE_TIMEOUT_SECS)))
         .connect_with(write_options)
         .await?;

      debug!(path = %path.display(), "Database opened");

      Ok(Self {
         read_pool,
         write_conn,
         wal_initialized: AtomicBool::new(false),
         closed: AtomicBool::new(false),
         path,
         notifier: OnceLock::new(),
      })
   }

   /// Absolute path of the database file; identifies the database in
   /// reference counts and listener queues.
   pub fn path(&self) -> &Path {
      &self.path
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::SeqCst)
   }

   /// Pool of read-only connections.
   pub fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }
      Ok(&self.read_pool)
   }

   /// Acquires a read-only connection, retrying transient failures.
   pub async fn acquire_reader(&self, retry: &RetryPolicy) -> Result<PoolConnection<Sqlite>> {
      with_retry(retry, "acquire read connection", || async {
         Ok(self.read_pool()?.acquire().await?)
      })
      .await
   }

   /// Acquires the single writer connection, enabling WAL on first use.
   ///
   /// Only one writer exists at a time; callers queue until it is returned.
   pub async fn acquire_writer(&self) -> Result<PoolConnection<Sqlite>> {
      if self.is_closed() {
         return Err(Error::DatabaseClosed);
      }

      let mut conn = self.write_conn.acquire().await?;

      if !self.wal_initialized.load(Ordering::SeqCst) {
         sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
         sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&mut *conn)
            .await?;
         self.wal_initialized.store(true, Ordering::SeqCst);
      }

      Ok(conn)
   }

   /// Acquires the writer wrapped so that committed ledger changes fire push
   /// notifications.
   pub async fn acquire_observable_writer(&self) -> Result<ObservableConnection> {
      let conn = self.acquire_writer().await?;
      Ok(self.notifier().observe(conn).await?)
   }

   /// Notification primitive of this database, created on first use.
   pub fn notifier(&self) -> Arc<SqliteNotifier> {
      Arc::clone(
         self
            .notifier
            .get_or_init(|| Arc::new(SqliteNotifier::new(self.read_pool.clone()))),
      )
   }

   /// Closes both pools and forgets the database.
   pub async fn close(self: Arc<Self>) -> Result<()> {
      self.closed.store(true, Ordering::SeqCst);

      {
         let mut registry = REGISTRY.lock().await;
         if registry
            .get(&self.path)
            .is_some_and(|weak| weak.as_ptr() == Arc::as_ptr(&self))
         {
            registry.remove(&self.path);
         }
      }

      self.read_pool.close().await;

      if self.wal_initialized.load(Ordering::SeqCst) {
         match self.write_conn.acquire().await {
            Ok(mut conn) => {
               if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                  .execute(&mut *conn)
                  .await
               {
                  error!(path = %self.path.display(), error = %e, "WAL checkpoint failed on close");
               }
            }
            Err(e) => error!(path = %self.path.display(), error = %e, "Writer unavailable on close"),
         }
      }

      self.write_conn.close().await;
      Ok(())
   }
}
