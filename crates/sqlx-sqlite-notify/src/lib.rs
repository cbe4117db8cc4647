//! Single-fire row change notifications for SQLite databases using sqlx.
//!
//! A caller registers a [`WatchCommand`] naming one row of one table and a
//! callback. The next committed change to that row invokes the callback exactly
//! once with a [`Notification`] describing why it fired; after that the
//! registration is gone and must be re-issued to keep watching.
//!
//! Changes are detected with SQLite's native hooks (`preupdate_hook`,
//! `commit_hook`, `rollback_hook`) installed on connections wrapped by
//! [`SqliteNotifier::observe`]. Writes made through connections that were not
//! observed are invisible to this crate.
//!
//! # SQLite Requirements
//!
//! Requires SQLite compiled with `SQLITE_ENABLE_PREUPDATE_HOOK`. The default
//! `bundled` feature compiles SQLite from source with that option; otherwise use
//! [`is_preupdate_hook_enabled()`] to verify support at runtime.
//!
//! # Example
//!
//! ```no_run
//! use sqlx::SqlitePool;
//! use sqlx_sqlite_notify::{SqliteNotifier, WatchCommand};
//!
//! # async fn example(pool: SqlitePool) -> sqlx_sqlite_notify::Result<()> {
//! let notifier = SqliteNotifier::new(pool.clone());
//! notifier.start_listener("orders");
//!
//! let command = WatchCommand::new("main", "ledger", 42);
//! notifier
//!    .register("orders", command, Box::new(|n| println!("row changed: {:?}", n.reason)))
//!    .await?;
//!
//! let mut conn = notifier.observe(pool.acquire().await?).await?;
//! sqlx::query("UPDATE ledger SET touched = 1 WHERE rowid = 42")
//!    .execute(&mut *conn)
//!    .await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod connection;
pub mod error;
pub mod hooks;
pub mod notification;
pub mod notifier;

pub use broker::NotificationBroker;
pub use connection::ObservableConnection;
pub use error::Error;
pub use hooks::{RowOperation, SqliteValue, is_preupdate_hook_enabled};
pub use notification::{
   Notification, NotificationCallback, NotificationPhase, NotificationReason, RegistrationId,
   WatchCommand,
};
pub use notifier::SqliteNotifier;

pub type Result<T> = std::result::Result<T, Error>;
