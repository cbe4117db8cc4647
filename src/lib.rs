//! Trigger-based change tracking for SQLite tables.
//!
//! A watch session observes a set of tables and raises an event whenever rows
//! are inserted, updated or deleted in them. No row data is captured: events
//! say which table changed and in which ways since it was last observed.
//!
//! Starting a session provisions a shared *change ledger* table in the
//! database, plus a trigger group per watched table that stamps the table's
//! ledger row on every write. Sessions sharing a database share these objects;
//! they are reference counted and dropped when the last session stops.
//!
//! Changes are detected by one of two strategies:
//!
//! - **Polling** re-reads the ledger every `polling_interval_ms` and reports
//!   stamps that moved. It sees writes from any connection or process.
//! - **Push** registers single-fire notifications on the ledger rows through
//!   [`sqlx_sqlite_notify`] and re-arms after each one. It only sees writes made
//!   through [`WatchDatabase::acquire_observable_writer`].
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use sqlx_sqlite_watch::{ChangeKinds, QualifiedTable, WatchProvider};
//!
//! # async fn example() -> sqlx_sqlite_watch::Result<()> {
//! let provider = WatchProvider::builder("app.db")
//!    .tables(["Orders", "Customers"])
//!    .kinds(ChangeKinds::INSERT | ChangeKinds::UPDATE)
//!    .build()
//!    .await?;
//!
//! let mut orders = provider.subscribe_stream([QualifiedTable::unqualified("Orders")]);
//! provider.start().await?;
//!
//! while let Some(change) = orders.next().await {
//!    println!("{} changed: {}", change.table, change.kinds);
//! }
//! # Ok(())
//! # }
//! ```

mod change;
mod config;
mod database;
mod error;
mod events;
mod factory;
mod ledger;
mod params;
mod polling;
mod provider;
mod push;
mod resources;
mod retry;
mod stream;
mod table;

pub use change::{ChangeKind, ChangeKinds};
pub use config::{RetryPolicy, WatchOptions};
pub use database::WatchDatabase;
pub use error::{Error, Result};
pub use events::{ErrorEvent, EventHub, FatalErrorEvent, TableChanged};
pub use factory::{WatchBuilder, WatchMode};
pub use ledger::LedgerStamps;
pub use params::WatchParameters;
pub use provider::{StrategyKind, WatchProvider};
pub use push::NotificationSource;
pub use resources::{ResourceKey, ResourceManager};
pub use retry::with_retry;
pub use stream::TableChangedStream;
pub use table::{DEFAULT_SCHEMA, QualifiedTable};

// Re-exported for implementing `NotificationSource`.
pub use sqlx_sqlite_notify::{
   Notification, NotificationCallback, NotificationPhase, NotificationReason, RegistrationId,
   WatchCommand,
};
