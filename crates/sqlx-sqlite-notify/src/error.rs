//! Error types for the sqlx-sqlite-notify crate.

/// Errors that can occur while registering or delivering notifications.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Failed to register SQLite hooks.
   #[error("Hook registration failed: {0}")]
   HookRegistration(String),

   /// A registration was attempted on a queue with no running listener.
   #[error("No listener is running for queue '{0}'")]
   ListenerNotStarted(String),

   /// Error from SQLx while inspecting the schema or locking a connection.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),
}
