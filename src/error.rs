use std::io::ErrorKind;
use std::sync::Arc;

/// Result type alias for watch operations.
pub type Result<T> = std::result::Result<T, Error>;

// SQLite primary result codes used for retry classification.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_IOERR: i32 = 10;

/// Errors raised while validating, provisioning or running a watch session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Error from the native notification layer.
   #[error(transparent)]
   Notify(#[from] sqlx_sqlite_notify::Error),

   /// I/O error when resolving database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Watch parameters failed validation.
   #[error("invalid watch parameters: {0}")]
   InvalidParameters(String),

   /// A monitored table does not exist in the database.
   #[error("table not found: {0}")]
   TableNotFound(String),

   /// A table or generated object name is not usable.
   #[error("invalid identifier: {0}")]
   InvalidIdentifier(String),

   #[error("watch session is already started")]
   AlreadyStarted,

   #[error("watch session has been disposed")]
   Disposed,

   /// Database has been closed and cannot be used.
   #[error("database has been closed")]
   DatabaseClosed,

   /// Push detection was requested but cannot run on this platform.
   #[error("push notifications unavailable: {0}")]
   PushUnavailable(String),

   /// A retryable operation kept failing.
   #[error("{operation} failed after {attempts} attempts: {source}")]
   RetriesExhausted {
      operation: String,
      attempts: u32,
      #[source]
      source: Box<Error>,
   },

   /// Starting a session failed. The same error was raised as a fatal event.
   #[error("watch session failed to start: {0}")]
   StartFailed(#[source] Arc<Error>),
}

impl Error {
   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(e) => sqlx_error_code(e),
         Error::Notify(sqlx_sqlite_notify::Error::Sqlx(e)) => sqlx_error_code(e),
         Error::Notify(_) => "NOTIFY_ERROR".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::InvalidParameters(_) => "INVALID_PARAMETERS".to_string(),
         Error::TableNotFound(_) => "TABLE_NOT_FOUND".to_string(),
         Error::InvalidIdentifier(_) => "INVALID_IDENTIFIER".to_string(),
         Error::AlreadyStarted => "ALREADY_STARTED".to_string(),
         Error::Disposed => "DISPOSED".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::PushUnavailable(_) => "PUSH_UNAVAILABLE".to_string(),
         Error::RetriesExhausted { .. } => "RETRIES_EXHAUSTED".to_string(),
         Error::StartFailed(_) => "START_FAILED".to_string(),
      }
   }

   /// Whether retrying the failed operation may succeed.
   ///
   /// Busy/locked databases, transient I/O failures and pool timeouts are
   /// retryable. Open failures (bad path, permissions, not a database) and
   /// every configuration error are not.
   pub fn is_retryable(&self) -> bool {
      match self {
         Error::Sqlx(e) => sqlx_is_retryable(e),
         Error::Notify(sqlx_sqlite_notify::Error::Sqlx(e)) => sqlx_is_retryable(e),
         Error::Io(e) => io_is_retryable(e),
         _ => false,
      }
   }
}

fn sqlx_error_code(e: &sqlx::Error) -> String {
   if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
      return format!("SQLITE_{}", code);
   }
   "SQLX_ERROR".to_string()
}

fn sqlx_is_retryable(e: &sqlx::Error) -> bool {
   match e {
      sqlx::Error::PoolTimedOut => true,
      sqlx::Error::Io(io) => io_is_retryable(io),
      sqlx::Error::Database(db_err) => db_err
         .code()
         .and_then(|code| code.parse::<i32>().ok())
         // Extended codes carry the primary code in the low byte.
         .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR))
         .unwrap_or(false),
      _ => false,
   }
}

fn io_is_retryable(e: &std::io::Error) -> bool {
   !matches!(
      e.kind(),
      ErrorKind::InvalidInput | ErrorKind::NotFound | ErrorKind::PermissionDenied
   )
}
