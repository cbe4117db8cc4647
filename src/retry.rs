use std::future::Future;

use tracing::debug;

use crate::Result;
use crate::config::RetryPolicy;
use crate::error::Error;

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. Attempts are separated by the fixed backoff.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
   F: FnMut() -> Fut,
   Fut: Future<Output = Result<T>>,
{
   let max_attempts = policy.max_attempts.max(1);
   let mut attempt = 0;

   loop {
      attempt += 1;
      match op().await {
         Ok(value) => return Ok(value),
         Err(e) if !e.is_retryable() => return Err(e),
         Err(e) if attempt >= max_attempts => {
            return Err(Error::RetriesExhausted {
               operation: operation.to_string(),
               attempts: attempt,
               source: Box::new(e),
            });
         }
         Err(e) => {
            debug!(
               operation,
               attempt,
               max_attempts,
               delay_ms = policy.backoff_ms,
               error = %e,
               "Retrying after transient failure"
            );
            tokio::time::sleep(policy.backoff()).await;
         }
      }
   }
}
