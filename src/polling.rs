//! Polling detection: periodically re-read the ledger and diff the stamps.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::Result;
use crate::ledger::{self, LedgerStamps};
use crate::provider::{Detection, DetectionContext};
use crate::table::QualifiedTable;

struct Worker {
   cancel: CancellationToken,
   handle: JoinHandle<()>,
   grace: Duration,
}

/// Runs one background task per started session.
///
/// The task owns the cache of last-seen stamps, so nothing else touches it.
/// Stopping cancels the task and waits up to the configured grace period
/// before aborting it.
#[derive(Default)]
pub struct PollingDetector {
   worker: Mutex<Option<Worker>>,
}

impl PollingDetector {
   pub fn new() -> Self {
      Self::default()
   }

   fn take_worker(&self) -> Option<Worker> {
      self.worker.lock().take()
   }
}

impl Detection for PollingDetector {
   async fn start(&self, ctx: DetectionContext) -> Result<()> {
      let cancel = CancellationToken::new();
      let grace = ctx.params.options.stop_grace_period();
      let handle = tokio::spawn(poll_loop(ctx, cancel.clone()));

      if let Some(previous) = self.worker.lock().replace(Worker {
         cancel,
         handle,
         grace,
      }) {
         // A start without a matching stop; never leave a loop orphaned.
         previous.cancel.cancel();
      }
      Ok(())
   }

   async fn stop(&self) -> Result<()> {
      let Some(worker) = self.take_worker() else {
         return Ok(());
      };

      worker.cancel.cancel();
      let mut handle = worker.handle;
      match tokio::time::timeout(worker.grace, &mut handle).await {
         Ok(Ok(())) => {}
         Ok(Err(e)) if e.is_panic() => warn!(error = %e, "Polling task panicked"),
         Ok(Err(_)) => {}
         Err(_) => {
            warn!(
               grace_ms = worker.grace.as_millis() as u64,
               "Polling task ignored cancellation; aborting it"
            );
            handle.abort();
         }
      }
      Ok(())
   }

   async fn cleanup(&self) {
      // Stopping the polling task cannot fail.
      let _ = self.stop().await;
   }

   fn abandon(&self) {
      if let Some(worker) = self.take_worker() {
         worker.cancel.cancel();
      }
   }
}

async fn poll_loop(ctx: DetectionContext, cancel: CancellationToken) {
   let interval = ctx.params.options.polling_interval();
   let tables: Vec<(i64, QualifiedTable)> = ctx
      .params
      .tables
      .iter()
      .map(|table| (table.object_id(), table.clone()))
      .collect();
   let mut cache: HashMap<QualifiedTable, LedgerStamps> = HashMap::new();

   debug!(
      session = %ctx.session,
      tables = tables.len(),
      interval_ms = interval.as_millis() as u64,
      "Polling started"
   );

   loop {
      let tick = tokio::select! {
         _ = cancel.cancelled() => break,
         result = poll_once(&ctx, &tables, &mut cache) => result,
      };

      if let Err(e) = tick
         && !ctx.events.raise_error(e)
      {
         debug!(session = %ctx.session, "Polling ends after an error that was not ignored");
         ctx.request_stop();
         break;
      }

      tokio::select! {
         _ = cancel.cancelled() => break,
         _ = tokio::time::sleep(interval) => {}
      }
   }

   debug!(session = %ctx.session, "Polling stopped");
}

/// One poll: read the ledger, diff against the cache, raise one event per
/// changed table.
async fn poll_once(
   ctx: &DetectionContext,
   tables: &[(i64, QualifiedTable)],
   cache: &mut HashMap<QualifiedTable, LedgerStamps>,
) -> Result<()> {
   let options = &ctx.params.options;
   let object_ids: Vec<i64> = tables.iter().map(|(id, _)| *id).collect();

   let mut conn = ctx.database.acquire_reader(&options.retry).await?;
   let rows = ledger::read_ledger(&mut conn, options, &object_ids).await?;
   drop(conn);

   let mut detected = Vec::new();
   for (object_id, table) in tables {
      let Some(current) = rows.get(object_id) else {
         continue;
      };
      let kinds = current.changed_since(cache.get(table), ctx.params.kinds);
      cache.insert(table.clone(), *current);
      if !kinds.is_empty() {
         detected.push((table.clone(), kinds));
      }
   }

   trace!(session = %ctx.session, rows = rows.len(), changed = detected.len(), "Poll complete");
   for (table, kinds) in detected {
      ctx.events.raise_changed(table, kinds);
   }
   Ok(())
}
