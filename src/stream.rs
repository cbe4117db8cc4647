use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::events::TableChanged;
use crate::table::QualifiedTable;

/// A stream of change events, optionally restricted to some tables.
pub struct TableChangedStream {
   inner: BroadcastStream<TableChanged>,
   filter_tables: Option<Vec<QualifiedTable>>,
}

impl TableChangedStream {
   pub fn new(rx: broadcast::Receiver<TableChanged>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
         filter_tables: None,
      }
   }

   pub fn filter_tables(mut self, tables: Vec<QualifiedTable>) -> Self {
      self.filter_tables = Some(tables);
      self
   }
}

impl Stream for TableChangedStream {
   type Item = TableChanged;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      loop {
         let inner = Pin::new(&mut self.inner);

         match inner.poll_next(cx) {
            Poll::Ready(Some(Ok(change))) => {
               if let Some(ref tables) = self.filter_tables
                  && !tables.contains(&change.table)
               {
                  continue;
               }
               return Poll::Ready(Some(change));
            }
            Poll::Ready(Some(Err(err))) => {
               warn!(
                  error = %err,
                  "Change stream lagged; raise channel_capacity to keep up"
               );
               continue;
            }
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => return Poll::Pending,
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::change::ChangeKinds;
   use futures::StreamExt;
   use uuid::Uuid;

   fn changed(name: &str) -> TableChanged {
      TableChanged {
         table: QualifiedTable::unqualified(name),
         kinds: ChangeKinds::UPDATE,
         session: Uuid::nil(),
      }
   }

   #[tokio::test]
   async fn test_filter_skips_other_tables() {
      let (tx, rx) = broadcast::channel(8);
      let mut stream =
         TableChangedStream::new(rx).filter_tables(vec![QualifiedTable::unqualified("orders")]);

      tx.send(changed("Customers")).unwrap();
      tx.send(changed("Orders")).unwrap();
      drop(tx);

      let first = stream.next().await.unwrap();
      assert_eq!(first.table.name(), "Orders");
      assert!(stream.next().await.is_none());
   }
}
