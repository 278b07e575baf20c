//! Event log facade over a [`WorkflowEventStore`]

use std::sync::Arc;

use futures::stream::{self, Stream, TryStreamExt};
use uuid::Uuid;

use super::store::{AppendBatch, StoreError, WorkflowEventStore};
use crate::workflow::RecordedEvent;

/// Default number of events fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Ordered, append-only log of a run
///
/// Reads are lazy and paged. A stream can be restarted from any sequence
/// number by calling [`EventLog::read`] again.
pub struct EventLog<S: WorkflowEventStore> {
    store: Arc<S>,
    page_size: usize,
}

impl<S: WorkflowEventStore> Clone for EventLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            page_size: self.page_size,
        }
    }
}

impl<S: WorkflowEventStore> EventLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Append a batch after `expected_sequence` events
    pub async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        batch: AppendBatch,
    ) -> Result<u64, StoreError> {
        self.store.append_events(run_id, expected_sequence, batch).await
    }

    /// Stream the events of a run starting at `from`
    pub fn read(
        &self,
        run_id: Uuid,
        from: u64,
    ) -> impl Stream<Item = Result<RecordedEvent, StoreError>> + Send + 'static {
        let store = Arc::clone(&self.store);
        let page_size = self.page_size;

        stream::try_unfold(Some(from), move |cursor| {
            let store = Arc::clone(&store);
            async move {
                let Some(from) = cursor else {
                    return Ok::<_, StoreError>(None);
                };
                let page = store.load_events(run_id, from, page_size).await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = if page.len() < page_size {
                    None
                } else {
                    page.last().map(|e| e.sequence + 1)
                };
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
    }

    /// Collect the full history of a run
    pub async fn load(&self, run_id: Uuid) -> Result<Vec<RecordedEvent>, StoreError> {
        self.read(run_id, 0).try_collect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryWorkflowEventStore, NewExecution};
    use crate::workflow::WorkflowEvent;
    use chrono::Utc;
    use futures::StreamExt;
    use serde_json::json;

    async fn seeded(events: usize) -> (EventLog<InMemoryWorkflowEventStore>, Uuid) {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let now = Utc::now();
        let exec = NewExecution::new("wf", "test", json!({}), now);
        let run_id = exec.run_id;
        store.create_execution(exec).await.unwrap();

        let log = EventLog::new(store).with_page_size(3);
        for i in 0..events {
            let batch = AppendBatch::event(
                now,
                WorkflowEvent::SignalReceived {
                    signal: crate::workflow::WorkflowSignal::new(format!("s{i}"), json!(i), now),
                },
            );
            log.append(run_id, i as u64 + 1, batch).await.unwrap();
        }
        (log, run_id)
    }

    #[tokio::test]
    async fn test_load_pages_through_history() {
        let (log, run_id) = seeded(7).await;

        let events = log.load(run_id).await.unwrap();
        assert_eq!(events.len(), 8);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_read_is_restartable() {
        let (log, run_id) = seeded(4).await;

        let first: Vec<_> = log.read(run_id, 0).take(2).collect().await;
        assert_eq!(first.len(), 2);

        let rest: Vec<RecordedEvent> = log.read(run_id, 2).try_collect().await.unwrap();
        assert_eq!(rest.first().map(|e| e.sequence), Some(2));
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn test_read_unknown_run_fails() {
        let (log, _) = seeded(0).await;
        let result = log.load(Uuid::now_v7()).await;
        assert!(matches!(result, Err(StoreError::RunNotFound(_))));
    }
}
