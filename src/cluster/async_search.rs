//! Bounded, deadline-aware search front end for async callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;

use super::dispatcher::{Dispatcher, SearchOutcome};
use crate::error::SearchError;

/// Runs dispatcher searches on the blocking pool with a cap on concurrent
/// searches and an optional per-search deadline.
///
/// A search that misses its deadline returns
/// [`SearchError::DeadlineExceeded`]; the blocking work is left to finish
/// and its permit is released when it does.
#[derive(Debug, Clone)]
pub struct AsyncSearcher {
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    deadline: Option<Duration>,
    expired: Arc<AtomicU64>,
}

impl AsyncSearcher {
    pub fn new(dispatcher: Arc<Dispatcher>, max_inflight: usize, deadline: Option<Duration>) -> Self {
        Self {
            dispatcher,
            permits: Arc::new(Semaphore::new(max_inflight.max(1))),
            deadline,
            expired: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Searcher configured from the dispatcher's `search` settings.
    pub fn from_dispatcher(dispatcher: Arc<Dispatcher>) -> Self {
        let search = &dispatcher.settings().search;
        let (max_inflight, deadline) = (search.max_inflight, search.deadline());
        Self::new(dispatcher, max_inflight, deadline)
    }

    pub async fn search(&self, query: Vec<f32>, k: usize) -> Result<SearchOutcome, SearchError> {
        let work = self.run(query, k);
        let Some(deadline) = self.deadline else {
            return work.await;
        };

        match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                self.expired.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(deadline_ms = deadline.as_millis() as u64, "search deadline exceeded");
                Err(SearchError::DeadlineExceeded {
                    deadline_ms: deadline.as_millis() as u64,
                })
            }
        }
    }

    async fn run(&self, query: Vec<f32>, k: usize) -> Result<SearchOutcome, SearchError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| SearchError::Worker(e.to_string()))?;
        let dispatcher = Arc::clone(&self.dispatcher);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            dispatcher.search(&query, k)
        })
        .await
        .map_err(|e| SearchError::Worker(e.to_string()))?
    }

    /// Searches that missed their deadline so far.
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Device, DeviceOptions};
    use crate::config::Settings;
    use crate::types::NodeId;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut settings = Settings::default();
        settings.index.dimensions = 2;
        let device = Arc::new(Device::new(DeviceOptions::default()).unwrap());
        let dispatcher = Dispatcher::new(settings, device).unwrap();
        dispatcher.insert(NodeId::new("x"), &[1.0, 0.0]).unwrap();
        dispatcher.insert(NodeId::new("y"), &[0.0, 1.0]).unwrap();
        Arc::new(dispatcher)
    }

    #[tokio::test]
    async fn test_concurrent_searches() {
        let searcher = AsyncSearcher::new(dispatcher(), 2, Some(Duration::from_secs(10)));
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let searcher = searcher.clone();
                tokio::spawn(async move {
                    let query = if i % 2 == 0 { vec![1.0, 0.1] } else { vec![0.1, 1.0] };
                    searcher.search(query, 1).await
                })
            })
            .collect();

        for (i, task) in tasks.into_iter().enumerate() {
            let outcome = task.await.unwrap().unwrap();
            let expected = if i % 2 == 0 { "x" } else { "y" };
            assert_eq!(outcome.results[0].id.as_str(), expected);
        }
        assert_eq!(searcher.available_permits(), 2);
        assert_eq!(searcher.expired_count(), 0);
    }

    #[tokio::test]
    async fn test_deadline_while_queued() {
        let searcher = AsyncSearcher::new(dispatcher(), 1, Some(Duration::from_millis(20)));
        // Hold the only permit so the search can never start
        let held = Arc::clone(&searcher.permits).acquire_owned().await.unwrap();

        let err = searcher.search(vec![1.0, 0.0], 1).await.unwrap_err();
        assert!(matches!(err, SearchError::DeadlineExceeded { deadline_ms: 20 }));
        assert_eq!(searcher.expired_count(), 1);

        drop(held);
        assert!(searcher.search(vec![1.0, 0.0], 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_errors_propagate() {
        let searcher = AsyncSearcher::new(dispatcher(), 4, None);
        assert!(matches!(
            searcher.search(vec![1.0], 1).await,
            Err(SearchError::DimensionMismatch { .. })
        ));
    }
}
