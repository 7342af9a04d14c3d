//! The worker pool: a fixed-size pool that drains the shared event channel
//! and drives the per-event catalog -> cache -> index -> notify pipeline,
//! with bounded retry and dead-letter hand-off.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::channel::SharedEventChannel;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ChangeAction, DeadLetterItem, EventKind, FileChange, FileChangeEvent};
use crate::notify_manager::NotificationManager;
use crate::reconcile::ReconciliationService;
use crate::search_index::{self, IndexStatus, SearchIndex};
use crate::tree_cache::DirectoryTreeCache;
use crate::util;

#[derive(Default)]
struct WorkerCounters {
    processed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerCounters {
    fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Fixed pool of N workers, all consuming the same [`SharedEventChannel`]
/// — no per-worker queue and no hash-partitioning.
pub struct WorkerPool {
    vault_id: String,
    vault_root: PathBuf,
    config: PipelineConfig,
    channel: SharedEventChannel,
    catalog: Arc<Catalog>,
    tree_cache: Arc<DirectoryTreeCache>,
    search_index: Arc<dyn SearchIndex>,
    notify_manager: Arc<NotificationManager>,
    reconcile: Arc<ReconciliationService>,
    /// Number of events currently being processed by some worker, used by
    /// the reconciliation service's reindex drain-wait.
    in_flight: Arc<AtomicUsize>,
    counters: Vec<WorkerCounters>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vault_id: impl Into<String>,
        vault_root: impl Into<PathBuf>,
        config: PipelineConfig,
        channel: SharedEventChannel,
        catalog: Arc<Catalog>,
        tree_cache: Arc<DirectoryTreeCache>,
        search_index: Arc<dyn SearchIndex>,
        notify_manager: Arc<NotificationManager>,
        reconcile: Arc<ReconciliationService>,
        in_flight: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let worker_count = config.worker_count.max(1);
        let mut counters = Vec::with_capacity(worker_count);
        counters.resize_with(worker_count, WorkerCounters::default);

        Arc::new(Self {
            vault_id: vault_id.into(),
            vault_root: vault_root.into(),
            config,
            channel,
            catalog,
            tree_cache,
            search_index,
            notify_manager,
            reconcile,
            in_flight,
            counters,
        })
    }

    /// Spawn every worker task. Each consumes `cancel` for shutdown and
    /// terminates once the channel closes and drains.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) {
        for idx in 0..self.counters.len() {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tokio::spawn(async move { this.run_worker(idx, cancel).await });
        }
    }

    async fn run_worker(&self, idx: usize, cancel: CancellationToken) {
        info!("[INFO] [worker] worker {} starting", idx);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[INFO] [worker] worker {} cancelled", idx);
                    break;
                }
                maybe = self.channel.recv() => {
                    match maybe {
                        Some(event) => {
                            self.in_flight.fetch_add(1, Ordering::SeqCst);
                            self.process_event(idx, event).await;
                            self.in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => {
                            info!("[INFO] [worker] worker {} stopping: channel closed", idx);
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Relativize and filter, then catalog-apply-with-retry, cache
    /// invalidation, best-effort index update, notification enqueue, and
    /// counter bookkeeping, in that order.
    async fn process_event(&self, idx: usize, event: FileChangeEvent) {
        let Some(relative_path) = util::relativize(&self.vault_root, &event.absolute_path) else {
            warn!("[WARN] [worker] dropping event outside vault root: {:?}", event.absolute_path);
            return;
        };
        if util::has_hidden_component(&relative_path) {
            debug!("[DEBUG] [worker] skipping hidden path {}", relative_path);
            return;
        }

        let (id, is_directory) = match self.apply_with_retry(&event, &relative_path).await {
            Ok(result) => result,
            Err(e) => {
                warn!("[WARN] [worker] retries exhausted for {}: {}", relative_path, e);
                self.counters[idx].failed.fetch_add(1, Ordering::Relaxed);
                let item = DeadLetterItem { event: event.clone(), attempts: self.config.max_retries + 1 };
                self.reconcile.send_to_dlq(item);
                return;
            }
        };

        // Step 3: cache invalidation, synchronous.
        self.tree_cache.invalidate_for(&relative_path).await;

        // Step 4: best-effort index update, only while the index is ready.
        // Directories are never indexed for full-text search.
        if is_directory {
            debug!("[DEBUG] [worker] skipping index update for directory {}", relative_path);
        } else if self.search_index.status() == IndexStatus::Ready {
            let result = if event.event_kind == EventKind::Deleted {
                self.search_index.delete(&relative_path, &id)
            } else {
                let body = search_index::read_body_best_effort(&event.absolute_path);
                self.search_index.reindex(&relative_path, &id, &body)
            };
            if let Err(e) = result {
                warn!("[WARN] [worker] index update failed for {}: {}", relative_path, e);
            }
        } else {
            debug!("[DEBUG] [worker] index not ready, skipping update for {}", relative_path);
        }

        // Step 5: notification queue. Only the relative path ever leaves here.
        let change = FileChange { file_id: id, relative_path, action: ChangeAction::from(event.event_kind) };
        self.notify_manager.enqueue(&self.vault_id, change).await;

        // Step 6.
        self.counters[idx].processed.fetch_add(1, Ordering::Relaxed);
    }

    async fn apply_with_retry(&self, event: &FileChangeEvent, relative_path: &str) -> PipelineResult<(String, bool)> {
        let attempts_total = self.config.max_retries + 1;
        let mut last_err: Option<PipelineError> = None;

        for attempt in 1..=attempts_total {
            match self.catalog.apply(event, relative_path).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    warn!(
                        "[WARN] [worker] catalog apply attempt {}/{} failed for {}: {}",
                        attempt, attempts_total, relative_path, e
                    );
                    last_err = Some(e);
                    if attempt < attempts_total {
                        tokio::time::sleep(self.config.retry_delay()).await;
                    }
                }
            }
        }

        Err(PipelineError::RetriesExhausted {
            attempts: attempts_total,
            source: Box::new(last_err.expect("at least one attempt runs")),
        })
    }

    /// Sum of every worker's processed counter, exposed for observability.
    pub fn processed_total(&self) -> u64 {
        self.counters.iter().map(|c| c.processed()).sum()
    }

    pub fn failed_total(&self) -> u64 {
        self.counters.iter().map(|c| c.failed()).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0 && self.channel.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VaultStatus;
    use crate::search_index::SqliteSearchIndex;

    fn test_pool(vault_root: PathBuf) -> Arc<WorkerPool> {
        let channel = SharedEventChannel::new(64);
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let tree_cache = Arc::new(DirectoryTreeCache::new(catalog.clone()));
        let search_index: Arc<dyn SearchIndex> = Arc::new(SqliteSearchIndex::open_in_memory().unwrap());
        let notify_manager = NotificationManager::new(PipelineConfig::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let config = PipelineConfig { max_retries: 1, retry_delay_ms: 1, ..PipelineConfig::default() };

        let reconcile = ReconciliationService::new(
            "v1",
            config.clone(),
            catalog.clone(),
            tree_cache.clone(),
            search_index.clone(),
            notify_manager.clone(),
            channel.clone(),
            in_flight.clone(),
            |_status: VaultStatus| {},
        );

        WorkerPool::new(
            "v1",
            vault_root,
            config,
            channel,
            catalog,
            tree_cache,
            search_index,
            notify_manager,
            reconcile,
            in_flight,
        )
    }

    fn created_event(absolute_path: PathBuf) -> FileChangeEvent {
        FileChangeEvent { vault_id: "v1".into(), absolute_path, event_kind: EventKind::Created, timestamp: 0 }
    }

    #[tokio::test]
    async fn successful_event_updates_catalog_cache_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.md");
        std::fs::write(&file, "hello world").unwrap();

        let pool = test_pool(dir.path().to_path_buf());
        pool.process_event(0, created_event(file)).await;

        assert_eq!(pool.processed_total(), 1);
        assert_eq!(pool.failed_total(), 0);
        let entry = pool.catalog.get_by_path("a.md", false).unwrap().unwrap();
        assert_eq!(entry.relative_path, "a.md");
    }

    #[tokio::test]
    async fn missing_file_exhausts_retries_and_lands_in_dlq() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("ghost.md");

        let pool = test_pool(dir.path().to_path_buf());
        pool.process_event(0, created_event(missing)).await;

        assert_eq!(pool.processed_total(), 0);
        assert_eq!(pool.failed_total(), 1);
        assert_eq!(pool.reconcile.dropped_count(), 0);
        assert_eq!(pool.reconcile.retried_count(), 0);
    }

    #[tokio::test]
    async fn event_outside_vault_root_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let pool = test_pool(dir.path().to_path_buf());
        pool.process_event(0, created_event(PathBuf::from("/somewhere/else.md"))).await;

        assert_eq!(pool.processed_total(), 0);
        assert_eq!(pool.failed_total(), 0);
    }
}
