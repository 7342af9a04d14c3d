//! Wiring for the whole vault event pipeline (C1-C8).
//!
//! `VaultPipeline` is the single place that constructs every subsystem and
//! owns them directly, driving them until cancelled.

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::catalog::Catalog;
use crate::channel::SharedEventChannel;
use crate::config::VaultConfig;
use crate::error::PipelineResult;
use crate::models::{NotificationEvent, VaultStatus};
use crate::notify_manager::NotificationManager;
use crate::reconcile::ReconciliationService;
use crate::search_index::SqliteSearchIndex;
use crate::tree_cache::DirectoryTreeCache;
use crate::watcher::SyncSource;
use crate::worker::WorkerPool;

/// Aggregate, read-only view of pipeline health, exposed for observability.
#[derive(Debug, Clone, Copy)]
pub struct PipelineMetrics {
    pub processed: u64,
    pub failed: u64,
    pub dlq_dropped: u64,
    pub dlq_retried: u64,
    pub pending_count: u64,
}

/// Owns and drives every component for a single configured vault.
pub struct VaultPipeline {
    vault_id: String,
    catalog: Arc<Catalog>,
    tree_cache: Arc<DirectoryTreeCache>,
    search_index: Arc<SqliteSearchIndex>,
    channel: SharedEventChannel,
    sync_source: Arc<SyncSource>,
    worker_pool: Arc<WorkerPool>,
    reconcile: Arc<ReconciliationService>,
    notify_manager: Arc<NotificationManager>,
    cancel: CancellationToken,
}

impl VaultPipeline {
    /// Construct every subsystem from `config` without starting anything.
    pub fn new(config: &VaultConfig) -> PipelineResult<Self> {
        let pipeline_config = config.pipeline.clone();

        let catalog = Arc::new(Catalog::open(&config.db_path)?);
        let search_index = Arc::new(SqliteSearchIndex::open(&config.index_path)?);
        let tree_cache = Arc::new(DirectoryTreeCache::new(catalog.clone()));
        let channel = SharedEventChannel::new(pipeline_config.channel_capacity);
        let notify_manager = NotificationManager::new(pipeline_config.clone());
        let in_flight = Arc::new(AtomicUsize::new(0));

        let vault_id = config.vault_id.clone();
        let status_vault_id = vault_id.clone();
        let reconcile = ReconciliationService::new(
            vault_id.clone(),
            pipeline_config.clone(),
            catalog.clone(),
            tree_cache.clone(),
            search_index.clone() as Arc<dyn crate::search_index::SearchIndex>,
            notify_manager.clone(),
            channel.clone(),
            in_flight.clone(),
            move |status| {
                info!("[INFO] [pipeline] vault {} status -> {:?}", status_vault_id, status);
            },
        );

        let sync_source = SyncSource::new(vault_id.clone(), config.vault_root(), channel.clone());

        let worker_pool = WorkerPool::new(
            vault_id.clone(),
            config.vault_root(),
            pipeline_config.clone(),
            channel.clone(),
            catalog.clone(),
            tree_cache.clone(),
            search_index.clone() as Arc<dyn crate::search_index::SearchIndex>,
            notify_manager.clone(),
            reconcile.clone(),
            in_flight,
        );

        Ok(Self {
            vault_id,
            catalog,
            tree_cache,
            search_index,
            channel,
            sync_source,
            worker_pool,
            reconcile,
            notify_manager,
            cancel: CancellationToken::new(),
        })
    }

    /// Start every subsystem. Returns once the initial walk completes and
    /// background tasks are spawned; the pipeline then runs until
    /// [`Self::shutdown`] or external cancellation of the returned token.
    pub async fn run(&self) -> PipelineResult<()> {
        info!("[INFO] [pipeline] starting vault {}", self.vault_id);

        self.reconcile.set_sync_source(self.sync_source.clone()).await;

        // Pending-count getter: channel depth + DLQ depth, both cheap O(1)
        // reads, captured as a closure rather than a new shared counter.
        let count_channel = self.channel.clone();
        let count_reconcile = self.reconcile.clone();
        self.notify_manager
            .set_pending_count_fn(&self.vault_id, move || count_channel.len() as u64 + count_reconcile.dlq_depth())
            .await;

        self.worker_pool.spawn(self.cancel.clone());
        tokio::task::spawn(Arc::clone(&self.reconcile).run(self.cancel.clone()));
        tokio::task::spawn(Arc::clone(&self.notify_manager).run(self.cancel.clone()));

        self.sync_source.start(self.cancel.clone()).await?;

        info!("[INFO] [pipeline] vault {} running", self.vault_id);
        Ok(())
    }

    /// Trigger a full reindex of the vault.
    pub async fn trigger_reindex(&self) -> PipelineResult<()> {
        self.reconcile.trigger_reindex().await
    }

    /// Passthrough to the sync source's `inject`, used by operators and
    /// tests to push a synthetic event straight onto the shared channel
    /// without going through the filesystem watcher.
    pub fn inject(&self, event: crate::models::FileChangeEvent) -> bool {
        self.sync_source.inject(event)
    }

    /// Register a new notification subscriber for this vault.
    pub async fn subscribe(&self) -> (String, mpsc::Receiver<NotificationEvent>) {
        self.notify_manager.register(&self.vault_id).await
    }

    pub async fn unsubscribe(&self, client_id: &str) {
        self.notify_manager.unregister(client_id).await
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            processed: self.worker_pool.processed_total(),
            failed: self.worker_pool.failed_total(),
            dlq_dropped: self.reconcile.dropped_count(),
            dlq_retried: self.reconcile.retried_count(),
            pending_count: self.channel.len() as u64 + self.reconcile.dlq_depth(),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn tree_cache(&self) -> &Arc<DirectoryTreeCache> {
        &self.tree_cache
    }

    pub fn search_index(&self) -> &Arc<SqliteSearchIndex> {
        &self.search_index
    }

    /// Begin graceful shutdown: cancellation propagates to the watcher, the
    /// workers, the reconciliation loop and the notification flusher
    /// Bounded by the caller's own timeout.
    pub fn shutdown(&self) {
        info!("[INFO] [pipeline] shutting down vault {}", self.vault_id);
        self.channel.close();
        self.cancel.cancel();
    }

    pub fn vault_status_is_active(&self) -> bool {
        !self.reconcile.is_reindexing()
    }
}

/// Helper exposing the vault's current high-level lifecycle for callers
/// that only need a coarse view rather than the full metrics struct.
pub fn status_of(pipeline: &VaultPipeline) -> VaultStatus {
    if pipeline.vault_status_is_active() {
        VaultStatus::Active
    } else {
        VaultStatus::Reindexing
    }
}
