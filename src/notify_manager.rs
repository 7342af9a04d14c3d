//! The notification manager (C8): per-vault pending-change buffering,
//! coalesced onto a fixed flush tick and fanned out to subscribed clients
//! through a per-client bounded queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::{FileChange, NotificationEvent};

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// A registered client's view into a vault's notification stream.
struct Subscriber {
    vault_id: String,
    sender: mpsc::Sender<NotificationEvent>,
}

/// Per-vault coalescing state.
#[derive(Default)]
struct VaultState {
    pending: Vec<FileChange>,
    error: Option<String>,
    refresh_requested: bool,
}

type PendingCountFn = Box<dyn Fn() -> u64 + Send + Sync>;

/// Owns the subscriber registry and the per-vault pending buffers. One
/// instance is shared across the whole pipeline (today, one vault; the
/// registry is keyed by `vault_id` so nothing here assumes there is only one).
pub struct NotificationManager {
    config: PipelineConfig,
    vaults: RwLock<HashMap<String, VaultState>>,
    pending_count_fns: RwLock<HashMap<String, PendingCountFn>>,
    subscribers: RwLock<HashMap<String, Subscriber>>,
    by_vault: RwLock<HashMap<String, Vec<String>>>,
    dropped_sends: AtomicU64,
}

impl NotificationManager {
    pub fn new(config: PipelineConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            vaults: RwLock::new(HashMap::new()),
            pending_count_fns: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            by_vault: RwLock::new(HashMap::new()),
            dropped_sends: AtomicU64::new(0),
        })
    }

    async fn ensure_vault(&self, vault_id: &str) {
        self.vaults.write().await.entry(vault_id.to_string()).or_default();
    }

    /// Bind the cheap pending-count reader for a vault: a closure over
    /// channel depth plus DLQ depth, no extra atomic counter needed.
    pub async fn set_pending_count_fn(&self, vault_id: &str, f: impl Fn() -> u64 + Send + Sync + 'static) {
        self.ensure_vault(vault_id).await;
        self.pending_count_fns.write().await.insert(vault_id.to_string(), Box::new(f));
    }

    /// Assigns a fresh client id, returns it plus the receiving half of its
    /// outgoing queue. A `Connected` record carrying `{client_id, vault_id}`
    /// is pushed onto the queue before it is handed back, so it is always
    /// the first event a subscriber observes.
    pub async fn register(self: &Arc<Self>, vault_id: &str) -> (String, mpsc::Receiver<NotificationEvent>) {
        self.ensure_vault(vault_id).await;
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.config.subscriber_queue_capacity.max(1));

        let connected = NotificationEvent::connected(vault_id, &client_id, now_unix());
        if tx.send(connected).await.is_err() {
            warn!("[WARN] [notify_manager] failed to deliver connected event to {}", client_id);
        }

        self.subscribers.write().await.insert(
            client_id.clone(),
            Subscriber { vault_id: vault_id.to_string(), sender: tx },
        );
        self.by_vault.write().await.entry(vault_id.to_string()).or_default().push(client_id.clone());

        info!("[INFO] [notify_manager] client {} subscribed to vault {}", client_id, vault_id);
        (client_id, rx)
    }

    /// Drops the outgoing sender (closing the queue) and removes both the
    /// global and per-vault index entries.
    pub async fn unregister(&self, client_id: &str) {
        let removed = self.subscribers.write().await.remove(client_id);
        if let Some(sub) = removed {
            if let Some(clients) = self.by_vault.write().await.get_mut(&sub.vault_id) {
                clients.retain(|id| id != client_id);
            }
            info!("[INFO] [notify_manager] client {} unsubscribed", client_id);
        }
    }

    /// Enqueue a worker-observed change into the vault's pending buffer.
    pub async fn enqueue(&self, vault_id: &str, change: FileChange) {
        self.ensure_vault(vault_id).await;
        let mut vaults = self.vaults.write().await;
        if let Some(state) = vaults.get_mut(vault_id) {
            state.pending.push(change);
        }
    }

    /// Set the vault's error slot, taking priority over any pending changes
    /// on the next tick.
    pub async fn set_error(&self, vault_id: &str, message: impl Into<String>) {
        self.ensure_vault(vault_id).await;
        let mut vaults = self.vaults.write().await;
        if let Some(state) = vaults.get_mut(vault_id) {
            state.error = Some(message.into());
        }
    }

    /// Request an out-of-band `Refresh` event be sent at the next tick.
    pub async fn request_refresh(&self, vault_id: &str) {
        self.ensure_vault(vault_id).await;
        let mut vaults = self.vaults.write().await;
        if let Some(state) = vaults.get_mut(vault_id) {
            state.refresh_requested = true;
        }
    }

    /// Run the periodic flusher until `cancel` fires. Intended to be
    /// `tokio::spawn`ed once per pipeline.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.flush_tick());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[INFO] [notify_manager] cancelled, stopping flusher");
                    break;
                }
                _ = ticker.tick() => {
                    self.flush_once().await;
                }
            }
        }
    }

    async fn flush_once(&self) {
        // Copy vault ids first so we never hold the vaults lock while sending.
        let vault_ids: Vec<String> = self.vaults.read().await.keys().cloned().collect();

        for vault_id in vault_ids {
            // Copy the subscriber set under a read lock before sending, so
            // the flusher never blocks concurrent (un)register.
            let targets: Vec<(String, mpsc::Sender<NotificationEvent>)> = {
                let by_vault = self.by_vault.read().await;
                let subscribers = self.subscribers.read().await;
                by_vault
                    .get(&vault_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| subscribers.get(id).map(|s| (id.clone(), s.sender.clone())))
                    .collect()
            };
            if targets.is_empty() {
                continue;
            }

            let pending_count = match self.pending_count_fns.read().await.get(&vault_id) {
                Some(f) => f(),
                None => 0,
            };

            let event = {
                let mut vaults = self.vaults.write().await;
                let Some(state) = vaults.get_mut(&vault_id) else { continue };

                if let Some(message) = state.error.take() {
                    NotificationEvent::error(&vault_id, message, pending_count, now_unix())
                } else if state.refresh_requested {
                    state.refresh_requested = false;
                    NotificationEvent::refresh(&vault_id, pending_count, now_unix())
                } else {
                    let changes = std::mem::take(&mut state.pending);
                    if changes.is_empty() {
                        NotificationEvent::ping(&vault_id, pending_count, now_unix())
                    } else {
                        NotificationEvent::bulk_process(&vault_id, changes, pending_count, now_unix())
                    }
                }
            };

            for (client_id, sender) in targets {
                let timeout = self.config.subscriber_send_timeout();
                match tokio::time::timeout(timeout, sender.send(event.clone())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => debug!("[DEBUG] [notify_manager] client {} queue closed", client_id),
                    Err(_) => {
                        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                        warn!("[WARN] [notify_manager] client {} missed a tick (queue full)", client_id);
                    }
                }
            }
        }
    }

    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeAction;

    fn config_with_fast_tick() -> PipelineConfig {
        PipelineConfig {
            flush_tick_ms: 20,
            subscriber_queue_capacity: 1,
            subscriber_send_timeout_ms: 50,
            ..PipelineConfig::default()
        }
    }

    async fn recv_connected(rx: &mut mpsc::Receiver<NotificationEvent>) {
        let event = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, crate::models::NotificationType::Connected);
    }

    #[tokio::test]
    async fn connected_is_the_first_event_on_registration() {
        let manager = NotificationManager::new(config_with_fast_tick());
        let (client_id, mut rx) = manager.register("v1").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, crate::models::NotificationType::Connected);
        assert_eq!(event.client_id.as_deref(), Some(client_id.as_str()));
        assert_eq!(event.vault_id, "v1");
    }

    #[tokio::test]
    async fn ping_is_emitted_when_nothing_pending() {
        let manager = NotificationManager::new(config_with_fast_tick());
        let (_client, mut rx) = manager.register("v1").await;
        recv_connected(&mut rx).await;

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, crate::models::NotificationType::Ping);
    }

    #[tokio::test]
    async fn bulk_process_carries_pending_changes() {
        let manager = NotificationManager::new(config_with_fast_tick());
        let (_client, mut rx) = manager.register("v1").await;
        recv_connected(&mut rx).await;
        manager
            .enqueue(
                "v1",
                FileChange { file_id: "id-1".into(), relative_path: "a.md".into(), action: ChangeAction::Create },
            )
            .await;

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, crate::models::NotificationType::BulkProcess);
        assert_eq!(event.changes.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn error_slot_takes_priority_over_pending_changes() {
        let manager = NotificationManager::new(config_with_fast_tick());
        let (_client, mut rx) = manager.register("v1").await;
        recv_connected(&mut rx).await;
        manager
            .enqueue(
                "v1",
                FileChange { file_id: "id-1".into(), relative_path: "a.md".into(), action: ChangeAction::Create },
            )
            .await;
        manager.set_error("v1", "boom").await;

        let event = tokio::time::timeout(std::time::Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, crate::models::NotificationType::Error);
        assert_eq!(event.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unregister_closes_the_queue() {
        let manager = NotificationManager::new(config_with_fast_tick());
        let (client_id, mut rx) = manager.register("v1").await;
        recv_connected(&mut rx).await;
        manager.unregister(&client_id).await;
        assert!(rx.recv().await.is_none());
    }
}
