//! The watcher / sync source: an initial recursive walk plus an OS
//! change-notification subscription, merged into one output sequence fed
//! into the shared event channel.
//!
//! This performs **no debouncing and no batching** at the source —
//! coalescing is the worker's job, not the source's, so every
//! `notify::Event` is translated 1:1 into one or more [`FileChangeEvent`]s
//! and sent immediately.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use notify::{Config, Event, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::SharedEventChannel;
use crate::models::{EventKind, FileChangeEvent};
use crate::util;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Produces the lazy, unbounded sequence of [`FileChangeEvent`]s for a vault.
pub struct SyncSource {
    vault_id: String,
    vault_root: PathBuf,
    channel: SharedEventChannel,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl SyncSource {
    pub fn new(vault_id: impl Into<String>, vault_root: impl Into<PathBuf>, channel: SharedEventChannel) -> Arc<Self> {
        Arc::new(Self {
            vault_id: vault_id.into(),
            vault_root: vault_root.into(),
            channel,
            watcher: Mutex::new(None),
        })
    }

    /// Push a synthetic event onto the shared channel (used for DLQ
    /// retries); accepts or refuses based on channel capacity.
    pub fn inject(&self, event: FileChangeEvent) -> bool {
        self.channel.try_send(event)
    }

    fn make_event(&self, absolute_path: PathBuf, event_kind: EventKind) -> FileChangeEvent {
        FileChangeEvent {
            vault_id: self.vault_id.clone(),
            absolute_path,
            event_kind,
            timestamp: now_unix(),
        }
    }

    /// Initial recursive walk, then attach the OS notification facility.
    /// Both streams merge into the shared channel.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> std::io::Result<()> {
        self.walk_once().await?;
        self.spawn_watch(cancel);
        Ok(())
    }

    /// Emit a `Created` event per regular file and per directory under the
    /// vault root, skipping hidden (dot-prefixed) entries. This blocks on
    /// channel send rather than dropping. Also invoked directly by the
    /// reconciliation service to re-walk the vault on reindex.
    pub(crate) async fn walk_once(&self) -> std::io::Result<()> {
        info!("[INFO] [watcher] starting initial walk of {:?}", self.vault_root);
        let mut stack = vec![self.vault_root.clone()];

        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("[WARN] [watcher] failed to read {:?}: {}", dir, e);
                    continue;
                }
            };

            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if util::is_hidden_name(&name) {
                    continue;
                }

                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                let event = self.make_event(path.clone(), EventKind::Created);
                self.channel.send(event).await;

                if is_dir {
                    stack.push(path);
                }
            }
        }

        info!("[INFO] [watcher] initial walk complete");
        Ok(())
    }

    fn spawn_watch(self: &Arc<Self>, cancel: CancellationToken) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

            let watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = tx.send(res);
                },
                Config::default(),
            );

            let mut watcher = match watcher {
                Ok(watcher) => watcher,
                Err(e) => {
                    warn!("[WARN] [watcher] failed to create watcher: {}", e);
                    return;
                }
            };

            if let Err(e) = watcher.watch(Path::new(&this.vault_root), RecursiveMode::Recursive) {
                warn!("[WARN] [watcher] failed to watch {:?}: {}", this.vault_root, e);
                return;
            }
            *this.watcher.lock().await = Some(watcher);

            info!("[INFO] [watcher] subscribed to OS notifications for {:?}", this.vault_root);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[INFO] [watcher] cancelled, stopping");
                        break;
                    }
                    maybe = rx.recv() => {
                        match maybe {
                            Some(Ok(event)) => this.handle_notify_event(event).await,
                            Some(Err(e)) => {
                                if !is_transient_error(&e) {
                                    warn!("[WARN] [watcher] error: {}", e);
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_notify_event(&self, event: Event) {
        for path in &event.paths {
            let Some(relative) = util::relativize(&self.vault_root, path) else {
                continue;
            };
            if util::has_hidden_component(&relative) {
                continue;
            }

            let kind = match &event.kind {
                NotifyEventKind::Create(_) => EventKind::Created,
                NotifyEventKind::Remove(_) => EventKind::Deleted,
                NotifyEventKind::Modify(_) => EventKind::Modified,
                _ => continue,
            };

            let change = self.make_event(path.clone(), kind);
            // OS-driven events that cannot enqueue are logged and dropped;
            // the reindex path is the recovery mechanism.
            if !self.channel.try_send(change) {
                warn!("[WARN] [watcher] dropped event for {:?}: channel full", path);
            }
        }
    }
}

fn is_transient_error(e: &notify::Error) -> bool {
    if let notify::ErrorKind::Io(ref io_err) = e.kind {
        matches!(io_err.raw_os_error(), Some(2) | Some(3))
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_walk_emits_created_for_every_non_hidden_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("README.md"), "hi").unwrap();
        std::fs::create_dir(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/a.md"), "hi").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "hi").unwrap();

        let channel = SharedEventChannel::new(64);
        let source = SyncSource::new("v1", dir.path().to_path_buf(), channel.clone());
        source.walk_once().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(std::time::Duration::from_millis(50), channel.recv()).await {
            seen.push(event);
        }

        // README.md, notes/ dir, notes/a.md — dotfiles skipped
        assert_eq!(seen.len(), 3);
        assert!(seen.iter().all(|e| e.event_kind == EventKind::Created));
    }

    #[tokio::test]
    async fn inject_refuses_when_channel_full() {
        let channel = SharedEventChannel::new(1);
        let source = SyncSource::new("v1", "/vault", channel);
        let event = FileChangeEvent {
            vault_id: "v1".into(),
            absolute_path: "/vault/a.md".into(),
            event_kind: EventKind::Modified,
            timestamp: 0,
        };
        assert!(source.inject(event.clone()));
        assert!(!source.inject(event));
    }
}
