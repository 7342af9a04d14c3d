//! The shared event channel (C2): a bounded MPMC queue carrying change
//! events from the watcher (and repair re-injections) to the worker pool.
//!
//! `async_channel` is used rather than `tokio::sync::mpsc` because load
//! balancing across the N workers is plain "whoever reads first" — a true
//! multi-consumer channel, not one receiver fanned out by hand.

use crate::models::FileChangeEvent;

/// Nominal channel capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct SharedEventChannel {
    sender: async_channel::Sender<FileChangeEvent>,
    receiver: async_channel::Receiver<FileChangeEvent>,
}

impl SharedEventChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = async_channel::bounded(capacity.max(1));
        Self { sender, receiver }
    }

    /// Blocking send: the initial walk blocks producers rather than
    /// dropping events.
    pub async fn send(&self, event: FileChangeEvent) -> bool {
        self.sender.send(event).await.is_ok()
    }

    /// Non-blocking send, used for OS-driven events and DLQ re-injection:
    /// accepts or refuses based on current channel capacity.
    pub fn try_send(&self, event: FileChangeEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    pub async fn recv(&self) -> Option<FileChangeEvent> {
        self.receiver.recv().await.ok()
    }

    /// Current depth, used by the notification manager's pending-count
    /// getter.
    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }

    pub fn close(&self) {
        self.sender.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventKind;

    fn dummy_event() -> FileChangeEvent {
        FileChangeEvent {
            vault_id: "v1".into(),
            absolute_path: "/vault/a.md".into(),
            event_kind: EventKind::Created,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn try_send_refuses_when_full() {
        let channel = SharedEventChannel::new(1);
        assert!(channel.try_send(dummy_event()));
        assert!(!channel.try_send(dummy_event()));
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn recv_drains_in_fifo_order() {
        let channel = SharedEventChannel::new(4);
        channel.send(dummy_event()).await;
        channel.send(dummy_event()).await;
        assert_eq!(channel.len(), 2);
        channel.recv().await.unwrap();
        assert_eq!(channel.len(), 1);
    }

    #[tokio::test]
    async fn close_ends_stream() {
        let channel = SharedEventChannel::new(4);
        channel.close();
        assert!(channel.recv().await.is_none());
    }
}
