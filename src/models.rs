//! Data model shared across the pipeline and the client-facing notification
//! wire shape.

use serde::{Deserialize, Serialize};

/// Kind of filesystem change that produced a [`FileChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Modified,
    Deleted,
}

/// The unit of work flowing from the watcher through the shared channel to
/// the worker pool. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    pub vault_id: String,
    pub absolute_path: std::path::PathBuf,
    pub event_kind: EventKind,
    pub timestamp: u64,
}

/// ACTIVE/DELETED lifecycle of a catalog row. Deletion is soft: the id
/// persists so dangling references resolve deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Active,
    Deleted,
}

/// A catalog row. `id` is a stable opaque string assigned once at first
/// sight and never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub relative_path: String,
    pub parent_id: Option<String>,
    pub is_directory: bool,
    pub file_type_id: i64,
    pub size: u64,
    pub created_at: u64,
    pub modified_at: u64,
    pub status: FileStatus,
}

/// A row of the `file_types` side table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileType {
    pub id: i64,
    pub name: String,
}

/// Projection of [`FileEntry`] stored in the tree cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeMetadata {
    pub id: String,
    pub name: String,
    pub is_directory: bool,
    pub is_markdown: bool,
    #[serde(rename = "type")]
    pub file_type: String,
    pub cached_at: u64,
}

/// A node in the cached directory tree. Only ACTIVE entries ever appear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub metadata: NodeMetadata,
    /// Ordered directories-first, then name-ascending (case-insensitive).
    pub children: Vec<TreeNode>,
}

/// What a client-visible [`FileChange`] represents. `Modified` collapses
/// into `Create` before it reaches a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    Create,
    Delete,
    Move,
}

impl From<EventKind> for ChangeAction {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Created | EventKind::Modified => ChangeAction::Create,
            EventKind::Deleted => ChangeAction::Delete,
        }
    }
}

/// A single client-visible change, enqueued into the per-vault pending
/// buffer. Only ever carries a vault-relative path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    #[serde(rename = "id")]
    pub file_id: String,
    pub relative_path: String,
    pub action: ChangeAction,
}

/// Tag discriminating a [`NotificationEvent`] — matches the wire contract's
/// `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationType {
    BulkProcess,
    Ping,
    Error,
    Refresh,
    Connected,
}

/// A record emitted to a subscribed client. Serialized as-is by whatever
/// transport frames it (HTTP/WebSocket/gRPC) — framing is outside the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    #[serde(rename = "type")]
    pub event_type: NotificationType,
    pub vault_id: String,
    pub pending_count: u64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<FileChange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl NotificationEvent {
    pub fn connected(vault_id: impl Into<String>, client_id: impl Into<String>, now: u64) -> Self {
        Self {
            event_type: NotificationType::Connected,
            vault_id: vault_id.into(),
            pending_count: 0,
            timestamp: now,
            changes: None,
            error_message: None,
            client_id: Some(client_id.into()),
        }
    }

    pub fn bulk_process(vault_id: impl Into<String>, changes: Vec<FileChange>, pending_count: u64, now: u64) -> Self {
        Self {
            event_type: NotificationType::BulkProcess,
            vault_id: vault_id.into(),
            pending_count,
            timestamp: now,
            changes: Some(changes),
            error_message: None,
            client_id: None,
        }
    }

    pub fn ping(vault_id: impl Into<String>, pending_count: u64, now: u64) -> Self {
        Self {
            event_type: NotificationType::Ping,
            vault_id: vault_id.into(),
            pending_count,
            timestamp: now,
            changes: None,
            error_message: None,
            client_id: None,
        }
    }

    pub fn error(vault_id: impl Into<String>, message: impl Into<String>, pending_count: u64, now: u64) -> Self {
        Self {
            event_type: NotificationType::Error,
            vault_id: vault_id.into(),
            pending_count,
            timestamp: now,
            changes: None,
            error_message: Some(message.into()),
            client_id: None,
        }
    }

    pub fn refresh(vault_id: impl Into<String>, pending_count: u64, now: u64) -> Self {
        Self {
            event_type: NotificationType::Refresh,
            vault_id: vault_id.into(),
            pending_count,
            timestamp: now,
            changes: None,
            error_message: None,
            client_id: None,
        }
    }
}

/// The [`FileChangeEvent`] plus an attempt counter, held in the DLQ.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub event: FileChangeEvent,
    pub attempts: u32,
}

/// Vault lifecycle status, flipped by [`crate::reconcile::ReconciliationService`]
/// around a full reindex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VaultStatus {
    Active,
    Reindexing,
}
