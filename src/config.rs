//! Vault and pipeline configuration, loaded from YAML.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineResult;

fn default_true() -> bool {
    true
}

fn default_worker_count() -> usize {
    2
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_dlq_capacity() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_dlq_tick_ms() -> u64 {
    5000
}

fn default_flush_tick_ms() -> u64 {
    2000
}

fn default_subscriber_queue_capacity() -> usize {
    10
}

fn default_subscriber_send_timeout_ms() -> u64 {
    100
}

/// `storage.type` — only `local` is implemented by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// Absolute vault root.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    pub local: LocalStorageConfig,
}

/// Pipeline tunables. Every field has a nominal default so a
/// vault can be declared with just an id, a name and a storage path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub worker_count: usize,
    pub channel_capacity: usize,
    pub dlq_capacity: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub dlq_tick_ms: u64,
    pub flush_tick_ms: u64,
    pub subscriber_queue_capacity: usize,
    pub subscriber_send_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            channel_capacity: default_channel_capacity(),
            dlq_capacity: default_dlq_capacity(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            dlq_tick_ms: default_dlq_tick_ms(),
            flush_tick_ms: default_flush_tick_ms(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            subscriber_send_timeout_ms: default_subscriber_send_timeout_ms(),
        }
    }
}

impl PipelineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dlq_tick(&self) -> Duration {
        Duration::from_millis(self.dlq_tick_ms)
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms)
    }

    pub fn subscriber_send_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_send_timeout_ms)
    }
}

/// A single configured vault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub vault_id: String,
    pub vault_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub default: bool,
    pub storage: StorageConfig,
    pub index_path: PathBuf,
    pub db_path: PathBuf,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

impl VaultConfig {
    /// The vault root directory (only `storage.type = local` is supported).
    pub fn vault_root(&self) -> &std::path::Path {
        &self.storage.local.path
    }

    /// Parse a vault configuration from a YAML document.
    pub fn from_yaml(input: &str) -> PipelineResult<Self> {
        Ok(serde_yaml::from_str(input)?)
    }

    /// Load a vault configuration from a YAML file on disk.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> PipelineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_vault_declaration_uses_nominal_defaults() {
        let yaml = r#"
vault_id: v1
vault_name: My Vault
storage:
  type: local
  local:
    path: /tmp/vault
index_path: /tmp/vault-index
db_path: /tmp/vault-db
"#;
        let config = VaultConfig::from_yaml(yaml).unwrap();
        assert!(config.enabled);
        assert!(!config.default);
        assert_eq!(config.pipeline.worker_count, 2);
        assert_eq!(config.pipeline.channel_capacity, 1024);
        assert_eq!(config.pipeline.dlq_capacity, 1000);
        assert_eq!(config.pipeline.max_retries, 2);
        assert_eq!(config.pipeline.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.pipeline.dlq_tick(), Duration::from_secs(5));
        assert_eq!(config.pipeline.flush_tick(), Duration::from_secs(2));
    }

    #[test]
    fn pipeline_tunables_can_be_overridden() {
        let yaml = r#"
vault_id: v1
vault_name: My Vault
storage:
  type: local
  local:
    path: /tmp/vault
index_path: /tmp/vault-index
db_path: /tmp/vault-db
pipeline:
  worker_count: 8
  channel_capacity: 64
"#;
        let config = VaultConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.pipeline.worker_count, 8);
        assert_eq!(config.pipeline.channel_capacity, 64);
        // untouched fields keep their nominal defaults
        assert_eq!(config.pipeline.max_retries, 2);
    }
}
