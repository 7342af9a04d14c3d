//! vaultd - vault event pipeline
//!
//! Keeps a local-first markdown vault's catalog, search index and
//! directory-tree cache continuously synchronized with the filesystem, and
//! fans out coalesced change notifications to subscribed clients.
//!
//! The core is the pipeline wired up in [`pipeline::VaultPipeline`]: a
//! watcher (`watcher`) feeds a shared channel (`channel`) drained by a
//! worker pool (`worker`), which updates the catalog (`catalog`), tree
//! cache (`tree_cache`) and search index (`search_index`), and enqueues
//! notifications (`notify_manager`). Permanently-failed events land in the
//! reconciliation service's dead-letter queue (`reconcile`), which also
//! drives full-vault reindex.

pub mod catalog;
pub mod channel;
pub mod config;
pub mod error;
pub mod models;
pub mod notify_manager;
pub mod pipeline;
pub mod reconcile;
pub mod search_index;
pub mod tree_cache;
pub mod util;
pub mod watcher;
pub mod worker;

pub use config::VaultConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::VaultPipeline;

/// Initialize the crate's `tracing` subscriber: env-filter plus a fmt
/// layer, defaulting to `info` when `RUST_LOG` is unset. Intended to be
/// called once from the `vaultd` binary's `main`.
pub fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
