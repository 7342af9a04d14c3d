//! The directory-tree cache: a read-mostly hierarchical projection of the
//! catalog, served to UI clients. Builds the directories-first,
//! case-insensitive tree by recursing over catalog rows instead of a live
//! `fs::read_dir`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::catalog::Catalog;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{FileEntry, NodeMetadata, TreeNode};
use crate::util;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Read-mostly hierarchical view of the vault, invalidated by the worker
/// pool on every applied event.
pub struct DirectoryTreeCache {
    catalog: Arc<Catalog>,
    /// Lazy map from relative path -> materialized subtree root.
    subtrees: RwLock<HashMap<String, TreeNode>>,
    /// Explicit full-tree materialization, kept separately since it spans
    /// the whole vault rather than one path.
    full_tree: RwLock<Option<TreeNode>>,
}

impl DirectoryTreeCache {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            subtrees: RwLock::new(HashMap::new()),
            full_tree: RwLock::new(None),
        }
    }

    fn project(&self, entry: &FileEntry) -> PipelineResult<NodeMetadata> {
        let file_type = self.catalog.file_type_name(entry.file_type_id)?;
        Ok(NodeMetadata {
            id: entry.id.clone(),
            name: entry.name.clone(),
            is_directory: entry.is_directory,
            is_markdown: util::is_markdown(&entry.relative_path),
            file_type,
            cached_at: now_unix(),
        })
    }

    /// Recursively build a [`TreeNode`] rooted at `entry`, from the catalog.
    fn build_node(&self, entry: &FileEntry) -> PipelineResult<TreeNode> {
        let metadata = self.project(entry)?;
        let mut children = Vec::new();
        if entry.is_directory {
            for child in self.catalog.children_of(Some(&entry.id))? {
                children.push(self.build_node(&child)?);
            }
        }
        Ok(TreeNode { metadata, children })
    }

    /// Materialize the subtree rooted at `path` if absent from the lazy map.
    pub async fn get_tree(&self, path: &str) -> PipelineResult<TreeNode> {
        let normalized = util::normalize_relative(path)?;

        if let Some(node) = self.subtrees.read().await.get(&normalized) {
            return Ok(node.clone());
        }

        let entry = self
            .catalog
            .get_by_path(&normalized, false)?
            .ok_or_else(|| PipelineError::NotFound(normalized.clone()))?;
        let node = self.build_node(&entry)?;

        self.subtrees.write().await.insert(normalized, node.clone());
        Ok(node)
    }

    /// The entire tree rooted at the vault root, ACTIVE entries only,
    /// directories-first then name-ascending.
    pub async fn get_full_tree(&self) -> PipelineResult<TreeNode> {
        if let Some(node) = self.full_tree.read().await.as_ref() {
            return Ok(node.clone());
        }

        let mut root_children = Vec::new();
        for entry in self.catalog.children_of(None)? {
            root_children.push(self.build_node(&entry)?);
        }
        let root = TreeNode {
            metadata: NodeMetadata {
                id: String::new(),
                name: String::new(),
                is_directory: true,
                is_markdown: false,
                file_type: "directory".to_string(),
                cached_at: now_unix(),
            },
            children: root_children,
        };

        *self.full_tree.write().await = Some(root.clone());
        Ok(root)
    }

    /// Direct children only, without materializing (or caching) the whole
    /// subtree.
    pub async fn get_children(&self, path: &str) -> PipelineResult<Vec<NodeMetadata>> {
        let normalized = util::normalize_relative(path)?;
        let parent_id = if normalized.is_empty() {
            None
        } else {
            Some(
                self.catalog
                    .get_by_path(&normalized, false)?
                    .ok_or_else(|| PipelineError::NotFound(normalized.clone()))?
                    .id,
            )
        };

        self.catalog
            .children_of(parent_id.as_deref())?
            .iter()
            .map(|entry| self.project(entry))
            .collect()
    }

    /// Metadata of a single ACTIVE node.
    pub async fn get_metadata(&self, path: &str) -> PipelineResult<NodeMetadata> {
        let normalized = util::normalize_relative(path)?;
        let entry = self
            .catalog
            .get_by_path(&normalized, false)?
            .ok_or_else(|| PipelineError::NotFound(normalized.clone()))?;
        self.project(&entry)
    }

    /// Remove the cache entries for the given path and every ancestor.
    /// Missing entries are a no-op.
    pub async fn invalidate_for(&self, relative_path: &str) {
        let mut subtrees = self.subtrees.write().await;
        subtrees.remove(relative_path);

        let mut built = relative_path;
        while let Some((parent, _)) = built.rsplit_once('/') {
            subtrees.remove(parent);
            built = parent;
        }
        drop(subtrees);

        *self.full_tree.write().await = None;
    }

    /// Drop everything, used by reindex.
    pub async fn clear(&self) {
        self.subtrees.write().await.clear();
        *self.full_tree.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_catalog_with(entries: &[(&str, bool)]) -> Arc<Catalog> {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        for (path, is_dir) in entries {
            let type_id = catalog
                .get_or_create_file_type(if *is_dir { "directory" } else { "markdown" })
                .unwrap();
            let name = path.rsplit('/').next().unwrap();
            let parent = path.rsplit_once('/').map(|(p, _)| p.to_string());
            let parent_id = parent.and_then(|p| catalog.get_by_path(&p, false).unwrap().map(|e| e.id));
            catalog
                .upsert_by_path(path, name, parent_id.as_deref(), *is_dir, type_id, 0, 1)
                .unwrap();
        }
        catalog
    }

    #[tokio::test]
    async fn full_tree_orders_directories_before_files() {
        let catalog = new_catalog_with(&[("README.md", false), ("notes", true)]);
        let cache = DirectoryTreeCache::new(catalog);

        let tree = cache.get_full_tree().await.unwrap();
        assert_eq!(tree.children.len(), 2);
        assert!(tree.children[0].metadata.is_directory);
        assert_eq!(tree.children[0].metadata.name, "notes");
        assert_eq!(tree.children[1].metadata.name, "README.md");
    }

    #[tokio::test]
    async fn get_tree_rejects_path_traversal() {
        let catalog = new_catalog_with(&[]);
        let cache = DirectoryTreeCache::new(catalog);

        assert!(cache.get_tree("../etc").await.is_err());
        assert!(cache.get_tree("folder/../..").await.is_err());
    }

    #[tokio::test]
    async fn invalidate_for_clears_path_and_ancestors() {
        let catalog = new_catalog_with(&[("notes", true), ("notes/a.md", false)]);
        let cache = DirectoryTreeCache::new(catalog);

        // materialize both
        cache.get_tree("notes").await.unwrap();
        cache.get_full_tree().await.unwrap();
        assert!(cache.subtrees.read().await.contains_key("notes"));
        assert!(cache.full_tree.read().await.is_some());

        cache.invalidate_for("notes/a.md").await;
        assert!(!cache.subtrees.read().await.contains_key("notes"));
        assert!(cache.full_tree.read().await.is_none());
    }
}
