//! Path normalization and file-type classification shared by the catalog,
//! tree cache and worker pool.

use std::path::{Component, Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// Normalize path separators to forward slashes.
pub fn normalize_slashes(path: &str) -> String {
    path.replace('\\', "/")
}

/// Relativize an absolute path against the vault root. Returns `None` if
/// the path is not under the root.
pub fn relativize<'a>(root: &Path, absolute_path: &'a Path) -> Option<String> {
    let relative = absolute_path.strip_prefix(root).ok()?;
    Some(normalize_slashes(&relative.to_string_lossy()))
}

/// Normalize a caller-supplied relative path and reject any attempt to
/// escape the vault root. A rejected path fails with a validation error —
/// it is never silently clamped.
pub fn normalize_relative(path: &str) -> PipelineResult<String> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return Err(PipelineError::PathValidation(format!(
            "absolute path not allowed: {path}"
        )));
    }

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(PipelineError::PathValidation(format!(
                        "path escapes vault root: {path}"
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PipelineError::PathValidation(format!(
                    "absolute path not allowed: {path}"
                )));
            }
        }
    }

    Ok(normalize_slashes(&normalized.to_string_lossy()))
}

/// Whether a path segment (file or directory name) should be hidden from
/// the initial walk and the watcher (dot-prefixed names).
pub fn is_hidden_name(name: &str) -> bool {
    name.starts_with('.')
}

/// Whether any component of a relative path is hidden.
pub fn has_hidden_component(relative_path: &str) -> bool {
    relative_path.split('/').any(is_hidden_name)
}

/// Classify a file by extension into a file-type tag, fed to
/// `Catalog::get_or_create_file_type`. Directories are tagged `"directory"`
/// by the caller, not by this function.
pub fn classify_extension(path: &str) -> &'static str {
    match Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("md") | Some("markdown") => "markdown",
        Some("txt") => "text",
        Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("webp") | Some("svg") => "image",
        Some("pdf") => "pdf",
        Some("canvas") => "canvas",
        _ => "unknown",
    }
}

pub fn is_markdown(path: &str) -> bool {
    classify_extension(path) == "markdown"
}

/// File name with extension stripped, used as a display title fallback.
pub fn path_to_title(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Untitled")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_relative_accepts_plain_paths() {
        assert_eq!(normalize_relative("notes/a.md").unwrap(), "notes/a.md");
        assert_eq!(normalize_relative("a.md").unwrap(), "a.md");
    }

    #[test]
    fn normalize_relative_rejects_absolute_paths() {
        assert!(normalize_relative("/etc/passwd").is_err());
    }

    #[test]
    fn normalize_relative_rejects_traversal_above_root() {
        assert!(normalize_relative("../etc").is_err());
        assert!(normalize_relative("folder/../..").is_err());
    }

    #[test]
    fn normalize_relative_collapses_internal_dotdot_within_root() {
        assert_eq!(normalize_relative("notes/sub/../a.md").unwrap(), "notes/a.md");
    }

    #[test]
    fn classify_extension_recognizes_markdown() {
        assert_eq!(classify_extension("notes/a.md"), "markdown");
        assert!(is_markdown("notes/a.md"));
        assert!(!is_markdown("notes/a.png"));
    }

    #[test]
    fn relativize_strips_vault_root() {
        let root = Path::new("/vault");
        let abs = Path::new("/vault/notes/a.md");
        assert_eq!(relativize(root, abs).unwrap(), "notes/a.md");
    }

    #[test]
    fn relativize_rejects_paths_outside_root() {
        let root = Path::new("/vault");
        let abs = Path::new("/other/a.md");
        assert!(relativize(root, abs).is_none());
    }
}
