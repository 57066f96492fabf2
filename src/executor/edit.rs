//! Deterministic edits and before/after change detection.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::classify::{EDIT_FILE_MISSING, EDIT_NOT_FOUND};
use crate::task::FileEdit;

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("search text not found in {file}")]
    NotFound { file: String },
    #[error("edit target {file} does not exist")]
    FileMissing { file: String },
    #[error("failed to {action} {file}")]
    Io {
        file: String,
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl EditError {
    /// Stable failure reason for the run result.
    pub fn reason_code(&self) -> String {
        match self {
            Self::NotFound { file } => format!("{EDIT_NOT_FOUND}:{file}"),
            Self::FileMissing { file } => format!("{EDIT_FILE_MISSING}:{file}"),
            Self::Io { file, .. } => format!("edit_io_failed:{file}"),
        }
    }
}

/// Apply literal search/replace edits under `root`.
///
/// Each edit replaces the first occurrence of its search text. Edits to the
/// same file apply in order. Every edit is checked before any file is
/// written, so a missing search string leaves the tree untouched. Returns the
/// files whose content changed, in first-edit order.
pub fn apply_edits(root: &Path, edits: &[FileEdit]) -> Result<Vec<String>, EditError> {
    let mut originals: BTreeMap<&str, String> = BTreeMap::new();
    let mut updated: BTreeMap<&str, String> = BTreeMap::new();
    let mut order: Vec<&str> = Vec::new();

    for edit in edits {
        let file = edit.file.as_str();
        if !updated.contains_key(file) {
            let path = root.join(file);
            if !path.is_file() {
                return Err(EditError::FileMissing {
                    file: file.to_string(),
                });
            }
            let content = std::fs::read_to_string(&path).map_err(|source| EditError::Io {
                file: file.to_string(),
                action: "read",
                source,
            })?;
            originals.insert(file, content.clone());
            updated.insert(file, content);
            order.push(file);
        }

        let Some(current) = updated.get_mut(file) else {
            continue;
        };
        if !current.contains(&edit.search) {
            return Err(EditError::NotFound {
                file: file.to_string(),
            });
        }
        *current = current.replacen(&edit.search, &edit.replace, 1);
    }

    let mut modified = Vec::new();
    for file in order {
        let (Some(before), Some(after)) = (originals.get(file), updated.get(file)) else {
            continue;
        };
        if before == after {
            continue;
        }
        std::fs::write(root.join(file), after).map_err(|source| EditError::Io {
            file: file.to_string(),
            action: "write",
            source,
        })?;
        modified.push(file.to_string());
    }
    Ok(modified)
}

/// Content digests of every file under a root, keyed by relative path.
pub type TreeSnapshot = BTreeMap<String, [u8; 32]>;

/// Excludes name top-level entries only, matching the workspace copy.
fn is_excluded(rel: &Path, exclude: &[String]) -> bool {
    rel.components()
        .next()
        .is_some_and(|c| exclude.iter().any(|e| c.as_os_str() == e.as_str()))
}

/// Hash every regular file under `root`, skipping excluded top-level entries.
pub fn snapshot_tree(root: &Path, exclude: &[String]) -> Result<TreeSnapshot> {
    let mut snapshot = TreeSnapshot::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter();
    for entry in walker.filter_entry(|e| {
        e.path()
            .strip_prefix(root)
            .map(|rel| !is_excluded(rel, exclude))
            .unwrap_or(true)
    }) {
        let entry = entry.with_context(|| format!("failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("{} escaped {}", entry.path().display(), root.display()))?;
        let bytes = std::fs::read(entry.path())
            .with_context(|| format!("failed to read {}", entry.path().display()))?;
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        snapshot.insert(key, digest);
    }
    Ok(snapshot)
}

/// Files created, deleted, or changed between two snapshots, sorted.
pub fn diff_snapshots(before: &TreeSnapshot, after: &TreeSnapshot) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(path, digest)| before.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect();
    changed.extend(
        before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .cloned(),
    );
    changed.sort();
    changed
}
