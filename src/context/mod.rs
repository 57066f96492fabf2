//! Context assembly: which files an agent is pointed at.
//!
//! The base set depends only on the task's context level. Treatment runs add
//! an "extra" set from the context resolver, re-ranked and truncated here so
//! resolver quirks cannot flood the agent with irrelevant files.

pub mod resolver;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};

use crate::paths::normalize_rel_path;

pub use resolver::{
    CommandResolverFactory, ContextRequest, ContextResolver, FailedSession, ResolverFactory,
};

/// Base context for a context level.
///
/// Level 0 exposes nothing; levels 1–4 list the top-level repository files;
/// level 5 adds the target files. A configured override for the level
/// replaces the computed list entirely.
pub fn build_base_context(
    workspace: &Path,
    level: u8,
    targets: &[String],
    overrides: &BTreeMap<u8, Vec<String>>,
) -> Result<Vec<String>> {
    if let Some(files) = overrides.get(&level) {
        return Ok(dedup_preserving_order(
            files.iter().map(|f| normalize_rel_path(f)),
        ));
    }
    if level == 0 {
        return Ok(Vec::new());
    }

    let mut files = top_level_files(workspace)?;
    if level >= 5 {
        files.extend(targets.iter().cloned());
    }
    Ok(dedup_preserving_order(files))
}

/// Regular files directly under `root`, sorted by name.
pub fn top_level_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to list workspace root {}", root.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    files.sort();
    Ok(files)
}

/// Concatenate base and extra, dropping duplicates and empty entries.
pub fn merge_context(base: &[String], extra: &[String]) -> Vec<String> {
    dedup_preserving_order(base.iter().chain(extra.iter()).cloned())
}

/// Targets absent from `context`.
pub fn missing_targets(context: &[String], targets: &[String]) -> Vec<String> {
    let present: HashSet<&str> = context.iter().map(String::as_str).collect();
    targets
        .iter()
        .filter(|t| !present.contains(t.as_str()))
        .cloned()
        .collect()
}

fn dedup_preserving_order(files: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    files
        .into_iter()
        .filter(|f| !f.is_empty() && seen.insert(f.clone()))
        .collect()
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

fn stem(path: &str) -> &str {
    let name = file_name(path);
    // "foo.test.ts" and "foo.ts" share the stem "foo".
    name.split('.').next().unwrap_or(name)
}

fn extension(path: &str) -> Option<&str> {
    file_name(path).rsplit_once('.').map(|(_, ext)| ext)
}

/// Test-like paths: `tests/`, `__tests__/`, `*.test.*`, `*.spec.*`, `*_test.*`.
pub fn is_test_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    let name = file_name(&lower);
    lower.split('/').any(|seg| {
        matches!(seg, "test" | "tests" | "__tests__" | "spec" | "specs" | "__mocks__")
    }) || name.contains(".test.")
        || name.contains(".spec.")
        || name.contains("_test.")
        || name.starts_with("test_")
}

fn relevance(candidate: &str, targets: &[String], target_dirs: &BTreeSet<&str>, targets_test_like: bool) -> i32 {
    if targets.iter().any(|t| t == candidate) {
        return 100;
    }
    let mut score = 0;
    if target_dirs.contains(parent_dir(candidate)) {
        score += 10;
    }
    if targets.iter().any(|t| stem(t) == stem(candidate)) {
        score += 6;
    }
    let ext = extension(candidate);
    if ext.is_some() && targets.iter().any(|t| extension(t) == ext) {
        score += 2;
    }
    if !targets_test_like && is_test_path(candidate) {
        score -= 5;
    }
    score
}

/// Re-rank resolver candidates against the targets and keep the best `limit`.
///
/// Candidates score for being a target, living in a target's directory,
/// sharing a target's stem, and sharing a target's extension; test paths are
/// penalized unless the targets themselves are tests. A `.js` file is dropped
/// when its `.ts` twin is also a candidate, unless the `.js` file is a target.
/// Ties keep resolver order.
pub fn rank_extra_candidates(candidates: &[String], targets: &[String], limit: usize) -> Vec<String> {
    let candidates = dedup_preserving_order(candidates.iter().map(|c| normalize_rel_path(c)));
    let candidate_set: HashSet<&str> = candidates.iter().map(String::as_str).collect();
    let target_dirs: BTreeSet<&str> = targets.iter().map(|t| parent_dir(t)).collect();
    let targets_test_like = !targets.is_empty() && targets.iter().all(|t| is_test_path(t));

    let mut scored: Vec<(i32, usize, &String)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            let Some(base) = c.strip_suffix(".js") else {
                return true;
            };
            let ts_twin = format!("{base}.ts");
            !candidate_set.contains(ts_twin.as_str()) || targets.iter().any(|t| t == *c)
        })
        .map(|(i, c)| (relevance(c, targets, &target_dirs, targets_test_like), i, c))
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    scored.into_iter().take(limit).map(|(_, _, c)| c.clone()).collect()
}
