//! Path normalization, case-insensitive resolution, and `${VAR}` / `{{TOKEN}}`
//! substitution.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

/// Explicit environment threaded from `main` down to every spawned command.
pub type EnvMap = BTreeMap<String, String>;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Z][A-Z0-9_]*)\s*\}\}").unwrap());

/// Environment variables referenced by a template but absent from the map.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing required environment variables: {}", .0.join(", "))]
pub struct MissingEnvVars(pub Vec<String>);

/// Snapshot the process environment. Only the binary entry point calls this.
pub fn capture_process_env() -> EnvMap {
    std::env::vars().collect()
}

/// Normalize a repository-relative path to forward slashes with no leading
/// `./`, no empty segments, and no trailing slash.
pub fn normalize_rel_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    segments.join("/")
}

/// Resolve `rel` under `root`, matching each segment case-insensitively when
/// the exact spelling does not exist. Returns the on-disk relative path.
///
/// An exact match always wins over a case-folded one, so `Foo.rs` next to
/// `foo.rs` resolves to whichever the caller spelled.
pub fn resolve_case_insensitive(root: &Path, rel: &str) -> Option<String> {
    let normalized = normalize_rel_path(rel);
    if normalized.is_empty() {
        return None;
    }
    if root.join(&normalized).exists() {
        return Some(normalized);
    }

    let mut current = root.to_path_buf();
    let mut resolved: Vec<String> = Vec::new();
    for segment in normalized.split('/') {
        let exact = current.join(segment);
        if exact.exists() {
            resolved.push(segment.to_string());
            current = exact;
            continue;
        }

        let entries = std::fs::read_dir(&current).ok()?;
        let mut matched: Option<String> = None;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.eq_ignore_ascii_case(segment) {
                // read_dir order is unspecified; keep the smallest name so
                // resolution is stable across platforms.
                if matched.as_ref().is_none_or(|m| name < *m) {
                    matched = Some(name);
                }
            }
        }
        let name = matched?;
        current = current.join(&name);
        resolved.push(name);
    }

    Some(resolved.join("/"))
}

/// Expand `${VAR}` references from `env`. Every missing variable is reported,
/// sorted and deduplicated.
pub fn expand_env_vars(input: &str, env: &EnvMap) -> Result<String, MissingEnvVars> {
    let mut missing: Vec<String> = ENV_VAR_RE
        .captures_iter(input)
        .filter_map(|caps| {
            let name = &caps[1];
            (!env.contains_key(name)).then(|| name.to_string())
        })
        .collect();
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(MissingEnvVars(missing));
    }

    Ok(ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            env.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned())
}

/// Substitute `{{TOKEN}}` placeholders. Unknown tokens are left untouched.
pub fn render_template(template: &str, tokens: &BTreeMap<&str, String>) -> String {
    TOKEN_RE
        .replace_all(template, |caps: &regex::Captures| {
            match tokens.get(&caps[1]) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Quote a value for safe interpolation into a POSIX shell command.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}
