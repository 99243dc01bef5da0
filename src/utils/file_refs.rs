use crate::constants::limits::{MAX_UPLOAD_BYTES, MAX_UPLOAD_FILES};
use crate::errors::ExecError;
use crate::utils::user_paths::expand_home_path;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Component, Path, PathBuf};

static FILE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:~/|\./|/)?(?:[\w.-]+/)*[\w-][\w.-]*\.[A-Za-z][A-Za-z0-9]{0,7}$")
        .expect("file token regex")
});

const TOKEN_TRIM: &[char] = &['"', '\'', '`', '(', ')', '[', ']', ',', ';', ':', '!', '?'];

fn has_parent_component(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Source-side check shared by every transfer route: no `..` components and
/// the path must name an existing regular file.
pub fn validate_source_path(raw: impl AsRef<Path>) -> Result<PathBuf, ExecError> {
    let raw = raw.as_ref();
    if has_parent_component(raw) {
        return Err(ExecError::invalid_params(format!(
            "Refusing path with '..' component: {}",
            raw.display()
        )));
    }
    let path = expand_home_path(raw);
    let metadata = std::fs::metadata(&path).map_err(|err| {
        ExecError::invalid_params(format!("Source path is not readable: {} ({})", path.display(), err))
    })?;
    if !metadata.is_file() {
        return Err(ExecError::invalid_params(format!(
            "Source path is not a regular file: {}",
            path.display()
        )));
    }
    Ok(path)
}

fn candidate_tokens(text: &str) -> impl Iterator<Item = &str> {
    text.split_whitespace()
        .map(|token| token.trim_matches(TOKEN_TRIM).trim_end_matches('.'))
        .filter(|token| !token.is_empty() && FILE_TOKEN.is_match(token))
}

/// Finds prompt tokens that look like file names and resolve to regular files
/// inside `base_dir`. Anything escaping `base_dir` is dropped.
pub fn detect_referenced_files(text: &str, base_dir: &Path) -> Vec<PathBuf> {
    let Ok(base) = base_dir.canonicalize() else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = Vec::new();
    for token in candidate_tokens(text) {
        let raw = Path::new(token);
        if has_parent_component(raw) {
            continue;
        }
        let joined = if token.starts_with("~/") {
            expand_home_path(token)
        } else if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            base.join(raw)
        };
        let Ok(resolved) = joined.canonicalize() else {
            continue;
        };
        if !resolved.starts_with(&base) {
            continue;
        }
        let Ok(metadata) = std::fs::metadata(&resolved) else {
            continue;
        };
        if !metadata.is_file() || metadata.len() > MAX_UPLOAD_BYTES {
            continue;
        }
        if !found.contains(&resolved) {
            found.push(resolved);
        }
        if found.len() >= MAX_UPLOAD_FILES {
            break;
        }
    }
    found
}
