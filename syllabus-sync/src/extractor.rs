//! Content Extractor: walks the content tree into a canonical snapshot.
//!
//! An item is a regular file with an accepted extension. Hidden entries and
//! staged writes are skipped. Any malformed item aborts the whole snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use syllabus_core::config::SyncConfig;
use syllabus_core::error::ContentError;
use syllabus_core::paths::STAGING_SUFFIX;
use syllabus_core::types::{ContentId, ContentRecord};
use syllabus_core::{canonical, ConfigError};

use crate::error::SyncError;

/// Local content keyed by id.
pub type Snapshot = BTreeMap<ContentId, ContentRecord>;

/// Produce the snapshot for `content_root`.
///
/// A missing content root is a configuration error rather than an empty
/// tree, so a mistyped path never reads as "everything was deleted".
pub fn extract(content_root: &Path, config: &SyncConfig) -> Result<Snapshot, SyncError> {
    if !content_root.is_dir() {
        return Err(SyncError::Config(ConfigError::Invalid(format!(
            "content root {} does not exist",
            content_root.display()
        ))));
    }

    let mut files = Vec::new();
    collect_files(content_root, content_root, config, &mut files)?;

    let mut snapshot = Snapshot::new();
    for (rel, abs) in files {
        let record = read_record(&rel, &abs)?;
        if let Some(existing) = snapshot.get(&record.id) {
            return Err(ContentError::DuplicateId {
                id: record.id.0.clone(),
                first: existing.path.clone(),
                second: record.path,
            }
            .into());
        }
        snapshot.insert(record.id.clone(), record);
    }
    tracing::debug!(items = snapshot.len(), root = %content_root.display(), "extracted snapshot");
    Ok(snapshot)
}

/// Read and hash a single item.
pub fn read_record(rel: &str, abs: &Path) -> Result<ContentRecord, SyncError> {
    canonical::validate_path(rel)?;
    let bytes = fs::read(abs).map_err(|e| content_io(abs, e))?;
    let text = String::from_utf8(bytes).map_err(|_| ContentError::NotUtf8 {
        path: rel.to_string(),
    })?;
    let payload = canonical::normalize_body(&text);
    let id = canonical::derive_id(rel, &payload)?;
    let content_hash = canonical::content_hash(rel, &payload)?;
    let modified = fs::metadata(abs)
        .and_then(|m| m.modified())
        .map_err(|e| content_io(abs, e))?;
    Ok(ContentRecord {
        id,
        path: rel.to_string(),
        payload,
        content_hash,
        local_modified_at: DateTime::<Utc>::from(modified),
    })
}

/// Depth-first walk in name order, yielding `(relative, absolute)` paths.
fn collect_files(
    root: &Path,
    dir: &Path,
    config: &SyncConfig,
    out: &mut Vec<(String, PathBuf)>,
) -> Result<(), SyncError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| content_io(dir, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| content_io(dir, e))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            return Err(ContentError::Malformed {
                path: entry.path().display().to_string(),
                reason: "file name is not valid UTF-8".to_string(),
            }
            .into());
        };
        if name.starts_with('.') || name.ends_with(STAGING_SUFFIX) {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type().map_err(|e| content_io(&path, e))?;
        if file_type.is_dir() {
            collect_files(root, &path, config, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let accepted = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| config.accepts_extension(e));
        if !accepted {
            continue;
        }
        out.push((relative_path(root, &path), path));
    }
    Ok(())
}

/// `/`-separated path of `path` relative to `root`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Absolute location of a `/`-separated content path.
pub fn absolute_path(root: &Path, rel: &str) -> PathBuf {
    rel.split('/').fold(root.to_path_buf(), |acc, seg| acc.join(seg))
}

fn content_io(path: &Path, source: std::io::Error) -> SyncError {
    SyncError::Validation(ContentError::Io {
        path: path.to_path_buf(),
        source,
    })
}
