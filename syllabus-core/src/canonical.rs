//! Payload normalization, content hashing, and id derivation.
//!
//! Hash input is `path + "\0" + canonical body`. The canonical body is the
//! normalized text with structured parts (front matter, whole JSON/YAML
//! documents) re-serialized with sorted keys, so semantically identical
//! content hashes identically across runs and platforms.

use serde_yaml::{Mapping, Value as YamlValue};
use sha2::{Digest, Sha256};

use crate::error::ContentError;
use crate::types::{ContentHash, ContentId};

const FRONT_MATTER_FENCE: &str = "---";

/// Normalize line endings and whitespace.
///
/// CRLF becomes LF, trailing whitespace is stripped from every line, and the
/// text ends with exactly one newline (empty input stays empty). Idempotent.
pub fn normalize_body(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    while out.ends_with("\n\n") {
        out.pop();
    }
    if out == "\n" {
        out.clear();
    }
    out
}

/// Split a leading YAML front-matter block off `body`.
///
/// Returns `(front_matter, rest)` when `body` starts with a `---` fence that
/// is closed by another `---` line.
pub fn split_front_matter(body: &str) -> Option<(&str, &str)> {
    let after_open = body.strip_prefix("---\n")?;
    if let Some(rest) = after_open.strip_prefix("---\n") {
        return Some(("", rest));
    }
    let mut offset = 0;
    for line in after_open.split_inclusive('\n') {
        if line.trim_end_matches('\n') == FRONT_MATTER_FENCE {
            let front = &after_open[..offset];
            let rest = &after_open[offset + line.len()..];
            return Some((front, rest));
        }
        offset += line.len();
    }
    None
}

/// Canonical form of an item's body, used as hash input.
pub fn canonical_body(path: &str, body: &str) -> Result<String, ContentError> {
    let normalized = normalize_body(body);
    match extension(path).as_deref() {
        Some("json") => canonical_json(path, &normalized),
        Some("yaml") | Some("yml") => canonical_yaml_document(path, &normalized),
        _ => canonical_text(path, &normalized),
    }
}

/// SHA-256 hex digest over `path` and the canonical body.
pub fn content_hash(path: &str, body: &str) -> Result<ContentHash, ContentError> {
    let canonical = canonical_body(path, body)?;
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Stable id for an item: front-matter `id` when present, otherwise the
/// path with its extension stripped.
pub fn derive_id(path: &str, body: &str) -> Result<ContentId, ContentError> {
    let normalized = normalize_body(body);
    if let Some((front, _)) = split_front_matter(&normalized) {
        if let Some(id) = front_matter_id(path, front)? {
            return validate_id(path, id);
        }
    }
    validate_id(path, strip_extension(path).to_string())
}

/// Validate a relative, `/`-separated content path.
pub fn validate_path(path: &str) -> Result<(), ContentError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(ContentError::Malformed {
            path: path.to_string(),
            reason: "path must be relative, '/'-separated, without '.' or '..' segments"
                .to_string(),
        });
    }
    Ok(())
}

fn validate_id(path: &str, id: String) -> Result<ContentId, ContentError> {
    let trimmed = id.trim();
    if trimmed.is_empty() || trimmed.contains("..") || trimmed.starts_with('/') {
        return Err(ContentError::InvalidId {
            path: path.to_string(),
            id,
        });
    }
    Ok(ContentId(trimmed.to_string()))
}

fn front_matter_id(path: &str, front: &str) -> Result<Option<String>, ContentError> {
    if front.trim().is_empty() {
        return Ok(None);
    }
    let value: YamlValue = serde_yaml::from_str(front).map_err(|e| malformed(path, e))?;
    match value.get("id") {
        None | Some(YamlValue::Null) => Ok(None),
        Some(YamlValue::String(id)) => Ok(Some(id.clone())),
        Some(YamlValue::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ContentError::Malformed {
            path: path.to_string(),
            reason: "front matter `id` must be a string".to_string(),
        }),
    }
}

fn canonical_text(path: &str, normalized: &str) -> Result<String, ContentError> {
    let Some((front, rest)) = split_front_matter(normalized) else {
        return Ok(normalized.to_string());
    };
    let value: YamlValue = if front.trim().is_empty() {
        YamlValue::Null
    } else {
        serde_yaml::from_str(front).map_err(|e| malformed(path, e))?
    };
    if !matches!(value, YamlValue::Mapping(_) | YamlValue::Null) {
        return Err(ContentError::Malformed {
            path: path.to_string(),
            reason: "front matter must be a mapping".to_string(),
        });
    }
    let sorted = serde_yaml::to_string(&sort_yaml(value)).map_err(|e| malformed(path, e))?;
    Ok(format!("---\n{sorted}---\n{rest}"))
}

fn canonical_json(path: &str, normalized: &str) -> Result<String, ContentError> {
    if normalized.trim().is_empty() {
        return Ok(String::new());
    }
    // serde_json's default map is ordered, so re-serializing sorts keys.
    let value: serde_json::Value =
        serde_json::from_str(normalized).map_err(|e| malformed(path, e))?;
    serde_json::to_string(&value).map_err(|e| malformed(path, e))
}

fn canonical_yaml_document(path: &str, normalized: &str) -> Result<String, ContentError> {
    if normalized.trim().is_empty() {
        return Ok(String::new());
    }
    let value: YamlValue = serde_yaml::from_str(normalized).map_err(|e| malformed(path, e))?;
    serde_yaml::to_string(&sort_yaml(value)).map_err(|e| malformed(path, e))
}

fn sort_yaml(value: YamlValue) -> YamlValue {
    match value {
        YamlValue::Mapping(map) => {
            let mut entries: Vec<(String, YamlValue, YamlValue)> = map
                .into_iter()
                .map(|(k, v)| {
                    let key = serde_yaml::to_string(&k).unwrap_or_default();
                    (key, k, sort_yaml(v))
                })
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Mapping::new();
            for (_, k, v) in entries {
                sorted.insert(k, v);
            }
            YamlValue::Mapping(sorted)
        }
        YamlValue::Sequence(items) => YamlValue::Sequence(items.into_iter().map(sort_yaml).collect()),
        YamlValue::Tagged(tagged) => {
            let mut inner = *tagged;
            inner.value = sort_yaml(inner.value);
            YamlValue::Tagged(Box::new(inner))
        }
        other => other,
    }
}

fn extension(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

fn strip_extension(path: &str) -> &str {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &path[..name_start + dot],
        _ => path,
    }
}

fn malformed(path: &str, err: impl std::fmt::Display) -> ContentError {
    ContentError::Malformed {
        path: path.to_string(),
        reason: err.to_string(),
    }
}
