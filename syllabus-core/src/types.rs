//! Domain types for the syllabus sync engine.
//!
//! Content paths are stored as `/`-separated strings relative to the content
//! root so that they compare identically on every platform and can be sent to
//! the remote side verbatim.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable local identifier of a content item. Never changes for the life of
/// the item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentId(pub String);

impl ContentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ContentId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identifier assigned by the remote content-management system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ExternalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExternalId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lowercase hex SHA-256 over an item's canonical payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// First 12 hex characters, for human-facing output.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for ContentHash {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Optimistic-concurrency token of a remote record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Version(pub u64);

impl Version {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which store a change was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => write!(f, "local"),
            Origin::Remote => write!(f, "remote"),
        }
    }
}

impl FromStr for Origin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Origin::Local),
            "remote" => Ok(Origin::Remote),
            other => Err(format!("unknown side '{other}'; expected: local, remote")),
        }
    }
}

/// How a conflict (same id changed on both sides) is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Later modification time wins; exact ties are broken by comparing the
    /// local id with the remote external id. External ids are assigned by
    /// the backend, so a tie on one backend can settle on the other side
    /// on another.
    LastWriterWins,
    PreferLocal,
    PreferRemote,
    /// Park the conflict for an operator; nothing is applied for that id.
    Manual,
}

impl ConflictPolicy {
    pub fn all() -> &'static [ConflictPolicy] {
        &[
            ConflictPolicy::LastWriterWins,
            ConflictPolicy::PreferLocal,
            ConflictPolicy::PreferRemote,
            ConflictPolicy::Manual,
        ]
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::LastWriterWins => write!(f, "last-writer-wins"),
            ConflictPolicy::PreferLocal => write!(f, "prefer-local"),
            ConflictPolicy::PreferRemote => write!(f, "prefer-remote"),
            ConflictPolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "last-writer-wins" => Ok(ConflictPolicy::LastWriterWins),
            "prefer-local" => Ok(ConflictPolicy::PreferLocal),
            "prefer-remote" => Ok(ConflictPolicy::PreferRemote),
            "manual" => Ok(ConflictPolicy::Manual),
            other => Err(format!(
                "unknown conflict policy '{other}'; expected: last-writer-wins, prefer-local, prefer-remote, manual"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What is sent to (and received from) the remote side for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub path: String,
    pub body: String,
}

/// Local-side view of one content item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: ContentId,
    pub path: String,
    /// Normalized file body.
    pub payload: String,
    pub content_hash: ContentHash,
    pub local_modified_at: DateTime<Utc>,
}

/// Remote-side view of one content item.
///
/// Backends always fill `content_id`: from the idempotency key when the
/// record was created by this engine, or derived from path and body for
/// records authored directly in the CMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub external_id: ExternalId,
    pub content_id: ContentId,
    pub path: String,
    pub content_hash: ContentHash,
    pub remote_modified_at: DateTime<Utc>,
    pub version: Version,
    /// Inline body, when the backend's listing already carries it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Last mutually agreed state of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateEntry {
    pub id: ContentId,
    pub external_id: ExternalId,
    pub path: String,
    pub last_local_hash: ContentHash,
    pub last_remote_hash: ContentHash,
    pub remote_version: Version,
    pub last_synced_at: DateTime<Utc>,
    /// Store-wide cycle sequence at which this entry was last agreed.
    pub sequence: u64,
}

// ---------------------------------------------------------------------------
// Changes
// ---------------------------------------------------------------------------

/// New content carried by a create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub hash: ContentHash,
    pub body: String,
    pub modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeKind {
    Create(Revision),
    Update(Revision),
    Delete,
}

/// One detected change, to be propagated to the side opposite its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeOp {
    pub id: ContentId,
    pub origin: Origin,
    /// Path after the change (the last known path for deletes).
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeOp {
    pub fn revision(&self) -> Option<&Revision> {
        match &self.kind {
            ChangeKind::Create(rev) | ChangeKind::Update(rev) => Some(rev),
            ChangeKind::Delete => None,
        }
    }

    pub fn hash(&self) -> Option<&ContentHash> {
        self.revision().map(|rev| &rev.hash)
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ChangeKind::Delete)
    }

    pub fn verb(&self) -> &'static str {
        match self.kind {
            ChangeKind::Create(_) => "create",
            ChangeKind::Update(_) => "update",
            ChangeKind::Delete => "delete",
        }
    }

    /// Payload to push to the remote side; `None` for deletes.
    pub fn payload(&self) -> Option<ContentPayload> {
        self.revision().map(|rev| ContentPayload {
            path: self.path.clone(),
            body: rev.body.clone(),
        })
    }
}

/// Both sides changed the same id since the last agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ContentId,
    pub local: ChangeOp,
    pub remote: ChangeOp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
