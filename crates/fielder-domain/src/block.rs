//! Blocks and overlays - the units of extraction work

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a block
///
/// Blocks are produced by the upstream partitioning pipeline, which assigns
/// content-hash identifiers. The worker treats them as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(String);

impl BlockId {
    /// Create a BlockId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Create a RunId from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier for one worker invocation
///
/// Generated fresh per invocation; claims are scoped to it so that release
/// operations never touch another worker's claims (outside the documented
/// ownership-drift fallback).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Generate a new random worker id (`worker-` + 8 hex chars)
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("worker-{}", &uuid[..8]))
    }

    /// Wrap an existing worker id string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable unit of document content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Unique identifier
    pub id: BlockId,

    /// Block kind as assigned by the partitioner (e.g. "NarrativeText", "Table")
    pub kind: String,

    /// Text content of the block
    pub content: String,
}

impl Block {
    /// Create a new block
    pub fn new(id: impl Into<String>, kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: BlockId::new(id),
            kind: kind.into(),
            content: content.into(),
        }
    }
}

/// Lifecycle state of an overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayStatus {
    /// Eligible to be claimed by any worker
    Pending,
    /// Exclusively held by one worker invocation
    Claimed,
    /// Extraction succeeded; fields are attached
    Done,
    /// Terminally failed after exhausting retries
    Failed,
}

impl OverlayStatus {
    /// Canonical string form used by stores
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayStatus::Pending => "pending",
            OverlayStatus::Claimed => "claimed",
            OverlayStatus::Done => "done",
            OverlayStatus::Failed => "failed",
        }
    }

    /// Parse from the canonical string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OverlayStatus::Pending),
            "claimed" => Some(OverlayStatus::Claimed),
            "done" => Some(OverlayStatus::Done),
            "failed" => Some(OverlayStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OverlayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-(run, block) extraction state
///
/// Owned by the work queue; the worker only requests transitions. The
/// `fields` payload is attached when the overlay reaches `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// The block this overlay tracks
    pub block_id: BlockId,

    /// Current lifecycle state
    pub status: OverlayStatus,

    /// Number of completed extraction attempts
    pub attempt_count: u32,

    /// Message from the most recent failure, truncated by the worker
    pub last_error: Option<String>,

    /// Worker currently holding the claim, if any
    pub claimed_by: Option<String>,

    /// When the claim was taken (seconds since Unix epoch)
    pub claimed_at: Option<u64>,

    /// Structured extraction result, present once `Done`
    pub fields: Option<serde_json::Value>,
}

/// Status tally for one run, recomputed from the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// Overlays in `done`
    pub done: usize,
    /// Overlays in `failed`
    pub failed: usize,
    /// Overlays in `pending`
    pub pending: usize,
    /// Overlays in `claimed`
    pub claimed: usize,
}

impl StatusCounts {
    /// Overlays still awaiting a terminal state (`pending` + `claimed`)
    pub fn remaining(&self) -> usize {
        self.pending + self.claimed
    }
}
