//! Trait definitions for external interactions
//!
//! These traits define the boundaries between the worker and its
//! infrastructure collaborators. Implementations live in other crates
//! (`fielder-store` provides the SQLite reference implementation). All
//! queue mutation is scoped to the calling worker's claimed id set, with
//! one documented exception: the `AnyClaimant` release scope used by the
//! ownership-drift fallback.

use crate::block::{Block, BlockId, OverlayStatus, RunId, StatusCounts, WorkerId};
use crate::run::{Credential, RunContext, RunStatus};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Errors surfaced by store implementations
#[derive(Error, Debug)]
pub enum StoreError {
    /// A referenced run, block, or overlay does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A state precondition did not hold (e.g. claim lost to another worker)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Underlying storage failure
    #[error("storage error: {0}")]
    Backend(String),
}

/// Claimant scope for a release operation
///
/// Phase 1 of the two-phase release uses `OwnedBy`; the drift fallback
/// (phase 2) uses `AnyClaimant`, which ignores `claimed_by` and matches
/// overlays still in `pending` or `claimed`.
#[derive(Debug, Clone)]
pub enum ReleaseScope {
    /// Only overlays whose `claimed_by` equals this worker
    OwnedBy(WorkerId),
    /// Any overlay in `pending` or `claimed`, regardless of claimant
    AnyClaimant,
}

/// The work queue: exclusive claims and per-overlay state transitions
///
/// The claim must be atomic with respect to concurrent workers: at any
/// instant at most one worker holds `claimed` for a given block. Any store
/// offering compare-and-swap semantics on overlay status suffices.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Atomically claim up to `batch_size` pending overlays for `worker_id`
    ///
    /// Returns the claimed block ids in queue order; empty when no work is
    /// pending.
    async fn claim(
        &self,
        run_id: &RunId,
        batch_size: usize,
        worker_id: &WorkerId,
    ) -> Result<Vec<BlockId>, StoreError>;

    /// Move overlays to `next_status`, clearing the claim columns
    ///
    /// Only overlays matching `scope` are touched. Returns the ids that
    /// were actually resolved so the caller can detect ownership drift.
    /// When `error` is given it replaces `last_error`; otherwise the
    /// previous value is kept.
    async fn release(
        &self,
        run_id: &RunId,
        scope: ReleaseScope,
        block_ids: &[BlockId],
        next_status: OverlayStatus,
        error: Option<&str>,
    ) -> Result<Vec<BlockId>, StoreError>;

    /// Record a successful extraction: attach `fields` and mark `done`
    async fn mark_done(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        fields: Value,
    ) -> Result<(), StoreError>;

    /// Record a failed attempt: set `attempt_count`, `next_status`
    /// (`pending` for a retry, `failed` when exhausted) and `last_error`,
    /// clearing the claim columns
    async fn mark_attempt(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        attempt_count: u32,
        next_status: OverlayStatus,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Mark an overlay terminally failed without touching `attempt_count`
    ///
    /// Used when the block itself is unusable (e.g. content missing from
    /// the block store) and retrying could never succeed.
    async fn fail_terminal(
        &self,
        run_id: &RunId,
        block_id: &BlockId,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Current attempt count for one overlay
    async fn attempt_count(&self, run_id: &RunId, block_id: &BlockId) -> Result<u32, StoreError>;

    /// Recompute the status tally for a run
    async fn status_counts(&self, run_id: &RunId) -> Result<StatusCounts, StoreError>;
}

/// Read access to block content
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Load the blocks for the given ids
    ///
    /// Ids with no backing block are simply absent from the result; the
    /// caller decides how to handle them.
    async fn blocks(&self, ids: &[BlockId]) -> Result<HashMap<BlockId, Block>, StoreError>;
}

/// Read/update access to runs
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Load a run
    async fn run(&self, run_id: &RunId) -> Result<RunContext, StoreError>;

    /// Persist the recomputed done/failed rollup counts
    async fn update_counts(
        &self,
        run_id: &RunId,
        done: usize,
        failed: usize,
    ) -> Result<(), StoreError>;

    /// Transition the run to a terminal status, stamping `ended_at`
    /// (seconds since Unix epoch)
    async fn finalize(
        &self,
        run_id: &RunId,
        status: RunStatus,
        ended_at: u64,
    ) -> Result<(), StoreError>;
}

/// Resolution and lifecycle of provider credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Resolve a usable credential for `(owner_id, provider)`, or `None`
    /// when the owner has no valid credential on file
    async fn resolve(&self, owner_id: &str, provider: &str)
        -> Result<Option<Credential>, StoreError>;

    /// Mark the credential invalid so future invocations skip it
    async fn invalidate(&self, owner_id: &str, provider: &str) -> Result<(), StoreError>;

    /// Mark the credential validated after a successful call
    async fn mark_valid(&self, owner_id: &str, provider: &str) -> Result<(), StoreError>;
}
