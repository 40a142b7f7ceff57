//! Usage accounting and batching metrics for one worker invocation

use fielder_llm::LlmUsage;
use serde::Serialize;

/// Run-level usage totals accumulated across all calls of an invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    /// Calls that returned a usage payload
    pub call_count: u64,
    /// Calls served at least partially from the prompt cache
    pub cache_hit_calls: u64,
    /// Summed token usage across those calls
    pub tokens: LlmUsage,
}

/// Accumulates per-call usage into run-level totals
///
/// Accumulation is associative and commutative, so a parallel scheduler
/// could merge accumulators without changing totals.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageAccumulator {
    totals: UsageTotals,
}

impl UsageAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call's usage payload
    pub fn record(&mut self, usage: &LlmUsage) {
        self.totals.call_count += 1;
        if usage.cache_read_tokens > 0 {
            self.totals.cache_hit_calls += 1;
        }
        self.totals.tokens.add(usage);
    }

    /// Current totals
    pub fn totals(&self) -> UsageTotals {
        self.totals
    }
}

/// Pack/call shape counters for one invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchingMetrics {
    /// Packs produced by the packer (before any splits)
    pub packs_built: u64,
    /// Batched calls attempted
    pub batch_calls: u64,
    /// Single-block calls attempted
    pub single_calls: u64,
    /// Packs split after an overflow or mapping mismatch
    pub splits: u64,
    /// Batched responses rejected by the result mapper
    pub mapping_mismatches: u64,
}

impl BatchingMetrics {
    /// Record the packer's initial output
    pub fn record_packs_built(&mut self, count: usize) {
        self.packs_built += count as u64;
    }

    /// Record a batched call attempt
    pub fn record_batch_call(&mut self) {
        self.batch_calls += 1;
    }

    /// Record a single-block call attempt
    pub fn record_single_call(&mut self) {
        self.single_calls += 1;
    }

    /// Record a pack split
    pub fn record_split(&mut self) {
        self.splits += 1;
    }

    /// Record a rejected batched response
    pub fn record_mapping_mismatch(&mut self) {
        self.mapping_mismatches += 1;
    }
}
