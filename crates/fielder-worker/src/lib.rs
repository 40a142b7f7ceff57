//! Fielder Batch Worker
//!
//! The worker scheduler that turns pending document blocks into structured
//! extraction results. Each invocation (typically fired by a dispatcher on
//! a schedule) runs one sequential pipeline:
//!
//! 1. **Claim** a bounded batch of pending overlays, exclusively
//! 2. **Check cancellation** and release everything untouched if the run
//!    was cancelled
//! 3. **Pack** the claimed blocks into token-budget-respecting groups to
//!    minimize LLM call count
//! 4. **Execute** each pack: one batched call per multi-block pack, single
//!    calls otherwise; batched responses must map 1:1 onto the pack's ids
//! 5. **Recover** from provider overflow and mapping mismatches by
//!    splitting the pack in two and reprocessing both halves
//! 6. **Bookkeep** bounded per-block retries and accumulate usage
//! 7. **Finalize** the run once nothing remains pending
//!
//! Auth failures are the one fatal class: the invocation aborts, claimed
//! overlays are released through a two-phase protocol tolerant of
//! ownership drift, and the credential is invalidated.
//!
//! # Usage
//!
//! ```no_run
//! use fielder_llm::AnthropicClient;
//! use fielder_store::SqliteQueue;
//! use fielder_worker::{WorkerConfig, WorkerScheduler};
//! use fielder_domain::RunId;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteQueue::new("fielder.db")?);
//! let client = Arc::new(AnthropicClient::new());
//! let scheduler = WorkerScheduler::new(client, store, WorkerConfig::default());
//!
//! let summary = scheduler.run_batch(&RunId::new("run-1")).await?;
//! println!(
//!     "claimed {} succeeded {} failed {} remaining {}",
//!     summary.claimed, summary.succeeded, summary.failed, summary.remaining_pending
//! );
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! [`WorkerConfig`] can be loaded from TOML:
//!
//! ```toml
//! batch_size = 25
//! max_retries = 3
//! batching_enabled = true
//! pack_size_max = 10
//! context_window_tokens = 200000
//! output_reserve_tokens = 8192
//! tool_overhead_tokens = 1024
//! max_output_tokens_per_call = 8192
//! per_item_output_budget_tokens = 2000
//! prompt_caching_enabled = false
//! llm_call_timeout_secs = 120
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod mapper;
mod packer;
mod retry;
mod scheduler;
mod usage;

pub use config::{WorkerConfig, MAX_BATCH_SIZE};
pub use error::WorkerError;
pub use mapper::{map_batch_results, MappingMismatch};
pub use packer::{Pack, Packer};
pub use retry::{next_attempt, RetryDecision};
pub use scheduler::{RunBatchSummary, WorkerScheduler};
pub use usage::{BatchingMetrics, UsageAccumulator, UsageTotals};
