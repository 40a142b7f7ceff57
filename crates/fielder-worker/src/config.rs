//! Configuration for the batch worker

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Hard cap on claims per invocation, matching the dispatcher contract
pub const MAX_BATCH_SIZE: usize = 100;

/// Configuration for one worker invocation
///
/// # Examples
///
/// ```
/// use fielder_worker::WorkerConfig;
///
/// let config = WorkerConfig::default();
/// assert_eq!(config.batch_size, 25);
/// assert!(config.batching_enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum overlays claimed per invocation (clamped to 1..=100)
    pub batch_size: usize,

    /// Attempts before an overlay fails terminally
    pub max_retries: u32,

    /// Whether multi-block packs are sent as batched calls; when disabled
    /// every pack is a singleton and every call is single-shape
    #[serde(default = "default_batching_enabled")]
    pub batching_enabled: bool,

    /// Maximum blocks per pack
    pub pack_size_max: usize,

    /// Provider context window budgeted against
    pub context_window_tokens: u32,

    /// Tokens reserved out of the context window for the response
    pub output_reserve_tokens: u32,

    /// Estimated token overhead of the tool definition itself
    pub tool_overhead_tokens: u32,

    /// Output token cap for one batched call
    pub max_output_tokens_per_call: u32,

    /// Output tokens budgeted per block within a batched call
    pub per_item_output_budget_tokens: u32,

    /// Whether to request prompt caching for the system prompt
    /// (forwarded to the LLM client only)
    #[serde(default)]
    pub prompt_caching_enabled: bool,

    /// Timeout applied to each outbound LLM call (seconds); a timeout is
    /// a transient failure and goes through the retry ledger
    pub llm_call_timeout_secs: u64,
}

fn default_batching_enabled() -> bool {
    true
}

impl Default for WorkerConfig {
    /// Balanced defaults sized for Claude-class context windows
    fn default() -> Self {
        Self {
            batch_size: 25,
            max_retries: 3,
            batching_enabled: true,
            pack_size_max: 10,
            context_window_tokens: 200_000,
            output_reserve_tokens: 8_192,
            tool_overhead_tokens: 1_024,
            max_output_tokens_per_call: 8_192,
            per_item_output_budget_tokens: 2_000,
            prompt_caching_enabled: false,
            llm_call_timeout_secs: 120,
        }
    }
}

impl WorkerConfig {
    /// Preset for high-throughput backfills: larger claims and packs,
    /// prompt caching on
    pub fn high_throughput() -> Self {
        Self {
            batch_size: 100,
            pack_size_max: 20,
            prompt_caching_enabled: true,
            ..Default::default()
        }
    }

    /// Preset that disables batching entirely: one block per call
    ///
    /// Useful when a schema is known to confuse the per-id result
    /// contract, at the cost of one call per block.
    pub fn single_shot() -> Self {
        Self {
            batching_enabled: false,
            ..Default::default()
        }
    }

    /// Batch size with the dispatcher clamp applied
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }

    /// Pack size cap actually used for packing; forcing singletons when
    /// batching is disabled keeps every call single-shape
    pub fn effective_pack_size_max(&self) -> usize {
        if self.batching_enabled {
            self.pack_size_max
        } else {
            1
        }
    }

    /// LLM call timeout as a Duration
    pub fn llm_call_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_call_timeout_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.max_retries == 0 {
            return Err("max_retries must be at least 1".to_string());
        }
        if self.pack_size_max == 0 {
            return Err("pack_size_max must be at least 1".to_string());
        }
        if self.context_window_tokens == 0 {
            return Err("context_window_tokens must be greater than 0".to_string());
        }
        if self.per_item_output_budget_tokens == 0 {
            return Err("per_item_output_budget_tokens must be greater than 0".to_string());
        }
        if self.llm_call_timeout_secs == 0 {
            return Err("llm_call_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, String> {
        toml::from_str(toml_str).map_err(|e| format!("Failed to parse TOML: {}", e))
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize to TOML: {}", e))
    }
}
