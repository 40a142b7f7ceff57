//! Fielder LLM Provider Layer
//!
//! Structured-extraction calls against LLM providers, behind the
//! [`LlmClient`] trait. Two call shapes exist: a single-block call and a
//! batched call that must return exactly one result per block id.
//!
//! Provider failures are classified **here**, at the adapter boundary, into
//! the typed [`LlmError`] taxonomy; the worker never inspects raw provider
//! error text. In particular `Auth` aborts a whole worker invocation and
//! `Overflow` is recoverable by pack splitting.
//!
//! # Providers
//!
//! - `MockClient`: deterministic scripted client for testing
//! - `AnthropicClient`: Anthropic Messages API with forced tool use
//!
//! # Examples
//!
//! ```
//! use fielder_llm::MockClient;
//!
//! let client = MockClient::new();
//! assert_eq!(client.call_count(), 0);
//! ```

#![warn(missing_docs)]

pub mod anthropic;
pub mod prompt;

use async_trait::async_trait;
use fielder_domain::{Block, BlockId, Credential};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

pub use anthropic::AnthropicClient;
pub use prompt::PromptBuilder;

/// Provider name used for credential resolution
pub const PROVIDER_ANTHROPIC: &str = "anthropic";

/// Errors from LLM calls, classified at the provider adapter boundary
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// Credential rejected by the provider (401/403); fatal to the whole
    /// worker invocation
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Request exceeded the provider's context or output token limits;
    /// recoverable by splitting the pack
    #[error("request too large: {0}")]
    Overflow(String),

    /// Tool payload did not decode against the expected shape
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    /// Response carried no structured tool invocation
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Provider rate limit (429)
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Any other provider-reported error
    #[error("provider error (HTTP {status}): {message}")]
    Api {
        /// HTTP status reported by the provider
        status: u16,
        /// Provider error body, truncated
        message: String,
    },

    /// Network or transport failure
    #[error("transport error: {0}")]
    Http(String),
}

impl LlmError {
    /// Whether this failure invalidates the credential and aborts the
    /// invocation
    pub fn is_auth(&self) -> bool {
        matches!(self, LlmError::Auth(_))
    }

    /// Whether splitting the pack and retrying smaller calls can recover
    /// from this failure
    pub fn is_overflow(&self) -> bool {
        matches!(self, LlmError::Overflow(_))
    }
}

/// Token usage reported by one provider call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Prompt tokens billed as input
    pub input_tokens: u64,
    /// Completion tokens
    pub output_tokens: u64,
    /// Tokens written to the prompt cache
    pub cache_creation_tokens: u64,
    /// Tokens served from the prompt cache
    pub cache_read_tokens: u64,
}

impl LlmUsage {
    /// Accumulate another call's usage into this one
    pub fn add(&mut self, other: &LlmUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }
}

/// Shared envelope for both call shapes
#[derive(Debug, Clone)]
pub struct CallEnvelope {
    /// Model to call
    pub model: String,
    /// Sampling temperature
    pub temperature: f64,
    /// Output token cap for this call
    pub max_tokens: u32,
    /// System prompt
    pub system_prompt: String,
    /// Per-block instruction text
    pub per_block_prompt: String,
    /// JSON Schema `properties` for the extraction tool
    pub schema_properties: Value,
    /// Whether to request prompt caching for the system prompt
    pub prompt_caching: bool,
    /// Credential presented to the provider
    pub credential: Credential,
}

/// A single-block extraction request
#[derive(Debug, Clone)]
pub struct SingleRequest {
    /// Call envelope
    pub call: CallEnvelope,
    /// The block to extract from
    pub block: Block,
}

/// A batched extraction request over an ordered pack of blocks
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Call envelope
    pub call: CallEnvelope,
    /// The blocks in pack order
    pub blocks: Vec<Block>,
}

/// Result of a single-block call
#[derive(Debug, Clone, PartialEq)]
pub struct SingleExtraction {
    /// Structured fields returned by the tool invocation
    pub fields: Value,
    /// Usage reported for the call
    pub usage: LlmUsage,
}

/// Result of a batched call, in provider-reported order
///
/// Entries are kept as a raw list (not a map) so the caller can detect
/// duplicate ids and apply its first-occurrence-wins policy.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchExtraction {
    /// `(block_id, fields)` entries as returned by the provider
    pub results: Vec<(BlockId, Value)>,
    /// Usage reported for the call
    pub usage: LlmUsage,
}

/// Structured-extraction client
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Extract fields for a single block
    async fn extract_single(&self, request: &SingleRequest)
        -> Result<SingleExtraction, LlmError>;

    /// Extract fields for a pack of blocks in one call
    ///
    /// The request instructs the model to return exactly one result keyed
    /// by each block's id; the caller validates that contract.
    async fn extract_batch(&self, request: &BatchRequest) -> Result<BatchExtraction, LlmError>;
}

/// A call observed by [`MockClient`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Whether the call used the batched shape
    pub batched: bool,
    /// Block ids in request order
    pub block_ids: Vec<BlockId>,
}

#[derive(Debug, Default)]
struct MockState {
    single_results: VecDeque<Result<SingleExtraction, LlmError>>,
    batch_results: VecDeque<Result<BatchExtraction, LlmError>>,
    calls: Vec<RecordedCall>,
}

/// Mock LLM client for deterministic testing
///
/// Responses can be scripted per call shape; unscripted calls echo a
/// default fields object per requested block. All calls are recorded.
///
/// # Examples
///
/// ```
/// use fielder_llm::{LlmError, MockClient};
///
/// let client = MockClient::new();
/// client.push_batch(Err(LlmError::Overflow("too big".to_string())));
/// assert_eq!(client.call_count(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockClient {
    state: Arc<Mutex<MockState>>,
    default_fields: Value,
}

impl MockClient {
    /// Create a mock client with an empty default fields object
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            default_fields: json!({}),
        }
    }

    /// Set the fields object echoed for unscripted calls
    pub fn with_default_fields(mut self, fields: Value) -> Self {
        self.default_fields = fields;
        self
    }

    /// Script the next single-call result
    pub fn push_single(&self, result: Result<SingleExtraction, LlmError>) {
        self.state.lock().unwrap().single_results.push_back(result);
    }

    /// Script the next batched-call result
    pub fn push_batch(&self, result: Result<BatchExtraction, LlmError>) {
        self.state.lock().unwrap().batch_results.push_back(result);
    }

    /// All calls observed so far, in order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of calls observed so far
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn echo_usage() -> LlmUsage {
        LlmUsage {
            input_tokens: 100,
            output_tokens: 50,
            ..Default::default()
        }
    }
}

#[async_trait]
impl LlmClient for MockClient {
    async fn extract_single(
        &self,
        request: &SingleRequest,
    ) -> Result<SingleExtraction, LlmError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            batched: false,
            block_ids: vec![request.block.id.clone()],
        });
        if let Some(result) = state.single_results.pop_front() {
            return result;
        }
        Ok(SingleExtraction {
            fields: self.default_fields.clone(),
            usage: Self::echo_usage(),
        })
    }

    async fn extract_batch(&self, request: &BatchRequest) -> Result<BatchExtraction, LlmError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RecordedCall {
            batched: true,
            block_ids: request.blocks.iter().map(|b| b.id.clone()).collect(),
        });
        if let Some(result) = state.batch_results.pop_front() {
            return result;
        }
        Ok(BatchExtraction {
            results: request
                .blocks
                .iter()
                .map(|b| (b.id.clone(), self.default_fields.clone()))
                .collect(),
            usage: Self::echo_usage(),
        })
    }
}
