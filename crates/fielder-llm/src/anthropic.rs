//! Anthropic Messages API adapter
//!
//! Structured output is obtained by forcing a tool invocation
//! (`tool_choice`) and reading the tool input back as the extraction
//! result. Raw provider failures are classified into the typed
//! [`LlmError`] taxonomy here, so the worker never matches on error text.

use crate::{
    BatchExtraction, BatchRequest, LlmClient, LlmError, LlmUsage, PromptBuilder,
    SingleExtraction, SingleRequest,
};
use async_trait::async_trait;
use fielder_domain::BlockId;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Default Anthropic API endpoint
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com";

/// Messages API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default HTTP request timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

const SINGLE_TOOL_NAME: &str = "extract_fields";
const BATCH_TOOL_NAME: &str = "extract_fields_batch";

// Provider error bodies are truncated before they enter error values.
const ERROR_BODY_LIMIT: usize = 500;

/// Anthropic Messages API client
pub struct AnthropicClient {
    endpoint: String,
    client: reqwest::Client,
}

impl AnthropicClient {
    /// Create a client against the public API endpoint
    pub fn new() -> Self {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    /// Create a client against a custom endpoint (e.g. a proxy)
    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .unwrap();
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }

    async fn post_messages(
        &self,
        api_key: &str,
        body: &MessagesRequest,
    ) -> Result<MessagesResponse, LlmError> {
        let url = format!("{}/v1/messages", self.endpoint);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Http(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_failure(status.as_u16(), &body));
        }

        response
            .json::<MessagesResponse>()
            .await
            .map_err(|e| LlmError::InvalidResponse(format!("failed to parse response: {}", e)))
    }
}

impl Default for AnthropicClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn extract_single(
        &self,
        request: &SingleRequest,
    ) -> Result<SingleExtraction, LlmError> {
        let body = build_single_body(request);
        let response = self
            .post_messages(&request.call.credential.secret, &body)
            .await?;
        decode_single_response(response)
    }

    async fn extract_batch(&self, request: &BatchRequest) -> Result<BatchExtraction, LlmError> {
        let body = build_batch_body(request);
        let response = self
            .post_messages(&request.call.credential.secret, &body)
            .await?;
        decode_batch_response(response)
    }
}

// ── Wire types ──

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    system: Value,
    messages: Vec<Message>,
    tools: Vec<Value>,
    tool_choice: Value,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

impl From<WireUsage> for LlmUsage {
    fn from(wire: WireUsage) -> Self {
        LlmUsage {
            input_tokens: wire.input_tokens,
            output_tokens: wire.output_tokens,
            cache_creation_tokens: wire.cache_creation_input_tokens,
            cache_read_tokens: wire.cache_read_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

// ── Request construction ──

fn system_field(system_prompt: &str, prompt_caching: bool) -> Value {
    if prompt_caching {
        json!([{
            "type": "text",
            "text": system_prompt,
            "cache_control": {"type": "ephemeral"},
        }])
    } else {
        json!(system_prompt)
    }
}

fn build_single_body(request: &SingleRequest) -> MessagesRequest {
    let call = &request.call;
    let tool = json!({
        "name": SINGLE_TOOL_NAME,
        "description": "Extract structured fields from the block content according to the schema.",
        "input_schema": {
            "type": "object",
            "properties": call.schema_properties,
        },
    });

    let prompt = PromptBuilder::new(call.per_block_prompt.clone()).single(&request.block);

    MessagesRequest {
        model: call.model.clone(),
        max_tokens: call.max_tokens,
        temperature: call.temperature,
        system: system_field(&call.system_prompt, call.prompt_caching),
        messages: vec![Message {
            role: "user",
            content: prompt,
        }],
        tools: vec![tool],
        tool_choice: json!({"type": "tool", "name": SINGLE_TOOL_NAME}),
    }
}

fn build_batch_body(request: &BatchRequest) -> MessagesRequest {
    let call = &request.call;
    let tool = json!({
        "name": BATCH_TOOL_NAME,
        "description": "Extract structured fields for every block, one result per block id.",
        "input_schema": {
            "type": "object",
            "properties": {
                "results": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "block_id": {"type": "string"},
                            "fields": {
                                "type": "object",
                                "properties": call.schema_properties,
                            },
                        },
                        "required": ["block_id", "fields"],
                    },
                },
            },
            "required": ["results"],
        },
    });

    let prompt = PromptBuilder::new(call.per_block_prompt.clone()).batch(&request.blocks);

    MessagesRequest {
        model: call.model.clone(),
        max_tokens: call.max_tokens,
        temperature: call.temperature,
        system: system_field(&call.system_prompt, call.prompt_caching),
        messages: vec![Message {
            role: "user",
            content: prompt,
        }],
        tools: vec![tool],
        tool_choice: json!({"type": "tool", "name": BATCH_TOOL_NAME}),
    }
}

// ── Response decoding ──

fn tool_input(response: &MessagesResponse) -> Result<&Value, LlmError> {
    response
        .content
        .iter()
        .find(|c| c.kind == "tool_use")
        .and_then(|c| c.input.as_ref())
        .ok_or_else(|| LlmError::InvalidResponse("no tool_use block in response".to_string()))
}

fn decode_single_response(response: MessagesResponse) -> Result<SingleExtraction, LlmError> {
    let input = tool_input(&response)?;
    if !input.is_object() {
        return Err(LlmError::SchemaViolation(
            "tool input is not a JSON object".to_string(),
        ));
    }
    let fields = input.clone();
    let usage = response.usage.map(LlmUsage::from).unwrap_or_default();
    Ok(SingleExtraction { fields, usage })
}

fn decode_batch_response(response: MessagesResponse) -> Result<BatchExtraction, LlmError> {
    let input = tool_input(&response)?;
    let entries = input
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| {
            LlmError::SchemaViolation("tool input has no 'results' array".to_string())
        })?;

    let mut results = Vec::with_capacity(entries.len());
    for (idx, entry) in entries.iter().enumerate() {
        let obj = entry.as_object().ok_or_else(|| {
            LlmError::SchemaViolation(format!("results[{}] is not an object", idx))
        })?;
        let block_id = obj.get("block_id").and_then(|v| v.as_str()).ok_or_else(|| {
            LlmError::SchemaViolation(format!("results[{}] has no string 'block_id'", idx))
        })?;
        let fields = obj.get("fields").cloned().ok_or_else(|| {
            LlmError::SchemaViolation(format!("results[{}] has no 'fields'", idx))
        })?;
        if !fields.is_object() {
            return Err(LlmError::SchemaViolation(format!(
                "results[{}].fields is not an object",
                idx
            )));
        }
        results.push((BlockId::new(block_id), fields));
    }

    let usage = response.usage.map(LlmUsage::from).unwrap_or_default();
    Ok(BatchExtraction { results, usage })
}

// ── Error classification ──

/// Whether a provider error message indicates a context/output overflow
///
/// These signatures cover the provider's context-length and token-limit
/// rejections; anything matching is recoverable by splitting the pack.
pub fn is_overflow_message(message: &str) -> bool {
    const SIGNATURES: [&str; 5] = [
        "context length",
        "maximum context",
        "max_tokens",
        "prompt is too long",
        "input length",
    ];
    let lower = message.to_ascii_lowercase();
    SIGNATURES.iter().any(|sig| lower.contains(sig))
}

fn classify_http_failure(status: u16, body: &str) -> LlmError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string());
    let message = truncate(&message, ERROR_BODY_LIMIT);

    match status {
        401 | 403 => LlmError::Auth(message),
        429 => LlmError::RateLimited(message),
        _ if is_overflow_message(&message) => LlmError::Overflow(message),
        _ => LlmError::Api { status, message },
    }
}

fn truncate(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
