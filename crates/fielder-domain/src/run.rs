//! Runs - the job grouping many blocks under one schema and model

use crate::block::RunId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Model used when neither the schema nor the run config names one
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Blocks are still being processed
    Running,
    /// Every overlay reached a terminal state
    Complete,
    /// Cancelled by the owner; claimed blocks are released untouched
    Cancelled,
}

impl RunStatus {
    /// Canonical string form used by stores
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Complete => "complete",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Parse from the canonical string form
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "complete" => Some(RunStatus::Complete),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prompt configuration carried by an extraction schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    /// System prompt sent with every call
    #[serde(default = "default_system_instructions")]
    pub system_instructions: String,

    /// Instruction prepended to each block's content
    #[serde(default = "default_per_block_prompt")]
    pub per_block_prompt: String,

    /// Model named by the schema author, if any
    #[serde(default)]
    pub model: Option<String>,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Output token cap for a single-block call
    #[serde(default = "default_max_tokens_per_block")]
    pub max_tokens_per_block: u32,
}

fn default_system_instructions() -> String {
    "You are a document analysis assistant. Extract structured fields from the given block content."
        .to_string()
}

fn default_per_block_prompt() -> String {
    "Extract the following fields from this content block:".to_string()
}

fn default_temperature() -> f64 {
    0.2
}

fn default_max_tokens_per_block() -> u32 {
    2000
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_instructions: default_system_instructions(),
            per_block_prompt: default_per_block_prompt(),
            model: None,
            temperature: default_temperature(),
            max_tokens_per_block: default_max_tokens_per_block(),
        }
    }
}

/// Target schema for a run: tool properties plus prompt configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    /// JSON Schema `properties` object describing the fields to extract
    pub properties: Value,

    /// Prompt configuration authored alongside the schema
    #[serde(default)]
    pub prompt: PromptConfig,
}

/// Run-level model configuration, distinct from the schema's prompt config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model override for this run
    #[serde(default)]
    pub model: Option<String>,
}

/// A run as loaded from the run store
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    /// Unique identifier
    pub run_id: RunId,

    /// Owner whose credential scopes the LLM calls
    pub owner_id: String,

    /// Current lifecycle state
    pub status: RunStatus,

    /// Extraction schema; absence is a run-level error
    pub schema: Option<ExtractionSchema>,

    /// Run-level model configuration
    pub model_config: Option<ModelConfig>,
}

impl RunContext {
    /// Resolve the model for this run
    ///
    /// Priority: caller override, then the schema's prompt config, then the
    /// run's model config, then [`DEFAULT_MODEL`].
    pub fn resolved_model(&self, model_override: Option<&str>) -> String {
        if let Some(m) = model_override {
            return m.to_string();
        }
        if let Some(schema) = &self.schema {
            if let Some(m) = &schema.prompt.model {
                return m.clone();
            }
        }
        if let Some(cfg) = &self.model_config {
            if let Some(m) = &cfg.model {
                return m.clone();
            }
        }
        DEFAULT_MODEL.to_string()
    }
}

/// A provider credential resolved for a run owner
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    /// Secret presented to the provider
    pub secret: String,

    /// Whether this credential belongs to the run owner (as opposed to a
    /// platform-level key); only owner-scoped credentials are marked
    /// validated on first successful use
    pub owner_scoped: bool,
}
