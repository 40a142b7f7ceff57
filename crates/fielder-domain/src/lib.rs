//! Fielder Domain Layer
//!
//! Core types and trait seams for the Fielder extraction worker. This crate
//! defines the vocabulary every other layer speaks:
//!
//! - **Block**: an immutable unit of document content to extract fields from
//! - **Overlay**: the per-(run, block) extraction state owned by the queue
//! - **Run**: the job grouping many blocks under one schema and model config
//! - **Trait seams**: the work queue, block/run/credential stores, and the
//!   pluggable token estimator
//!
//! Infrastructure implementations live in other crates (`fielder-store` for
//! the SQLite-backed queue, `fielder-llm` for providers); the worker crate
//! composes them through the traits defined here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod estimator;
pub mod run;
pub mod traits;

// Re-exports for convenience
pub use block::{Block, BlockId, Overlay, OverlayStatus, RunId, StatusCounts, WorkerId};
pub use estimator::{CharEstimator, TokenEstimator};
pub use run::{Credential, ExtractionSchema, ModelConfig, PromptConfig, RunContext, RunStatus};
pub use traits::{BlockStore, CredentialStore, ReleaseScope, RunStore, StoreError, WorkQueue};
