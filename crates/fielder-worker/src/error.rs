//! Error types for the batch worker

use fielder_domain::StoreError;
use thiserror::Error;

/// Persisted and returned error messages are bounded to this many bytes.
pub const ERROR_MESSAGE_LIMIT: usize = 500;

/// Run-level errors that abort a worker invocation
///
/// Block-level failures never surface here; they are converted into queue
/// state transitions by the retry ledger.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The run does not exist
    #[error("run not found: {0}")]
    RunNotFound(String),

    /// The run has no extraction schema attached
    #[error("no extraction schema for run: {0}")]
    SchemaMissing(String),

    /// No usable credential for the run owner
    #[error("no credential available for owner: {0}")]
    NoCredential(String),

    /// The provider rejected the credential; claimed blocks were released
    /// and the credential invalidated
    #[error("provider rejected credential: {0}")]
    AuthRejected(String),

    /// The two-phase release could not resolve these block ids
    #[error("inconsistent queue state; unresolved releases: {0:?}")]
    InconsistentQueue(Vec<String>),

    /// Invalid worker configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Store failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Truncate an error message to `limit` bytes on a char boundary
pub(crate) fn truncate_error(message: &str, limit: usize) -> String {
    if message.len() <= limit {
        return message.to_string();
    }
    let mut end = limit;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_messages_untouched() {
        assert_eq!(truncate_error("boom", ERROR_MESSAGE_LIMIT), "boom");
    }

    #[test]
    fn test_long_messages_bounded() {
        let long = "x".repeat(2_000);
        assert_eq!(truncate_error(&long, ERROR_MESSAGE_LIMIT).len(), ERROR_MESSAGE_LIMIT);
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let message = format!("{}ü", "a".repeat(ERROR_MESSAGE_LIMIT - 1));
        let truncated = truncate_error(&message, ERROR_MESSAGE_LIMIT);
        assert_eq!(truncated.len(), ERROR_MESSAGE_LIMIT - 1);
    }

    #[test]
    fn test_store_error_converts() {
        let err: WorkerError = StoreError::NotFound("run x".to_string()).into();
        assert!(matches!(err, WorkerError::Store(_)));
    }
}
