//! Reconciliation of batched results against the originating pack
//!
//! A successful batched call must map 1:1 onto the pack's block ids: every
//! expected id present, no foreign ids, duplicates resolved first-wins.
//! Anything else is a [`MappingMismatch`], which the scheduler treats as
//! split-recoverable.

use fielder_domain::BlockId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// At most this many ids are reported per side in the error message
const SAMPLE_LIMIT: usize = 5;

/// A batched response did not map 1:1 onto the pack
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "batch result mismatch: {missing_count} missing, {unexpected_count} unexpected \
     (missing sample: {missing_sample:?}, unexpected sample: {unexpected_sample:?})"
)]
pub struct MappingMismatch {
    /// Expected ids with no result
    pub missing_count: usize,
    /// Returned ids not in the pack
    pub unexpected_count: usize,
    /// Up to five missing ids, in pack order
    pub missing_sample: Vec<BlockId>,
    /// Up to five unexpected ids, in response order
    pub unexpected_sample: Vec<BlockId>,
}

/// Validate a batched response against the pack's expected ids
///
/// Returns a per-id lookup on success. Duplicate ids in the response keep
/// their first occurrence; missing or unexpected ids reject the whole
/// response.
pub fn map_batch_results(
    expected: &[BlockId],
    results: Vec<(BlockId, Value)>,
) -> Result<HashMap<BlockId, Value>, MappingMismatch> {
    let expected_set: HashSet<&BlockId> = expected.iter().collect();

    let mut mapped: HashMap<BlockId, Value> = HashMap::with_capacity(expected.len());
    let mut unexpected: Vec<BlockId> = Vec::new();
    let mut seen_unexpected: HashSet<BlockId> = HashSet::new();

    for (block_id, fields) in results {
        if !expected_set.contains(&block_id) {
            if seen_unexpected.insert(block_id.clone()) {
                unexpected.push(block_id);
            }
            continue;
        }
        // First occurrence wins
        mapped.entry(block_id).or_insert(fields);
    }

    let missing: Vec<BlockId> = expected
        .iter()
        .filter(|id| !mapped.contains_key(*id))
        .cloned()
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(mapped);
    }

    Err(MappingMismatch {
        missing_count: missing.len(),
        unexpected_count: unexpected.len(),
        missing_sample: missing.into_iter().take(SAMPLE_LIMIT).collect(),
        unexpected_sample: unexpected.into_iter().take(SAMPLE_LIMIT).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(names: &[&str]) -> Vec<BlockId> {
        names.iter().map(|n| BlockId::new(*n)).collect()
    }

    #[test]
    fn test_exact_mapping_accepted() {
        let expected = ids(&["a", "b", "c"]);
        let results = vec![
            (BlockId::new("a"), json!({"n": 1})),
            (BlockId::new("b"), json!({"n": 2})),
            (BlockId::new("c"), json!({"n": 3})),
        ];

        let mapped = map_batch_results(&expected, results).unwrap();
        assert_eq!(mapped.len(), 3);
        assert_eq!(mapped[&BlockId::new("b")], json!({"n": 2}));
    }

    #[test]
    fn test_missing_id_rejected_with_counts() {
        let expected = ids(&["a", "b", "c"]);
        let results = vec![
            (BlockId::new("a"), json!({})),
            (BlockId::new("b"), json!({})),
        ];

        let err = map_batch_results(&expected, results).unwrap_err();
        assert_eq!(err.missing_count, 1);
        assert_eq!(err.unexpected_count, 0);
        assert_eq!(err.missing_sample, ids(&["c"]));
    }

    #[test]
    fn test_unexpected_id_rejected() {
        let expected = ids(&["a", "b"]);
        let results = vec![
            (BlockId::new("a"), json!({})),
            (BlockId::new("b"), json!({})),
            (BlockId::new("d"), json!({})),
        ];

        let err = map_batch_results(&expected, results).unwrap_err();
        assert_eq!(err.missing_count, 0);
        assert_eq!(err.unexpected_count, 1);
        assert_eq!(err.unexpected_sample, ids(&["d"]));
    }

    #[test]
    fn test_missing_and_unexpected_both_reported() {
        let expected = ids(&["a", "b"]);
        let results = vec![(BlockId::new("a"), json!({})), (BlockId::new("x"), json!({}))];

        let err = map_batch_results(&expected, results).unwrap_err();
        assert_eq!(err.missing_count, 1);
        assert_eq!(err.unexpected_count, 1);
        let message = err.to_string();
        assert!(message.contains("1 missing"));
        assert!(message.contains("1 unexpected"));
    }

    #[test]
    fn test_duplicate_id_keeps_first_occurrence() {
        let expected = ids(&["a", "b"]);
        let results = vec![
            (BlockId::new("a"), json!({"v": "first"})),
            (BlockId::new("a"), json!({"v": "second"})),
            (BlockId::new("b"), json!({})),
        ];

        let mapped = map_batch_results(&expected, results).unwrap();
        assert_eq!(mapped[&BlockId::new("a")], json!({"v": "first"}));
    }

    #[test]
    fn test_samples_are_bounded() {
        let expected: Vec<BlockId> = (0..20).map(|i| BlockId::new(format!("b{}", i))).collect();
        let err = map_batch_results(&expected, Vec::new()).unwrap_err();

        assert_eq!(err.missing_count, 20);
        assert_eq!(err.missing_sample.len(), SAMPLE_LIMIT);
        // Samples follow pack order
        assert_eq!(err.missing_sample[0], BlockId::new("b0"));
    }

    #[test]
    fn test_empty_pack_and_empty_results_accepted() {
        let mapped = map_batch_results(&[], Vec::new()).unwrap();
        assert!(mapped.is_empty());
    }
}
