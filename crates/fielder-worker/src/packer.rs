//! Token-budget bin packing of claimed blocks
//!
//! One greedy left-to-right pass groups blocks into packs so that a batched
//! call stays inside the provider's input window and output cap. Order is
//! preserved and every block lands in exactly one pack. A block is always
//! admitted to an empty pack, even when it alone exceeds a budget: forward
//! progress is guaranteed and the overflow/split path owns the fallout.

use crate::config::WorkerConfig;
use fielder_domain::{Block, BlockId, TokenEstimator};

/// Floor for the input budget after prompt reservations
const MIN_INPUT_BUDGET: u64 = 512;

/// Floor for the per-pack output budget
const MIN_OUTPUT_BUDGET: u64 = 512;

/// Fixed token overhead charged per block (id tag, section framing)
const PER_ITEM_OVERHEAD_TOKENS: u64 = 16;

/// An ordered, non-empty group of blocks bound for one LLM call
///
/// Packs are ephemeral: constructed per invocation and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Pack {
    blocks: Vec<Block>,
}

impl Pack {
    /// Build a pack from blocks; callers must pass at least one block
    pub fn from_blocks(blocks: Vec<Block>) -> Self {
        debug_assert!(!blocks.is_empty(), "packs are never empty");
        Self { blocks }
    }

    /// The blocks in pack order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks in the pack
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false; kept for iterator-style call sites
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block ids in pack order
    pub fn block_ids(&self) -> Vec<BlockId> {
        self.blocks.iter().map(|b| b.id.clone()).collect()
    }

    /// Split into two order-preserving halves (`ceil(n/2)` / remainder)
    ///
    /// A singleton pack is returned unchanged.
    pub fn split(mut self) -> Vec<Pack> {
        if self.blocks.len() <= 1 {
            return vec![self];
        }
        let mid = self.blocks.len().div_ceil(2);
        let tail = self.blocks.split_off(mid);
        vec![Pack::from_blocks(self.blocks), Pack::from_blocks(tail)]
    }

    /// Split into exactly two halves, or `None` for a singleton
    pub fn split_pair(self) -> Option<(Pack, Pack)> {
        if self.blocks.len() <= 1 {
            return None;
        }
        let mut halves = self.split().into_iter();
        match (halves.next(), halves.next()) {
            (Some(first), Some(second)) => Some((first, second)),
            _ => None,
        }
    }
}

/// Greedy packer over claimed blocks
pub struct Packer<'a, E: TokenEstimator> {
    estimator: &'a E,
    config: &'a WorkerConfig,
}

impl<'a, E: TokenEstimator> Packer<'a, E> {
    /// Create a packer over the given estimator and config
    pub fn new(estimator: &'a E, config: &'a WorkerConfig) -> Self {
        Self { estimator, config }
    }

    /// Input tokens available for block content after reserving the output
    /// window, tool overhead, and both prompts
    fn available_input_tokens(&self, system_prompt: &str, user_prompt: &str) -> u64 {
        let budget = self.config.context_window_tokens as i64
            - self.config.output_reserve_tokens as i64
            - self.config.tool_overhead_tokens as i64
            - self.estimator.estimate(system_prompt) as i64
            - self.estimator.estimate(user_prompt) as i64;
        budget.max(MIN_INPUT_BUDGET as i64) as u64
    }

    fn output_budget_per_pack(&self) -> u64 {
        (self.config.max_output_tokens_per_call as u64).max(MIN_OUTPUT_BUDGET)
    }

    fn item_cost(&self, block: &Block) -> u64 {
        let text = format!("{}\n{}\n{}\n", block.id, block.kind, block.content);
        self.estimator.estimate(&text) as u64 + PER_ITEM_OVERHEAD_TOKENS
    }

    /// Pack blocks into ordered, budget-respecting groups
    ///
    /// The result covers the input exactly once, in order. A pack is closed
    /// before adding a block whenever the addition would exceed the item
    /// count cap, the input token budget, or the per-pack output budget.
    pub fn pack(&self, blocks: Vec<Block>, system_prompt: &str, user_prompt: &str) -> Vec<Pack> {
        let available_input = self.available_input_tokens(system_prompt, user_prompt);
        let output_budget = self.output_budget_per_pack();
        let max_items = self.config.effective_pack_size_max();
        let per_item_output = self.config.per_item_output_budget_tokens as u64;

        let mut packs = Vec::new();
        let mut current: Vec<Block> = Vec::new();
        let mut input_sum: u64 = 0;

        for block in blocks {
            let cost = self.item_cost(&block);
            if !current.is_empty() {
                let next_count = current.len() as u64 + 1;
                let over_count = current.len() + 1 > max_items;
                let over_input = input_sum + cost > available_input;
                let over_output = next_count * per_item_output > output_budget;
                if over_count || over_input || over_output {
                    packs.push(Pack::from_blocks(std::mem::take(&mut current)));
                    input_sum = 0;
                }
            }
            input_sum += cost;
            current.push(block);
        }
        if !current.is_empty() {
            packs.push(Pack::from_blocks(current));
        }
        packs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fielder_domain::CharEstimator;

    fn block(id: &str, content: &str) -> Block {
        Block::new(id, "NarrativeText", content)
    }

    fn flat_ids(packs: &[Pack]) -> Vec<BlockId> {
        packs.iter().flat_map(|p| p.block_ids()).collect()
    }

    #[test]
    fn test_empty_input_yields_no_packs() {
        let config = WorkerConfig::default();
        let packer = Packer::new(&CharEstimator, &config);
        assert!(packer.pack(Vec::new(), "sys", "user").is_empty());
    }

    #[test]
    fn test_small_blocks_share_one_pack() {
        let config = WorkerConfig::default();
        let packer = Packer::new(&CharEstimator, &config);
        let blocks = vec![block("a", "one"), block("b", "two"), block("c", "three")];

        let packs = packer.pack(blocks, "sys", "user");
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].len(), 3);
    }

    #[test]
    fn test_item_count_cap() {
        let mut config = WorkerConfig::default();
        config.pack_size_max = 2;
        let packer = Packer::new(&CharEstimator, &config);
        let blocks = vec![
            block("a", "x"),
            block("b", "x"),
            block("c", "x"),
            block("d", "x"),
            block("e", "x"),
        ];

        let packs = packer.pack(blocks, "sys", "user");
        let sizes: Vec<usize> = packs.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn test_input_budget_closes_packs() {
        let mut config = WorkerConfig::default();
        // Leaves the floor of 512 input tokens available
        config.context_window_tokens = 1_000;
        config.output_reserve_tokens = 1_000;
        config.tool_overhead_tokens = 0;
        let packer = Packer::new(&CharEstimator, &config);

        // Each block costs ~266 tokens (1000 bytes / 4 + 16), so two fit
        // under 512 and a third does not.
        let blocks = vec![
            block("a", &"x".repeat(920)),
            block("b", &"x".repeat(920)),
            block("c", &"x".repeat(920)),
        ];

        let packs = packer.pack(blocks, "", "");
        let sizes: Vec<usize> = packs.iter().map(|p| p.len()).collect();
        assert_eq!(sizes, vec![2, 1]);
    }

    #[test]
    fn test_scenario_tight_output_budget_yields_singletons() {
        let mut config = WorkerConfig::default();
        config.pack_size_max = usize::MAX;
        config.per_item_output_budget_tokens = 600;
        config.max_output_tokens_per_call = 1_000;
        let packer = Packer::new(&CharEstimator, &config);

        let blocks = vec![
            block("a", "Alpha"),
            block("b", "Beta Gamma"),
            block("c", "Delta Epsilon"),
        ];

        let packs = packer.pack(blocks, "sys", "user");
        assert_eq!(packs.len(), 3);
        for pack in &packs {
            assert_eq!(pack.len(), 1);
        }
        assert_eq!(
            flat_ids(&packs),
            vec![BlockId::new("a"), BlockId::new("b"), BlockId::new("c")]
        );
    }

    #[test]
    fn test_oversized_block_still_gets_a_pack() {
        let mut config = WorkerConfig::default();
        config.context_window_tokens = 1_000;
        config.output_reserve_tokens = 1_000;
        config.tool_overhead_tokens = 0;
        let packer = Packer::new(&CharEstimator, &config);

        // Far beyond the 512-token floor on its own
        let blocks = vec![block("huge", &"x".repeat(100_000)), block("tiny", "x")];

        let packs = packer.pack(blocks, "", "");
        assert_eq!(packs.len(), 2);
        assert_eq!(packs[0].block_ids(), vec![BlockId::new("huge")]);
        assert_eq!(packs[1].block_ids(), vec![BlockId::new("tiny")]);
    }

    #[test]
    fn test_packing_is_total_and_order_preserving() {
        let mut config = WorkerConfig::default();
        config.pack_size_max = 3;
        let packer = Packer::new(&CharEstimator, &config);

        let blocks: Vec<Block> = (0..17)
            .map(|i| block(&format!("b{:02}", i), &"y".repeat(i * 37)))
            .collect();
        let expected: Vec<BlockId> = blocks.iter().map(|b| b.id.clone()).collect();

        let packs = packer.pack(blocks, "sys", "user");
        assert_eq!(flat_ids(&packs), expected);
        for pack in &packs {
            assert!(pack.len() <= 3);
            assert!(!pack.is_empty());
        }
    }

    #[test]
    fn test_split_covers_parent_in_order() {
        let pack = Pack::from_blocks(vec![
            block("a", "1"),
            block("b", "2"),
            block("c", "3"),
            block("d", "4"),
            block("e", "5"),
        ]);

        let halves = pack.split();
        assert_eq!(halves.len(), 2);
        assert_eq!(
            halves[0].block_ids(),
            vec![BlockId::new("a"), BlockId::new("b"), BlockId::new("c")]
        );
        assert_eq!(
            halves[1].block_ids(),
            vec![BlockId::new("d"), BlockId::new("e")]
        );
    }

    #[test]
    fn test_split_even_count() {
        let pack = Pack::from_blocks(vec![
            block("a", "1"),
            block("b", "2"),
            block("c", "3"),
            block("d", "4"),
        ]);

        let halves = pack.split();
        assert_eq!(halves[0].len(), 2);
        assert_eq!(halves[1].len(), 2);
    }

    #[test]
    fn test_split_singleton_unchanged() {
        let pack = Pack::from_blocks(vec![block("only", "1")]);
        let halves = pack.split();
        assert_eq!(halves.len(), 1);
        assert_eq!(halves[0].block_ids(), vec![BlockId::new("only")]);
    }
}
