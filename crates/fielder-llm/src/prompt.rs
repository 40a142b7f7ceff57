//! User-message construction for single and batched extraction calls

use fielder_domain::Block;

/// Builds the user message for extraction calls
///
/// The single shape matches the one-block-per-call wire format; the batched
/// shape tags every block section with its id and spells out the
/// one-result-per-id contract the result mapper later enforces.
pub struct PromptBuilder {
    per_block_prompt: String,
}

impl PromptBuilder {
    /// Create a builder around the schema's per-block instruction
    pub fn new(per_block_prompt: impl Into<String>) -> Self {
        Self {
            per_block_prompt: per_block_prompt.into(),
        }
    }

    /// User message for a single-block call
    pub fn single(&self, block: &Block) -> String {
        format!(
            "{}\n\n---\n\nBlock type: {}\nBlock content:\n{}",
            self.per_block_prompt, block.kind, block.content
        )
    }

    /// User message for a batched call over an ordered pack
    pub fn batch(&self, blocks: &[Block]) -> String {
        let mut prompt = String::new();
        prompt.push_str(&self.per_block_prompt);
        prompt.push_str("\n\n");
        prompt.push_str(BATCH_CONTRACT);
        prompt.push_str("\n");
        for block in blocks {
            prompt.push_str(&format!(
                "\n--- BLOCK {} ---\nBlock type: {}\nBlock content:\n{}\n",
                block.id, block.kind, block.content
            ));
        }
        prompt
    }
}

const BATCH_CONTRACT: &str = "Process each block below independently. \
Return exactly one result per block, keyed by the block id shown in its header. \
Do not skip any block and do not invent block ids.";
