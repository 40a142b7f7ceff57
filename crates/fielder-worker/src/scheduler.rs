//! The batch worker scheduler
//!
//! One invocation is a sequential pipeline: claim a bounded batch of
//! pending overlays, check for cancellation, pack the claimed blocks under
//! token budgets, execute each pack (batched or single-shape), persist
//! results, and finalize the run when nothing remains pending.
//!
//! Overflow and mapping-mismatch failures split the pack in two and requeue
//! both halves at the front of the worklist, which reproduces the
//! processing order of synchronous recursion. Auth failures abort the whole
//! invocation: still-claimed overlays are released through the two-phase
//! protocol and the credential is invalidated.

use crate::config::WorkerConfig;
use crate::error::{truncate_error, WorkerError, ERROR_MESSAGE_LIMIT};
use crate::mapper::map_batch_results;
use crate::packer::{Pack, Packer};
use crate::retry::{next_attempt, RetryDecision};
use crate::usage::{BatchingMetrics, UsageAccumulator, UsageTotals};
use fielder_domain::{
    BlockId, BlockStore, CharEstimator, Credential, CredentialStore, ExtractionSchema,
    OverlayStatus, ReleaseScope, RunId, RunStatus, RunStore, StoreError, TokenEstimator,
    WorkQueue, WorkerId,
};
use fielder_llm::{
    BatchExtraction, BatchRequest, CallEnvelope, LlmClient, LlmError, SingleExtraction,
    SingleRequest, PROVIDER_ANTHROPIC,
};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Current timestamp in seconds since Unix epoch
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Summary returned to the dispatcher after one invocation
///
/// Always produced, including on partial block failures; the only path
/// that skips it is the auth abort.
#[derive(Debug, Clone, Serialize)]
pub struct RunBatchSummary {
    /// Worker id generated for this invocation
    pub worker_id: WorkerId,
    /// The run processed
    pub run_id: RunId,
    /// Overlays claimed at the start of the invocation
    pub claimed: usize,
    /// Blocks whose extraction succeeded
    pub succeeded: usize,
    /// Blocks that failed this invocation (retrying or terminal)
    pub failed: usize,
    /// Overlays still pending or claimed after this invocation
    pub remaining_pending: usize,
    /// Accumulated usage across all calls
    pub usage: UsageTotals,
    /// Pack/call shape counters
    pub batching: BatchingMetrics,
}

/// What became of one pack execution
enum PackOutcome {
    /// Every block reached a terminal transition for this invocation
    Completed,
    /// The pack was split; both halves go back on the worklist
    Split(Pack, Pack),
}

/// Mutable bookkeeping for one invocation
#[derive(Default)]
struct InvocationState {
    succeeded: usize,
    failed: usize,
    usage: UsageAccumulator,
    metrics: BatchingMetrics,
    credential_validated: bool,
}

/// Immutable call context shared by every pack of an invocation
struct PackContext<'a> {
    run_id: &'a RunId,
    owner_id: &'a str,
    model: &'a str,
    schema: &'a ExtractionSchema,
    credential: &'a Credential,
}

/// The batch worker scheduler
///
/// Generic over the LLM client, the store (which must implement all four
/// store traits), and the token estimator used for packing.
pub struct WorkerScheduler<C, S, E = CharEstimator> {
    client: Arc<C>,
    store: Arc<S>,
    estimator: E,
    config: WorkerConfig,
}

impl<C, S> WorkerScheduler<C, S, CharEstimator>
where
    C: LlmClient,
    S: WorkQueue + BlockStore + RunStore + CredentialStore,
{
    /// Create a scheduler with the default chars/4 token estimator
    pub fn new(client: Arc<C>, store: Arc<S>, config: WorkerConfig) -> Self {
        Self {
            client,
            store,
            estimator: CharEstimator,
            config,
        }
    }
}

impl<C, S, E> WorkerScheduler<C, S, E>
where
    C: LlmClient,
    S: WorkQueue + BlockStore + RunStore + CredentialStore,
    E: TokenEstimator,
{
    /// Replace the token estimator (e.g. with an exact tokenizer)
    pub fn with_estimator<E2: TokenEstimator>(self, estimator: E2) -> WorkerScheduler<C, S, E2> {
        WorkerScheduler {
            client: self.client,
            store: self.store,
            estimator,
            config: self.config,
        }
    }

    /// Process one batch of pending overlays for `run_id`
    ///
    /// Claims up to the configured batch size, executes packs, persists
    /// per-block outcomes, recomputes the run rollup, and finalizes the
    /// run when nothing remains pending.
    pub async fn run_batch(&self, run_id: &RunId) -> Result<RunBatchSummary, WorkerError> {
        self.config.validate().map_err(WorkerError::Config)?;

        let worker_id = WorkerId::generate();
        let claimed = self
            .store
            .claim(run_id, self.config.effective_batch_size(), &worker_id)
            .await?;
        info!(
            "worker {} claimed {} overlays for run {}",
            worker_id,
            claimed.len(),
            run_id
        );

        if claimed.is_empty() {
            let counts = self.store.status_counts(run_id).await?;
            return Ok(self.summary(worker_id, run_id, 0, InvocationState::default(), counts.remaining()));
        }

        // Run lookup failure releases everything we just claimed.
        let run = match self.store.run(run_id).await {
            Ok(run) => run,
            Err(err) => {
                let message =
                    truncate_error(&format!("run lookup failed: {}", err), ERROR_MESSAGE_LIMIT);
                self.release_claimed(run_id, &worker_id, &claimed, Some(&message))
                    .await?;
                return Err(match err {
                    StoreError::NotFound(_) => WorkerError::RunNotFound(run_id.to_string()),
                    other => WorkerError::Store(other),
                });
            }
        };

        // Cancellation is checked once, right after claiming. Claimed
        // overlays go back untouched and no LLM call is made.
        if run.status == RunStatus::Cancelled {
            info!("run {} is cancelled; releasing {} overlays", run_id, claimed.len());
            self.release_claimed(run_id, &worker_id, &claimed, None).await?;
            let counts = self.store.status_counts(run_id).await?;
            return Ok(self.summary(
                worker_id,
                run_id,
                claimed.len(),
                InvocationState::default(),
                counts.remaining(),
            ));
        }

        let Some(schema) = run.schema.clone() else {
            self.release_claimed(run_id, &worker_id, &claimed, Some("extraction schema missing"))
                .await?;
            return Err(WorkerError::SchemaMissing(run_id.to_string()));
        };

        let credential = match self.store.resolve(&run.owner_id, PROVIDER_ANTHROPIC).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                self.release_claimed(run_id, &worker_id, &claimed, Some("no credential available"))
                    .await?;
                return Err(WorkerError::NoCredential(run.owner_id.clone()));
            }
            Err(err) => {
                self.release_claimed(run_id, &worker_id, &claimed, Some("credential lookup failed"))
                    .await?;
                return Err(WorkerError::Store(err));
            }
        };

        let model = run.resolved_model(None);
        let context = PackContext {
            run_id,
            owner_id: &run.owner_id,
            model: &model,
            schema: &schema,
            credential: &credential,
        };

        // Everything past this point tracks which overlays reached a
        // terminal transition, so an abort can release exactly the
        // still-claimed remainder.
        let mut state = InvocationState::default();
        let mut settled: HashSet<BlockId> = HashSet::new();

        if let Err(err) = self
            .process_claimed(&context, &claimed, &mut state, &mut settled)
            .await
        {
            let in_flight: Vec<BlockId> = claimed
                .iter()
                .filter(|id| !settled.contains(*id))
                .cloned()
                .collect();
            let message = truncate_error(&err.to_string(), ERROR_MESSAGE_LIMIT);
            self.release_claimed(run_id, &worker_id, &in_flight, Some(&message))
                .await?;
            return Err(err);
        }

        let counts = self.store.status_counts(run_id).await?;
        self.store
            .update_counts(run_id, counts.done, counts.failed)
            .await?;
        if counts.remaining() == 0 {
            info!("run {} has no remaining work; finalizing", run_id);
            self.store
                .finalize(run_id, RunStatus::Complete, current_timestamp())
                .await?;
        }

        info!(
            "worker {} finished run {}: {} succeeded, {} failed, {} remaining",
            worker_id, run_id, state.succeeded, state.failed, counts.remaining()
        );
        Ok(self.summary(worker_id, run_id, claimed.len(), state, counts.remaining()))
    }

    fn summary(
        &self,
        worker_id: WorkerId,
        run_id: &RunId,
        claimed: usize,
        state: InvocationState,
        remaining_pending: usize,
    ) -> RunBatchSummary {
        RunBatchSummary {
            worker_id,
            run_id: run_id.clone(),
            claimed,
            succeeded: state.succeeded,
            failed: state.failed,
            remaining_pending,
            usage: state.usage.totals(),
            batching: state.metrics,
        }
    }

    /// Load content, pack, and drive the ordered worklist of packs
    async fn process_claimed(
        &self,
        context: &PackContext<'_>,
        claimed: &[BlockId],
        state: &mut InvocationState,
        settled: &mut HashSet<BlockId>,
    ) -> Result<(), WorkerError> {
        let block_map = self.store.blocks(claimed).await?;

        let mut blocks = Vec::with_capacity(claimed.len());
        for block_id in claimed {
            match block_map.get(block_id) {
                Some(block) => blocks.push(block.clone()),
                None => {
                    // Retrying can never materialize missing content, so
                    // this bypasses the retry ledger entirely.
                    warn!("block {} has no content; failing terminally", block_id);
                    self.store
                        .fail_terminal(context.run_id, block_id, "block content not found")
                        .await?;
                    settled.insert(block_id.clone());
                    state.failed += 1;
                }
            }
        }

        let packer = Packer::new(&self.estimator, &self.config);
        let packs = packer.pack(
            blocks,
            &context.schema.prompt.system_instructions,
            &context.schema.prompt.per_block_prompt,
        );
        state.metrics.record_packs_built(packs.len());
        debug!(
            "packed {} blocks into {} packs for run {}",
            claimed.len(),
            packs.len(),
            context.run_id
        );

        let mut worklist: VecDeque<Pack> = packs.into();
        while let Some(pack) = worklist.pop_front() {
            match self.execute_pack(context, &pack, state, settled).await? {
                PackOutcome::Completed => {}
                PackOutcome::Split(first, second) => {
                    worklist.push_front(second);
                    worklist.push_front(first);
                }
            }
        }
        Ok(())
    }

    /// Execute one pack: batched when it has more than one block
    async fn execute_pack(
        &self,
        context: &PackContext<'_>,
        pack: &Pack,
        state: &mut InvocationState,
        settled: &mut HashSet<BlockId>,
    ) -> Result<PackOutcome, WorkerError> {
        if pack.len() > 1 {
            state.metrics.record_batch_call();
            let request = BatchRequest {
                call: self.envelope(context, self.batch_max_tokens(pack.len())),
                blocks: pack.blocks().to_vec(),
            };
            match self.call_batch(&request).await {
                Ok(batch) => {
                    state.usage.record(&batch.usage);
                    self.settle_batch(context, pack, batch, state, settled).await
                }
                Err(err) => self.handle_call_failure(context, pack, err, state, settled).await,
            }
        } else {
            state.metrics.record_single_call();
            let block = pack.blocks()[0].clone();
            let block_id = block.id.clone();
            let request = SingleRequest {
                call: self.envelope(context, context.schema.prompt.max_tokens_per_block),
                block,
            };
            match self.call_single(&request).await {
                Ok(single) => {
                    state.usage.record(&single.usage);
                    self.store
                        .mark_done(context.run_id, &block_id, single.fields)
                        .await?;
                    settled.insert(block_id);
                    state.succeeded += 1;
                    self.note_success(context, state).await?;
                    Ok(PackOutcome::Completed)
                }
                Err(err) => self.handle_call_failure(context, pack, err, state, settled).await,
            }
        }
    }

    /// Map a batched response onto the pack and persist per-block results
    async fn settle_batch(
        &self,
        context: &PackContext<'_>,
        pack: &Pack,
        batch: BatchExtraction,
        state: &mut InvocationState,
        settled: &mut HashSet<BlockId>,
    ) -> Result<PackOutcome, WorkerError> {
        match map_batch_results(&pack.block_ids(), batch.results) {
            Ok(mapped) => {
                for (block_id, fields) in mapped {
                    self.store.mark_done(context.run_id, &block_id, fields).await?;
                    settled.insert(block_id);
                    state.succeeded += 1;
                }
                self.note_success(context, state).await?;
                Ok(PackOutcome::Completed)
            }
            Err(mismatch) => {
                state.metrics.record_mapping_mismatch();
                warn!(
                    "batched response rejected for pack of {}: {}",
                    pack.len(),
                    mismatch
                );
                if let Some((first, second)) = pack.clone().split_pair() {
                    state.metrics.record_split();
                    Ok(PackOutcome::Split(first, second))
                } else {
                    self.fail_pack_blocks(context, pack, &mismatch.to_string(), state, settled)
                        .await?;
                    Ok(PackOutcome::Completed)
                }
            }
        }
    }

    /// Route a classified call failure: abort, split, or retry ledger
    async fn handle_call_failure(
        &self,
        context: &PackContext<'_>,
        pack: &Pack,
        err: LlmError,
        state: &mut InvocationState,
        settled: &mut HashSet<BlockId>,
    ) -> Result<PackOutcome, WorkerError> {
        if err.is_auth() {
            warn!(
                "provider rejected credential for owner {}; aborting invocation",
                context.owner_id
            );
            self.store
                .invalidate(context.owner_id, PROVIDER_ANTHROPIC)
                .await?;
            return Err(WorkerError::AuthRejected(truncate_error(
                &err.to_string(),
                ERROR_MESSAGE_LIMIT,
            )));
        }

        if err.is_overflow() {
            if let Some((first, second)) = pack.clone().split_pair() {
                debug!("overflow on pack of {}; splitting in two", pack.len());
                state.metrics.record_split();
                return Ok(PackOutcome::Split(first, second));
            }
        }

        // Unclassified failure, or an overflow that can no longer split.
        self.fail_pack_blocks(context, pack, &err.to_string(), state, settled)
            .await?;
        Ok(PackOutcome::Completed)
    }

    /// Send every block of a pack through the retry ledger
    async fn fail_pack_blocks(
        &self,
        context: &PackContext<'_>,
        pack: &Pack,
        message: &str,
        state: &mut InvocationState,
        settled: &mut HashSet<BlockId>,
    ) -> Result<(), WorkerError> {
        let message = truncate_error(message, ERROR_MESSAGE_LIMIT);
        for block in pack.blocks() {
            let attempts = self.store.attempt_count(context.run_id, &block.id).await?;
            let decision = next_attempt(attempts, self.config.max_retries);
            self.store
                .mark_attempt(
                    context.run_id,
                    &block.id,
                    decision.attempt_count(),
                    decision.next_status(),
                    &message,
                )
                .await?;
            match decision {
                RetryDecision::Retry { attempt_count } => debug!(
                    "block {} back to pending (attempt {}): {}",
                    block.id, attempt_count, message
                ),
                RetryDecision::GiveUp { attempt_count } => info!(
                    "block {} failed terminally after {} attempts: {}",
                    block.id, attempt_count, message
                ),
            }
            settled.insert(block.id.clone());
            state.failed += 1;
        }
        Ok(())
    }

    /// Two-phase release of claimed overlays back to `pending`
    ///
    /// Phase 1 is scoped to this worker's claims. Ids it cannot resolve
    /// (ownership drift) are retried unscoped against anything still in
    /// `pending`/`claimed`. Ids unresolved after both phases are an
    /// inconsistent-queue hard error, never swallowed.
    async fn release_claimed(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
        block_ids: &[BlockId],
        error: Option<&str>,
    ) -> Result<(), WorkerError> {
        if block_ids.is_empty() {
            return Ok(());
        }

        let resolved = self
            .store
            .release(
                run_id,
                ReleaseScope::OwnedBy(worker_id.clone()),
                block_ids,
                OverlayStatus::Pending,
                error,
            )
            .await?;
        let resolved: HashSet<BlockId> = resolved.into_iter().collect();
        let unresolved: Vec<BlockId> = block_ids
            .iter()
            .filter(|id| !resolved.contains(*id))
            .cloned()
            .collect();
        if unresolved.is_empty() {
            return Ok(());
        }

        warn!(
            "release drift: {} overlays no longer owned by {}; retrying unscoped",
            unresolved.len(),
            worker_id
        );
        let resolved = self
            .store
            .release(
                run_id,
                ReleaseScope::AnyClaimant,
                &unresolved,
                OverlayStatus::Pending,
                error,
            )
            .await?;
        let resolved: HashSet<BlockId> = resolved.into_iter().collect();
        let still_unresolved: Vec<String> = unresolved
            .iter()
            .filter(|id| !resolved.contains(*id))
            .map(|id| id.to_string())
            .collect();
        if !still_unresolved.is_empty() {
            return Err(WorkerError::InconsistentQueue(still_unresolved));
        }
        Ok(())
    }

    /// On the first success with an owner-scoped credential, record it valid
    async fn note_success(
        &self,
        context: &PackContext<'_>,
        state: &mut InvocationState,
    ) -> Result<(), WorkerError> {
        if context.credential.owner_scoped && !state.credential_validated {
            self.store
                .mark_valid(context.owner_id, PROVIDER_ANTHROPIC)
                .await?;
            state.credential_validated = true;
        }
        Ok(())
    }

    fn envelope(&self, context: &PackContext<'_>, max_tokens: u32) -> CallEnvelope {
        CallEnvelope {
            model: context.model.to_string(),
            temperature: context.schema.prompt.temperature,
            max_tokens,
            system_prompt: context.schema.prompt.system_instructions.clone(),
            per_block_prompt: context.schema.prompt.per_block_prompt.clone(),
            schema_properties: context.schema.properties.clone(),
            prompt_caching: self.config.prompt_caching_enabled,
            credential: context.credential.clone(),
        }
    }

    fn batch_max_tokens(&self, pack_len: usize) -> u32 {
        batch_max_tokens(&self.config, pack_len)
    }

    async fn call_single(&self, request: &SingleRequest) -> Result<SingleExtraction, LlmError> {
        match timeout(self.config.llm_call_timeout(), self.client.extract_single(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Http(format!(
                "call timed out after {}s",
                self.config.llm_call_timeout_secs
            ))),
        }
    }

    async fn call_batch(&self, request: &BatchRequest) -> Result<BatchExtraction, LlmError> {
        match timeout(self.config.llm_call_timeout(), self.client.extract_batch(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Http(format!(
                "call timed out after {}s",
                self.config.llm_call_timeout_secs
            ))),
        }
    }
}

/// Output token cap for a batched call over `pack_len` blocks
fn batch_max_tokens(config: &WorkerConfig, pack_len: usize) -> u32 {
    (pack_len as u32)
        .saturating_mul(config.per_item_output_budget_tokens)
        .min(config.max_output_tokens_per_call)
}
