use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use thiserror::Error;
use tracing::instrument;

use crate::{sampler::Sampler, scheduler::SchedulerOutputs, sequence::SequenceGroupMetadata};

/// `ModelInput` - The flattened tensor pack handed to the executor for one
/// forward pass.
///
/// Tokens of every scheduled sequence are laid out back to back, one row
/// per token, in scheduling order. The executor owns the KV cache tensors
/// and reads/writes them at the physical slots in `slot_mapping`; the
/// engine never touches KV memory directly.
pub struct ModelInput {
    /// Token ids, `[total_tokens, 1]` i64
    pub input_ids: Tensor,
    /// Absolute position of each token in its sequence, `[total_tokens, 1]` i64
    pub position_ids: Tensor,
    /// Physical KV slot of each token
    /// (`block_number * block_size + offset`), `[total_tokens, 1]` i64
    pub slot_mapping: Tensor,
    /// Per-sequence visible context length after this step, `[num_seqs]` i64
    pub context_lens: Tensor,
    /// Largest entry of `context_lens`
    pub max_context_len: usize,
    /// Per-sequence prompt-phase flag, `[num_seqs]` u8
    pub is_prompt: Tensor,
    /// Physical block numbers per sequence, `[num_seqs, max_num_blocks]`
    /// i32, zero-padded; entries beyond the sequence's table are unused
    pub block_tables: Tensor,
    /// Flattened token indices whose logits the engine needs back,
    /// `[num_logit_rows]` i64
    pub selected_token_indices: Tensor,
    /// Copy-on-write `(src, dst)` block pairs the executor must apply to
    /// the KV cache before the forward pass
    pub blocks_to_copy: Vec<(u32, u32)>,
}

impl ModelInput {
    /// Builds the tensor pack from the scheduler's decision.
    ///
    /// Row layout: for each scheduled group, for each of its sequences in
    /// metadata order, `token_chunk_size` consecutive token rows starting
    /// at the sequence's computed-token offset. The selected logit rows
    /// follow the sampler's convention: none for non-sampling chunks, the
    /// trailing candidate rows plus one for speculative verification, the
    /// final row otherwise.
    #[instrument(skip_all)]
    pub fn from_scheduled(
        sequence_groups_metadata: &[Arc<SequenceGroupMetadata>],
        scheduler_outputs: &SchedulerOutputs,
        block_size: usize,
        device: &Device,
    ) -> Result<Self, ModelExecutorError> {
        let mut input_ids: Vec<i64> = Vec::new();
        let mut position_ids: Vec<i64> = Vec::new();
        let mut slot_mapping: Vec<i64> = Vec::new();
        let mut context_lens: Vec<i64> = Vec::new();
        let mut is_prompt: Vec<u8> = Vec::new();
        let mut block_tables: Vec<Vec<i64>> = Vec::new();
        let mut selected_token_indices: Vec<i64> = Vec::new();

        for metadata in sequence_groups_metadata {
            for (sequence_id, data) in metadata.sequence_data.iter() {
                let all_token_ids = data.get_token_ids();
                let start = data.get_num_computed_tokens();
                let chunk = metadata
                    .token_chunk_size
                    .min(all_token_ids.len().saturating_sub(start));
                if chunk == 0 {
                    continue;
                }
                let table = metadata
                    .block_tables
                    .get(sequence_id)
                    .ok_or(ModelExecutorError::MissingBlockTable(*sequence_id))?;

                let base_row = input_ids.len();
                for position in start..start + chunk {
                    input_ids.push(all_token_ids[position] as i64);
                    position_ids.push(position as i64);
                    let block_number = *table.get(position / block_size).ok_or(
                        ModelExecutorError::SlotOutOfRange(*sequence_id, position),
                    )? as i64;
                    slot_mapping.push(block_number * block_size as i64 + (position % block_size) as i64);
                }

                context_lens.push((start + chunk) as i64);
                is_prompt.push(metadata.is_prompt as u8);
                block_tables.push(table.iter().map(|b| *b as i64).collect());

                let num_logit_rows = Sampler::num_rows_for_sequence(metadata, data);
                for row in (chunk - num_logit_rows.min(chunk))..chunk {
                    selected_token_indices.push((base_row + row) as i64);
                }
            }
        }

        let total_tokens = input_ids.len();
        let num_seqs = context_lens.len();
        let max_context_len = context_lens.iter().copied().max().unwrap_or(0) as usize;
        let max_num_blocks = block_tables.iter().map(|t| t.len()).max().unwrap_or(0);
        let padded_tables: Vec<i64> = block_tables
            .into_iter()
            .flat_map(|mut table| {
                table.resize(max_num_blocks, 0);
                table
            })
            .collect();

        Ok(Self {
            input_ids: Tensor::from_vec(input_ids, (total_tokens, 1), device)?,
            position_ids: Tensor::from_vec(position_ids, (total_tokens, 1), device)?,
            slot_mapping: Tensor::from_vec(slot_mapping, (total_tokens, 1), device)?,
            context_lens: Tensor::from_vec(context_lens, (num_seqs,), device)?,
            max_context_len,
            is_prompt: Tensor::from_vec(is_prompt, (num_seqs,), device)?,
            block_tables: Tensor::from_vec(padded_tables, (num_seqs, max_num_blocks), device)?,
            selected_token_indices: Tensor::from_vec(
                selected_token_indices.clone(),
                (selected_token_indices.len(),),
                device,
            )?,
            blocks_to_copy: scheduler_outputs.blocks_to_copy.clone(),
        })
    }

    /// Number of token rows in the pack
    pub fn num_tokens(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Number of logit rows the executor must return
    pub fn num_selected(&self) -> usize {
        self.selected_token_indices.dims()[0]
    }
}

/// `ModelExecutor` trait - interface to the neural-network inference
/// runtime that executes a forward pass and returns logits.
///
/// The executor owns the KV cache storage. It receives physical slot
/// assignments through `ModelInput` and must return one logits row per
/// selected token index, as `[num_selected, vocab]` f32.
pub trait ModelExecutor {
    /// Performs a forward pass over the flattened batch.
    fn forward(&mut self, input: &ModelInput) -> Result<Tensor, ModelExecutorError>;

    /// End-of-sequence token id of the model, if defined
    fn eos_token_id(&self) -> Option<u32>;

    /// Vocabulary size of the model
    fn vocab_size(&self) -> usize;

    /// Hidden size of the model, used for the speculative cache split
    fn hidden_size(&self) -> usize;

    /// Tensor dtype the executor computes in
    fn dtype(&self) -> DType {
        DType::F32
    }
}

#[derive(Debug, Error)]
pub enum ModelExecutorError {
    #[error("Candle error: `{0}`")]
    CandleError(#[from] candle_core::Error),
    #[error("Missing block table for sequence with id = `{0}`")]
    MissingBlockTable(u64),
    #[error("Slot out of range for sequence `{0}` at position `{1}`")]
    SlotOutOfRange(u64, usize),
    #[error("Executor failure: `{0}`")]
    ExecutionFailure(String),
}
