//! generator.rs
//!
//! Lyric generation: a seed sentence built from a [`FeatureRecord`] plus the user's
//! prompt, continued by a causal language model.
//!
//! The tokenizer and model are plain trait objects owned by a [`LyricGenerator`], so a
//! caller decides when they are loaded and tests can swap in fakes.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::error::LyrgenError;
use crate::features::FeatureRecord;
use crate::sampling::{Sampler, SamplingParams};

pub trait TextTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
    fn eos_token_id(&self) -> Option<u32>;
}

pub trait LanguageModel {
    /// Continue `input_ids` until `max_len` ids in total or `eos` is drawn.
    /// The returned sequence starts with `input_ids`.
    fn generate(
        &mut self,
        input_ids: &[u32],
        max_len: usize,
        eos: Option<u32>,
        sampler: &mut Sampler,
    ) -> Result<Vec<u32>>;
}

#[derive(Clone, Debug)]
pub struct GenerationParams {
    /// Tokens to sample beyond the seed
    pub max_length: usize,
    pub sampling: SamplingParams,
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_length: 50, sampling: SamplingParams::default(), seed: None }
    }
}

/// The exact text handed to the model.
pub fn seed_text(record: &FeatureRecord, prompt: &str) -> String {
    format!("Tempo at {:.1}, AvgDur: {:.2}. {}", record.tempo(), record.avg_duration(), prompt)
}

/// Total sequence length a model with `context_len` positions can produce.
///
/// A seed that does not fit is an error; a longer budget is capped at the context.
pub fn generation_limit(seed_len: usize, max_len: usize, context_len: usize) -> Result<usize> {
    if seed_len > context_len {
        return Err(LyrgenError::ContextOverflow(seed_len, context_len).into());
    }
    if max_len > context_len {
        warn!(requested = max_len, context = context_len, "truncating generation to model context");
        return Ok(context_len);
    }
    Ok(max_len)
}

/// Autoregressive loop shared by model backends.
///
/// `next_logits` receives the whole sequence so far and returns the logits for the
/// position after its last token.
pub fn sample_until<F>(
    input_ids: &[u32],
    max_len: usize,
    eos: Option<u32>,
    sampler: &mut Sampler,
    mut next_logits: F,
) -> Result<Vec<u32>>
where
    F: FnMut(&[u32]) -> Result<Vec<f32>>,
{
    let mut ids = input_ids.to_vec();
    while ids.len() < max_len {
        let logits = next_logits(&ids)?;
        let next = sampler.sample(&logits)?;
        ids.push(next);
        if Some(next) == eos {
            break;
        }
    }
    Ok(ids)
}

pub struct LyricGenerator<T, M> {
    tokenizer: T,
    model: M,
}

impl<T: TextTokenizer, M: LanguageModel> LyricGenerator<T, M> {
    pub fn new(tokenizer: T, model: M) -> Self {
        Self { tokenizer, model }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Generate text from the record and prompt. The result includes the seed.
    pub fn generate(&mut self, record: &FeatureRecord, prompt: &str, params: &GenerationParams) -> Result<String> {
        let seed = seed_text(record, prompt);
        let input_ids = self.tokenizer.encode(&seed)?;
        if input_ids.is_empty() {
            return Err(LyrgenError::EmptyPrompt.into());
        }

        let max_len = input_ids.len() + params.max_length;
        debug!(seed = %seed, seed_tokens = input_ids.len(), max_len, "generating");

        let mut sampler = Sampler::new(params.sampling, params.seed);
        let output = self.model.generate(&input_ids, max_len, self.tokenizer.eos_token_id(), &mut sampler)?;
        info!(new_tokens = output.len().saturating_sub(input_ids.len()), "generation finished");

        self.tokenizer.decode(&output, true)
    }
}

/// Holds an expensive value that is built on first use and reused afterwards.
pub struct ModelSlot<G> {
    value: Option<G>,
    loads: usize,
}

impl<G> Default for ModelSlot<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> ModelSlot<G> {
    pub const fn new() -> Self {
        Self { value: None, loads: 0 }
    }

    /// Run `load` only if nothing is held yet. A failed load leaves the slot empty.
    pub fn get_or_try_load<F>(&mut self, load: F) -> Result<&mut G>
    where
        F: FnOnce() -> Result<G>,
    {
        let value = match self.value.take() {
            Some(v) => v,
            None => {
                let v = load()?;
                self.loads += 1;
                v
            }
        };
        Ok(self.value.insert(value))
    }

    pub fn is_loaded(&self) -> bool {
        self.value.is_some()
    }

    /// How many times a loader has succeeded.
    pub fn loads(&self) -> usize {
        self.loads
    }
}
