use std::sync::Arc;

use parking_lot::Mutex;
use tokenizers::Tokenizer;

use crate::{
    error::ServiceError,
    model::{SamplingParams, adapter::AdapterSource},
    sampling::Sampler,
};

const EOS_CANDIDATES: [&str; 5] = ["<|endoftext|>", "</s>", "<|eot_id|>", "<|im_end|>", "<eos>"];

/// A causal language model that yields next-token logits for a sequence.
pub trait LogitsModel: Send {
    /// Logits over the vocabulary for the position after `input_ids`.
    fn next_token_logits(&mut self, input_ids: &[u32]) -> Result<Vec<f32>, ServiceError>;

    /// Merges adapter weights into the model in place.
    fn apply_adapter(&mut self, adapter: &AdapterSource) -> Result<(), ServiceError>;
}

/// Text in, text out. Implementations block; callers run them on the
/// blocking pool.
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Completion, ServiceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens: usize,
}

/// Weights and tokenizer for one checkpoint, before it is wrapped for
/// generation. Adapters are merged at this stage.
pub struct Checkpoint {
    pub source: String,
    pub tokenizer: Arc<Tokenizer>,
    pub model: Box<dyn LogitsModel>,
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpoint")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub max_input_tokens: usize,
    pub repetition_penalty: f32,
}

/// Tokenize, sample and decode loop over a [`LogitsModel`].
pub struct CausalGenerator {
    tokenizer: Arc<Tokenizer>,
    model: Mutex<Box<dyn LogitsModel>>,
    eos_token_id: Option<u32>,
    settings: GenerationSettings,
    seed: Option<u64>,
}

impl CausalGenerator {
    pub fn new(checkpoint: Checkpoint, settings: GenerationSettings) -> Self {
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|token| checkpoint.tokenizer.token_to_id(token));
        Self {
            tokenizer: checkpoint.tokenizer,
            model: Mutex::new(checkpoint.model),
            eos_token_id,
            settings,
            seed: None,
        }
    }

    /// Fixes the sampler seed, for reproducible output.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl TextGenerator for CausalGenerator {
    fn generate(&self, prompt: &str, params: &SamplingParams) -> Result<Completion, ServiceError> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| ServiceError::GenerationFailed(format!("tokenizer: {e}")))?;
        let mut input_ids: Vec<u32> = encoding.get_ids().to_vec();
        input_ids.truncate(self.settings.max_input_tokens);
        if input_ids.is_empty() {
            return Err(ServiceError::GenerationFailed(
                "prompt produced no tokens".into(),
            ));
        }
        let prompt_len = input_ids.len();

        let mut sampler = Sampler::new(
            params.temperature,
            params.top_p,
            self.settings.repetition_penalty,
        );
        if let Some(seed) = self.seed {
            sampler = sampler.with_seed(seed);
        }

        {
            let mut model = self.model.lock();
            for _ in 0..params.max_tokens {
                let logits = model.next_token_logits(&input_ids)?;
                let next = sampler.sample(&logits, &input_ids)?;
                input_ids.push(next);
                if Some(next) == self.eos_token_id {
                    break;
                }
            }
        }

        let generated = &input_ids[prompt_len..];
        let text = self
            .tokenizer
            .decode(generated, true)
            .map_err(|e| ServiceError::GenerationFailed(format!("tokenizer: {e}")))?;

        Ok(Completion {
            text,
            tokens: generated.len(),
        })
    }
}
