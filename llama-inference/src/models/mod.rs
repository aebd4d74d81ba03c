#[cfg(test)]
#[path = "../../tests/unit/models_test.rs"]
mod models_test;

use crate::{
    chat::BEGIN_OF_TEXT, configuration::ModelConfig, gguf::GgufFile, state::GenerationState, tokenizer::Tokenizer,
};
use anyhow::Result;
use log::{debug, info};

mod llama;

pub use llama::LlamaTransformer;

/// A fully loaded model: configuration, tokenizer and weights.
///
/// A `Model` is immutable after loading; wrap it in an `Arc` to share it
/// between sessions and threads. All mutable inference data lives in
/// [`GenerationState`].
pub struct Model {
    config: ModelConfig,
    tokenizer: Tokenizer,
    transformer: LlamaTransformer,
}

impl Model {
    /// Builds a model from a parsed GGUF file.
    ///
    /// `ctx_length` shrinks the context window (and KV cache); values that are
    /// zero or larger than the model's own context length are ignored.
    pub fn from_gguf(gguf: &GgufFile, ctx_length: Option<usize>) -> Result<Self> {
        let tokenizer = Tokenizer::from_gguf(gguf)?;
        debug!("{tokenizer:#?}");

        let config = ModelConfig::from_gguf(gguf, tokenizer.vocab_size(), ctx_length)?;
        debug!("{config:#?}");

        let transformer = LlamaTransformer::load(gguf, &config)?;
        debug!("{transformer:#?}");

        Ok(Self { config, tokenizer, transformer })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Fresh buffers and caches, seeded with the beginning-of-text token when the vocabulary has one.
    pub fn create_session(&self) -> GenerationState {
        let mut state = GenerationState::new(&self.config);
        if let Some(bos) = self.tokenizer.special_token(BEGIN_OF_TEXT) {
            state.latest_token = bos;
        }
        state
    }

    /// Runs one decoding step and returns the logits stored in `state`.
    ///
    /// Panics when `token` is outside the vocabulary or `pos` outside the context window.
    pub fn forward<'s>(&self, state: &'s mut GenerationState, token: usize, pos: usize) -> &'s mut [f32] {
        assert!(token < self.config.vocab_size, "token {token} outside vocabulary of {}", self.config.vocab_size);
        assert!(pos < self.config.context_length, "position {pos} outside context of {}", self.config.context_length);

        self.transformer.forward(state, token, pos)
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer)
            .field("transformer", &self.transformer)
            .finish()
    }
}

/// Builder pattern for loading models from disk
pub struct ModelBuilder {
    model_path: String,
    ctx_length: Option<usize>,
}

impl ModelBuilder {
    pub fn new(model_path: &str) -> Self {
        Self { model_path: model_path.to_string(), ctx_length: None }
    }

    pub fn with_ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }

    pub fn build(self) -> Result<Model> {
        let gguf = GgufFile::open(&self.model_path)?;
        debug!("{gguf:#?}");

        let model = Model::from_gguf(&gguf, self.ctx_length)?;

        let config = model.config();
        info!(
            "Loaded {}: {} layers, dim {}, vocab {}, context {}",
            self.model_path, config.n_layers, config.dim, config.vocab_size, config.context_length
        );

        Ok(model)
    }
}
