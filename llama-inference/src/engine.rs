#[cfg(test)]
#[path = "../tests/unit/engine_test.rs"]
mod engine_test;

use crate::{InferenceConfig, apply_runtime_settings};
use crate::chat::{ChatFormat, Message, Role};
use crate::error::LlamaError;
use crate::generation::{GenerationStats, generate_tokens};
use crate::models::{Model, ModelBuilder};
use crate::sampler::Sampler;
use anyhow::Result;
use arc_swap::ArcSwap;
use log::info;
use std::sync::Arc;

/// A model together with the configuration it was loaded from.
#[derive(Debug)]
pub struct LoadedModel {
    pub model: Model,
    pub config: InferenceConfig,
}

impl LoadedModel {
    /// Loads the model, then applies the kernel and thread settings of `config`.
    pub fn load(config: InferenceConfig) -> Result<Self> {
        let model = ModelBuilder::new(&config.model_path).with_ctx_length(config.ctx_length).build()?;
        apply_runtime_settings(&config);
        Ok(Self { model, config })
    }

    /// A sampler built from the configured temperature, top-p and seed.
    pub fn sampler(&self) -> Result<Sampler> {
        Sampler::new(self.model.config().vocab_size, self.config.temperature, self.config.topp, self.config.seed)
    }
}

/// Decoded answer of one chat request.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Sampled tokens without the trailing stop token.
    pub tokens: Vec<usize>,
    pub text: String,
    pub stats: GenerationStats,
}

/// Serves chat requests against the current model.
///
/// **Reload**: [`LlamaEngine::reload`] builds the replacement completely before
/// publishing it. Requests that already started keep the model they began with,
/// and a failed reload leaves the previous model in place.
pub struct LlamaEngine {
    current: ArcSwap<LoadedModel>,
}

impl LlamaEngine {
    pub fn new(config: InferenceConfig) -> Result<Self> {
        let loaded = LoadedModel::load(config)?;
        Ok(Self { current: ArcSwap::from_pointee(loaded) })
    }

    pub fn current(&self) -> Arc<LoadedModel> {
        self.current.load_full()
    }

    pub fn reload(&self, config: InferenceConfig) -> Result<()> {
        let loaded = LoadedModel::load(config)?;
        info!("Swapping in model {}", loaded.config.model_path);
        self.current.store(Arc::new(loaded));
        Ok(())
    }

    /// Runs one system/user exchange on a fresh session.
    ///
    /// `on_token` sees every token the loop picks, prompt tokens included.
    pub fn run_prompt(
        &self,
        system_prompt: Option<&str>,
        user_prompt: &str,
        max_tokens: usize,
        on_token: Option<&mut dyn FnMut(usize)>,
    ) -> Result<ChatResponse> {
        let loaded = self.current();
        validate_request(&loaded.config, user_prompt, max_tokens)?;

        let model = &loaded.model;
        let tokenizer = model.tokenizer();
        let format = ChatFormat::new(tokenizer)?;

        let mut dialog = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            dialog.push(Message::new(Role::System, system));
        }
        dialog.push(Message::new(Role::User, user_prompt));
        let prompt_tokens = format.encode_dialog_prompt(&dialog, true)?;

        let stop_tokens = format.stop_tokens();
        let mut sampler = loaded.sampler()?;
        let mut state = model.create_session();

        let response = generate_tokens(
            model,
            &mut state,
            0,
            &prompt_tokens,
            &stop_tokens,
            Some(max_tokens),
            &mut sampler,
            on_token,
        )?;

        let mut tokens = response.tokens;
        if tokens.last().is_some_and(|token| stop_tokens.contains(token)) {
            tokens.pop();
        }
        let text = tokenizer.decode(&tokens);

        Ok(ChatResponse { tokens, text, stats: response.stats })
    }
}

fn validate_request(config: &InferenceConfig, user_prompt: &str, max_tokens: usize) -> Result<()> {
    if user_prompt.trim().is_empty() {
        anyhow::bail!(LlamaError::InvalidRequest("user prompt must not be blank".to_string()));
    }
    if max_tokens == 0 || max_tokens > config.max_tokens {
        anyhow::bail!(LlamaError::InvalidRequest(format!(
            "max_tokens must be in 1..={}, got {max_tokens}",
            config.max_tokens
        )));
    }
    Ok(())
}
