#[cfg(test)]
#[path = "../tests/unit/generation_test.rs"]
mod generation_test;

use crate::error::LlamaError;
use crate::models::Model;
use crate::sampler::Sampler;
use crate::state::GenerationState;
use anyhow::Result;
use log::debug;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// Throughput of one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats {
    /// Positions advanced, prompt tokens included.
    pub total_tokens: usize,
    pub elapsed: Duration,
}

impl GenerationStats {
    pub fn tokens_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.total_tokens as f64 / secs } else { 0.0 }
    }
}

impl std::fmt::Display for GenerationStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} tokens in {:.2}s - {:.2} tokens/sec",
            self.total_tokens,
            self.elapsed.as_secs_f64(),
            self.tokens_per_second()
        )
    }
}

/// Tokens sampled by one generation call (prompt tokens excluded, stop token kept).
#[derive(Debug, Clone)]
pub struct Response {
    pub tokens: Vec<usize>,
    pub stats: GenerationStats,
}

/// Ingests `prompt_tokens`, then samples until a stop token or the position bound.
///
/// Positions run from `start_position` up to `max_tokens`, which is clamped to
/// the context length (`None` means the whole context). At every position the
/// forward pass runs on `state.latest_token`; while prompt tokens remain the
/// next token is taken from the prompt, afterwards it is sampled and checked
/// against `stop_tokens`. Every chosen token, prompt or sampled, is passed to
/// `on_token`.
#[allow(clippy::too_many_arguments)]
pub fn generate_tokens(
    model: &Model,
    state: &mut GenerationState,
    start_position: usize,
    prompt_tokens: &[usize],
    stop_tokens: &HashSet<usize>,
    max_tokens: Option<usize>,
    sampler: &mut Sampler,
    mut on_token: Option<&mut dyn FnMut(usize)>,
) -> Result<Response> {
    let config = model.config();
    if let Some(&token) = prompt_tokens.iter().find(|&&t| t >= config.vocab_size) {
        anyhow::bail!(LlamaError::InvalidRequest(format!(
            "Prompt token {token} outside vocabulary of {}",
            config.vocab_size
        )));
    }

    let bound = max_tokens.map_or(config.context_length, |max| max.min(config.context_length));
    let start_time = Instant::now();

    let mut tokens = Vec::new();
    let mut prompt_index = 0;
    let mut token = state.latest_token;

    for position in start_position..bound {
        let logits = model.forward(state, token, position);

        let (next_token, sampled) = if prompt_index < prompt_tokens.len() {
            // Force-pick token from prompt
            prompt_index += 1;
            (prompt_tokens[prompt_index - 1], false)
        } else {
            let next = sampler.sample(logits);
            tokens.push(next);
            (next, true)
        };

        if let Some(callback) = on_token.as_deref_mut() {
            callback(next_token);
        }

        if sampled && stop_tokens.contains(&next_token) {
            break;
        }

        token = next_token;
        state.latest_token = next_token;
    }

    let stats = GenerationStats { total_tokens: prompt_index + tokens.len(), elapsed: start_time.elapsed() };
    debug!("Generation finished: {stats}");

    Ok(Response { tokens, stats })
}
