//! Llama 3 inference on quantized GGUF checkpoints.
//!
//! The crate reads GGUF model files, tokenizes with byte-level BPE, runs the
//! transformer forward pass over F32, Q8_0 and Q4_0 weights, and samples
//! tokens with greedy, categorical or nucleus strategies.

pub mod chat;
pub mod configuration;
pub mod engine;
pub mod error;
pub mod generation;
pub mod gguf;
pub mod kernels;
pub mod layers;
pub mod models;
pub mod sampler;
pub mod state;
pub mod tensor;
pub mod tokenizer;

mod runner;
mod utils;

#[cfg(test)]
#[path = "../tests/common/gguf_writer.rs"]
pub(crate) mod gguf_writer;

use anyhow::Result;
use log::{debug, info, warn};
use std::time::{SystemTime, UNIX_EPOCH};

pub use crate::engine::{ChatResponse, LlamaEngine, LoadedModel};
pub use crate::error::LlamaError;
pub use crate::generation::{GenerationStats, Response, generate_tokens};
pub use crate::gguf::GgufFile;
pub use crate::models::{Model, ModelBuilder};
pub use crate::sampler::Sampler;
pub use crate::state::GenerationState;
pub use crate::tokenizer::{StreamDecoder, Tokenizer};
pub use crate::utils::TensorBytes;

/// Environment switch for the SIMD-lane dot products, read when the config leaves it unset.
pub const VECTOR_API_ENV: &str = "LLAMA_VECTOR_API";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Chat,
}

impl std::str::FromStr for Mode {
    type Err = LlamaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(Mode::Generate),
            "chat" => Ok(Mode::Chat),
            other => Err(LlamaError::Config(format!("Unknown mode '{other}', expected generate|chat"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub model_path: String,
    pub temperature: f32,
    pub topp: f32,
    pub seed: u64,
    pub ctx_length: Option<usize>,
    /// Upper bound on positions for one request.
    pub max_tokens: usize,
    pub mode: Mode,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    pub threads: Option<usize>,
    pub vector_kernels: bool,
}

impl InferenceConfig {
    pub fn builder() -> InferenceConfigBuilder {
        InferenceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct InferenceConfigBuilder {
    model_path: Option<String>,
    temperature: Option<f32>,
    topp: Option<f32>,
    seed: Option<u64>,
    ctx_length: Option<usize>,
    max_tokens: Option<usize>,
    mode: Option<String>,
    prompt: Option<String>,
    system_prompt: Option<String>,
    threads: Option<usize>,
    vector_kernels: Option<bool>,
}

impl InferenceConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }
    pub fn topp(mut self, topp: Option<f32>) -> Self {
        self.topp = topp;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
    pub fn ctx_length(mut self, ctx_length: Option<usize>) -> Self {
        self.ctx_length = ctx_length;
        self
    }
    pub fn max_tokens(mut self, max_tokens: Option<usize>) -> Self {
        self.max_tokens = max_tokens;
        self
    }
    pub fn mode(mut self, mode: Option<&String>) -> Self {
        self.mode = mode.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn system_prompt(mut self, system_prompt: Option<&String>) -> Self {
        self.system_prompt = system_prompt.cloned();
        self
    }
    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
    pub fn vector_kernels(mut self, enabled: Option<bool>) -> Self {
        self.vector_kernels = enabled;
        self
    }

    pub fn build(self) -> Result<InferenceConfig> {
        let model_path = self
            .model_path
            .ok_or_else(|| LlamaError::Config("model_path is required".to_string()))?;

        let temperature = self.temperature.unwrap_or(0.1);
        if temperature.is_nan() || temperature < 0.0 {
            anyhow::bail!(LlamaError::Config(format!("temperature must be >= 0, got {temperature}")));
        }

        let topp = self.topp.unwrap_or(0.95);
        if !(0.0..=1.0).contains(&topp) {
            anyhow::bail!(LlamaError::Config(format!("topp must be in [0, 1], got {topp}")));
        }

        let max_tokens = self.max_tokens.unwrap_or(512);
        if max_tokens == 0 {
            anyhow::bail!(LlamaError::Config("max_tokens must be positive".to_string()));
        }

        let mode = match self.mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => Mode::Chat,
        };

        Ok(InferenceConfig {
            model_path,
            temperature,
            topp,
            seed: self.seed.unwrap_or_else(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |elapsed| elapsed.as_secs())
            }),
            ctx_length: self.ctx_length,
            max_tokens,
            mode,
            prompt: self.prompt,
            system_prompt: self.system_prompt,
            threads: self.threads,
            vector_kernels: self.vector_kernels.unwrap_or_else(vector_kernels_from_env),
        })
    }
}

/// `false` only when the environment switch is explicitly set to `false`.
fn vector_kernels_from_env() -> bool {
    std::env::var(VECTOR_API_ENV).map_or(true, |value| !value.trim().eq_ignore_ascii_case("false"))
}

/// Applies the process-wide settings of `config`: the dot product kernels and
/// the size of the rayon pool.
///
/// The pool can only be sized once per process; later requests keep the
/// existing pool and log a warning.
pub fn apply_runtime_settings(config: &InferenceConfig) {
    if let Some(threads) = config.threads {
        if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(threads).build_global() {
            warn!("Keeping existing worker pool of {} threads: {e}", rayon::current_num_threads());
        }
    }

    kernels::set_vector_kernels(config.vector_kernels);
    if config.vector_kernels {
        info!(
            "Using {}-bit vector dot products on {} threads",
            match kernels::LaneKernels::preferred().width() {
                kernels::LaneWidth::Bits128 => 128,
                kernels::LaneWidth::Bits256 => 256,
            },
            rayon::current_num_threads()
        );
    } else {
        info!("Using scalar dot products on {} threads", rayon::current_num_threads());
    }
}

/// Runs inference.
pub fn run_inference(inference_config: InferenceConfig) -> Result<()> {
    debug!("{inference_config:#?}");

    apply_runtime_settings(&inference_config);

    let model = ModelBuilder::new(&inference_config.model_path)
        .with_ctx_length(inference_config.ctx_length)
        .build()?;

    let mut sampler = Sampler::new(
        model.config().vocab_size,
        inference_config.temperature,
        inference_config.topp,
        inference_config.seed,
    )?;
    debug!("Sampling strategy: {:?}", sampler.strategy());

    let prompt = inference_config.prompt.as_deref();
    let system_prompt = inference_config.system_prompt.as_deref();
    let max_tokens = inference_config.max_tokens;

    match inference_config.mode {
        Mode::Generate => runner::generate(&model, &mut sampler, prompt, max_tokens),
        Mode::Chat => runner::chat(&model, &mut sampler, prompt, system_prompt, max_tokens),
    }
}

/// Prints the header, metadata and tensor table of a GGUF file.
pub fn inspect_model(model_path: &str) -> Result<()> {
    let gguf = GgufFile::open(model_path)?;

    println!("GGUF version {} ({})", gguf.version(), model_path);
    println!("alignment: {}, data offset: {}", gguf.alignment(), gguf.data_offset());

    let mut keys: Vec<_> = gguf.metadata().keys().collect();
    keys.sort();
    println!("\nmetadata ({} entries):", keys.len());
    for key in keys {
        if let Some(value) = gguf.get(key) {
            println!("  {key:<48} {value}");
        }
    }

    println!("\ntensors ({}):", gguf.tensor_infos().len());
    for info in gguf.tensor_infos() {
        println!(
            "  {:<40} {:<6} {:<20} offset {}",
            info.name,
            format!("{:?}", info.ggml_type),
            format!("{:?}", info.dimensions),
            info.offset
        );
    }

    Ok(())
}
