use crate::{configuration::ModelConfig, error::LlamaError, gguf::*, layers::*, state::GenerationState, tensor::*};
use anyhow::{Context, Result};
use log::{debug, warn};

/// Decoder-only Llama transformer: embedding, N pre-norm blocks, final norm and classifier.
pub struct LlamaTransformer {
    token_embedding: TokenEmbedding,
    blocks: Vec<LlamaTransformerBlock>,
    final_norm: RMSNorm,
    lm_head: Linear,
    rope: RoPE,
}

impl LlamaTransformer {
    /// Materialises all weights named by the GGUF Llama layout.
    pub(crate) fn load(gguf: &GgufFile, config: &ModelConfig) -> Result<Self> {
        let ModelConfig { dim, hidden_dim, n_layers, vocab_size, rms_norm_eps, .. } = *config;
        let kv_dim = config.kv_dim();

        let embedding_table = load_matrix(gguf, "token_embd.weight", vocab_size, dim)?;

        let blocks = (0..n_layers)
            .map(|layer_idx| -> Result<LlamaTransformerBlock> {
                let name = |suffix: &str| format!("blk.{layer_idx}.{suffix}");

                let attention = MultiHeadAttention::new(
                    Linear::new(load_matrix(gguf, &name("attn_q.weight"), dim, dim)?, dim, dim),
                    Linear::new(load_matrix(gguf, &name("attn_k.weight"), kv_dim, dim)?, dim, kv_dim),
                    Linear::new(load_matrix(gguf, &name("attn_v.weight"), kv_dim, dim)?, dim, kv_dim),
                    Linear::new(load_matrix(gguf, &name("attn_output.weight"), dim, dim)?, dim, dim),
                    config,
                );

                let feed_forward = FeedForward::new(
                    Linear::new(load_matrix(gguf, &name("ffn_gate.weight"), hidden_dim, dim)?, dim, hidden_dim),
                    Linear::new(load_matrix(gguf, &name("ffn_down.weight"), dim, hidden_dim)?, hidden_dim, dim),
                    Linear::new(load_matrix(gguf, &name("ffn_up.weight"), hidden_dim, dim)?, dim, hidden_dim),
                );

                Ok(LlamaTransformerBlock {
                    attn_norm: RMSNorm::new(load_vector(gguf, &name("attn_norm.weight"), dim)?, rms_norm_eps),
                    attention,
                    ffn_norm: RMSNorm::new(load_vector(gguf, &name("ffn_norm.weight"), dim)?, rms_norm_eps),
                    feed_forward,
                    layer_idx,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let final_norm = RMSNorm::new(load_vector(gguf, "output_norm.weight", dim)?, rms_norm_eps);

        let classifier = if gguf.tensor_info("output.weight").is_some() {
            load_matrix(gguf, "output.weight", vocab_size, dim)?
        } else {
            warn!("No output.weight tensor, sharing the token embedding table as classifier");
            embedding_table.clone()
        };

        let rope = RoPE::from_config(config);
        debug!("{rope:?}");

        Ok(Self {
            token_embedding: TokenEmbedding::new(embedding_table, dim),
            blocks,
            final_norm,
            lm_head: Linear::new(classifier, dim, vocab_size),
            rope,
        })
    }

    /// Forward pass through the transformer for one token
    ///
    /// **Process Flow:**
    /// 1. **Token Embedding**: copy the token's row into the residual stream
    /// 2. **Transformer Blocks**: attention and FFN sub-blocks with residual adds
    /// 3. **Final Normalization**: RMSNorm of the residual stream
    /// 4. **Classification Head**: project to vocabulary logits
    ///
    /// The keys and values of `pos` are written into the caches of `state`.
    pub fn forward<'s>(&self, state: &'s mut GenerationState, token: usize, pos: usize) -> &'s mut [f32] {
        self.token_embedding.forward(token, &mut state.x);

        for block in &self.blocks {
            block.forward(pos, &self.rope, state);
        }

        self.final_norm.forward_inplace(&mut state.x);
        self.lm_head.forward(&mut state.logits, &state.x);

        &mut state.logits
    }
}

impl std::fmt::Debug for LlamaTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        struct BlocksSummary<'a, T>(&'a [T]);

        impl<'a, T: std::fmt::Debug> std::fmt::Debug for BlocksSummary<'a, T> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_list()
                    .entries(self.0.iter().take(1))
                    .entry(&format_args!("... and {} more", self.0.len().saturating_sub(1)))
                    .finish()
            }
        }

        f.debug_struct("LlamaTransformer")
            .field("token_embedding", &self.token_embedding)
            .field("blocks", &BlocksSummary(&self.blocks))
            .field("final_norm", &self.final_norm)
            .field("lm_head", &self.lm_head)
            .field("rope", &self.rope)
            .finish()
    }
}

/// Pre-norm decoder layer: attention and SwiGLU feed-forward, each with a residual connection
pub struct LlamaTransformerBlock {
    pub attn_norm: RMSNorm,
    pub attention: MultiHeadAttention,
    pub ffn_norm: RMSNorm,
    pub feed_forward: FeedForward,
    pub layer_idx: usize,
}

impl LlamaTransformerBlock {
    fn forward(&self, pos: usize, rope: &RoPE, state: &mut GenerationState) {
        // Attention block with residual connection
        self.attn_norm.forward(&mut state.xb, &state.x);
        self.attention.forward(pos, self.layer_idx, rope, state);
        state.x.iter_mut().zip(state.xb2.iter()).for_each(|(x_val, &delta)| *x_val += delta);

        // Feed-forward block with residual connection
        self.ffn_norm.forward(&mut state.xb, &state.x);
        self.feed_forward.forward(state);
        state.x.iter_mut().zip(state.xb.iter()).for_each(|(x_val, &delta)| *x_val += delta);
    }
}

impl std::fmt::Debug for LlamaTransformerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("layer_idx", &self.layer_idx)
            .field("attn_norm", &self.attn_norm)
            .field("attention", &self.attention)
            .field("ffn_norm", &self.ffn_norm)
            .field("feed_forward", &self.feed_forward)
            .finish()
    }
}

/// Loads a row-major `rows x cols` matrix stored with `cols` as the fastest dimension.
fn load_matrix(gguf: &GgufFile, name: &str, rows: usize, cols: usize) -> Result<FloatTensor> {
    let (info, bytes) = gguf.tensor_data(name)?;
    let shape_ok = info.dimensions.first() == Some(&cols) && info.num_elements() == rows * cols;
    if !shape_ok {
        anyhow::bail!(LlamaError::Format(format!(
            "Tensor '{name}' has shape {:?}, expected [{cols}, {rows}]",
            info.dimensions
        )));
    }

    FloatTensor::from_bytes(info.ggml_type, info.num_elements(), bytes)
        .with_context(|| format!("Failed to load tensor '{name}'"))
}

/// Loads a dense f32 vector such as a normalization weight.
fn load_vector(gguf: &GgufFile, name: &str, len: usize) -> Result<Vec<f32>> {
    let (info, bytes) = gguf.tensor_data(name)?;
    if info.num_elements() != len {
        anyhow::bail!(LlamaError::Format(format!(
            "Tensor '{name}' has {} elements, expected {len}",
            info.num_elements()
        )));
    }

    match FloatTensor::from_bytes(info.ggml_type, len, bytes)
        .with_context(|| format!("Failed to load tensor '{name}'"))?
    {
        FloatTensor::F32(values) => Ok(values),
        mapped @ FloatTensor::MappedF32(_) => {
            let mut values = vec![0.0; len];
            mapped.copy_to(0, &mut values);
            Ok(values)
        }
        other => anyhow::bail!(LlamaError::UnsupportedType(format!(
            "Tensor '{name}' must be F32 to be used as a vector, got {:?}",
            other.ggml_type()
        ))),
    }
}
