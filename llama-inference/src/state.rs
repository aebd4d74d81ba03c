use crate::configuration::ModelConfig;

/// Mutable per-session buffers for the forward pass.
///
/// Everything here is owned by one generation session; the model weights are
/// shared read-only between sessions. Buffers are pre-allocated once so the
/// forward pass never allocates.
#[derive(Debug)]
pub struct GenerationState {
    /// Residual stream
    /// Shape: [dim]
    pub x: Vec<f32>,

    /// Normalized input of the current sub-block, then its output
    /// Shape: [dim]
    pub xb: Vec<f32>,

    /// Attention output projection
    /// Shape: [dim]
    pub xb2: Vec<f32>,

    /// FFN gate activations
    /// Shape: [hidden_dim]
    pub hb: Vec<f32>,

    /// FFN up activations
    /// Shape: [hidden_dim]
    pub hb2: Vec<f32>,

    /// Query for the current position
    /// Shape: [dim]
    pub q: Vec<f32>,

    /// Key for the current position
    /// Shape: [kv_dim]
    pub k: Vec<f32>,

    /// Value for the current position
    /// Shape: [kv_dim]
    pub v: Vec<f32>,

    /// Attention scores
    /// Shape: [n_heads, context_length]
    pub att: Vec<f32>,

    /// Output logits over the vocabulary
    /// Shape: [vocab_size]
    pub logits: Vec<f32>,

    /// Per-layer key cache
    /// Shape: [n_layers] × [context_length, kv_dim]
    pub key_cache: Vec<Vec<f32>>,

    /// Per-layer value cache
    /// Shape: [n_layers] × [context_length, kv_dim]
    pub value_cache: Vec<Vec<f32>>,

    /// Token fed into the next forward pass.
    pub latest_token: usize,
}

impl GenerationState {
    pub fn new(config: &ModelConfig) -> Self {
        let ModelConfig { dim, hidden_dim, n_layers, n_heads, vocab_size, context_length, .. } = *config;
        let kv_dim = config.kv_dim();

        Self {
            x: vec![0.0; dim],
            xb: vec![0.0; dim],
            xb2: vec![0.0; dim],
            hb: vec![0.0; hidden_dim],
            hb2: vec![0.0; hidden_dim],
            q: vec![0.0; dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; n_heads * context_length],
            logits: vec![0.0; vocab_size],
            key_cache: (0..n_layers).map(|_| vec![0.0; context_length * kv_dim]).collect(),
            value_cache: (0..n_layers).map(|_| vec![0.0; context_length * kv_dim]).collect(),
            latest_token: 0,
        }
    }
}
