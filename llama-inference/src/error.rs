use thiserror::Error;

/// Failure categories raised by the inference core.
///
/// Functions return `anyhow::Result`, so callers classify a failure with
/// `err.downcast_ref::<LlamaError>()` even after context has been attached.
#[derive(Debug, Error)]
pub enum LlamaError {
    /// Malformed model file: bad magic, unknown value type, truncated data.
    #[error("Invalid model file: {0}")]
    Format(String),

    /// A tensor encoding the engine cannot materialise.
    #[error("Unsupported tensor type: {0}")]
    UnsupportedType(String),

    /// Missing token, merge or special token in the vocabulary.
    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    /// Hyperparameters that violate the model invariants.
    #[error("Invalid model configuration: {0}")]
    Config(String),

    /// A request rejected before any work is done.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
