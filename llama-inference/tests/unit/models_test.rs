use super::*;
use crate::error::LlamaError;
use crate::gguf_writer::{BEGIN_OF_TEXT, GGML_TYPE_Q4_0, GGML_TYPE_Q8_0, TinyLlama, dense};
use crate::tensor::{encode_q4_0, encode_q8_0};

fn quantized(name: &str, values: &[f32]) -> (u32, Vec<u8>) {
    if name.contains("ffn") {
        (GGML_TYPE_Q4_0, encode_q4_0(values).unwrap())
    } else {
        (GGML_TYPE_Q8_0, encode_q8_0(values).unwrap())
    }
}

fn load(tiny: &TinyLlama, encode: crate::gguf_writer::MatrixEncoder<'_>) -> Result<Model> {
    let gguf = GgufFile::from_bytes(tiny.to_gguf(encode))?;
    Model::from_gguf(&gguf, None)
}

#[test]
fn test_load_tiny_model() -> Result<()> {
    let tiny = TinyLlama::new();
    let model = load(&tiny, &dense)?;

    let config = model.config();
    assert_eq!(config.dim, 32);
    assert_eq!(config.n_layers, 1);
    assert_eq!(config.kv_dim(), 16);
    assert_eq!(config.vocab_size, 6);
    assert_eq!(config.context_length, 16);
    assert_eq!(model.tokenizer().special_token(BEGIN_OF_TEXT), Some(4));

    Ok(())
}

#[test]
fn test_session_starts_at_begin_of_text() -> Result<()> {
    let model = load(&TinyLlama::new(), &dense)?;
    let state = model.create_session();

    assert_eq!(state.latest_token, 4);
    assert_eq!(state.key_cache.len(), 1);
    assert_eq!(state.key_cache[0].len(), 16 * 16);
    assert_eq!(state.logits.len(), 6);

    Ok(())
}

#[test]
fn test_forward_is_deterministic_and_finite() -> Result<()> {
    for encode in [&dense as crate::gguf_writer::MatrixEncoder<'_>, &quantized] {
        let model = load(&TinyLlama::new(), encode)?;

        let run = || {
            let mut state = model.create_session();
            let mut all = Vec::new();
            for (pos, token) in [4, 2, 3].into_iter().enumerate() {
                all.push(model.forward(&mut state, token, pos).to_vec());
            }
            all
        };

        let first = run();
        assert_eq!(first, run());
        assert!(first.iter().flatten().all(|v| v.is_finite()));
        assert_ne!(first[0], first[1]);
    }

    Ok(())
}

#[test]
fn test_later_positions_do_not_change_earlier_logits() -> Result<()> {
    let model = load(&TinyLlama::new(), &dense)?;

    let mut state = model.create_session();
    let at_zero = model.forward(&mut state, 1, 0).to_vec();
    model.forward(&mut state, 2, 1);

    let mut fresh = model.create_session();
    assert_eq!(model.forward(&mut fresh, 1, 0).to_vec(), at_zero);

    Ok(())
}

#[test]
fn test_tied_classifier_uses_embeddings() -> Result<()> {
    let tiny = TinyLlama { tied_embeddings: true, ..TinyLlama::new() };
    let model = load(&tiny, &dense)?;

    let mut state = model.create_session();
    let logits = model.forward(&mut state, 0, 0);
    assert_eq!(logits.len(), 6);
    assert!(logits.iter().all(|v| v.is_finite()));

    Ok(())
}

#[test]
fn test_missing_tensor_fails_to_load() -> Result<()> {
    let tiny = TinyLlama { n_layers: 2, ..TinyLlama::new() };
    let mut bytes = tiny.to_gguf(&dense);
    // rename the second layer's query weight so it can no longer be found
    let needle = b"blk.1.attn_q.weight";
    let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap();
    bytes[at + 4] = b'9';

    let gguf = GgufFile::from_bytes(bytes)?;
    let err = Model::from_gguf(&gguf, None).unwrap_err();
    assert!(matches!(err.downcast_ref::<LlamaError>(), Some(LlamaError::Format(msg)) if msg.contains("blk.1.attn_q.weight")));

    Ok(())
}

#[test]
fn test_matrix_shape_is_checked() -> Result<()> {
    let tiny = TinyLlama { n_kv_heads: 4, ..TinyLlama::new() };
    let mut bytes = tiny.to_gguf(&dense);
    // declare two KV heads while the weights were written for four
    let needle = b"llama.attention.head_count_kv";
    let at = bytes.windows(needle.len()).position(|w| w == needle).unwrap() + needle.len() + 4;
    bytes[at..at + 4].copy_from_slice(&2u32.to_le_bytes());

    let gguf = GgufFile::from_bytes(bytes)?;
    let err = Model::from_gguf(&gguf, None).unwrap_err();
    assert!(format!("{err:#}").contains("attn_k.weight"));

    Ok(())
}

#[test]
fn test_context_length_override() -> Result<()> {
    let gguf = GgufFile::from_bytes(TinyLlama::new().to_gguf(&dense))?;

    assert_eq!(Model::from_gguf(&gguf, Some(8))?.config().context_length, 8);
    assert_eq!(Model::from_gguf(&gguf, Some(64))?.config().context_length, 16);

    Ok(())
}

#[test]
#[should_panic(expected = "outside context")]
fn test_forward_past_context_panics() {
    let model = load(&TinyLlama::new(), &dense).unwrap();
    let mut state = model.create_session();
    model.forward(&mut state, 0, 16);
}

#[test]
fn test_builder_loads_from_disk() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("tiny.gguf");
    std::fs::write(&path, TinyLlama::new().to_gguf(&dense))?;

    let model = ModelBuilder::new(path.to_str().unwrap()).with_ctx_length(Some(4)).build()?;
    assert_eq!(model.config().context_length, 4);

    assert!(ModelBuilder::new("/nonexistent/model.gguf").build().is_err());

    Ok(())
}
