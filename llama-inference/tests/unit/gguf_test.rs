use super::*;
use crate::gguf_writer::{GGML_TYPE_F32, GGML_TYPE_Q8_0, GgufWriter, Value, f32_bytes};

fn downcast(err: &anyhow::Error) -> Option<&LlamaError> {
    err.downcast_ref::<LlamaError>()
}

#[test]
fn test_parse_metadata_and_tensors() -> Result<()> {
    let bytes = GgufWriter::new()
        .string("general.architecture", "llama")
        .u32("llama.block_count", 2)
        .f32("llama.rope.freq_base", 500000.0)
        .metadata("flag", Value::Bool(true))
        .metadata("big", Value::U64(1 << 40))
        .metadata("tokenizer.ggml.tokens", Value::strings(&["a", "b", "c"]))
        .f32_tensor("norm.weight", &[4], &[1.0, 2.0, 3.0, 4.0])
        .f32_tensor("other.weight", &[2, 2], &[5.0, 6.0, 7.0, 8.0])
        .build();

    let gguf = GgufFile::from_bytes(bytes)?;

    assert_eq!(gguf.version(), 3);
    assert_eq!(gguf.alignment(), DEFAULT_ALIGNMENT);
    assert_eq!(gguf.data_offset() % DEFAULT_ALIGNMENT, 0);
    assert_eq!(gguf.get("general.architecture").and_then(MetadataValue::as_str), Some("llama"));
    assert_eq!(gguf.get("llama.block_count").and_then(MetadataValue::as_usize), Some(2));
    assert_eq!(gguf.get("llama.rope.freq_base").and_then(MetadataValue::as_f32), Some(500000.0));
    assert_eq!(gguf.get("flag").and_then(MetadataValue::as_bool), Some(true));
    assert_eq!(gguf.get("big").and_then(MetadataValue::as_i64), Some(1 << 40));

    let tokens = gguf.get("tokenizer.ggml.tokens").and_then(MetadataValue::as_array).unwrap();
    assert_eq!(tokens.len(), 3);
    assert_eq!(tokens[1].as_str(), Some("b"));

    assert_eq!(gguf.tensor_infos().len(), 2);
    let (info, data) = gguf.tensor_data("other.weight")?;
    assert_eq!(info.dimensions, vec![2, 2]);
    assert_eq!(info.ggml_type, GgmlType::F32);
    assert_eq!(info.num_elements(), 4);
    assert_eq!(info.offset % DEFAULT_ALIGNMENT, 0);
    assert_eq!(&data[..], &f32_bytes(&[5.0, 6.0, 7.0, 8.0])[..]);

    Ok(())
}

#[test]
fn test_version_2_and_custom_alignment() -> Result<()> {
    let bytes = GgufWriter::new()
        .version(2)
        .alignment(64)
        .f32_tensor("a", &[3], &[1.0, 2.0, 3.0])
        .f32_tensor("b", &[1], &[9.0])
        .build();

    let gguf = GgufFile::from_bytes(bytes)?;

    assert_eq!(gguf.version(), 2);
    assert_eq!(gguf.alignment(), 64);
    assert_eq!(gguf.data_offset() % 64, 0);
    assert_eq!(gguf.tensor_info("b").map(|info| info.offset), Some(64));
    let (_, data) = gguf.tensor_data("b")?;
    assert_eq!(&data[..], &9.0f32.to_le_bytes()[..]);

    Ok(())
}

#[test]
fn test_file_without_tensors() -> Result<()> {
    let gguf = GgufFile::from_bytes(GgufWriter::new().string("general.name", "empty").build())?;

    assert!(gguf.tensor_infos().is_empty());
    assert_eq!(gguf.metadata().len(), 1);
    assert_eq!(format!("{}", gguf.get("general.name").unwrap()), "\"empty\"");

    Ok(())
}

#[test]
fn test_rejects_bad_magic() {
    let mut bytes = GgufWriter::new().build();
    bytes[0] = b'X';

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(matches!(downcast(&err), Some(LlamaError::Format(msg)) if msg.contains("magic")));
}

#[test]
fn test_rejects_unsupported_version() {
    let err = GgufFile::from_bytes(GgufWriter::new().version(1).build()).unwrap_err();
    assert!(matches!(downcast(&err), Some(LlamaError::Format(msg)) if msg.contains("version")));
}

#[test]
fn test_rejects_truncated_header() {
    let bytes = GgufWriter::new().string("general.name", "truncated").build();
    let truncated = bytes[..bytes.len() - 4].to_vec();

    let err = GgufFile::from_bytes(truncated).unwrap_err();
    assert!(err.chain().any(|cause| matches!(cause.downcast_ref::<LlamaError>(), Some(LlamaError::Format(_)))));
}

#[test]
fn test_rejects_unknown_tensor_type() {
    let bytes = GgufWriter::new().tensor("w", &[32], 99, vec![0; 64]).build();

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(format!("{err:#}").contains("Unknown tensor type id: 99"));
}

#[test]
fn test_rejects_tensor_past_end_of_file() {
    let mut bytes = GgufWriter::new().tensor("w", &[32], GGML_TYPE_Q8_0, vec![0; 34]).build();
    bytes.truncate(bytes.len() - 1);

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(matches!(downcast(&err), Some(LlamaError::Format(msg)) if msg.contains("past the end")));
}

#[test]
fn test_rejects_oversized_array() {
    let mut bytes = GgufWriter::new().metadata("list", Value::Array(4, vec![Value::U32(1)])).build();
    // array length field sits after magic, version, counts, key and the two type ids
    let length_at = 4 + 4 + 8 + 8 + 8 + "list".len() + 4 + 4;
    bytes[length_at..length_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(format!("{err:#}").contains("exceeds"));
}

#[test]
fn test_rejects_nested_array() {
    let nested = Value::Array(9, vec![Value::Array(4, vec![Value::U32(1)])]);
    let bytes = GgufWriter::new().metadata("nested", nested).build();

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(err.chain().any(|cause| matches!(
        cause.downcast_ref::<LlamaError>(),
        Some(LlamaError::Format(msg)) if msg.contains("Nested metadata arrays")
    )));
}

#[test]
fn test_deeply_nested_arrays_fail_without_recursing() {
    let depth = 200_000;
    let mut bytes = Vec::with_capacity(40 + depth * 12);
    bytes.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(&0u64.to_le_bytes());
    bytes.extend_from_slice(&1u64.to_le_bytes());
    bytes.extend_from_slice(&(b"deep".len() as u64).to_le_bytes());
    bytes.extend_from_slice(b"deep");
    bytes.extend_from_slice(&9u32.to_le_bytes());
    for _ in 0..depth {
        bytes.extend_from_slice(&9u32.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
    }

    let err = GgufFile::from_bytes(bytes).unwrap_err();
    assert!(format!("{err:#}").contains("Nested metadata arrays are not supported"));
}

#[test]
fn test_missing_tensor_lookup() -> Result<()> {
    let gguf = GgufFile::from_bytes(GgufWriter::new().f32_tensor("present", &[1], &[1.0]).build())?;

    assert!(gguf.tensor_info("absent").is_none());
    let err = gguf.tensor_data("absent").unwrap_err();
    assert!(matches!(downcast(&err), Some(LlamaError::Format(msg)) if msg.contains("absent")));

    Ok(())
}

#[test]
fn test_ggml_type_sizes() -> Result<()> {
    assert_eq!(GgmlType::from_id(GGML_TYPE_F32)?, GgmlType::F32);
    assert_eq!(GgmlType::from_id(GGML_TYPE_Q8_0)?, GgmlType::Q8_0);
    assert_eq!(GgmlType::Q4_0.id(), 2);
    assert_eq!(GgmlType::Q8_0.byte_size(64)?, 68);
    assert_eq!(GgmlType::Q4_0.byte_size(64)?, 36);
    assert_eq!(GgmlType::F32.byte_size(3)?, 12);
    assert!(GgmlType::Q4_0.byte_size(33).is_err());
    assert!(GgmlType::from_id(4).is_err());

    Ok(())
}

#[test]
fn test_array_display_is_summarised() {
    let value = MetadataValue::Array(vec![MetadataValue::I32(1), MetadataValue::I32(2)]);
    assert_eq!(value.to_string(), "[i32; 2]");
    assert_eq!(MetadataValue::Array(Vec::new()).to_string(), "[empty; 0]");
}

#[test]
fn test_open_reads_file_from_disk() -> Result<()> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("model.gguf");
    std::fs::write(&path, GgufWriter::new().f32_tensor("w", &[2], &[0.5, -0.5]).build())?;

    let gguf = GgufFile::open(&path)?;
    let (_, data) = gguf.tensor_data("w")?;
    assert_eq!(&data[..], &f32_bytes(&[0.5, -0.5])[..]);

    assert!(GgufFile::open(dir.path().join("missing.gguf")).is_err());

    Ok(())
}
