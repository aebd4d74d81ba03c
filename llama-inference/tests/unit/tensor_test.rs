use super::*;
use crate::gguf_writer::{f32_bytes, pseudo_random};

fn mapped_f32(values: &[f32]) -> Result<FloatTensor> {
    FloatTensor::from_bytes(GgmlType::F32, values.len(), TensorBytes::from_vec(f32_bytes(values)))
}

fn assert_close(actual: f32, expected: f32, rel: f32) {
    let tolerance = rel * expected.abs().max(1.0);
    assert!((actual - expected).abs() <= tolerance, "{actual} vs {expected} (tolerance {tolerance})");
}

#[test]
fn test_q8_0_quantization_error_is_small() -> Result<()> {
    let values = pseudo_random(1, 128);
    let tensor = FloatTensor::quantize(GgmlType::Q8_0, &values)?;

    assert_eq!(tensor.ggml_type(), GgmlType::Q8_0);
    assert_eq!(tensor.size(), 128);
    for (i, &v) in values.iter().enumerate() {
        // half a quantization step of a block with absmax <= 1
        assert!((tensor.get(i) - v).abs() <= 1.0 / 127.0, "element {i}: {} vs {v}", tensor.get(i));
    }

    Ok(())
}

#[test]
fn test_q4_0_nibble_layout() -> Result<()> {
    // scale 1.0: element j is the low nibble of byte j, element j + 16 the high nibble
    let mut block = half::f16::from_f32(1.0).to_le_bytes().to_vec();
    block.extend((0..16u8).map(|j| (j % 16) | (((15 - j) % 16) << 4)));
    let tensor = FloatTensor::from_bytes(GgmlType::Q4_0, 32, TensorBytes::from_vec(block))?;

    for j in 0..16 {
        assert_eq!(tensor.get(j), j as f32 - 8.0);
        assert_eq!(tensor.get(j + 16), (15 - j) as f32 - 8.0);
    }

    Ok(())
}

#[test]
fn test_q4_0_quantization_error_is_small() -> Result<()> {
    let values = pseudo_random(2, 64);
    let tensor = FloatTensor::quantize(GgmlType::Q4_0, &values)?;

    for (i, &v) in values.iter().enumerate() {
        // one step of a 16-level grid over [-1, 1]
        assert!((tensor.get(i) - v).abs() <= 1.0 / 8.0 + 1e-3, "element {i}: {} vs {v}", tensor.get(i));
    }

    Ok(())
}

#[test]
fn test_vector_and_scalar_dot_agree() -> Result<()> {
    let values = pseudo_random(3, 256);
    let that = pseudo_random(4, 256);

    let tensors = [
        FloatTensor::quantize(GgmlType::F32, &values)?,
        mapped_f32(&values)?,
        FloatTensor::quantize(GgmlType::Q8_0, &values)?,
        FloatTensor::quantize(GgmlType::Q4_0, &values)?,
    ];
    for tensor in &tensors {
        for (this_offset, that_offset, size) in [(0, 0, 256), (0, 0, 32), (5, 3, 100), (31, 0, 2), (33, 7, 190), (64, 64, 0)] {
            let scalar = tensor.scalar_dot(this_offset, &that, that_offset, size);
            let vector = tensor.vector_dot(this_offset, &that, that_offset, size);
            assert_close(vector, scalar, 1e-3);
        }
    }

    Ok(())
}

#[test]
fn test_dense_dot_matches_plain_sum() {
    let tensor = FloatTensor::F32(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
    let that = [2.0, 2.0, 2.0, 2.0, 2.0];

    assert_eq!(tensor.scalar_dot(1, &that, 0, 3), 18.0);
    assert_eq!(tensor.vector_dot(0, &that, 0, 5), 30.0);
}

#[test]
fn test_matmul_rows() -> Result<()> {
    let rows = 3;
    let cols = 64;
    let weights = pseudo_random(5, rows * cols);
    let input = pseudo_random(6, cols);

    let tensors = [
        FloatTensor::quantize(GgmlType::F32, &weights)?,
        mapped_f32(&weights)?,
        FloatTensor::quantize(GgmlType::Q8_0, &weights)?,
        FloatTensor::quantize(GgmlType::Q4_0, &weights)?,
    ];
    for tensor in &tensors {
        let mut out = vec![0.0; rows];
        tensor.matmul(&input, &mut out, rows, cols);

        for (i, &value) in out.iter().enumerate() {
            assert_close(value, tensor.scalar_dot(i * cols, &input, 0, cols), 1e-3);
        }
    }

    Ok(())
}

#[test]
fn test_copy_to_decodes_window() -> Result<()> {
    let values = pseudo_random(7, 64);
    let tensor = FloatTensor::quantize(GgmlType::Q8_0, &values)?;

    let mut out = vec![0.0; 10];
    tensor.copy_to(30, &mut out);

    for (i, &v) in out.iter().enumerate() {
        assert_eq!(v, tensor.get(30 + i));
    }

    Ok(())
}

#[test]
fn test_only_dense_tensors_are_writable() -> Result<()> {
    let mut dense = FloatTensor::F32(vec![0.0; 4]);
    dense.set(2, 1.5)?;
    assert_eq!(dense.get(2), 1.5);
    assert!(dense.set(4, 1.0).is_err());

    let mut quantized = FloatTensor::quantize(GgmlType::Q8_0, &[0.0; 32])?;
    let err = quantized.set(0, 1.0).unwrap_err();
    assert!(matches!(err.downcast_ref::<LlamaError>(), Some(LlamaError::UnsupportedType(_))));

    Ok(())
}

#[test]
fn test_from_bytes_validates_length_and_type() {
    let short = FloatTensor::from_bytes(GgmlType::Q8_0, 32, TensorBytes::from_vec(vec![0; 33]));
    assert!(matches!(short.unwrap_err().downcast_ref::<LlamaError>(), Some(LlamaError::Format(_))));

    let unsupported = FloatTensor::from_bytes(GgmlType::F16, 2, TensorBytes::from_vec(vec![0; 4]));
    assert!(matches!(unsupported.unwrap_err().downcast_ref::<LlamaError>(), Some(LlamaError::UnsupportedType(_))));
}

#[test]
fn test_from_bytes_keeps_f32_in_place() -> Result<()> {
    let bytes: Vec<u8> = [1.0f32, -2.5, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
    let mut tensor = FloatTensor::from_bytes(GgmlType::F32, 3, TensorBytes::from_vec(bytes))?;

    assert!(matches!(tensor, FloatTensor::MappedF32(_)));
    assert_eq!(tensor.ggml_type(), GgmlType::F32);
    assert_eq!(tensor.size(), 3);
    assert_eq!(tensor.get(1), -2.5);
    assert!(tensor.as_f32().is_none());

    let mut out = [0.0; 2];
    tensor.copy_to(1, &mut out);
    assert_eq!(out, [-2.5, 4.0]);
    assert_eq!(tensor.vector_dot(0, &[2.0, 2.0, 1.0], 0, 3), 1.0);

    let err = tensor.set(0, 3.0).unwrap_err();
    assert!(matches!(err.downcast_ref::<LlamaError>(), Some(LlamaError::UnsupportedType(_))));

    Ok(())
}

#[test]
fn test_encoders_require_whole_blocks() {
    assert!(encode_q8_0(&[0.0; 31]).is_err());
    assert!(encode_q4_0(&[0.0; 40]).is_err());
    assert_eq!(encode_q8_0(&[0.0; 64]).map(|b| b.len()).ok(), Some(68));
    assert_eq!(encode_q4_0(&[0.0; 64]).map(|b| b.len()).ok(), Some(36));
}

#[test]
#[should_panic]
fn test_get_out_of_range_panics() {
    let tensor = FloatTensor::quantize(GgmlType::Q4_0, &[0.0; 32]).unwrap();
    tensor.get(32);
}
