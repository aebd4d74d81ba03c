use super::*;
use crate::gguf::GgmlType;
use crate::gguf_writer::{f32_bytes, pseudo_random};
use crate::tensor::{FloatTensor, encode_q4_0, encode_q8_0};
use crate::utils::TensorBytes;
use anyhow::Result;

fn available_kernels() -> Vec<LaneKernels> {
    [LaneWidth::Bits128, LaneWidth::Bits256].into_iter().filter_map(LaneKernels::for_width).collect()
}

fn assert_close(actual: f32, expected: f32) {
    let tolerance = 1e-4 * expected.abs().max(1.0);
    assert!((actual - expected).abs() <= tolerance, "{actual} vs {expected}");
}

#[test]
fn test_lane_widths() {
    assert_eq!(LaneWidth::Bits128.lanes(), 4);
    assert_eq!(LaneWidth::Bits256.lanes(), 8);
    assert!(LaneWidth::Bits128.is_supported());

    let portable = LaneKernels::for_width(LaneWidth::Bits128).unwrap();
    assert_eq!(portable.width(), LaneWidth::Bits128);
    assert_eq!(LaneKernels::for_width(LaneWidth::Bits256).is_some(), LaneWidth::Bits256.is_supported());
}

#[test]
fn test_preferred_kernels_use_widest_supported_width() {
    let expected = if LaneWidth::Bits256.is_supported() { LaneWidth::Bits256 } else { LaneWidth::Bits128 };
    assert_eq!(LaneKernels::preferred().width(), expected);
}

#[test]
fn test_block_kernels_match_scalar_decoding() -> Result<()> {
    let values = pseudo_random(21, QK);
    let x = pseudo_random(22, QK);
    let q8 = encode_q8_0(&values)?;
    let q4 = encode_q4_0(&values)?;
    let le = f32_bytes(&values);

    let expected_q8: f32 = (0..QK).map(|i| q8_0_value(&q8, i) * x[i]).sum();
    let expected_q4: f32 = (0..QK).map(|i| q4_0_value(&q4, i) * x[i]).sum();
    let expected_dense: f32 = values.iter().zip(&x).map(|(a, b)| a * b).sum();

    for kernels in available_kernels() {
        assert_close(kernels.q8_0_block(&q8, &x), expected_q8);
        assert_close(kernels.q4_0_block(&q4, &x), expected_q4);
        assert_close(kernels.dense(&values, &x), expected_dense);
        assert_close(kernels.dense_le(&le, &x), expected_dense);
    }

    Ok(())
}

#[test]
fn test_every_width_agrees_with_scalar_dot() -> Result<()> {
    let values = pseudo_random(23, 320);
    let that = pseudo_random(24, 320);

    let tensors = [
        FloatTensor::quantize(GgmlType::F32, &values)?,
        FloatTensor::from_bytes(GgmlType::F32, values.len(), TensorBytes::from_vec(f32_bytes(&values)))?,
        FloatTensor::quantize(GgmlType::Q8_0, &values)?,
        FloatTensor::quantize(GgmlType::Q4_0, &values)?,
    ];

    for kernels in available_kernels() {
        for tensor in &tensors {
            // unaligned starts and lengths that leave lane and block remainders
            for (this_offset, that_offset, size) in [(0, 0, 320), (3, 1, 61), (32, 0, 96), (45, 9, 203), (7, 7, 5)] {
                let scalar = tensor.scalar_dot(this_offset, &that, that_offset, size);
                let lane = tensor.lane_dot(&kernels, this_offset, &that, that_offset, size);
                assert!(
                    (lane - scalar).abs() <= 1e-3 * scalar.abs().max(1.0),
                    "{:?} {tensor:?} at {this_offset}+{size}: {lane} vs {scalar}",
                    kernels.width()
                );
            }
        }
    }

    Ok(())
}
