//! Rowwise N-bit quantization into fused rows.
//!
//! A fused row stores the packed quantized elements followed by an f16 scale
//! and an f16 bias. Quantization is affine per row: `q = round((x - min) /
//! scale)` with `scale = (max - min) / (2^bits - 1)`, evaluated against the
//! f16-rounded parameters that are actually stored so decode sees the same
//! numbers encode used.

use half::f16;

use crate::types::{fused_row_bytes, quantized_row_bytes};

/// Quantize a dense row-major `rows x cols` matrix into fused N-bit rows.
pub fn quantize_rows_nbit(bit_rate: usize, values: &[f32], rows: usize, cols: usize) -> Vec<u8> {
    assert!(bit_rate == 2 || bit_rate == 4, "bit_rate must be 2 or 4");
    assert_eq!(values.len(), rows * cols, "values must be rows * cols");

    let fused = fused_row_bytes(cols, bit_rate);
    let payload = quantized_row_bytes(cols, bit_rate);
    let num_elem_per_byte = 8 / bit_rate;
    let levels = (1u32 << bit_rate) - 1;

    let mut out = vec![0u8; rows * fused];
    for r in 0..rows {
        let row_in = &values[r * cols..(r + 1) * cols];
        let row_out = &mut out[r * fused..(r + 1) * fused];

        let min = row_in.iter().copied().fold(f32::INFINITY, f32::min);
        let max = row_in.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let range = max - min;
        let mut scale_h = f16::from_f32(if range > 0.0 {
            range / levels as f32
        } else {
            1.0
        });
        if scale_h.to_f32() == 0.0 {
            // Sub-f16 ranges collapse to a constant row.
            scale_h = f16::from_f32(1.0);
        }
        let bias_h = f16::from_f32(min);
        let inv_scale = 1.0 / scale_h.to_f32();
        let bias = bias_h.to_f32();

        for (c, &x) in row_in.iter().enumerate() {
            let q = ((x - bias) * inv_scale).round().clamp(0.0, levels as f32) as u8;
            row_out[c / num_elem_per_byte] |= q << ((c % num_elem_per_byte) * bit_rate);
        }
        row_out[payload..payload + 2].copy_from_slice(&scale_h.to_le_bytes());
        row_out[payload + 2..payload + 4].copy_from_slice(&bias_h.to_le_bytes());
    }
    out
}

/// Decode fused N-bit rows back to f32, the exact inverse of the kernel's
/// per-element dequantization.
pub fn dequantize_rows_nbit(bit_rate: usize, fused_rows: &[u8], rows: usize, cols: usize) -> Vec<f32> {
    assert!(bit_rate == 2 || bit_rate == 4, "bit_rate must be 2 or 4");
    let fused = fused_row_bytes(cols, bit_rate);
    let payload = quantized_row_bytes(cols, bit_rate);
    assert_eq!(fused_rows.len(), rows * fused, "input must be rows * fused_row_bytes");

    let num_elem_per_byte = 8 / bit_rate;
    let mask = (1u8 << bit_rate) - 1;

    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let row = &fused_rows[r * fused..(r + 1) * fused];
        let scale = f16::from_le_bytes([row[payload], row[payload + 1]]).to_f32();
        let bias = f16::from_le_bytes([row[payload + 2], row[payload + 3]]).to_f32();
        for c in 0..cols {
            let q = (row[c / num_elem_per_byte] >> ((c % num_elem_per_byte) * bit_rate)) & mask;
            out.push(q as f32 * scale + bias);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_error_is_bounded_by_half_a_step() {
        let rows = 4;
        let cols = 33;
        let mut values = Vec::with_capacity(rows * cols);
        for i in 0..rows * cols {
            values.push(((i * 37) % 100) as f32 / 25.0 - 2.0);
        }
        for &bit_rate in &[2usize, 4] {
            let fused = quantize_rows_nbit(bit_rate, &values, rows, cols);
            let decoded = dequantize_rows_nbit(bit_rate, &fused, rows, cols);
            let levels = ((1u32 << bit_rate) - 1) as f32;
            for r in 0..rows {
                let row = &values[r * cols..(r + 1) * cols];
                let min = row.iter().copied().fold(f32::INFINITY, f32::min);
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let step = (max - min) / levels;
                // Half a step plus slack for the f16 rounding of scale/bias.
                let tol = step * 0.5 + 0.05;
                for c in 0..cols {
                    let err = (decoded[r * cols + c] - row[c]).abs();
                    assert!(err <= tol, "bit_rate={bit_rate} r={r} c={c} err={err} tol={tol}");
                }
            }
        }
    }

    #[test]
    fn constant_row_survives() {
        let values = vec![3.25f32; 8];
        let fused = quantize_rows_nbit(4, &values, 1, 8);
        let decoded = dequantize_rows_nbit(4, &fused, 1, 8);
        for x in decoded {
            assert!((x - 3.25).abs() < 2e-3);
        }
    }

    #[test]
    fn trailer_holds_f16_scale_and_bias() {
        let values = vec![0.0f32, 15.0];
        let fused = quantize_rows_nbit(4, &values, 1, 2);
        // One payload byte, then scale 1.0 and bias 0.0 as f16.
        assert_eq!(fused.len(), 5);
        assert_eq!(fused[0], 0xF0);
        assert_eq!(
            half::f16::from_le_bytes([fused[1], fused[2]]).to_f32(),
            1.0
        );
        assert_eq!(
            half::f16::from_le_bytes([fused[3], fused[4]]).to_f32(),
            0.0
        );
    }
}
