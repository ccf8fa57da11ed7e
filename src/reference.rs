//! Scalar reference implementation of the N-bit lookup kernels.
//!
//! This is the fallback path on CPUs without a SIMD target and the oracle
//! the JIT back-ends are validated against. It follows the same protocol as
//! the generated code: `false` reports an out-of-range index or a length-sum
//! mismatch, and bags finished before the fault keep their output.

use half::f16;

use crate::types::{fused_row_bytes, quantized_row_bytes, SlsIndex};

/// Shape parameters captured by the scalar fallback closure.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScalarShape {
    pub bit_rate: usize,
    pub block_size: usize,
    pub has_weight: bool,
    pub normalize_by_lengths: bool,
    pub is_weight_positional: bool,
}

/// Dense N-bit sparse-length-sum over fused rows.
///
/// `data_size` is the number of rows addressable through `input`; `lengths`
/// partitions `indices` into one bag per output row.
#[allow(clippy::too_many_arguments)]
pub fn embedding_sls_nbit_ref<I: SlsIndex>(
    bit_rate: usize,
    block_size: usize,
    data_size: i64,
    input: &[u8],
    indices: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
    out: &mut [f32],
) -> bool {
    debug_assert!(bit_rate == 2 || bit_rate == 4);
    let fused = fused_row_bytes(block_size, bit_rate);
    let payload = quantized_row_bytes(block_size, bit_rate);

    let mut current = 0usize;
    for (bag, &len_raw) in lengths.iter().enumerate() {
        if len_raw < 0 || current + len_raw as usize > indices.len() {
            return false;
        }
        let len = len_raw as usize;
        let out_row = &mut out[bag * block_size..(bag + 1) * block_size];
        out_row.fill(0.0);

        for j in 0..len {
            let idx = indices[current].as_i64();
            if idx < 0 || idx >= data_size {
                return false;
            }
            let row = &input[idx as usize * fused..(idx as usize + 1) * fused];
            let mut scale = f16::from_le_bytes([row[payload], row[payload + 1]]).to_f32();
            let mut bias = f16::from_le_bytes([row[payload + 2], row[payload + 3]]).to_f32();
            if let Some(w) = weights {
                let wv = w[if is_weight_positional { j } else { current }];
                scale *= wv;
                bias *= wv;
            }
            accumulate_row(out_row, row, bit_rate, scale, bias);
            current += 1;
        }

        if normalize_by_lengths && len > 0 {
            let inv = 1.0 / len as f32;
            for x in out_row.iter_mut() {
                *x *= inv;
            }
        }
    }
    current == indices.len()
}

/// Rowwise-sparse variant: every index passes through
/// `compressed_indices_table`, and a remap of -1 consumes the index (and its
/// weight) without contributing to the bag.
#[allow(clippy::too_many_arguments)]
pub fn embedding_sls_nbit_rowwise_sparse_ref<I: SlsIndex>(
    bit_rate: usize,
    block_size: usize,
    uncompressed_data_size: i64,
    input: &[u8],
    indices: &[I],
    compressed_indices_table: &[I],
    lengths: &[i32],
    weights: Option<&[f32]>,
    normalize_by_lengths: bool,
    is_weight_positional: bool,
    out: &mut [f32],
) -> bool {
    debug_assert!(bit_rate == 2 || bit_rate == 4);
    let fused = fused_row_bytes(block_size, bit_rate);
    let payload = quantized_row_bytes(block_size, bit_rate);

    let mut current = 0usize;
    for (bag, &len_raw) in lengths.iter().enumerate() {
        if len_raw < 0 || current + len_raw as usize > indices.len() {
            return false;
        }
        let len = len_raw as usize;
        let out_row = &mut out[bag * block_size..(bag + 1) * block_size];
        out_row.fill(0.0);

        for j in 0..len {
            let idx = indices[current].as_i64();
            if idx < 0 || idx >= uncompressed_data_size {
                return false;
            }
            let remapped = compressed_indices_table[idx as usize].as_i64();
            let wv = weights.map(|w| w[if is_weight_positional { j } else { current }]);
            current += 1;
            if remapped == -1 {
                continue;
            }
            let row = &input[remapped as usize * fused..(remapped as usize + 1) * fused];
            let mut scale = f16::from_le_bytes([row[payload], row[payload + 1]]).to_f32();
            let mut bias = f16::from_le_bytes([row[payload + 2], row[payload + 3]]).to_f32();
            if let Some(wv) = wv {
                scale *= wv;
                bias *= wv;
            }
            accumulate_row(out_row, row, bit_rate, scale, bias);
        }

        if normalize_by_lengths && len > 0 {
            let inv = 1.0 / len as f32;
            for x in out_row.iter_mut() {
                *x *= inv;
            }
        }
    }
    current == indices.len()
}

fn accumulate_row(out_row: &mut [f32], row: &[u8], bit_rate: usize, scale: f32, bias: f32) {
    let mask = (1u8 << bit_rate) - 1;
    let num_elem_per_byte = 8 / bit_rate;
    for (k, x) in out_row.iter_mut().enumerate() {
        let byte = row[k / num_elem_per_byte];
        let q = (byte >> ((k % num_elem_per_byte) * bit_rate)) & mask;
        // Bias first, then one fused multiply-add per element, matching the
        // generated code's accumulation order.
        *x = scale.mul_add(q as f32, *x + bias);
    }
}

// ── Raw-pointer shims matching the JIT calling convention ───────────────────

unsafe fn slice_or_fail<'a, T>(ptr: *const T, len: usize) -> Option<&'a [T]> {
    if len == 0 {
        Some(&[])
    } else if ptr.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(ptr, len))
    }
}

/// Dense scalar kernel behind the JIT pointer signature.
///
/// # Safety
/// Pointers must satisfy the kernel preconditions: `input` spans `data_size`
/// fused rows, `indices` has `index_size` entries, `lengths` has
/// `output_size` entries, `out` has room for `output_size` rows, and
/// `weights` (when the shape carries weights) has `index_size` entries.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn dense_from_raw<I: SlsIndex>(
    shape: &ScalarShape,
    output_size: i64,
    index_size: i64,
    data_size: i64,
    input: *const u8,
    indices: *const I,
    lengths: *const i32,
    weights: *const f32,
    out: *mut f32,
) -> bool {
    if output_size < 0 || index_size < 0 {
        return false;
    }
    let rows = data_size.max(0) as usize;
    let fused = fused_row_bytes(shape.block_size, shape.bit_rate);
    let (Some(input), Some(indices), Some(lengths)) = (
        slice_or_fail(input, rows * fused),
        slice_or_fail(indices, index_size as usize),
        slice_or_fail(lengths, output_size as usize),
    ) else {
        return false;
    };
    let weights = if shape.has_weight {
        match slice_or_fail(weights, index_size as usize) {
            Some(w) => Some(w),
            None => return false,
        }
    } else {
        None
    };
    let out_len = output_size as usize * shape.block_size;
    let mut empty_out: [f32; 0] = [];
    let out: &mut [f32] = if out_len == 0 {
        &mut empty_out
    } else {
        std::slice::from_raw_parts_mut(out, out_len)
    };
    embedding_sls_nbit_ref(
        shape.bit_rate,
        shape.block_size,
        data_size,
        input,
        indices,
        lengths,
        weights,
        shape.normalize_by_lengths,
        shape.is_weight_positional,
        out,
    )
}

/// Rowwise-sparse scalar kernel behind the JIT pointer signature.
///
/// # Safety
/// Same as [`dense_from_raw`], plus `compressed_indices_table` must span
/// `uncompressed_data_size` entries.
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn sparse_from_raw<I: SlsIndex>(
    shape: &ScalarShape,
    output_size: i64,
    index_size: i64,
    uncompressed_data_size: i64,
    input: *const u8,
    indices: *const I,
    lengths: *const i32,
    weights: *const f32,
    out: *mut f32,
    compressed_indices_table: *const I,
) -> bool {
    if output_size < 0 || index_size < 0 {
        return false;
    }
    let uncompressed = uncompressed_data_size.max(0) as usize;
    let fused = fused_row_bytes(shape.block_size, shape.bit_rate);
    let (Some(cit), Some(indices), Some(lengths)) = (
        slice_or_fail(compressed_indices_table, uncompressed),
        slice_or_fail(indices, index_size as usize),
        slice_or_fail(lengths, output_size as usize),
    ) else {
        return false;
    };
    // The compressed row count is not part of the signature; size the input
    // span by the largest live remap target.
    let compressed_rows = cit
        .iter()
        .map(|i| i.as_i64() + 1)
        .max()
        .unwrap_or(0)
        .max(0) as usize;
    let Some(input) = slice_or_fail(input, compressed_rows * fused) else {
        return false;
    };
    let weights = if shape.has_weight {
        match slice_or_fail(weights, index_size as usize) {
            Some(w) => Some(w),
            None => return false,
        }
    } else {
        None
    };
    let out_len = output_size as usize * shape.block_size;
    let mut empty_out: [f32; 0] = [];
    let out: &mut [f32] = if out_len == 0 {
        &mut empty_out
    } else {
        std::slice::from_raw_parts_mut(out, out_len)
    };
    embedding_sls_nbit_rowwise_sparse_ref(
        shape.bit_rate,
        shape.block_size,
        uncompressed_data_size,
        input,
        indices,
        cit,
        lengths,
        weights,
        shape.normalize_by_lengths,
        shape.is_weight_positional,
        out,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    // Two fused 4-bit rows of dimension 4 with scale 1.0 and bias 0.0:
    // row 0 decodes to [1, 2, 3, 4], row 1 to [5, 6, 7, 8].
    fn two_unit_rows() -> Vec<u8> {
        let one = f16::from_f32(1.0).to_le_bytes();
        let zero = f16::from_f32(0.0).to_le_bytes();
        let mut table = Vec::new();
        for nibbles in [[0x21u8, 0x43], [0x65, 0x87]] {
            table.extend_from_slice(&nibbles);
            table.extend_from_slice(&one);
            table.extend_from_slice(&zero);
        }
        table
    }

    #[test]
    fn plain_sum_of_two_rows() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 4];
        let ok = embedding_sls_nbit_ref::<i64>(
            4, 4, 2, &table, &[0, 1], &[2], None, false, false, &mut out,
        );
        assert!(ok);
        assert_eq!(out, vec![6.0, 8.0, 10.0, 12.0]);
    }

    #[test]
    fn normalized_sum_of_two_rows() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 4];
        let ok = embedding_sls_nbit_ref::<i64>(
            4, 4, 2, &table, &[0, 1], &[2], None, true, false, &mut out,
        );
        assert!(ok);
        assert_eq!(out, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn weighted_sum_of_two_rows() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 4];
        let ok = embedding_sls_nbit_ref::<i64>(
            4,
            4,
            2,
            &table,
            &[0, 1],
            &[2],
            Some(&[0.5, 2.0]),
            false,
            false,
            &mut out,
        );
        assert!(ok);
        assert_eq!(out, vec![10.5, 13.0, 15.5, 18.0]);
    }

    #[test]
    fn empty_bag_yields_zero_row() {
        // 2-bit rows of dimension 16: payload 4 bytes plus the f16 trailer.
        let scale = f16::from_f32(0.5).to_le_bytes();
        let bias = f16::from_f32(-1.0).to_le_bytes();
        let mut table = Vec::new();
        for seed in [0x1Bu8, 0x6E, 0xC5] {
            table.extend_from_slice(&[seed, seed.rotate_left(3), seed ^ 0x5A, 0x99]);
            table.extend_from_slice(&scale);
            table.extend_from_slice(&bias);
        }
        let mut out = vec![7.0f32; 32];
        let ok = embedding_sls_nbit_ref::<i32>(
            2,
            16,
            3,
            &table,
            &[0, 1, 2],
            &[0, 3],
            None,
            false,
            false,
            &mut out,
        );
        assert!(ok);
        assert!(out[..16].iter().all(|&x| x == 0.0), "empty bag must be zeroed");
        // Second bag: decode the three rows by hand and compare.
        let mut expect = vec![0.0f32; 16];
        for row in 0..3 {
            let bytes = &table[row * 8..row * 8 + 4];
            for k in 0..16 {
                let q = (bytes[k / 4] >> ((k % 4) * 2)) & 0x3;
                expect[k] += 0.5 * q as f32 + -1.0;
            }
        }
        for (got, want) in out[16..].iter().zip(&expect) {
            assert!((got - want).abs() < 1e-5, "got {got}, want {want}");
        }
    }

    #[test]
    fn out_of_range_index_fails() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 8];
        let ok = embedding_sls_nbit_ref::<i64>(
            4, 4, 3, &table, &[0, 5], &[1, 1], None, false, false, &mut out,
        );
        assert!(!ok);
    }

    #[test]
    fn length_sum_mismatch_fails() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 4];
        // Two indices supplied but the single bag only claims one.
        let ok = embedding_sls_nbit_ref::<i64>(
            4, 4, 2, &table, &[0, 1], &[1], None, false, false, &mut out,
        );
        assert!(!ok);
    }

    #[test]
    fn rowwise_sparse_skips_pruned_rows() {
        let table = two_unit_rows();
        let mut out = vec![0.0f32; 4];
        // Remap: uncompressed 0 -> 0, 1 -> pruned, 2 -> 1.
        let ok = embedding_sls_nbit_rowwise_sparse_ref::<i32>(
            4,
            4,
            3,
            &table,
            &[2, 1, 0],
            &[0, -1, 1],
            &[3],
            None,
            false,
            false,
            &mut out,
        );
        assert!(ok);
        // Rows 1 and 0 of the compressed table survive.
        assert_eq!(out, vec![6.0, 8.0, 10.0, 12.0]);
    }

    #[test]
    fn positional_weights_follow_bag_position() {
        let table = two_unit_rows();
        let weights = [10.0f32, 0.1];
        let run = |indices: &[i64]| {
            let mut out = vec![0.0f32; 4];
            let ok = embedding_sls_nbit_ref::<i64>(
                4,
                4,
                2,
                &table,
                indices,
                &[2],
                Some(&weights),
                false,
                true,
                &mut out,
            );
            assert!(ok);
            out
        };
        let forward = run(&[0, 1]);
        let reversed = run(&[1, 0]);
        assert_ne!(forward, reversed, "permuting indices must change the output");
        // Position 0 always gets weight 10.0: reversed applies it to row 1.
        assert_eq!(reversed[0], 10.0 * 5.0 + 0.1 * 1.0);
    }
}
