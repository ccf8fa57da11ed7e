//! Kernel synthesizer: emits the specialized machine code for one lookup
//! shape.
//!
//! The generated function walks three nested loops: over bags, over the
//! indices of each bag, and (unrolled) over the vector tiles of one row.
//! Shape parameters are baked in as immediates and displacements, so the hot
//! path carries no scalar shape arithmetic and no branches beyond the loop
//! back-edges and bounds checks.
//!
//! Emitted signature, System V AMD64:
//!
//! ```text
//! bool (output_size, index_size, data_size, input, indices, lengths,
//!       weights, out [, compressed_indices_table])
//! ```
//!
//! A `false` return reports an out-of-range index or a length-sum mismatch
//! detected while running; bags finished before the fault keep their output.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

use crate::cpu::IsaLevel;
use crate::jit::frame;
use crate::jit::isa::{Avx2, Avx512, SimdIsa};
use crate::signature::KernelSignature;
use crate::types::{ceil_div, fused_row_bytes, quantized_row_bytes, KernelError};

/// Assemble the kernel for `sig` on the given SIMD target.
///
/// The returned bytes are position-independent (relative branches only) and
/// ready for [`crate::jit::runtime::JitRuntime::publish`].
pub(crate) fn synthesize(
    sig: &KernelSignature,
    isa: IsaLevel,
    index_is_64: bool,
    rowwise_sparse: bool,
) -> Result<Vec<u8>, KernelError> {
    let assembled = match isa {
        IsaLevel::Avx2 => emit_kernel::<Avx2>(sig, index_is_64, rowwise_sparse),
        IsaLevel::Avx512 => emit_kernel::<Avx512>(sig, index_is_64, rowwise_sparse),
        IsaLevel::Scalar => {
            return Err(KernelError::Unsupported(
                "no SIMD target available for kernel synthesis".into(),
            ))
        }
    };
    assembled.map_err(|e| KernelError::CompileError(format!("kernel assembly failed: {e}")))
}

fn emit_kernel<M: SimdIsa>(
    sig: &KernelSignature,
    index_is_64: bool,
    sparse: bool,
) -> Result<Vec<u8>, IcedError> {
    let mut a = CodeAssembler::new(64)?;
    if M::NUM_VEC_REGS > 16 {
        // Register indices go up to 31, which the VEX encoding of dual
        // VEX/EVEX-form instructions (e.g. vpbroadcastw) cannot address;
        // force EVEX so register allocation above ymm/zmm15 assembles.
        a.set_prefer_vex(false);
    }

    let bit_rate = sig.bit_rate as usize;
    let block_size = sig.block_size as usize;
    let prefetch = sig.prefetch_distance as usize;
    let idx_bytes = if index_is_64 { 8usize } else { 4usize };

    let vlen = M::VLEN;
    let tiles_per_row = ceil_div(block_size, vlen);
    let remainder = block_size % vlen;

    // The quantized load runs at 32-bit granularity: the f16 scale/bias
    // trailer guarantees at least four bytes past the payload, so the load
    // mask never has to resolve single elements.
    let num_elem_per_32bit = 32 / bit_rate;
    let num_32bit_per_vload = vlen * 4 / num_elem_per_32bit;
    let remainder_32bit = ceil_div(block_size, num_elem_per_32bit) % num_32bit_per_vload;

    let num_elem_per_byte = 8 / bit_rate;
    let fused_row = fused_row_bytes(block_size, bit_rate) as i32;
    let payload_bytes = quantized_row_bytes(block_size, bit_rate) as i32;

    // General-purpose plan. The first six arguments arrive in registers;
    // weights, out, and the remap table come off the stack.
    let output_size = rdi;
    let indices_end = rsi; // carries index_size on entry
    let data_size = rdx;
    let input = rcx;
    let indices = r8;
    let lengths = r9;
    let weights = r10;
    let out = r11;
    let cit = r12;
    let (length_ctr, length_ctr64, scratch1, scratch1_32, scratch2, scratch2_32) = if sparse {
        (r13d, r13, r14, r14d, r15, r15d)
    } else {
        (r12d, r12, r13, r13d, r14, r14d)
    };

    let saved: &[AsmRegister64] = if sparse {
        &[r12, r13, r14, r15]
    } else {
        &[r12, r13, r14]
    };
    let stack_args: &[AsmRegister64] = if sparse {
        &[r10, r11, r12]
    } else {
        &[r10, r11]
    };
    frame::emit_prolog(&mut a, saved, stack_args)?;

    // Vector register plan: fixed roles claim registers from the top of the
    // file; whatever remains, rounded down to a multiple of four, becomes
    // the tile unroll factor.
    let mut pool = M::NUM_VEC_REGS as u8;
    pool -= 1;
    let scale = pool;
    pool -= 1;
    let bias = pool;
    pool -= 1;
    let src = pool;
    pool -= 1;
    let temp = pool;
    let temp2 = if bit_rate == 2 {
        pool -= 1;
        Some(pool)
    } else {
        None
    };
    pool -= 1;
    let extract = pool;
    M::init_extract_mask(&mut a, extract, bit_rate)?;
    let w_vreg = if sig.has_weight {
        pool -= 1;
        Some(pool)
    } else {
        None
    };
    let store_mask_vreg = if remainder != 0 && M::VECTOR_MASKS {
        pool -= 1;
        Some(pool)
    } else {
        None
    };
    let load_mask_vreg = if remainder_32bit != 0 && M::VECTOR_MASKS {
        pool -= 1;
        Some(pool)
    } else {
        None
    };
    let vlen_inv = if sig.normalize_by_lengths {
        pool -= 1;
        Some(pool)
    } else {
        None
    };
    let unroll = (pool / 4 * 4) as usize;

    if remainder != 0 {
        M::init_store_mask(&mut a, store_mask_vreg, remainder, scratch1_32)?;
    }
    if remainder_32bit != 0 {
        M::init_load_mask(&mut a, load_mask_vreg, remainder_32bit, scratch1_32)?;
    }

    // indices_end = indices + index_size * idx_bytes
    a.imul_3(scratch1, indices_end, idx_bytes as i32)?;
    a.add(scratch1, indices)?;
    a.mov(indices_end, scratch1)?;

    let mut exit = a.create_label();
    let mut error = a.create_label();
    let mut bag_loop = a.create_label();
    let mut bag_loop_end = a.create_label();

    a.set_label(&mut bag_loop)?;
    a.dec(output_size)?;
    a.jl(bag_loop_end)?;

    if let Some(vi) = vlen_inv {
        // 1/length, left at zero for an empty bag so the normalized row
        // stays all-zero instead of dividing by zero.
        let mut skip = a.create_label();
        a.cmp(dword_ptr(lengths), 1i32)?;
        M::vzero(&mut a, vi)?;
        a.jl(skip)?;
        M::broadcast_length_inv(&mut a, vi, lengths, length_ctr)?;
        a.set_label(&mut skip)?;
    }

    let mut tile_base = 0usize;
    while tile_base < tiles_per_row {
        let cur_unroll = unroll.min(tiles_per_row - tile_base);
        for v in 0..cur_unroll {
            M::vzero(&mut a, v as u8)?;
        }

        a.mov(length_ctr, dword_ptr(lengths))?;

        // A bag that would read past the end of the index stream fails
        // before any of its loads run.
        a.imul_3(scratch1, length_ctr64, idx_bytes as i32)?;
        a.add(scratch1, indices)?;
        a.cmp(scratch1, indices_end)?;
        a.jg(error)?;

        let mut index_loop = a.create_label();
        let mut index_loop_end = a.create_label();
        a.set_label(&mut index_loop)?;
        a.dec(length_ctr)?;
        a.jl(index_loop_end)?;

        if index_is_64 {
            a.mov(scratch1, qword_ptr(indices))?;
        } else {
            a.mov(scratch1_32, dword_ptr(indices))?;
        }
        a.cmp(scratch1, 0i32)?;
        a.jl(error)?;
        a.cmp(scratch1, data_size)?;
        a.jge(error)?;

        if sparse {
            if index_is_64 {
                a.mov(scratch1, qword_ptr(cit + scratch1 * 8))?;
            } else {
                a.mov(scratch1_32, dword_ptr(cit + scratch1 * 4))?;
            }
        }

        if prefetch > 0 {
            // Peek `prefetch` indices ahead. A peek that runs off the stream
            // or names an out-of-range row silently falls back to the
            // current row; the load below remains the bounds authority.
            let mut clamp = a.create_label();
            let mut resolved = a.create_label();
            a.mov(scratch2, indices)?;
            a.add(scratch2, (prefetch * idx_bytes) as i32)?;
            a.cmp(scratch2, indices_end)?;
            a.jge(clamp)?;
            if index_is_64 {
                a.mov(scratch2, qword_ptr(indices + (prefetch * idx_bytes) as i32))?;
            } else {
                a.mov(scratch2_32, dword_ptr(indices + (prefetch * idx_bytes) as i32))?;
            }
            a.cmp(scratch2, 0i32)?;
            a.jl(clamp)?;
            a.cmp(scratch2, data_size)?;
            a.jge(clamp)?;
            a.jmp(resolved)?;
            a.set_label(&mut clamp)?;
            if index_is_64 {
                a.mov(scratch2, qword_ptr(indices))?;
            } else {
                a.mov(scratch2_32, dword_ptr(indices))?;
            }
            a.set_label(&mut resolved)?;
            if sparse {
                if index_is_64 {
                    a.mov(scratch2, qword_ptr(cit + scratch2 * 8))?;
                } else {
                    a.mov(scratch2_32, dword_ptr(cit + scratch2 * 4))?;
                }
            }
            a.imul_3(scratch2, scratch2, fused_row)?;
        }

        a.add(indices, idx_bytes as i32)?;

        if let Some(wv) = w_vreg {
            M::broadcast_weight(&mut a, wv, weights)?;
            a.add(weights, 4i32)?;
        }

        if sparse {
            // A remap of -1 marks a pruned row: the index and its weight are
            // consumed but nothing reaches the accumulators.
            if index_is_64 {
                a.cmp(scratch1, -1i32)?;
            } else {
                a.cmp(scratch1_32, -1i32)?;
            }
            a.je(index_loop)?;
        }

        a.imul_3(scratch1, scratch1, fused_row)?;

        M::broadcast_scale_bias(&mut a, scale, bias, input, scratch1, payload_bytes)?;
        if let Some(wv) = w_vreg {
            M::vmul(&mut a, scale, scale, wv)?;
            M::vmul(&mut a, bias, bias, wv)?;
        }

        // Four tiles per pass: one widening load covers four tiles' worth of
        // packed elements, and each 128-bit lane group of the unpacked
        // register feeds one accumulator.
        let bytes_per_vload = vlen / num_elem_per_byte;
        let mut v = 0usize;
        while v < cur_unroll {
            let disp = ((tile_base + v) * bytes_per_vload) as i32;
            let masked_load = tiles_per_row - (tile_base + v) < 4 && remainder_32bit != 0;
            if bit_rate == 4 {
                M::load_unpack_4bit(
                    &mut a,
                    src,
                    temp,
                    extract,
                    input,
                    scratch1,
                    disp,
                    masked_load,
                    load_mask_vreg,
                )?;
            } else {
                M::load_unpack_2bit(
                    &mut a,
                    src,
                    temp,
                    temp2.expect("bit rate 2 reserves temp2"),
                    extract,
                    input,
                    scratch1,
                    disp,
                    masked_load,
                    load_mask_vreg,
                )?;
            }

            let groups = 4.min(tiles_per_row - (tile_base + v));
            for i in 0..groups {
                M::extract_lane_group(&mut a, temp, src, i)?;
                M::accumulate(&mut a, (v + i) as u8, temp, scale, bias)?;
            }

            const CACHE_LINE_LEN: usize = 64;
            let vloads_per_cache_line = CACHE_LINE_LEN / bytes_per_vload;
            let v_aligned = ceil_div(tile_base + v, 4) * 4;
            if prefetch > 0 && (v_aligned * 4) % vloads_per_cache_line == 0 {
                a.prefetcht0(byte_ptr(input + scratch2 + (v_aligned * bytes_per_vload) as i32))?;
            }
            v += 4;
        }

        a.jmp(index_loop)?;
        a.set_label(&mut index_loop_end)?;

        for v in 0..cur_unroll {
            let disp = ((tile_base + v) * vlen * 4) as i32;
            if let Some(vi) = vlen_inv {
                M::vmul(&mut a, v as u8, v as u8, vi)?;
            }
            let masked = remainder != 0 && tile_base + v == tiles_per_row - 1;
            M::store_tile(&mut a, out, disp, v as u8, masked, store_mask_vreg)?;
        }

        // Rewind the bag cursors when a further tile group re-reads this
        // bag. Positional weighting always rewinds the weight cursor, so
        // every bag consumes the same weight prefix; the index cursor is
        // rewound by its own element size, independent of the weight stride.
        let more_groups = tile_base + unroll < tiles_per_row;
        if more_groups || (sig.has_weight && sig.is_weight_positional) {
            a.mov(length_ctr, dword_ptr(lengths))?;
            if sig.has_weight {
                a.imul_3(scratch1, length_ctr64, 4i32)?;
                a.sub(weights, scratch1)?;
            }
            if more_groups {
                a.imul_3(scratch1, length_ctr64, idx_bytes as i32)?;
                a.sub(indices, scratch1)?;
            }
        }

        tile_base += unroll;
    }

    a.add(lengths, 4i32)?;
    a.add(out, (block_size * 4) as i32)?;
    a.jmp(bag_loop)?;
    a.set_label(&mut bag_loop_end)?;

    // Every index must have been consumed; anything else is a length-sum
    // mismatch.
    a.cmp(indices, indices_end)?;
    a.jne(error)?;
    a.mov(eax, 1i32)?;
    a.jmp(exit)?;
    a.set_label(&mut error)?;
    a.mov(eax, 0i32)?;
    a.set_label(&mut exit)?;
    frame::emit_epilog(&mut a, saved)?;

    // Relative branches only; the code can be copied to any base address.
    a.assemble(0)
}
