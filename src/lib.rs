//! sls-kernels: JIT-compiled N-bit quantized embedding-bag kernels for
//! x86-64.
//!
//! An embedding table is stored as fused rows: elements packed at 2 or 4
//! bits each, followed by an f16 scale and an f16 bias. For a batch of
//! variable-length index lists, a kernel decodes the addressed rows,
//! dequantizes them, optionally applies per-index weights, sums each bag,
//! optionally normalizes by bag length, and writes one dense f32 row per
//! bag.
//!
//! The factories in [`generator`] specialize a kernel per shape (bit rate,
//! embedding dimension, weighting, normalization, prefetch distance) and
//! target ISA: AVX-512 when available, AVX2 otherwise, with a scalar
//! reference fallback on anything else. Generated code is deduplicated
//! through a per-shape code cache and published into executable memory that
//! lives for the process lifetime.
//!
//! Kernels are pure, single-threaded functions of their arguments; callers
//! own any parallelism by sharding bags over disjoint output regions.

pub mod code_cache;
pub mod cpu;
pub mod generator;
pub mod quantize;
pub mod reference;
pub mod signature;
pub mod types;

#[cfg(all(target_arch = "x86_64", unix))]
mod jit;

pub use cpu::{isa_level, IsaLevel};
pub use generator::{
    generate_nbit_sls, generate_nbit_sls_rowwise_sparse, SlsKernel, SlsRowwiseSparseKernel,
};
pub use quantize::{dequantize_rows_nbit, quantize_rows_nbit};
pub use reference::{embedding_sls_nbit_ref, embedding_sls_nbit_rowwise_sparse_ref};
pub use signature::KernelSignature;
pub use types::{fused_row_bytes, quantized_row_bytes, KernelError, SlsIndex};
