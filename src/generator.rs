//! Public kernel factories.
//!
//! A factory call validates the shape, probes the CPU once, and returns a
//! kernel backed either by JIT-generated code (AVX-512 preferred, then AVX2)
//! or by the scalar reference path. JIT entry points are shared through the
//! per-(index-width, variant) code caches, so equal shapes yield the same
//! published code.

use std::marker::PhantomData;

#[cfg(all(target_arch = "x86_64", unix))]
use crate::cpu::{isa_level, IsaLevel};
use crate::reference::{self, ScalarShape};
use crate::signature::KernelSignature;
use crate::types::{fused_row_bytes, KernelError, SlsIndex};

#[derive(Debug, Clone, Copy)]
enum KernelBackend {
    /// Address of published JIT code; the owning kernel type fixes the
    /// function signature it is transmuted to.
    #[cfg(all(target_arch = "x86_64", unix))]
    Jit(usize),
    Scalar(ScalarShape),
}

fn select_backend<I: SlsIndex>(sig: &KernelSignature, rowwise_sparse: bool) -> KernelBackend {
    #[cfg(all(target_arch = "x86_64", unix))]
    {
        let isa = isa_level();
        if isa != IsaLevel::Scalar {
            let cache = if rowwise_sparse {
                I::sparse_code_cache()
            } else {
                I::dense_code_cache()
            };
            let published = cache.get_or_create(*sig, || {
                let result = crate::jit::synthesizer::synthesize(sig, isa, I::IS_64BIT, rowwise_sparse)
                    .and_then(|code| crate::jit::runtime::runtime().publish(&code));
                match result {
                    Ok(entry) => Some(crate::code_cache::CodePtr(entry.as_ptr() as usize)),
                    Err(e) => {
                        log::error!(
                            "kernel emission failed for {sig:?} (index64={}, sparse={rowwise_sparse}): {e}",
                            I::IS_64BIT
                        );
                        None
                    }
                }
            });
            if let Some(ptr) = published {
                return KernelBackend::Jit(ptr.addr());
            }
            // Emission failure is not cached; this call degrades to the
            // scalar path and a later call may retry the compile.
        }
    }
    KernelBackend::Scalar(ScalarShape {
        bit_rate: sig.bit_rate as usize,
        block_size: sig.block_size as usize,
        has_weight: sig.has_weight,
        normalize_by_lengths: sig.normalize_by_lengths,
        is_weight_positional: sig.is_weight_positional,
    })
}

/// A compiled dense N-bit sparse-length-sum kernel.
pub struct SlsKernel<I: SlsIndex> {
    backend: KernelBackend,
    bit_rate: usize,
    block_size: usize,
    has_weight: bool,
    _index: PhantomData<fn(*const I)>,
}

impl<I: SlsIndex> SlsKernel<I> {
    /// Embedding dimension the kernel was specialized for.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Address of the published JIT code, `None` on the scalar path.
    ///
    /// Two kernels built from equal shapes report equal addresses.
    pub fn jit_entry(&self) -> Option<usize> {
        match self.backend {
            #[cfg(all(target_arch = "x86_64", unix))]
            KernelBackend::Jit(addr) => Some(addr),
            KernelBackend::Scalar(_) => None,
        }
    }

    /// Run the kernel over raw buffers.
    ///
    /// # Safety
    /// All pointers must satisfy the kernel preconditions: `input` spans
    /// `data_size` fused rows, `indices` has `index_size` entries, `lengths`
    /// has `output_size` entries summing to `index_size`, `out` has capacity
    /// for `output_size` rows of `block_size` f32, and `weights` (required
    /// when the shape carries weights, null otherwise) has `index_size`
    /// entries.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn invoke(
        &self,
        output_size: i64,
        index_size: i64,
        data_size: i64,
        input: *const u8,
        indices: *const I,
        lengths: *const i32,
        weights: *const f32,
        out: *mut f32,
    ) -> bool {
        match self.backend {
            #[cfg(all(target_arch = "x86_64", unix))]
            KernelBackend::Jit(addr) => {
                let f: crate::types::DenseJitFn<I> = std::mem::transmute(addr);
                f(output_size, index_size, data_size, input, indices, lengths, weights, out)
            }
            KernelBackend::Scalar(ref shape) => reference::dense_from_raw::<I>(
                shape, output_size, index_size, data_size, input, indices, lengths, weights, out,
            ),
        }
    }

    /// Safe wrapper over [`Self::invoke`]: sizes come from the slices and
    /// the buffer contracts are checked up front.
    pub fn execute(
        &self,
        data_size: i64,
        input: &[u8],
        indices: &[I],
        lengths: &[i32],
        weights: Option<&[f32]>,
        out: &mut [f32],
    ) -> bool {
        let fused = fused_row_bytes(self.block_size, self.bit_rate);
        assert!(
            input.len() >= data_size.max(0) as usize * fused,
            "input shorter than data_size fused rows"
        );
        assert!(
            out.len() >= lengths.len() * self.block_size,
            "out shorter than one row per bag"
        );
        let weights_ptr = match (self.has_weight, weights) {
            (true, Some(w)) => {
                assert!(w.len() >= indices.len(), "weights shorter than indices");
                w.as_ptr()
            }
            (true, None) => panic!("kernel was built with has_weight but no weights were passed"),
            (false, _) => std::ptr::null(),
        };
        unsafe {
            self.invoke(
                lengths.len() as i64,
                indices.len() as i64,
                data_size,
                input.as_ptr(),
                indices.as_ptr(),
                lengths.as_ptr(),
                weights_ptr,
                out.as_mut_ptr(),
            )
        }
    }
}

/// A compiled rowwise-sparse N-bit sparse-length-sum kernel.
pub struct SlsRowwiseSparseKernel<I: SlsIndex> {
    backend: KernelBackend,
    bit_rate: usize,
    block_size: usize,
    has_weight: bool,
    _index: PhantomData<fn(*const I)>,
}

impl<I: SlsIndex> SlsRowwiseSparseKernel<I> {
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Address of the published JIT code, `None` on the scalar path.
    pub fn jit_entry(&self) -> Option<usize> {
        match self.backend {
            #[cfg(all(target_arch = "x86_64", unix))]
            KernelBackend::Jit(addr) => Some(addr),
            KernelBackend::Scalar(_) => None,
        }
    }

    /// Run the kernel over raw buffers.
    ///
    /// # Safety
    /// As [`SlsKernel::invoke`], with `data_size` reinterpreted as the
    /// uncompressed row count and `compressed_indices_table` spanning that
    /// many entries.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn invoke(
        &self,
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
        match self.backend {
            #[cfg(all(target_arch = "x86_64", unix))]
            KernelBackend::Jit(addr) => {
                let f: crate::types::SparseJitFn<I> = std::mem::transmute(addr);
                f(
                    output_size,
                    index_size,
                    uncompressed_data_size,
                    input,
                    indices,
                    lengths,
                    weights,
                    out,
                    compressed_indices_table,
                )
            }
            KernelBackend::Scalar(ref shape) => reference::sparse_from_raw::<I>(
                shape,
                output_size,
                index_size,
                uncompressed_data_size,
                input,
                indices,
                lengths,
                weights,
                out,
                compressed_indices_table,
            ),
        }
    }

    /// Safe wrapper over [`Self::invoke`].
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        input: &[u8],
        indices: &[I],
        compressed_indices_table: &[I],
        lengths: &[i32],
        weights: Option<&[f32]>,
        out: &mut [f32],
    ) -> bool {
        assert!(
            out.len() >= lengths.len() * self.block_size,
            "out shorter than one row per bag"
        );
        let fused = fused_row_bytes(self.block_size, self.bit_rate);
        let compressed_rows = compressed_indices_table
            .iter()
            .map(|i| i.as_i64() + 1)
            .max()
            .unwrap_or(0)
            .max(0) as usize;
        assert!(
            input.len() >= compressed_rows * fused,
            "input shorter than the remap table's largest target"
        );
        let weights_ptr = match (self.has_weight, weights) {
            (true, Some(w)) => {
                assert!(w.len() >= indices.len(), "weights shorter than indices");
                w.as_ptr()
            }
            (true, None) => panic!("kernel was built with has_weight but no weights were passed"),
            (false, _) => std::ptr::null(),
        };
        unsafe {
            self.invoke(
                lengths.len() as i64,
                indices.len() as i64,
                compressed_indices_table.len() as i64,
                input.as_ptr(),
                indices.as_ptr(),
                lengths.as_ptr(),
                weights_ptr,
                out.as_mut_ptr(),
                compressed_indices_table.as_ptr(),
            )
        }
    }
}

/// Build a dense N-bit sparse-length-sum kernel.
///
/// `bit_rate` must be 2 or 4 and `block_size` at least 1; `prefetch` is the
/// lookahead distance in indices (0 disables prefetching).
pub fn generate_nbit_sls<I: SlsIndex>(
    bit_rate: i32,
    block_size: i64,
    has_weight: bool,
    normalize_by_lengths: bool,
    prefetch: i32,
    is_weight_positional: bool,
) -> Result<SlsKernel<I>, KernelError> {
    let sig = KernelSignature::new(
        bit_rate,
        block_size,
        has_weight,
        is_weight_positional,
        normalize_by_lengths,
        prefetch,
    )?;
    Ok(SlsKernel {
        backend: select_backend::<I>(&sig, false),
        bit_rate: bit_rate as usize,
        block_size: block_size as usize,
        has_weight,
        _index: PhantomData,
    })
}

/// Build a rowwise-sparse N-bit sparse-length-sum kernel.
///
/// The returned kernel remaps every index through a compressed-indices
/// table; a remap of -1 skips the row.
pub fn generate_nbit_sls_rowwise_sparse<I: SlsIndex>(
    bit_rate: i32,
    block_size: i64,
    has_weight: bool,
    normalize_by_lengths: bool,
    prefetch: i32,
    is_weight_positional: bool,
) -> Result<SlsRowwiseSparseKernel<I>, KernelError> {
    let sig = KernelSignature::new(
        bit_rate,
        block_size,
        has_weight,
        is_weight_positional,
        normalize_by_lengths,
        prefetch,
    )?;
    Ok(SlsRowwiseSparseKernel {
        backend: select_backend::<I>(&sig, true),
        bit_rate: bit_rate as usize,
        block_size: block_size as usize,
        has_weight,
        _index: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_bit_rate() {
        assert!(generate_nbit_sls::<i64>(8, 16, false, false, 0, false).is_err());
        assert!(generate_nbit_sls::<i32>(0, 16, false, false, 0, false).is_err());
    }

    #[test]
    fn factory_is_idempotent_per_shape() {
        let a = generate_nbit_sls::<i64>(4, 24, true, false, 16, false).unwrap();
        let b = generate_nbit_sls::<i64>(4, 24, true, false, 16, false).unwrap();
        assert_eq!(a.jit_entry(), b.jit_entry());

        let c = generate_nbit_sls::<i64>(4, 24, true, false, 0, false).unwrap();
        if let (Some(pa), Some(pc)) = (a.jit_entry(), c.jit_entry()) {
            assert_ne!(pa, pc, "distinct shapes must not share code");
        }
    }

    #[test]
    fn dense_and_sparse_caches_are_disjoint() {
        let dense = generate_nbit_sls::<i32>(4, 40, false, false, 0, false).unwrap();
        let sparse =
            generate_nbit_sls_rowwise_sparse::<i32>(4, 40, false, false, 0, false).unwrap();
        if let (Some(pd), Some(ps)) = (dense.jit_entry(), sparse.jit_entry()) {
            assert_ne!(pd, ps);
        }
    }
}
