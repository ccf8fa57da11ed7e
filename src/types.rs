//! Shared types: the kernel error enum, the index-width abstraction, and the
//! fused-row layout math used by the generator, the reference path, and the
//! quantization utilities.

use std::fmt;

use crate::code_cache::{CodeCache, CodePtr};
use crate::signature::KernelSignature;

/// Errors surfaced by the kernel factories.
#[derive(Debug)]
pub enum KernelError {
    /// Invalid construction parameters (bad bit rate, non-positive block size).
    InvalidConfig(String),
    /// JIT emission or code publication failed.
    CompileError(String),
    /// Requested configuration has no backend on this build target.
    Unsupported(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(s) => write!(f, "invalid config: {s}"),
            Self::CompileError(s) => write!(f, "compile error: {s}"),
            Self::Unsupported(s) => write!(f, "unsupported: {s}"),
        }
    }
}

impl std::error::Error for KernelError {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
}

/// Index element type of the lookup stream.
///
/// The two admissible widths are type-level parameters of the generator: each
/// width keeps its own code caches, so a 32-bit and a 64-bit kernel with the
/// same shape never alias.
pub trait SlsIndex: sealed::Sealed + Copy + Send + Sync + 'static {
    /// True for 64-bit indices; selects the load width emitted by the JIT.
    const IS_64BIT: bool;
    /// Size of one index element in bytes.
    const SIZE: usize;

    fn as_i64(self) -> i64;
    fn from_i64(v: i64) -> Self;

    #[doc(hidden)]
    fn dense_code_cache() -> &'static CodeCache<KernelSignature, CodePtr>;
    #[doc(hidden)]
    fn sparse_code_cache() -> &'static CodeCache<KernelSignature, CodePtr>;
}

macro_rules! impl_sls_index {
    ($ty:ty, $is64:expr) => {
        impl SlsIndex for $ty {
            const IS_64BIT: bool = $is64;
            const SIZE: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn as_i64(self) -> i64 {
                self as i64
            }

            #[inline]
            fn from_i64(v: i64) -> Self {
                v as $ty
            }

            fn dense_code_cache() -> &'static CodeCache<KernelSignature, CodePtr> {
                static CACHE: std::sync::OnceLock<CodeCache<KernelSignature, CodePtr>> =
                    std::sync::OnceLock::new();
                CACHE.get_or_init(CodeCache::new)
            }

            fn sparse_code_cache() -> &'static CodeCache<KernelSignature, CodePtr> {
                static CACHE: std::sync::OnceLock<CodeCache<KernelSignature, CodePtr>> =
                    std::sync::OnceLock::new();
                CACHE.get_or_init(CodeCache::new)
            }
        }
    };
}

impl_sls_index!(i32, false);
impl_sls_index!(i64, true);

/// Raw JIT entry point for the dense kernel variant.
///
/// `bool` maps to the C `_Bool` return convention (value in `al`).
pub type DenseJitFn<I> = unsafe extern "C" fn(
    i64,        // output_size
    i64,        // index_size
    i64,        // data_size
    *const u8,  // input
    *const I,   // indices
    *const i32, // lengths
    *const f32, // weights (may be null)
    *mut f32,   // out
) -> bool;

/// Raw JIT entry point for the rowwise-sparse kernel variant.
pub type SparseJitFn<I> = unsafe extern "C" fn(
    i64,        // output_size
    i64,        // index_size
    i64,        // uncompressed_data_size
    *const u8,  // input
    *const I,   // indices
    *const i32, // lengths
    *const f32, // weights (may be null)
    *mut f32,   // out
    *const I,   // compressed_indices_table
) -> bool;

#[inline]
pub(crate) const fn ceil_div(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Quantized payload bytes of one row: `block_size` elements packed at
/// `bit_rate` bits each, little-endian within every byte.
#[inline]
pub const fn quantized_row_bytes(block_size: usize, bit_rate: usize) -> usize {
    ceil_div(block_size, 8 / bit_rate)
}

/// Total stride of one fused row: packed elements followed by an f16 scale
/// and an f16 bias.
#[inline]
pub const fn fused_row_bytes(block_size: usize, bit_rate: usize) -> usize {
    quantized_row_bytes(block_size, bit_rate) + 2 * std::mem::size_of::<half::f16>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fused_row_layout_math() {
        // 4 elements at 4 bits = 2 payload bytes, plus 4 bytes of scale/bias.
        assert_eq!(fused_row_bytes(4, 4), 6);
        // 16 elements at 2 bits = 4 payload bytes.
        assert_eq!(fused_row_bytes(16, 2), 8);
        // Partial trailing byte rounds up.
        assert_eq!(quantized_row_bytes(17, 4), 9);
        assert_eq!(quantized_row_bytes(1, 2), 1);
    }

    #[test]
    fn index_widths() {
        assert_eq!(<i32 as SlsIndex>::SIZE, 4);
        assert_eq!(<i64 as SlsIndex>::SIZE, 8);
        assert!(!<i32 as SlsIndex>::IS_64BIT);
        assert!(<i64 as SlsIndex>::IS_64BIT);
    }
}
