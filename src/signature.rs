//! Kernel shape signature: every parameter that changes the emitted code.
//!
//! Index width and the dense/rowwise-sparse split are not part of the
//! signature; they select the code cache instance instead (see
//! [`crate::types::SlsIndex`]), so the tuple below only carries what varies
//! within one generator instance.

use crate::types::KernelError;

/// Shape key for one specialized kernel.
///
/// Equality and hashing are structural; two factory calls with equal
/// signatures share one compiled function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelSignature {
    /// Bits per quantized element, 2 or 4.
    pub bit_rate: i32,
    /// Embedding dimension in elements.
    pub block_size: i64,
    /// Whether a per-index weight array is applied.
    pub has_weight: bool,
    /// Whether weights are indexed by bag-local position.
    pub is_weight_positional: bool,
    /// Whether each output row is scaled by `1 / length`.
    pub normalize_by_lengths: bool,
    /// Lookahead distance, in indices, for row prefetching. Zero disables.
    pub prefetch_distance: i32,
}

impl KernelSignature {
    pub fn new(
        bit_rate: i32,
        block_size: i64,
        has_weight: bool,
        is_weight_positional: bool,
        normalize_by_lengths: bool,
        prefetch_distance: i32,
    ) -> Result<Self, KernelError> {
        let sig = KernelSignature {
            bit_rate,
            block_size,
            has_weight,
            is_weight_positional,
            normalize_by_lengths,
            prefetch_distance,
        };
        sig.validate()?;
        Ok(sig)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.bit_rate != 2 && self.bit_rate != 4 {
            return Err(KernelError::InvalidConfig(format!(
                "bit_rate must be 2 or 4, got {}",
                self.bit_rate
            )));
        }
        if self.block_size < 1 {
            return Err(KernelError::InvalidConfig(format!(
                "block_size must be at least 1, got {}",
                self.block_size
            )));
        }
        // Row and output strides are baked into 32-bit displacements and
        // immediates of the emitted code.
        if self.block_size > (i32::MAX / 4) as i64 {
            return Err(KernelError::InvalidConfig(format!(
                "block_size {} exceeds the addressable row stride",
                self.block_size
            )));
        }
        if self.prefetch_distance < 0 {
            return Err(KernelError::InvalidConfig(format!(
                "prefetch_distance must be non-negative, got {}",
                self.prefetch_distance
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_shapes() {
        assert!(KernelSignature::new(2, 1, false, false, false, 0).is_ok());
        assert!(KernelSignature::new(4, 128, true, true, true, 16).is_ok());
    }

    #[test]
    fn rejects_invalid_shapes() {
        assert!(KernelSignature::new(8, 64, false, false, false, 0).is_err());
        assert!(KernelSignature::new(3, 64, false, false, false, 0).is_err());
        assert!(KernelSignature::new(4, 0, false, false, false, 0).is_err());
        assert!(KernelSignature::new(4, 64, false, false, false, -1).is_err());
    }

    #[test]
    fn equality_is_structural() {
        let a = KernelSignature::new(4, 64, true, false, true, 16).unwrap();
        let b = KernelSignature::new(4, 64, true, false, true, 16).unwrap();
        let c = KernelSignature::new(4, 64, true, false, true, 0).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let hash = |s: &KernelSignature| {
            let mut h = DefaultHasher::new();
            s.hash(&mut h);
            h.finish()
        };
        assert_eq!(hash(&a), hash(&b));
    }
}
