//! CPU capability probing for kernel dispatch.

use std::sync::OnceLock;

/// ISA level for dispatch decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsaLevel {
    Scalar,
    Avx2,
    Avx512,
}

impl IsaLevel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scalar => "scalar",
            Self::Avx2 => "avx2",
            Self::Avx512 => "avx512",
        }
    }
}

static DETECTED_ISA: OnceLock<IsaLevel> = OnceLock::new();

/// Detect the widest ISA level the generated kernels can target, once per
/// process.
///
/// The AVX2 tier also requires FMA and F16C (the kernels lean on
/// `vfmadd231ps` and `vcvtph2ps`); the AVX-512 tier requires the F, BW, VL,
/// and DQ subsets (word broadcasts, byte-to-word widening loads, masked
/// ymm/xmm moves, and `vxorps` on zmm).
pub fn isa_level() -> IsaLevel {
    *DETECTED_ISA.get_or_init(detect_isa_level)
}

#[cfg(all(target_arch = "x86_64", unix))]
fn detect_isa_level() -> IsaLevel {
    if is_x86_feature_detected!("avx512f")
        && is_x86_feature_detected!("avx512bw")
        && is_x86_feature_detected!("avx512vl")
        && is_x86_feature_detected!("avx512dq")
    {
        return IsaLevel::Avx512;
    }
    if is_x86_feature_detected!("avx2")
        && is_x86_feature_detected!("fma")
        && is_x86_feature_detected!("f16c")
    {
        return IsaLevel::Avx2;
    }
    IsaLevel::Scalar
}

#[cfg(not(all(target_arch = "x86_64", unix)))]
fn detect_isa_level() -> IsaLevel {
    IsaLevel::Scalar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_is_stable() {
        let first = isa_level();
        let second = isa_level();
        assert_eq!(first, second);
        println!("detected ISA level: {:?}", first);
    }
}
