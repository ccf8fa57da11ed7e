//! Instruction-set abstraction for the kernel synthesizer.
//!
//! The synthesizer drives code generation through the [`SimdIsa`] trait and
//! is generic over it, so the AVX2 and AVX-512 back-ends share one
//! algorithmic skeleton. The two implementations diverge only in vector
//! width, register count, and masking style: AVX-512 keeps its remainder
//! masks in the k1/k2 predicate registers, while AVX2 materializes -1/0
//! lane masks in vector registers and uses masked load/store instructions.
//!
//! Vector registers are addressed by plain index; each back-end maps the
//! index to its physical register file.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

pub(crate) fn xmm(i: u8) -> AsmRegisterXmm {
    match i {
        0 => xmm0,
        1 => xmm1,
        2 => xmm2,
        3 => xmm3,
        4 => xmm4,
        5 => xmm5,
        6 => xmm6,
        7 => xmm7,
        8 => xmm8,
        9 => xmm9,
        10 => xmm10,
        11 => xmm11,
        12 => xmm12,
        13 => xmm13,
        14 => xmm14,
        15 => xmm15,
        16 => xmm16,
        17 => xmm17,
        18 => xmm18,
        19 => xmm19,
        20 => xmm20,
        21 => xmm21,
        22 => xmm22,
        23 => xmm23,
        24 => xmm24,
        25 => xmm25,
        26 => xmm26,
        27 => xmm27,
        28 => xmm28,
        29 => xmm29,
        30 => xmm30,
        31 => xmm31,
        _ => panic!("xmm register index {i} out of range"),
    }
}

pub(crate) fn ymm(i: u8) -> AsmRegisterYmm {
    match i {
        0 => ymm0,
        1 => ymm1,
        2 => ymm2,
        3 => ymm3,
        4 => ymm4,
        5 => ymm5,
        6 => ymm6,
        7 => ymm7,
        8 => ymm8,
        9 => ymm9,
        10 => ymm10,
        11 => ymm11,
        12 => ymm12,
        13 => ymm13,
        14 => ymm14,
        15 => ymm15,
        16 => ymm16,
        17 => ymm17,
        18 => ymm18,
        19 => ymm19,
        20 => ymm20,
        21 => ymm21,
        22 => ymm22,
        23 => ymm23,
        24 => ymm24,
        25 => ymm25,
        26 => ymm26,
        27 => ymm27,
        28 => ymm28,
        29 => ymm29,
        30 => ymm30,
        31 => ymm31,
        _ => panic!("ymm register index {i} out of range"),
    }
}

pub(crate) fn zmm(i: u8) -> AsmRegisterZmm {
    match i {
        0 => zmm0,
        1 => zmm1,
        2 => zmm2,
        3 => zmm3,
        4 => zmm4,
        5 => zmm5,
        6 => zmm6,
        7 => zmm7,
        8 => zmm8,
        9 => zmm9,
        10 => zmm10,
        11 => zmm11,
        12 => zmm12,
        13 => zmm13,
        14 => zmm14,
        15 => zmm15,
        16 => zmm16,
        17 => zmm17,
        18 => zmm18,
        19 => zmm19,
        20 => zmm20,
        21 => zmm21,
        22 => zmm22,
        23 => zmm23,
        24 => zmm24,
        25 => zmm25,
        26 => zmm26,
        27 => zmm27,
        28 => zmm28,
        29 => zmm29,
        30 => zmm30,
        31 => zmm31,
        _ => panic!("zmm register index {i} out of range"),
    }
}

/// Vector-emission interface consumed by the synthesizer.
///
/// Every method appends instructions to the shared assembler; scalar and
/// control-flow emission stays in the synthesizer, which owns the labels.
pub(crate) trait SimdIsa {
    /// f32 lanes per vector register.
    const VLEN: usize;
    /// Size of the architectural vector register file.
    const NUM_VEC_REGS: usize;
    /// True when remainder masks occupy vector registers instead of k1/k2.
    const VECTOR_MASKS: bool;

    fn vzero(a: &mut CodeAssembler, v: u8) -> Result<(), IcedError>;

    fn vmul(a: &mut CodeAssembler, dst: u8, x: u8, y: u8) -> Result<(), IcedError>;

    /// Broadcast the constant that isolates one quantized element per byte:
    /// 0x0F0F per 16-bit lane at bit rate 4, 0x03030303 per 32-bit lane at
    /// bit rate 2. The constant is staged through a stack slot.
    fn init_extract_mask(
        a: &mut CodeAssembler,
        v: u8,
        bit_rate: usize,
    ) -> Result<(), IcedError>;

    /// Prepare the column-remainder mask used by the final tile store.
    fn init_store_mask(
        a: &mut CodeAssembler,
        mask_vreg: Option<u8>,
        remainder: usize,
        scratch: AsmRegister32,
    ) -> Result<(), IcedError>;

    /// Prepare the 32-bit-granularity mask used by the trailing quantized
    /// load, covering `active` dwords of one four-tile load.
    fn init_load_mask(
        a: &mut CodeAssembler,
        mask_vreg: Option<u8>,
        active: usize,
        scratch: AsmRegister32,
    ) -> Result<(), IcedError>;

    /// Broadcast `1.0 / *lengths` into `v`. Caller has already zeroed `v`
    /// and branched around this when the length is not positive.
    fn broadcast_length_inv(
        a: &mut CodeAssembler,
        v: u8,
        lengths: AsmRegister64,
        counter: AsmRegister32,
    ) -> Result<(), IcedError>;

    /// Broadcast the row's trailing f16 scale and bias and widen both to f32.
    /// `row_off` holds the row's byte offset; the scale sits at `scale_disp`,
    /// the bias two bytes later.
    fn broadcast_scale_bias(
        a: &mut CodeAssembler,
        scale: u8,
        bias: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        scale_disp: i32,
    ) -> Result<(), IcedError>;

    fn broadcast_weight(
        a: &mut CodeAssembler,
        w: u8,
        weights: AsmRegister64,
    ) -> Result<(), IcedError>;

    /// Load one four-tile group of 4-bit elements and spread each nibble
    /// into its own byte: widen bytes to 16-bit lanes, then
    /// `(src | src << 4) & 0x0F0F`.
    #[allow(clippy::too_many_arguments)]
    fn load_unpack_4bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError>;

    /// Load one four-tile group of 2-bit elements and spread the four
    /// fields of each source byte into the four bytes of a 32-bit lane:
    /// widen bytes to 32-bit lanes, then
    /// `(src << 18 | src << 12 | src << 6 | src) & 0x03030303`.
    #[allow(clippy::too_many_arguments)]
    fn load_unpack_2bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        temp2: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError>;

    /// Move the `quarter`-th 128-bit lane group of `src` into `temp` and
    /// sign-extend its bytes to i32 across the full register.
    fn extract_lane_group(
        a: &mut CodeAssembler,
        temp: u8,
        src: u8,
        quarter: usize,
    ) -> Result<(), IcedError>;

    /// `acc = (acc + bias) + f32(temp) * scale`, the per-tile fused
    /// dequantize-accumulate step.
    fn accumulate(
        a: &mut CodeAssembler,
        acc: u8,
        temp: u8,
        scale: u8,
        bias: u8,
    ) -> Result<(), IcedError>;

    fn store_tile(
        a: &mut CodeAssembler,
        out: AsmRegister64,
        disp: i32,
        acc: u8,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError>;
}

// ── AVX2 back-end: ymm registers, vector-register masking ───────────────────

pub(crate) struct Avx2;

impl SimdIsa for Avx2 {
    const VLEN: usize = 8;
    const NUM_VEC_REGS: usize = 16;
    const VECTOR_MASKS: bool = true;

    fn vzero(a: &mut CodeAssembler, v: u8) -> Result<(), IcedError> {
        a.vxorps(ymm(v), ymm(v), ymm(v))
    }

    fn vmul(a: &mut CodeAssembler, dst: u8, x: u8, y: u8) -> Result<(), IcedError> {
        a.vmulps(ymm(dst), ymm(x), ymm(y))
    }

    fn init_extract_mask(
        a: &mut CodeAssembler,
        v: u8,
        bit_rate: usize,
    ) -> Result<(), IcedError> {
        a.sub(rsp, 4i32)?;
        if bit_rate == 4 {
            a.mov(word_ptr(rsp), 0x0F0Fi32)?;
            a.vpbroadcastw(ymm(v), word_ptr(rsp))?;
        } else {
            a.mov(dword_ptr(rsp), 0x0303_0303i32)?;
            a.vpbroadcastd(ymm(v), dword_ptr(rsp))?;
        }
        a.add(rsp, 4i32)
    }

    fn init_store_mask(
        a: &mut CodeAssembler,
        mask_vreg: Option<u8>,
        remainder: usize,
        _scratch: AsmRegister32,
    ) -> Result<(), IcedError> {
        let mask = ymm(mask_vreg.expect("avx2 store mask needs a vector register"));
        a.sub(rsp, (Self::VLEN * 4) as i32)?;
        for i in 0..Self::VLEN {
            let lane: i32 = if i < remainder { -1 } else { 0 };
            a.mov(dword_ptr(rsp + (4 * i as i32)), lane)?;
        }
        a.vmovups(mask, ymmword_ptr(rsp))?;
        a.add(rsp, (Self::VLEN * 4) as i32)
    }

    fn init_load_mask(
        a: &mut CodeAssembler,
        mask_vreg: Option<u8>,
        active: usize,
        _scratch: AsmRegister32,
    ) -> Result<(), IcedError> {
        let mask = xmm(mask_vreg.expect("avx2 load mask needs a vector register"));
        let lanes = Self::VLEN / 2;
        a.sub(rsp, (lanes * 4) as i32)?;
        for i in 0..lanes {
            let lane: i32 = if i < active { -1 } else { 0 };
            a.mov(dword_ptr(rsp + (4 * i as i32)), lane)?;
        }
        a.vmovups(mask, xmmword_ptr(rsp))?;
        a.add(rsp, (lanes * 4) as i32)
    }

    fn broadcast_length_inv(
        a: &mut CodeAssembler,
        v: u8,
        lengths: AsmRegister64,
        counter: AsmRegister32,
    ) -> Result<(), IcedError> {
        a.mov(counter, 1i32)?;
        a.cvtsi2ss(xmm(v), counter)?;
        a.cvtsi2ss(xmm0, dword_ptr(lengths))?;
        a.divss(xmm(v), xmm0)?;
        a.vpbroadcastd(ymm(v), xmm(v))
    }

    fn broadcast_scale_bias(
        a: &mut CodeAssembler,
        scale: u8,
        bias: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        scale_disp: i32,
    ) -> Result<(), IcedError> {
        a.vpbroadcastw(xmm(scale), word_ptr(input + row_off + scale_disp))?;
        a.vpbroadcastw(xmm(bias), word_ptr(input + row_off + scale_disp + 2))?;
        a.vcvtph2ps(ymm(scale), xmm(scale))?;
        a.vcvtph2ps(ymm(bias), xmm(bias))
    }

    fn broadcast_weight(
        a: &mut CodeAssembler,
        w: u8,
        weights: AsmRegister64,
    ) -> Result<(), IcedError> {
        a.vbroadcastss(ymm(w), dword_ptr(weights))
    }

    fn load_unpack_4bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            let mask = xmm(mask_vreg.expect("masked load without a mask register"));
            a.vpmaskmovd(xmm(src), mask, xmmword_ptr(input + row_off + disp))?;
            a.vpmovzxbw(ymm(src), xmm(src))?;
        } else {
            a.vpmovzxbw(ymm(src), xmmword_ptr(input + row_off + disp))?;
        }
        a.vpslld(ymm(temp), ymm(src), 4u32)?;
        a.vpor(ymm(src), ymm(src), ymm(temp))?;
        a.vpand(ymm(src), ymm(src), ymm(extract))
    }

    fn load_unpack_2bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        temp2: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            let mask = xmm(mask_vreg.expect("masked load without a mask register"));
            a.vpmaskmovd(xmm(src), mask, xmmword_ptr(input + row_off + disp))?;
            a.vpmovzxbd(ymm(src), xmm(src))?;
        } else {
            a.vpmovzxbd(ymm(src), qword_ptr(input + row_off + disp))?;
        }
        a.vpslld(ymm(temp), ymm(src), 18u32)?;
        a.vpslld(ymm(temp2), ymm(src), 12u32)?;
        a.vpor(ymm(temp), ymm(temp), ymm(temp2))?;
        a.vpslld(ymm(temp2), ymm(src), 6u32)?;
        a.vpor(ymm(temp), ymm(temp), ymm(temp2))?;
        a.vpor(ymm(src), ymm(temp), ymm(src))?;
        a.vpand(ymm(src), ymm(src), ymm(extract))
    }

    fn extract_lane_group(
        a: &mut CodeAssembler,
        temp: u8,
        src: u8,
        quarter: usize,
    ) -> Result<(), IcedError> {
        // No single instruction pulls an arbitrary 64-bit chunk out of a ymm,
        // so the odd quarters bounce through rax.
        match quarter {
            0 => return a.vpmovsxbd(ymm(temp), xmm(src)),
            1 => {
                a.pextrq(rax, xmm(src), 1u32)?;
                a.movq(xmm(temp), rax)?;
            }
            2 => {
                a.vextractf128(xmm(temp), ymm(src), 1u32)?;
            }
            3 => {
                a.vextractf128(xmm(temp), ymm(src), 1u32)?;
                a.pextrq(rax, xmm(temp), 1u32)?;
                a.movq(xmm(temp), rax)?;
            }
            _ => panic!("lane group {quarter} out of range"),
        }
        a.vpmovsxbd(ymm(temp), xmm(temp))
    }

    fn accumulate(
        a: &mut CodeAssembler,
        acc: u8,
        temp: u8,
        scale: u8,
        bias: u8,
    ) -> Result<(), IcedError> {
        a.vcvtdq2ps(ymm(temp), ymm(temp))?;
        a.vaddps(ymm(acc), ymm(acc), ymm(bias))?;
        a.vfmadd231ps(ymm(acc), ymm(temp), ymm(scale))
    }

    fn store_tile(
        a: &mut CodeAssembler,
        out: AsmRegister64,
        disp: i32,
        acc: u8,
        masked: bool,
        mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            let mask = ymm(mask_vreg.expect("masked store without a mask register"));
            a.vmaskmovps(ymmword_ptr(out + disp), mask, ymm(acc))
        } else {
            a.vmovups(ymmword_ptr(out + disp), ymm(acc))
        }
    }
}

// ── AVX-512 back-end: zmm registers, k1/k2 predicate masking ────────────────

pub(crate) struct Avx512;

impl SimdIsa for Avx512 {
    const VLEN: usize = 16;
    const NUM_VEC_REGS: usize = 32;
    const VECTOR_MASKS: bool = false;

    fn vzero(a: &mut CodeAssembler, v: u8) -> Result<(), IcedError> {
        a.vxorps(zmm(v), zmm(v), zmm(v))
    }

    fn vmul(a: &mut CodeAssembler, dst: u8, x: u8, y: u8) -> Result<(), IcedError> {
        a.vmulps(zmm(dst), zmm(x), zmm(y))
    }

    fn init_extract_mask(
        a: &mut CodeAssembler,
        v: u8,
        bit_rate: usize,
    ) -> Result<(), IcedError> {
        a.sub(rsp, 4i32)?;
        if bit_rate == 4 {
            a.mov(word_ptr(rsp), 0x0F0Fi32)?;
            a.vpbroadcastw(zmm(v), word_ptr(rsp))?;
        } else {
            a.mov(dword_ptr(rsp), 0x0303_0303i32)?;
            a.vpbroadcastd(zmm(v), dword_ptr(rsp))?;
        }
        a.add(rsp, 4i32)
    }

    fn init_store_mask(
        a: &mut CodeAssembler,
        _mask_vreg: Option<u8>,
        remainder: usize,
        scratch: AsmRegister32,
    ) -> Result<(), IcedError> {
        a.mov(scratch, (1i32 << remainder) - 1)?;
        a.kmovw(k1, scratch)
    }

    fn init_load_mask(
        a: &mut CodeAssembler,
        _mask_vreg: Option<u8>,
        active: usize,
        scratch: AsmRegister32,
    ) -> Result<(), IcedError> {
        a.mov(scratch, (1i32 << active) - 1)?;
        a.kmovw(k2, scratch)
    }

    fn broadcast_length_inv(
        a: &mut CodeAssembler,
        v: u8,
        lengths: AsmRegister64,
        counter: AsmRegister32,
    ) -> Result<(), IcedError> {
        // zmm0 doubles as scratch; the accumulators are re-zeroed right after.
        a.mov(counter, 1i32)?;
        a.cvtsi2ss(xmm0, counter)?;
        a.vpbroadcastd(zmm(v), xmm0)?;
        a.vpbroadcastd(zmm0, dword_ptr(lengths))?;
        a.vcvtdq2ps(zmm0, zmm0)?;
        a.vdivps(zmm(v), zmm(v), zmm0)
    }

    fn broadcast_scale_bias(
        a: &mut CodeAssembler,
        scale: u8,
        bias: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        scale_disp: i32,
    ) -> Result<(), IcedError> {
        a.vpbroadcastw(ymm(scale), word_ptr(input + row_off + scale_disp))?;
        a.vpbroadcastw(ymm(bias), word_ptr(input + row_off + scale_disp + 2))?;
        a.vcvtph2ps(zmm(scale), ymm(scale))?;
        a.vcvtph2ps(zmm(bias), ymm(bias))
    }

    fn broadcast_weight(
        a: &mut CodeAssembler,
        w: u8,
        weights: AsmRegister64,
    ) -> Result<(), IcedError> {
        a.vbroadcastss(zmm(w), dword_ptr(weights))
    }

    fn load_unpack_4bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        _mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            // Merge-masked: stale upper lanes never reach memory because the
            // final tile's store is k1-masked as well.
            a.vmovups(ymm(src).k2(), ymmword_ptr(input + row_off + disp))?;
            a.vpmovzxbw(zmm(src), ymm(src))?;
        } else {
            a.vpmovzxbw(zmm(src), ymmword_ptr(input + row_off + disp))?;
        }
        a.vpslld(zmm(temp), zmm(src), 4u32)?;
        a.vpord(zmm(src), zmm(src), zmm(temp))?;
        a.vpandd(zmm(src), zmm(src), zmm(extract))
    }

    fn load_unpack_2bit(
        a: &mut CodeAssembler,
        src: u8,
        temp: u8,
        temp2: u8,
        extract: u8,
        input: AsmRegister64,
        row_off: AsmRegister64,
        disp: i32,
        masked: bool,
        _mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            a.vmovups(xmm(src).k2(), xmmword_ptr(input + row_off + disp))?;
            a.vpmovzxbd(zmm(src), xmm(src))?;
        } else {
            a.vpmovzxbd(zmm(src), xmmword_ptr(input + row_off + disp))?;
        }
        a.vpslld(zmm(temp), zmm(src), 18u32)?;
        a.vpslld(zmm(temp2), zmm(src), 12u32)?;
        a.vpord(zmm(temp), zmm(temp), zmm(temp2))?;
        a.vpslld(zmm(temp2), zmm(src), 6u32)?;
        a.vpord(zmm(temp), zmm(temp), zmm(temp2))?;
        a.vpord(zmm(src), zmm(temp), zmm(src))?;
        a.vpandd(zmm(src), zmm(src), zmm(extract))
    }

    fn extract_lane_group(
        a: &mut CodeAssembler,
        temp: u8,
        src: u8,
        quarter: usize,
    ) -> Result<(), IcedError> {
        if quarter == 0 {
            a.vpmovsxbd(zmm(temp), xmm(src))
        } else {
            a.vextracti32x4(xmm(temp), zmm(src), quarter as u32)?;
            a.vpmovsxbd(zmm(temp), xmm(temp))
        }
    }

    fn accumulate(
        a: &mut CodeAssembler,
        acc: u8,
        temp: u8,
        scale: u8,
        bias: u8,
    ) -> Result<(), IcedError> {
        a.vcvtdq2ps(zmm(temp), zmm(temp))?;
        a.vaddps(zmm(acc), zmm(acc), zmm(bias))?;
        a.vfmadd231ps(zmm(acc), zmm(temp), zmm(scale))
    }

    fn store_tile(
        a: &mut CodeAssembler,
        out: AsmRegister64,
        disp: i32,
        acc: u8,
        masked: bool,
        _mask_vreg: Option<u8>,
    ) -> Result<(), IcedError> {
        if masked {
            a.vmovups(zmmword_ptr(out + disp).k1(), zmm(acc))
        } else {
            a.vmovups(zmmword_ptr(out + disp), zmm(acc))
        }
    }
}
