//! System V AMD64 prolog and epilog for the generated kernel functions.
//!
//! The first six integer arguments arrive in rdi, rsi, rdx, rcx, r8, r9; the
//! seventh and later are read off the stack above the return address. The
//! kernel body declares which callee-saved registers it clobbers and the
//! prolog/epilog pair preserves exactly those.

use iced_x86::code_asm::*;
use iced_x86::IcedError;

/// Push the clobbered callee-saved registers and load stack-passed arguments
/// into their assigned scratch registers.
///
/// `stack_args[i]` receives the i-th argument beyond the six register
/// arguments. Offsets account for the pushes performed here.
pub(crate) fn emit_prolog(
    a: &mut CodeAssembler,
    saved: &[AsmRegister64],
    stack_args: &[AsmRegister64],
) -> Result<(), IcedError> {
    for &reg in saved {
        a.push(reg)?;
    }
    // [rsp] holds the last push; the return address sits above the saved
    // registers, stack arguments above that.
    let base = 8 * (saved.len() as i32 + 1);
    for (i, &dst) in stack_args.iter().enumerate() {
        a.mov(dst, qword_ptr(rsp + (base + 8 * i as i32)))?;
    }
    Ok(())
}

/// Restore callee-saved registers in reverse push order and return.
pub(crate) fn emit_epilog(
    a: &mut CodeAssembler,
    saved: &[AsmRegister64],
) -> Result<(), IcedError> {
    for &reg in saved.iter().rev() {
        a.pop(reg)?;
    }
    a.ret()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::runtime::runtime;

    // Emit a function that returns its 7th argument, exercising both the
    // push accounting and the stack-argument offsets.
    #[test]
    fn stack_argument_offsets_are_push_adjusted() {
        let mut a = CodeAssembler::new(64).unwrap();
        emit_prolog(&mut a, &[r12, r13, r14], &[r10, r11]).unwrap();
        a.mov(rax, r10).unwrap();
        emit_epilog(&mut a, &[r12, r13, r14]).unwrap();
        let code = a.assemble(0).unwrap();
        let entry = runtime().publish(&code).unwrap();
        unsafe {
            let f: extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64) -> u64 =
                std::mem::transmute(entry.as_ptr());
            assert_eq!(f(1, 2, 3, 4, 5, 6, 77, 88), 77);
        }
    }

    #[test]
    fn eighth_argument_loads_after_four_pushes() {
        let mut a = CodeAssembler::new(64).unwrap();
        emit_prolog(&mut a, &[r12, r13, r14, r15], &[r10, r11, r12]).unwrap();
        a.mov(rax, r12).unwrap();
        emit_epilog(&mut a, &[r12, r13, r14, r15]).unwrap();
        let code = a.assemble(0).unwrap();
        let entry = runtime().publish(&code).unwrap();
        unsafe {
            let f: extern "C" fn(u64, u64, u64, u64, u64, u64, u64, u64, u64) -> u64 =
                std::mem::transmute(entry.as_ptr());
            assert_eq!(f(1, 2, 3, 4, 5, 6, 7, 8, 99), 99);
        }
    }
}
