//! x86-64 JIT back-end: executable-memory runtime, calling-convention frame,
//! the instruction-set abstraction, and the kernel synthesizer.

pub(crate) mod frame;
pub(crate) mod isa;
pub(crate) mod runtime;
pub(crate) mod synthesizer;
