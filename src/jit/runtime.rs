//! Executable-memory runtime: mmap'd W^X code pages behind a process-wide
//! publication lock.
//!
//! Published buffers are retained until process teardown; a kernel entry
//! point handed out once must stay callable for the lifetime of every cached
//! kernel that references it.

use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};

use crate::types::KernelError;

/// An executable memory region backed by mmap.
struct ExecutableBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: ExecutableBuffer owns its mapping exclusively and the contents are
// immutable (PROT_READ|PROT_EXEC) after construction.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Allocate a page-rounded mapping, copy `code` into it, and flip the
    /// protection to read-execute.
    fn new(code: &[u8]) -> Result<Self, KernelError> {
        if code.is_empty() {
            return Err(KernelError::CompileError(
                "refusing to publish empty code buffer".into(),
            ));
        }

        let page_size = page_size();
        let len = (code.len() + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no fd; result checked against
        // MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(KernelError::CompileError(
                "mmap failed for executable buffer".into(),
            ));
        }
        let ptr = ptr as *mut u8;

        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }

        let ret = unsafe { libc::mprotect(ptr as *mut _, len, libc::PROT_READ | libc::PROT_EXEC) };
        if ret != 0 {
            unsafe {
                libc::munmap(ptr as *mut _, len);
            }
            return Err(KernelError::CompileError(
                "mprotect failed for executable buffer".into(),
            ));
        }

        Ok(ExecutableBuffer { ptr, len })
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            unsafe {
                libc::munmap(self.ptr as *mut _, self.len);
            }
        }
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Process-wide owner of all published kernel code.
pub(crate) struct JitRuntime {
    buffers: Mutex<Vec<ExecutableBuffer>>,
}

impl JitRuntime {
    fn new() -> Self {
        JitRuntime {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Copy assembled code into executable memory and return its entry point.
    ///
    /// Publication is serialized on the runtime's lock; the buffer is kept
    /// alive in the arena until process exit.
    pub(crate) fn publish(&self, code: &[u8]) -> Result<NonNull<u8>, KernelError> {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = ExecutableBuffer::new(code)?;
        // Not null: ExecutableBuffer::new only returns mapped pages.
        let entry = NonNull::new(buf.ptr).ok_or_else(|| {
            KernelError::CompileError("executable buffer had null base".into())
        })?;
        buffers.push(buf);
        Ok(entry)
    }
}

pub(crate) fn runtime() -> &'static JitRuntime {
    static RUNTIME: OnceLock<JitRuntime> = OnceLock::new();
    RUNTIME.get_or_init(JitRuntime::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_rejects_empty_code() {
        assert!(runtime().publish(&[]).is_err());
    }

    #[test]
    fn published_stub_is_callable() {
        // x86_64 `ret`
        let code = [0xC3u8];
        let entry = runtime().publish(&code).unwrap();
        unsafe {
            let f: extern "C" fn() = std::mem::transmute(entry.as_ptr());
            f();
        }
    }

    #[test]
    fn published_identity_fn_returns_argument() {
        // mov rax, rdi; ret
        let code = [0x48u8, 0x89, 0xF8, 0xC3];
        let entry = runtime().publish(&code).unwrap();
        unsafe {
            let f: extern "C" fn(u64) -> u64 = std::mem::transmute(entry.as_ptr());
            assert_eq!(f(0xDEAD_BEEF), 0xDEAD_BEEF);
        }
    }
}
