//! # Jump Hook
//!
//! This hook type redirects with a 6-byte `jmp [rip + disp32]` through a
//! destination cell allocated near the target, so retargeting is one aligned
//! pointer-sized store

use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use thiserror::Error;

use crate::alloc::{allocate_near, AllocError, ExecutableMemory};
use crate::code::x64::{
    jmp_abs, jmp_indirect, rip_disp, steal_prologue, RelocateError, JMP_ABS_SIZE, JMP_IND_SIZE,
};
use crate::patcher::entry::{EntryPatchGuard, EntryPatcher};
use crate::patcher::{to_mut, Patcher};

use super::{Hook, HookHandle};

/// Bytes reserved per redirection: destination cell plus trampoline, with
/// headroom for prologue instructions that grow when re-encoded
const RESERVE: usize = 96;

/// Errors when installing a jmp hook
#[derive(Debug, Error)]
pub enum JmpError {
    /// The target's entry cannot host a redirection
    #[error("unsupported target entry: {0}")]
    UnsupportedEntry(#[from] RelocateError),
    /// No executable memory is reachable from the entry
    #[error("{0}")]
    Alloc(#[from] AllocError),
    /// The entry's pages could not be made writable
    #[error("{0}")]
    Protection(#[from] region::Error),
    /// The relocated prologue outgrew the reserved trampoline space
    #[error("relocated prologue exceeds the trampoline buffer")]
    TrampolineOverflow,
    /// The destination cell is not reachable with a 32-bit displacement
    #[error("destination cell is out of displacement range of the entry")]
    OutOfRange,
}

/// Hook that patches an indirect jmp over the target's entry.
///
/// Layout of the near allocation:
///
/// ```text
/// [destination cell: 8 bytes, aligned] [relocated prologue...] [jmp back]
/// ```
///
/// The entry's `jmp [rip + disp32]` reads the cell on every call, so
/// [`HookHandle::retarget`] only stores a new address into the cell. The
/// relocated prologue plus the jump back to the remainder of the body is the
/// alternate entry.
#[derive(Default)]
pub struct JmpHook {
    /// Patcher used to rewrite the entry bytes
    patcher: EntryPatcher,
}

impl JmpHook {
    /// Creates a new jmp hook
    pub fn new() -> Self {
        Self::default()
    }
}

unsafe impl Hook for JmpHook {
    type Error = JmpError;
    type Handle = JmpHookHandle;

    unsafe fn install(
        &self,
        target: *const u8,
        replacement: *const u8,
    ) -> Result<Self::Handle, Self::Error> {
        let mut memory = allocate_near(target as usize, RESERVE)?;
        let base = memory.as_ptr() as usize;

        // the cell must be 8-byte aligned so retargeting stores atomically
        let cell = (base + 7) & !7;
        let trampoline = cell + 8;

        // build the trampoline before touching the entry; an unsupported
        // prologue must fail with the target untouched
        let (prologue, stolen) = steal_prologue(target, JMP_IND_SIZE, trampoline as u64)?;
        let resume = jmp_abs(target as usize + stolen);
        let end = (trampoline - base) + prologue.len() + JMP_ABS_SIZE;
        if end > memory.len() {
            return Err(JmpError::TrampolineOverflow);
        }

        let offset = cell - base;
        memory[offset..offset + 8].copy_from_slice(&(replacement as usize).to_le_bytes());
        let offset = trampoline - base;
        memory[offset..offset + prologue.len()].copy_from_slice(&prologue);
        memory[offset + prologue.len()..end].copy_from_slice(&resume);

        let disp =
            rip_disp(target as usize + JMP_IND_SIZE, cell).ok_or(JmpError::OutOfRange)?;
        let guard = self.patcher.patch(to_mut(target), &jmp_indirect(disp))?;

        debug!(
            "redirected entry {target:p} -> {replacement:p}, alternate entry {:#x}",
            trampoline
        );

        Ok(JmpHookHandle {
            guard,
            cell,
            alt: trampoline,
            _memory: memory,
        })
    }
}

/// Handle for an installed jmp hook.
///
/// Dropping the handle restores the original entry bytes and releases the
/// cell and trampoline memory, in that order.
pub struct JmpHookHandle {
    /// Restores the entry bytes when dropped; declared first so the entry
    /// stops pointing at the cell before the memory is released
    guard: EntryPatchGuard,
    /// Address of the destination cell
    cell: usize,
    /// Address of the trampoline
    alt: usize,
    /// Owns the cell and trampoline
    _memory: ExecutableMemory,
}

unsafe impl HookHandle for JmpHookHandle {
    type Error = JmpError;

    fn alt_entry(&self) -> *const u8 {
        self.alt as *const u8
    }

    unsafe fn retarget(&self, replacement: *const u8) -> Result<(), Self::Error> {
        // Safety: the cell was created 8-byte aligned and lives as long as
        // this handle
        let cell = &*(self.cell as *const AtomicUsize);
        cell.store(replacement as usize, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use std::mem;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::alloc::{allocate_near, ExecutableMemory};
    use crate::hook::{Hook, HookHandle};

    use super::JmpHook;

    /// A callable unit crafted as machine code: `mov rax, rdi; add rax, rsi; ret`
    const ADD_BODY: [u8; 7] = [0x48, 0x89, 0xf8, 0x48, 0x01, 0xf0, 0xc3];

    /// Writes `body` into fresh executable memory, padded with nops
    fn craft(body: &[u8]) -> ExecutableMemory {
        let mut memory = allocate_near(craft as usize, 64).unwrap();
        memory[..body.len()].copy_from_slice(body);
        for byte in &mut memory[body.len()..] {
            *byte = 0x90;
        }
        memory
    }

    /// Calls a two-argument entry with the platform convention
    unsafe fn call2(entry: *const u8, a: usize, b: usize) -> usize {
        mem::transmute::<*const u8, extern "sysv64" fn(usize, usize) -> usize>(entry)(a, b)
    }

    extern "sysv64" fn add_plus_100(a: usize, b: usize) -> usize {
        a + b + 100
    }

    extern "sysv64" fn mul(a: usize, b: usize) -> usize {
        a * b
    }

    extern "sysv64" fn always_one(_: usize, _: usize) -> usize {
        1
    }

    extern "sysv64" fn always_two(_: usize, _: usize) -> usize {
        2
    }

    #[test]
    /// Install redirects the entry, retarget moves only the destination, and
    /// dropping the handle restores the original body
    fn test_install_retarget_restore() {
        let target = craft(&ADD_BODY);
        let entry = target.as_ptr();

        // sanity check the crafted body
        assert_eq!(unsafe { call2(entry, 2, 3) }, 5);

        let hook = JmpHook::new();
        let handle = unsafe { hook.install(entry, add_plus_100 as *const u8).unwrap() };

        // calls through the entry reach the replacement
        assert_eq!(unsafe { call2(entry, 2, 3) }, 105);
        // the alternate entry still runs the original body
        let alt = handle.alt_entry();
        assert_eq!(unsafe { call2(alt, 2, 3) }, 5);

        unsafe { handle.retarget(mul as *const u8).unwrap() };
        assert_eq!(unsafe { call2(entry, 2, 3) }, 6);
        // retargeting never moves the alternate entry
        assert_eq!(handle.alt_entry(), alt);
        assert_eq!(unsafe { call2(alt, 2, 3) }, 5);

        drop(handle);
        assert_eq!(unsafe { call2(entry, 2, 3) }, 5);
    }

    #[test]
    /// A body that returns before the patch site is rejected untouched
    fn test_install_too_small() {
        // xor eax, eax; ret
        let target = craft(&[0x31, 0xc0, 0xc3]);
        let entry = target.as_ptr();
        let before: Vec<u8> = target[..8].to_vec();

        let hook = JmpHook::new();
        assert!(unsafe { hook.install(entry, add_plus_100 as *const u8) }.is_err());
        assert_eq!(&target[..8], &before[..]);
    }

    #[test]
    /// Concurrent callers during a retarget observe the old or new
    /// replacement, never anything else
    fn test_retarget_under_load() {
        let target = craft(&ADD_BODY);
        let entry = target.as_ptr() as usize;

        let hook = JmpHook::new();
        let handle = unsafe {
            hook.install(entry as *const u8, always_one as *const u8)
                .unwrap()
        };

        let done = Arc::new(AtomicBool::new(false));
        let callers: Vec<_> = (0..4)
            .map(|_| {
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let result = unsafe { call2(entry as *const u8, 0, 0) };
                        assert!(result == 1 || result == 2);
                    }
                })
            })
            .collect();

        for _ in 0..500 {
            unsafe {
                handle.retarget(always_two as *const u8).unwrap();
                handle.retarget(always_one as *const u8).unwrap();
            }
        }
        done.store(true, Ordering::Relaxed);

        for caller in callers {
            caller.join().unwrap();
        }
    }
}
