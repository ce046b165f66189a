//! Executable arenas the trampolines are minted from.
//!
//! Mapping one page per stub would be absurdly wasteful, so stubs come from
//! big arenas: each is mapped read-write, prepopulated with copies of the
//! template at every chunk boundary, flipped to read-execute once, and then
//! only ever bump-allocated from. Exhausted arenas stay mapped (their stubs
//! are live code) and a fresh arena is linked ahead of them.

use crate::arch;
use anyhow::{anyhow, Context, Result};
use log::debug;
use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};
use std::ffi::c_void;
use std::ptr;

/// Stubs are handed out at this alignment. Finer alignment showed no
/// measurable win on x86-64 or aarch64, and 16 keeps gdb's unwinder happy
/// across stub boundaries.
const CHUNK_ALIGN: usize = 16;

/// Arena size in pages. Non-trivial programs typically need 64 to 256 kiB
/// worth of stubs.
const ARENA_PAGES: usize = 16;

/// The address and code length of one minted stub.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Trampoline {
    pub addr: *const u8,
    pub code_size: usize,
}

/// One read-execute mapping prepopulated with template copies.
pub(crate) struct CodeArena {
    // Held as a `usize` rather than a pointer so the arena list is `Send`;
    // the mapping itself is coordinated at the OS layer.
    base: usize,
    size: usize,
    used: usize,
    size_left: usize,
    /// Spacing between template copies: the template plus the backend's
    /// padding request, rounded up to [`CHUNK_ALIGN`]. Recorded per arena
    /// so earlier arenas stay consistent when the padding changes.
    chunk_size: usize,
    /// Byte length of the template held in each chunk.
    code_size: usize,
    prev: Option<Box<CodeArena>>,
}

impl CodeArena {
    fn new(code_padding: usize) -> Result<Box<CodeArena>> {
        let template = arch::template_code();
        let size = ARENA_PAGES * rustix::param::page_size();
        let chunk_size = align_up(template.len() + code_padding, CHUNK_ALIGN);

        let base = unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .context("mmap failed to allocate a trampoline arena")?
        };

        unsafe {
            let mut offset = 0;
            while offset + chunk_size <= size {
                ptr::copy_nonoverlapping(
                    template.as_ptr(),
                    base.cast::<u8>().add(offset),
                    template.len(),
                );
                offset += chunk_size;
            }
        }

        // Some systems refuse to create executable code on the fly; release
        // the mapping rather than keep a data-only arena around.
        if let Err(err) =
            unsafe { mprotect(base, size, MprotectFlags::READ | MprotectFlags::EXEC) }
        {
            unsafe {
                let _ = munmap(base, size);
            }
            return Err(anyhow::Error::new(err)
                .context("mprotect failed to make a trampoline arena executable"));
        }

        // On arm and aarch64 the freshly copied bytes must reach the
        // instruction cache before any stub in the arena runs.
        if let Err(err) = icache_coherence(base, size) {
            unsafe {
                let _ = munmap(base, size);
            }
            return Err(err);
        }

        Ok(Box::new(CodeArena {
            base: base as usize,
            size,
            used: 0,
            size_left: size,
            chunk_size,
            code_size: template.len(),
            prev: None,
        }))
    }

    fn has_room(&self) -> bool {
        self.size_left >= self.chunk_size
    }

    fn bump(&mut self) -> Trampoline {
        debug_assert!(self.has_room());
        let addr = (self.base + self.used) as *const u8;
        self.used += self.chunk_size;
        self.size_left -= self.chunk_size;
        Trampoline {
            addr,
            code_size: self.code_size,
        }
    }

    fn contains(&self, addr: usize) -> bool {
        (self.base..self.base + self.size).contains(&addr)
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base as *mut c_void, self.size);
        }
    }
}

/// The arena list, newest first.
pub(crate) struct ArenaList {
    head: Option<Box<CodeArena>>,
}

impl ArenaList {
    pub(crate) const fn new() -> ArenaList {
        ArenaList { head: None }
    }

    /// Map and link a fresh arena at the head of the list. The current head
    /// is left untouched on failure.
    pub(crate) fn grow(&mut self, code_padding: usize) -> Result<()> {
        let mut arena = CodeArena::new(code_padding)?;
        debug!(
            "new trampoline arena at {:#x}: {} chunks of {} bytes",
            arena.base,
            arena.size / arena.chunk_size,
            arena.chunk_size,
        );
        arena.prev = self.head.take();
        self.head = Some(arena);
        Ok(())
    }

    /// Hand out the next stub, growing the list if the head arena is
    /// missing or full.
    pub(crate) fn mint(&mut self, code_padding: usize) -> Result<Trampoline> {
        if !self.head.as_deref().is_some_and(CodeArena::has_room) {
            self.grow(code_padding)?;
        }
        Ok(self.head.as_mut().unwrap().bump())
    }

    /// Unmap every arena, newest first.
    pub(crate) fn free_all(&mut self) {
        let mut cur = self.head.take();
        while let Some(mut arena) = cur {
            cur = arena.prev.take();
        }
    }

    #[cfg(test)]
    fn contains(&self, addr: usize) -> bool {
        let mut cur = self.head.as_deref();
        while let Some(arena) = cur {
            if arena.contains(addr) {
                return true;
            }
            cur = arena.prev.as_deref();
        }
        false
    }

    #[cfg(test)]
    fn arena_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.head.as_deref();
        while let Some(arena) = cur {
            count += 1;
            cur = arena.prev.as_deref();
        }
        count
    }
}

fn icache_coherence(base: *mut c_void, len: usize) -> Result<()> {
    unsafe { wasmtime_jit_icache_coherence::clear_cache(base.cast_const(), len) }
        .map_err(|err| anyhow!("failed to clear the instruction cache: {err:?}"))?;
    wasmtime_jit_icache_coherence::pipeline_flush_mt()
        .map_err(|err| anyhow!("failed to flush the pipeline: {err:?}"))?;
    Ok(())
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
