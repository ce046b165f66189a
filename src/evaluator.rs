//! The trampoline-installing frame evaluator.
//!
//! Installed as the host's frame-evaluation hook. The first time a code
//! object comes through, a stub is minted for it, published to the active
//! backend, and cached in the code object's extra-data slot; from then on
//! every evaluation of that code object enters the default evaluator
//! through its own stub, and that stub's address is what the profiler sees
//! on the native stack.

use crate::host::{CodeObject, Host, InterpFrame, ThreadState, TrampolineFn};
use crate::state::{self, Error, Status, EXTRA_CODE_INDEX};
use anyhow::{bail, Result};
use std::ffi::{c_int, c_void};
use std::mem;
use std::sync::atomic::Ordering;

/// The frame-evaluation hook. Never fails upward: any problem minting or
/// publishing a stub falls back to the default evaluator, so evaluation
/// results are unaffected by profiling state.
pub unsafe extern "C" fn trampoline_eval_frame(
    tstate: *mut ThreadState,
    frame: *mut InterpFrame,
    throw_flag: c_int,
) -> *mut c_void {
    // The hook is only ever installed through `init`, which registers the
    // host first.
    let Some(host) = state::host() else {
        return std::ptr::null_mut();
    };
    let default_eval = host.default_eval_frame();
    if state::status() != Status::Ok {
        return default_eval(tstate, frame, throw_flag);
    }
    let code = host.frame_code(frame);
    match trampoline_for_code(host, code) {
        Ok(stub) => stub(tstate, frame, throw_flag, default_eval),
        Err(_) => default_eval(tstate, frame, throw_flag),
    }
}

/// Mint and publish a stub for one code object without evaluating it, so
/// hosts can pre-populate the cache (and the profiler's symbol table)
/// before hot code first runs.
///
/// # Safety
///
/// `code` must be a live code object of the registered host.
pub unsafe fn compile_code(code: *mut CodeObject) -> Result<()> {
    let host = state::host().ok_or(Error::NotInitialized)?;
    if state::status() != Status::Ok {
        bail!(Error::NotInitialized);
    }
    trampoline_for_code(host, code)?;
    Ok(())
}

/// The code object's cached stub, minting and publishing one first if this
/// is the first time the code object comes through.
unsafe fn trampoline_for_code(host: &dyn Host, code: *mut CodeObject) -> Result<TrampolineFn> {
    let index = EXTRA_CODE_INDEX.load(Ordering::Acquire);
    if index == u32::MAX {
        bail!(Error::NotInitialized);
    }

    let cached = host.code_extra(code, index);
    if !cached.is_null() {
        return Ok(mem::transmute::<*mut c_void, TrampolineFn>(cached));
    }

    let mut state = state::lock_state();
    // Re-check under the lock: a racing thread may have minted while we
    // waited, and each code object publishes at most one symbol.
    let cached = host.code_extra(code, index);
    if !cached.is_null() {
        return Ok(mem::transmute::<*mut c_void, TrampolineFn>(cached));
    }

    let trampoline = match state.mint_trampoline() {
        Ok(trampoline) => trampoline,
        Err(err) => {
            // Arena exhaustion is an allocation failure; gate every later
            // evaluation straight into the fallback path.
            state::set_status(Status::Failed);
            return Err(err.context(Error::AllocationFailure));
        }
    };

    let name = symbol_name(host, code);
    // Publish before the cache store: by the time another thread can see
    // the stub, its symbol is already on record.
    state.publish(trampoline, &name);
    host.set_code_extra(code, index, trampoline.addr as *mut c_void);

    Ok(mem::transmute::<*const u8, TrampolineFn>(trampoline.addr))
}

/// The symbol a code object publishes as: `py::<qualname>:<filename>`,
/// with missing components left empty.
unsafe fn symbol_name(host: &dyn Host, code: *mut CodeObject) -> String {
    let qualname = host.code_qualname(code).unwrap_or_default();
    let filename = host.code_filename(code).unwrap_or_default();
    format!("py::{qualname}:{filename}")
}
