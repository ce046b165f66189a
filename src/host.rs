//! The seam between this crate and the interpreter that owns the frames.
//!
//! The trampoline core needs very little from its host: a hook slot for the
//! frame-evaluation function, a way to reach the default evaluator, a
//! per-code-object storage slot to cache minted stubs in, and the two
//! strings a published symbol is built from. Everything else about the
//! interpreter stays opaque behind the raw pointer types below.

use std::ffi::{c_int, c_void};

/// The host's per-thread interpreter state. Opaque to this crate; it is
/// only ever forwarded through the trampoline.
#[repr(C)]
pub struct ThreadState {
    _private: [u8; 0],
}

/// One frame about to be evaluated. Opaque except for [`Host::frame_code`].
#[repr(C)]
pub struct InterpFrame {
    _private: [u8; 0],
}

/// The host's representation of a compiled function body. Carries a
/// qualified name, a source filename, and an extra-data slot.
#[repr(C)]
pub struct CodeObject {
    _private: [u8; 0],
}

/// A frame evaluator: the default one, or the hook this crate installs.
pub type EvalFrameFn =
    unsafe extern "C" fn(*mut ThreadState, *mut InterpFrame, c_int) -> *mut c_void;

/// A minted stub. The evaluator to forward to is passed as the fourth
/// argument so the stub itself stays position-independent.
pub type TrampolineFn =
    unsafe extern "C" fn(*mut ThreadState, *mut InterpFrame, c_int, EvalFrameFn) -> *mut c_void;

/// Interface to the interpreter embedding this crate.
///
/// Registered once via [`crate::init`] and used from whichever thread
/// evaluates a frame, so implementations must be internally synchronized.
///
/// # Safety
///
/// Implementations must uphold the pointer contracts the evaluation hook
/// relies on:
///
/// * [`Host::frame_code`] must return a code object that stays alive for at
///   least as long as the frame it was taken from is being evaluated.
/// * The extra-data slot must behave like a plain per-code-object pointer
///   cell: [`Host::code_extra`] returns the last value stored through
///   [`Host::set_code_extra`] for the same `index`, null initially, and a
///   store must be visible to other threads no later than the cell's next
///   load (release/acquire ordering or stronger).
/// * [`Host::default_eval_frame`] must be callable with any
///   (`tstate`, `frame`, `throw_flag`) triple the hook itself was called
///   with.
pub unsafe trait Host: Sync {
    /// The currently installed frame-evaluation hook, if any.
    fn eval_frame_hook(&self) -> Option<EvalFrameFn>;

    /// Install (or with `None`, clear) the frame-evaluation hook.
    fn set_eval_frame_hook(&self, hook: Option<EvalFrameFn>);

    /// The evaluator frames run through when no hook is installed.
    fn default_eval_frame(&self) -> EvalFrameFn;

    /// The code object the frame is executing.
    unsafe fn frame_code(&self, frame: *mut InterpFrame) -> *mut CodeObject;

    /// Reserve a fresh extra-data slot index, or `None` if the host cannot
    /// hand one out.
    fn request_code_extra_index(&self) -> Option<u32>;

    /// Read the code object's extra-data slot at `index`.
    unsafe fn code_extra(&self, code: *mut CodeObject, index: u32) -> *mut c_void;

    /// Store into the code object's extra-data slot at `index`.
    unsafe fn set_code_extra(&self, code: *mut CodeObject, index: u32, data: *mut c_void);

    /// The code object's qualified name, if it has one.
    unsafe fn code_qualname(&self, code: *mut CodeObject) -> Option<String>;

    /// The code object's source filename, if it has one.
    unsafe fn code_filename(&self, code: *mut CodeObject) -> Option<String>;
}
