//! A minimal fake interpreter for driving the trampoline subsystem.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use perf_trampoline::{CodeObject, EvalFrameFn, Host, InterpFrame, ThreadState};
use std::ffi::{c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::OnceLock;

/// Extra-data slots per code object. Every `init` grabs a fresh index, so
/// this bounds the init/fini cycles one test process may run.
pub const EXTRA_SLOTS: usize = 16;

/// Times the default evaluator ran, however it was reached.
pub static DEFAULT_EVAL_CALLS: AtomicUsize = AtomicUsize::new(0);

/// The interpreter's stand-in default evaluator: a pure function of the
/// thread state, the frame's code object, and the throw flag, so tests can
/// check that all three arguments and the result survive the trampoline
/// unchanged.
pub unsafe extern "C" fn default_eval(
    tstate: *mut ThreadState,
    frame: *mut InterpFrame,
    throw_flag: c_int,
) -> *mut c_void {
    DEFAULT_EVAL_CALLS.fetch_add(1, Ordering::SeqCst);
    let code = (*frame.cast::<FakeFrame>()).code;
    (tstate as usize)
        .wrapping_mul(31)
        .wrapping_add(code as usize)
        .wrapping_add(throw_flag as usize) as *mut c_void
}

pub struct FakeCode {
    qualname: Option<String>,
    filename: Option<String>,
    extra: [AtomicPtr<c_void>; EXTRA_SLOTS],
}

impl FakeCode {
    pub fn new(qualname: Option<&str>, filename: Option<&str>) -> FakeCode {
        FakeCode {
            qualname: qualname.map(str::to_owned),
            filename: filename.map(str::to_owned),
            extra: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    pub fn as_ptr(&self) -> *mut CodeObject {
        self as *const FakeCode as *mut CodeObject
    }

    /// What the subsystem cached for this code object, if anything.
    pub fn extra(&self, index: u32) -> *mut c_void {
        self.extra[index as usize].load(Ordering::Acquire)
    }
}

#[repr(C)]
pub struct FakeFrame {
    pub code: *mut CodeObject,
}

pub struct FakeInterp {
    hook: AtomicUsize,
    next_extra_index: AtomicUsize,
}

impl FakeInterp {
    /// The extra-data slot index handed out most recently.
    pub fn last_extra_index(&self) -> u32 {
        self.next_extra_index.load(Ordering::SeqCst) as u32 - 1
    }
}

unsafe impl Host for FakeInterp {
    fn eval_frame_hook(&self) -> Option<EvalFrameFn> {
        match self.hook.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(unsafe { std::mem::transmute::<usize, EvalFrameFn>(raw) }),
        }
    }

    fn set_eval_frame_hook(&self, hook: Option<EvalFrameFn>) {
        self.hook.store(hook.map_or(0, |f| f as usize), Ordering::SeqCst);
    }

    fn default_eval_frame(&self) -> EvalFrameFn {
        default_eval
    }

    unsafe fn frame_code(&self, frame: *mut InterpFrame) -> *mut CodeObject {
        (*frame.cast::<FakeFrame>()).code
    }

    fn request_code_extra_index(&self) -> Option<u32> {
        let index = self.next_extra_index.fetch_add(1, Ordering::SeqCst);
        (index < EXTRA_SLOTS).then_some(index as u32)
    }

    unsafe fn code_extra(&self, code: *mut CodeObject, index: u32) -> *mut c_void {
        (*code.cast::<FakeCode>()).extra[index as usize].load(Ordering::Acquire)
    }

    unsafe fn set_code_extra(&self, code: *mut CodeObject, index: u32, data: *mut c_void) {
        (*code.cast::<FakeCode>()).extra[index as usize].store(data, Ordering::Release);
    }

    unsafe fn code_qualname(&self, code: *mut CodeObject) -> Option<String> {
        (*code.cast::<FakeCode>()).qualname.clone()
    }

    unsafe fn code_filename(&self, code: *mut CodeObject) -> Option<String> {
        (*code.cast::<FakeCode>()).filename.clone()
    }
}

/// The one host instance this test process registers with the subsystem.
pub fn host() -> &'static FakeInterp {
    static HOST: OnceLock<FakeInterp> = OnceLock::new();
    HOST.get_or_init(|| FakeInterp {
        hook: AtomicUsize::new(0),
        next_extra_index: AtomicUsize::new(0),
    })
}

/// Evaluate `code` the way the interpreter would: through the installed
/// hook if there is one, directly through the default evaluator otherwise.
pub fn eval(code: &FakeCode, tstate: usize, throw_flag: c_int) -> *mut c_void {
    let mut frame = FakeFrame { code: code.as_ptr() };
    let frame_ptr = (&mut frame as *mut FakeFrame).cast::<InterpFrame>();
    let eval = host().eval_frame_hook().unwrap_or(default_eval);
    unsafe { eval(tstate as *mut ThreadState, frame_ptr, throw_flag) }
}

/// What [`default_eval`] returns for this code object, computed without
/// running anything through the subsystem.
pub fn expected_result(code: &FakeCode, tstate: usize, throw_flag: c_int) -> usize {
    tstate
        .wrapping_mul(31)
        .wrapping_add(code.as_ptr() as usize)
        .wrapping_add(throw_flag as usize)
}
