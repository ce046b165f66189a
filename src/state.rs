//! The process-wide subsystem record and its lifecycle.
//!
//! Everything mutable lives in one place: a status word the evaluation
//! hook's fast path reads without locking, and a mutex-guarded record for
//! the slow path (arena list, backend callbacks, fork policy). The host is
//! expected to serialize [`init`]/[`fini`]/[`set_callbacks`] themselves;
//! frame evaluation may happen concurrently with anything.

use crate::arena::{ArenaList, Trampoline};
use crate::evaluator;
use crate::host::{EvalFrameFn, Host};
use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use perf_trampoline_jit_debug::perf_map;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Failure conditions callers may want to tell apart; carried in the
/// `anyhow` context chain of the public entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// `init` found a frame-evaluation hook that is not ours.
    #[error("a foreign frame-evaluation hook is already installed")]
    HookConflict,
    /// The operation needs an active subsystem.
    #[error("the perf trampoline subsystem is not initialized")]
    NotInitialized,
    /// `init` was called with a different host than the one registered.
    #[error("the perf trampoline subsystem is bound to a different host")]
    HostMismatch,
    /// Executable memory could not be obtained; the subsystem is in
    /// fallback until the next `fini`/`init` cycle.
    #[error("failed to allocate executable trampoline memory")]
    AllocationFailure,
    /// Fork persistence only works with the perf-map backend.
    #[error("perf map entries only persist across fork with the map backend active")]
    ForkPolicyMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Status {
    NoInit = 0,
    Ok = 1,
    Failed = 2,
}

/// Which backend family currently owns publication. Tagged while the
/// subsystem is active; the fork handler keys its policy on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Unset,
    Map,
    Jitdump,
}

/// Opaque token a backend's `init_state` hands back and the other two
/// callbacks receive. Null means "no state" — the perf-map backend runs
/// that way permanently, the jitdump backend until its lazy init succeeds.
pub type BackendState = *mut c_void;

/// A symbol-publication backend: the three callbacks the core drives, plus
/// the two constants the core needs to know up front.
#[derive(Clone, Copy)]
pub struct PerfCallbacks {
    /// The backend family, for the fork-persist policy.
    pub kind: BackendKind,
    /// Extra bytes to reserve after every stub in the arenas, so whatever
    /// the backend publishes per stub fits between neighboring code ranges.
    pub code_padding: usize,
    /// Create backend state. Called when the subsystem activates; a failure
    /// is logged and publication becomes best-effort.
    pub init_state: fn() -> Result<BackendState>,
    /// Publish `len` bytes of code at `addr` under `name`.
    ///
    /// # Safety
    ///
    /// `addr` must point to at least `len` readable bytes.
    pub write_state: unsafe fn(state: BackendState, addr: *const u8, len: usize, name: &str),
    /// Tear down whatever `init_state` created.
    pub free_state: fn(state: BackendState),
}

pub(crate) struct PerfState {
    arenas: ArenaList,
    callbacks: Option<PerfCallbacks>,
    backend_state: BackendState,
    backend_kind: BackendKind,
    persist_after_fork: bool,
}

// The backend token is opaque and only ever dereferenced by the backend
// that produced it; holding it in the process-wide record is fine.
unsafe impl Send for PerfState {}

impl PerfState {
    const fn new() -> PerfState {
        PerfState {
            arenas: ArenaList::new(),
            callbacks: None,
            backend_state: ptr::null_mut(),
            backend_kind: BackendKind::Unset,
            persist_after_fork: false,
        }
    }

    /// Mint one stub, sized for the active backend's padding request.
    pub(crate) fn mint_trampoline(&mut self) -> Result<Trampoline> {
        let code_padding = self.callbacks.map_or(0, |cb| cb.code_padding);
        self.arenas.mint(code_padding)
    }

    /// Hand the stub to the active backend, if any.
    pub(crate) fn publish(&mut self, trampoline: Trampoline, name: &str) {
        if let Some(cb) = self.callbacks {
            unsafe {
                (cb.write_state)(self.backend_state, trampoline.addr, trampoline.code_size, name);
            }
        }
    }
}

static STATE: Mutex<PerfState> = Mutex::new(PerfState::new());
static STATUS: AtomicU8 = AtomicU8::new(Status::NoInit as u8);
static HOST: OnceLock<&'static dyn Host> = OnceLock::new();

/// The extra-data slot index the evaluation hook reads on its fast path,
/// mirrored out of the locked state. `u32::MAX` while uninitialized.
pub(crate) static EXTRA_CODE_INDEX: AtomicU32 = AtomicU32::new(u32::MAX);

pub(crate) fn status() -> Status {
    match STATUS.load(Ordering::Acquire) {
        1 => Status::Ok,
        2 => Status::Failed,
        _ => Status::NoInit,
    }
}

pub(crate) fn set_status(status: Status) {
    STATUS.store(status as u8, Ordering::Release);
}

pub(crate) fn host() -> Option<&'static dyn Host> {
    HOST.get().copied()
}

pub(crate) fn lock_state() -> MutexGuard<'static, PerfState> {
    STATE.lock().unwrap()
}

/// Register a symbol-publication backend, finalizing the previous one if
/// the subsystem is currently active.
pub fn set_callbacks(callbacks: PerfCallbacks) {
    if status() == Status::Ok {
        fini();
    }
    let mut state = lock_state();
    state.callbacks = Some(callbacks);
    state.backend_state = ptr::null_mut();
}

/// The currently registered backend, if any.
pub fn get_callbacks() -> Option<PerfCallbacks> {
    lock_state().callbacks
}

/// Install (or with `activate = false`, clear) the trampoline evaluation
/// hook for `host`.
///
/// With `activate = true` this maps the first arena, reserves an extra-data
/// slot index, brings up the registered backend, and marks the subsystem
/// live; every later frame evaluation mints and publishes stubs on demand.
/// Fails without side effects if a foreign evaluation hook is installed.
pub fn init(host: &'static dyn Host, activate: bool) -> Result<()> {
    let registered = *HOST.get_or_init(|| host);
    if !ptr::eq(
        registered as *const dyn Host as *const (),
        host as *const dyn Host as *const (),
    ) {
        bail!(Error::HostMismatch);
    }

    if let Some(hook) = host.eval_frame_hook() {
        if hook != evaluator::trampoline_eval_frame as EvalFrameFn {
            bail!(Error::HookConflict);
        }
    }

    if !activate {
        host.set_eval_frame_hook(None);
        set_status(Status::NoInit);
        return Ok(());
    }

    host.set_eval_frame_hook(Some(evaluator::trampoline_eval_frame));

    let mut state = lock_state();
    let code_padding = state.callbacks.map_or(0, |cb| cb.code_padding);
    if let Err(err) = state.arenas.grow(code_padding) {
        set_status(Status::Failed);
        return Err(err.context(Error::AllocationFailure));
    }

    let index = host
        .request_code_extra_index()
        .ok_or_else(|| anyhow!("the host could not reserve a code extra-data slot"))?;
    EXTRA_CODE_INDEX.store(index, Ordering::Release);

    if let Some(cb) = state.callbacks {
        if state.backend_state.is_null() {
            match (cb.init_state)() {
                Ok(backend_state) => state.backend_state = backend_state,
                // Best-effort: the backend may be able to come up lazily on
                // its first write.
                Err(err) => warn!("trampoline backend failed to initialize: {err:?}"),
            }
        }
        state.backend_kind = cb.kind;
    }

    drop(state);
    set_status(Status::Ok);
    debug!("perf trampoline subsystem activated");
    Ok(())
}

/// Restore the default evaluation hook and release backend state. Arenas
/// stay mapped: stubs already cached on live code objects must keep
/// working. [`free_arenas`] releases them at full teardown.
pub fn fini() {
    if status() != Status::Ok {
        return;
    }
    let Some(host) = host() else { return };
    if host.eval_frame_hook() == Some(evaluator::trampoline_eval_frame as EvalFrameFn) {
        host.set_eval_frame_hook(None);
    }
    let mut state = lock_state();
    if let Some(cb) = state.callbacks {
        (cb.free_state)(state.backend_state);
    }
    state.backend_state = ptr::null_mut();
    state.backend_kind = BackendKind::Unset;
    drop(state);
    EXTRA_CODE_INDEX.store(u32::MAX, Ordering::Release);
    set_status(Status::NoInit);
    debug!("perf trampoline subsystem deactivated");
}

/// Whether our evaluation hook is the one currently installed.
pub fn is_active() -> bool {
    match host() {
        Some(host) => {
            host.eval_frame_hook() == Some(evaluator::trampoline_eval_frame as EvalFrameFn)
        }
        None => false,
    }
}

/// Unmap every arena. Only safe at full process teardown, after [`fini`],
/// when no cached stub can run anymore.
pub fn free_arenas() {
    lock_state().arenas.free_all();
}

/// Set whether a forked child keeps the parent's published symbols instead
/// of restarting with its own files. Returns the value just set.
pub fn set_persist_after_fork(enable: bool) -> bool {
    lock_state().persist_after_fork = enable;
    enable
}

/// Apply the fork policy in a freshly forked child.
///
/// With persistence on (perf-map backend only), the subsystem shuts down
/// and the parent's map file is carried over under the child's pid. With
/// persistence off, an active subsystem is torn down and restarted so the
/// child publishes to its own files.
pub fn after_fork_in_child() -> Result<()> {
    let persist = lock_state().persist_after_fork;
    if persist {
        if lock_state().backend_kind != BackendKind::Map {
            bail!(Error::ForkPolicyMismatch);
        }
        fini();
        let parent_pid = rustix::process::getppid()
            .map(|pid| pid.as_raw_nonzero().get() as u32)
            .ok_or_else(|| anyhow!("the parent process is gone"))?;
        perf_map::copy_from(&perf_map::path_for_pid(parent_pid))
            .context("failed to copy the parent's perf map file")?;
    } else {
        let was_active = is_active();
        fini();
        if was_active {
            let host = host().ok_or(Error::NotInitialized)?;
            init(host, true)?;
        }
    }
    Ok(())
}
