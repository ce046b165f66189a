//! Per-code-object native trampolines that make interpreted frames visible
//! to Linux `perf`.
//!
//! Native sampling profilers only see native stack frames. Every function a
//! bytecode interpreter runs executes under the same native evaluation
//! routine, so to a profiler an entire interpreted program collapses onto
//! one symbol and reports are useless. This crate fixes that by giving each
//! code object its own tiny native stub: the first time a code object is
//! evaluated, a copy of a fixed assembly template is handed out from an
//! executable arena, its address range is published to the profiler under
//! the code object's qualified name, and evaluation enters the default
//! evaluator *through* that stub. Sampled stacks then carry one unique,
//! named native frame per interpreted function:
//!
//! ```text
//!   default_eval_frame          <- frame of foo()
//!   py::foo:/app/foo.py         <- that frame's trampoline
//!   default_eval_frame          <- frame of bar()
//!   py::bar:/app/foo.py
//!   ...
//! ```
//!
//! Two publication backends are provided. [`profiling::perfmap`] appends
//! one text line per stub to `/tmp/perf-<pid>.map`; together with frame
//! pointers (build the embedder with `-fno-omit-frame-pointer`) that is all
//! `perf report` needs. [`profiling::jitdump`] writes the binary
//! `/tmp/jit-<pid>.dump` stream for `perf inject -j`, including synthesized
//! DWARF unwind information, so perf can unwind through the stubs even
//! without frame pointers.
//!
//! The interpreter plugs in through the [`Host`] trait and otherwise stays
//! untouched:
//!
//! ```no_run
//! # fn interpreter_host() -> &'static dyn perf_trampoline::Host { unimplemented!() }
//! let host = interpreter_host();
//! perf_trampoline::set_callbacks(perf_trampoline::profiling::perfmap::callbacks());
//! perf_trampoline::init(host, true)?;
//! // ... run interpreted code, sample with `perf record -F 9999 -g -p <pid>` ...
//! perf_trampoline::fini();
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! Minting never affects program behavior: if executable memory cannot be
//! obtained or a backend write fails, evaluation falls back to the default
//! evaluator and the only casualty is an unattributed sample.

mod arch;
mod arena;
mod evaluator;
mod host;
pub mod profiling;
mod state;

pub use crate::evaluator::{compile_code, trampoline_eval_frame};
pub use crate::host::{CodeObject, EvalFrameFn, Host, InterpFrame, ThreadState, TrampolineFn};
pub use crate::state::{
    after_fork_in_child, fini, free_arenas, get_callbacks, init, is_active, set_callbacks,
    set_persist_after_fork, BackendKind, BackendState, Error, PerfCallbacks,
};
