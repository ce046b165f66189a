//! Symbol-publication backends.
//!
//! A backend is a [`crate::PerfCallbacks`] value; at most one is registered
//! at a time. [`perfmap`] covers the common case — perf resolves symbol
//! names from the text sidecar, frame pointers do the unwinding.
//! [`jitdump`] additionally ships synthesized unwind information, for
//! callers built without frame pointers or profiled with `--call-graph
//! dwarf`.

pub mod jitdump;
pub mod perfmap;
