//! The perf-map backend: one `/tmp/perf-<pid>.map` line per stub.

use crate::state::{BackendKind, BackendState, PerfCallbacks};
use anyhow::Result;
use log::warn;
use perf_trampoline_jit_debug::perf_map;
use std::ptr;

/// The perf-map backend's callbacks.
pub fn callbacks() -> PerfCallbacks {
    PerfCallbacks {
        kind: BackendKind::Map,
        // Map lines carry no unwind payload, so stubs can sit back to back.
        code_padding: 0,
        init_state,
        write_state,
        free_state,
    }
}

fn init_state() -> Result<BackendState> {
    // Stateless apart from the process-wide map file, which opens lazily on
    // the first write; the null token records that.
    Ok(ptr::null_mut())
}

unsafe fn write_state(_state: BackendState, addr: *const u8, len: usize, name: &str) {
    if let Err(err) = perf_map::write_entry(addr, len, name) {
        warn!("failed to append a perf map entry for {name}: {err:?}");
    }
}

fn free_state(_state: BackendState) {
    perf_map::fini();
}
