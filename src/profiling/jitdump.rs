//! The jitdump backend: a binary `/tmp/jit-<pid>.dump` stream with
//! synthesized unwind information, consumed by `perf inject -j`.

use crate::state::{BackendKind, BackendState, PerfCallbacks};
use anyhow::Result;
use log::warn;
use perf_trampoline_jit_debug::perf_jitdump::JitDumpFile;
use std::process;
use std::sync::Mutex;

/// Spacing reserved after every stub. `perf inject` synthesizes one DSO per
/// code-load record — headers, code, and unwind info — and maps them at the
/// recorded code addresses, so consecutive stubs must sit far enough apart
/// that those images do not overlap. The unwind payload per stub is under
/// 0x100 bytes on every supported architecture.
pub const CODE_PADDING: usize = 0x100;

/// Process-wide jitdump file. Perf only accepts a unique file per process
/// in the injection step.
static JITDUMP_FILE: Mutex<Option<JitDumpFile>> = Mutex::new(None);

/// The jitdump backend's callbacks.
pub fn callbacks() -> PerfCallbacks {
    PerfCallbacks {
        kind: BackendKind::Jitdump,
        code_padding: CODE_PADDING,
        init_state,
        write_state,
        free_state,
    }
}

fn init_state() -> Result<BackendState> {
    let mut file = JITDUMP_FILE.lock().unwrap();
    if file.is_none() {
        *file = Some(open_dump()?);
    }
    // The token only signals "state ready"; the real state lives behind the
    // lock above.
    Ok(&JITDUMP_FILE as *const _ as BackendState)
}

unsafe fn write_state(_state: BackendState, addr: *const u8, len: usize, name: &str) {
    let mut slot = JITDUMP_FILE.lock().unwrap();
    // A failed init leaves no file behind; retry here so profiling can
    // still come up late.
    if slot.is_none() {
        match open_dump() {
            Ok(file) => *slot = Some(file),
            Err(err) => {
                warn!("jitdump: failed to create the dump file: {err:?}");
                return;
            }
        }
    }
    let file = slot.as_mut().unwrap();

    #[allow(trivial_numeric_casts)]
    let tid = rustix::thread::gettid().as_raw_nonzero().get() as u32;

    // One locked sequence per stub: the unwinding info immediately followed
    // by its code-load record, so readers always see the two paired.
    let timestamp = file.get_time_stamp();
    if let Err(err) = file.dump_unwinding_info_record(len, timestamp) {
        warn!("jitdump: failed to write unwinding info for {name}: {err:?}");
        return;
    }
    let timestamp = file.get_time_stamp();
    if let Err(err) = file.dump_code_load_record(name, addr, len, timestamp, process::id(), tid) {
        warn!("jitdump: failed to write the code load record for {name}: {err:?}");
    }
}

fn free_state(_state: BackendState) {
    // Dropping the file flushes buffered records and unmaps the marker
    // page.
    let _ = JITDUMP_FILE.lock().unwrap().take();
}

fn open_dump() -> Result<JitDumpFile> {
    let filename = format!("/tmp/jit-{}.dump", process::id());
    JitDumpFile::new(filename, JitDumpFile::host_e_machine())
}

#[cfg(test)]
mod tests {
    use super::*;
    use perf_trampoline_jit_debug::eh_frame;
    use perf_trampoline_jit_debug::perf_jitdump::EhFrameHeader;

    // The arena reserves CODE_PADDING bytes after every stub; the unwind
    // payload published for a stub must fit in that reservation.
    #[test]
    fn unwind_payload_fits_the_padding() {
        let code_size = crate::arch::template_code().len();
        let frame = eh_frame::synthesize(code_size as u32);
        let unwind_data_size = frame.bytes().len() + std::mem::size_of::<EhFrameHeader>();
        assert!(unwind_data_size <= CODE_PADDING);
    }
}
