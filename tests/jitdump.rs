//! The jitdump backend writes a parseable record stream, and the fork
//! policy refuses to persist it.

mod common;

use common::{eval, expected_result, host, FakeCode};
use perf_trampoline::{profiling, Error};
use std::sync::{Mutex, MutexGuard};

fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap()
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(bytes[offset..offset + 8].try_into().unwrap())
}

#[test]
fn dump_stream_parses_record_by_record() {
    let _guard = serialize();
    perf_trampoline::set_callbacks(profiling::jitdump::callbacks());
    perf_trampoline::init(host(), true).unwrap();
    let index = host().last_extra_index();

    let code = FakeCode::new(Some("jitted"), Some("/t/j.py"));
    let got = eval(&code, 0x7000, 0);
    assert_eq!(got as usize, expected_result(&code, 0x7000, 0));
    let stub_addr = code.extra(index) as usize;
    assert_ne!(stub_addr, 0);

    // Closing the backend flushes the stream.
    perf_trampoline::fini();

    let dump = std::fs::read(format!("/tmp/jit-{}.dump", std::process::id())).unwrap();

    // File header.
    assert!(dump.len() > 40);
    assert_eq!(u32_at(&dump, 0), 0x4A69_5444);
    assert_eq!(u32_at(&dump, 4), 1);
    assert_eq!(u32_at(&dump, 8), 40);
    assert_eq!(u32_at(&dump, 20), std::process::id());

    // The declared record sizes tile the rest of the file exactly.
    let mut records = Vec::new();
    let mut offset = 40;
    while offset < dump.len() {
        let id = u32_at(&dump, offset);
        let size = u32_at(&dump, offset + 4) as usize;
        assert!(size >= 16, "runt record at {offset}");
        records.push((id, offset, size));
        offset += size;
    }
    assert_eq!(offset, dump.len());

    // One stub published: its unwinding info immediately followed by its
    // code-load record.
    assert_eq!(records.len(), 2);
    let (unwind_id, unwind_at, unwind_size) = records[0];
    let (load_id, load_at, load_size) = records[1];
    assert_eq!(unwind_id, 4);
    assert_eq!(load_id, 0);

    // Unwinding-info record: 8-aligned, payload within the padding budget,
    // and the eh_frame parses as one CIE plus one FDE describing the stub.
    assert_eq!(unwind_size % 8, 0);
    let unwind_data_size = u64_at(&dump, unwind_at + 16) as usize;
    let eh_frame_hdr_size = u64_at(&dump, unwind_at + 24) as usize;
    let mapped_size = u64_at(&dump, unwind_at + 32) as usize;
    assert_eq!(eh_frame_hdr_size, 20);
    assert!(unwind_data_size <= 0x100);
    assert_eq!(mapped_size, (unwind_data_size + 15) & !15);
    assert_eq!(mapped_size % 16, 0);

    let eh_frame_at = unwind_at + 40;
    let eh_frame_size = unwind_data_size - eh_frame_hdr_size;
    let cie_len = u32_at(&dump, eh_frame_at) as usize + 4;
    let fde_len = u32_at(&dump, eh_frame_at + cie_len) as usize + 4;
    assert_eq!(cie_len + fde_len, eh_frame_size);
    assert_eq!(u32_at(&dump, eh_frame_at + 4), 0, "CIE id");

    // Code-load record: identity, addresses, then the symbol string and a
    // verbatim copy of the stub's bytes, nothing more.
    let code_size = u64_at(&dump, load_at + 40) as usize;
    assert_eq!(u32_at(&dump, load_at + 16), std::process::id());
    assert_eq!(u64_at(&dump, load_at + 24) as usize, stub_addr);
    assert_eq!(u64_at(&dump, load_at + 32) as usize, stub_addr);
    assert_eq!(u64_at(&dump, load_at + 48), 1, "first code id");

    // The FDE covers exactly the loaded code range.
    assert_eq!(u32_at(&dump, eh_frame_at + cie_len + 12) as usize, code_size);

    let symbol = b"py::jitted:/t/j.py\0";
    let symbol_at = load_at + 56;
    assert_eq!(&dump[symbol_at..symbol_at + symbol.len()], symbol);
    assert_eq!(load_size, 56 + symbol.len() + code_size);

    let live_stub = unsafe { std::slice::from_raw_parts(stub_addr as *const u8, code_size) };
    assert_eq!(&dump[symbol_at + symbol.len()..load_at + load_size], live_stub);
}

#[test]
fn persisting_a_jitdump_across_fork_is_refused() {
    let _guard = serialize();
    perf_trampoline::set_callbacks(profiling::jitdump::callbacks());
    perf_trampoline::init(host(), true).unwrap();
    perf_trampoline::set_persist_after_fork(true);

    let err = perf_trampoline::after_fork_in_child().unwrap_err();
    assert_eq!(err.downcast_ref::<Error>(), Some(&Error::ForkPolicyMismatch));

    perf_trampoline::set_persist_after_fork(false);
    perf_trampoline::fini();
}
