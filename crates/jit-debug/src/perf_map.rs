//! The `/tmp/perf-<pid>.map` text sidecar consumed by Linux perf.
//!
//! Format is documented here:
//! <https://github.com/torvalds/linux/blob/master/tools/perf/Documentation/jit-interface.txt>
//!
//! One line per code region, `<hex addr> <hex size> <name>`. The file name
//! and location are fixed by perf and keyed on the writing process id, so
//! the file handle is process-wide state.

use anyhow::Result;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

/// Process-wide perf map file. Perf only reads a unique file per process.
static PERF_MAP_FILE: Mutex<Option<BufWriter<File>>> = Mutex::new(None);

/// The map file perf associates with process `pid`.
pub fn path_for_pid(pid: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/perf-{pid}.map"))
}

/// Append one `<hex addr> <hex size> <name>` line for the code region at
/// `addr`, opening this process's map file on first use.
pub fn write_entry(addr: *const u8, len: usize, name: &str) -> Result<()> {
    let mut file = PERF_MAP_FILE.lock().unwrap();
    let file = ensure_open(&mut file)?;
    // Try our best to sanitize the name; a stray newline would corrupt the
    // line-oriented format.
    let sanitized_name = name.replace('\n', "_").replace('\r', "_");
    write!(file, "{:x} {:x} {}\n", addr as usize, len, sanitized_name)?;
    file.flush()?;
    Ok(())
}

/// Append the contents of another process's map file (the parent's, after a
/// fork) to this process's map file.
pub fn copy_from(path: &Path) -> Result<()> {
    let mut source = File::open(path)?;
    let mut file = PERF_MAP_FILE.lock().unwrap();
    let file = ensure_open(&mut file)?;
    io::copy(&mut source, file)?;
    file.flush()?;
    Ok(())
}

/// Flush and close the map file. A later [`write_entry`] reopens it.
pub fn fini() {
    let mut file = PERF_MAP_FILE.lock().unwrap();
    if let Some(mut file) = file.take() {
        let _ = file.flush();
    }
}

fn ensure_open(slot: &mut Option<BufWriter<File>>) -> Result<&mut BufWriter<File>> {
    if slot.is_none() {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path_for_pid(process::id()))?;
        *slot = Some(BufWriter::new(file));
    }
    Ok(slot.as_mut().unwrap())
}
