//! On-disk formats used to describe dynamically generated code to a
//! profiler.
//!
//! Linux `perf` learns about code that never appears in any ELF file through
//! two side channels, both implemented here:
//!
//! * [`perf_map`] — the `/tmp/perf-<pid>.map` text sidecar, one line per
//!   code region.
//! * [`perf_jitdump`] — the binary `/tmp/jit-<pid>.dump` stream consumed by
//!   `perf inject -j`, including synthesized DWARF unwind information
//!   ([`eh_frame`]) so perf can unwind through the generated code.

pub mod eh_frame;
pub mod perf_jitdump;
pub mod perf_map;
