//! Support for jitdump files which can be used by perf for profiling jitted
//! code. Spec definitions for the output format are as described here:
//! <https://git.kernel.org/pub/scm/linux/kernel/git/torvalds/linux.git/tree/tools/perf/Documentation/jitdump-specification.txt>
//!
//! Usage Example:
//!     Record
//!         perf record -k 1 -e instructions:u <the embedding program>
//!     Combine
//!         perf inject -v -j -i perf.data -o perf.jit.data
//!     Report
//!         perf report -i perf.jit.data
//!
//! In addition to the code-load records the specification describes, this
//! writer emits one unwinding-info record ahead of every code-load record,
//! carrying a synthesized `.eh_frame` (see [`crate::eh_frame`]) plus the
//! `.eh_frame_hdr` search table, so perf can unwind through the generated
//! stubs.

use crate::eh_frame::{self, DW_EH_PE_DATAREL, DW_EH_PE_PCREL, DW_EH_PE_SDATA4, DW_EH_PE_UDATA4};
use anyhow::Result;
use object::elf;
use rustix::mm::{MapFlags, ProtFlags};
use rustix::time::{clock_gettime, ClockId};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::ptr;
use std::slice;
use std::{mem, process};
use target_lexicon::Architecture;

/// Defined record types in a jitdump file. Only `JitCodeLoad` and
/// `JitCodeUnwindingInfo` are ever written here.
#[repr(u32)]
pub enum RecordId {
    /// Record describing a jitted function.
    JitCodeLoad = 0,
    /// Record describing an already jitted function which is moved.
    JitCodeMove = 1,
    /// Record describing the debug info for a jitted function.
    JitCodeDebugInfo = 2,
    /// Record marking the end of the jit runtime (optional).
    JitCodeClose = 3,
    /// Record describing the unwind information for a jitted function.
    JitCodeUnwindingInfo = 4,
}

/// Fixed-size header for the whole jitdump file.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct FileHeader {
    /// Uniquely identifies the file as a jitdump: 0x4A695444.
    pub magic: u32,
    /// Format version. It is currently set to 1.
    pub version: u32,
    /// Size in bytes of this header.
    pub size: u32,
    /// ELF architecture encoding: EM_X86_64 for x86_64, ...
    pub e_machine: u32,
    /// Padding. Reserved for future use.
    pub reserved: u32,
    /// Process id of the jit runtime.
    pub pid: u32,
    /// Timestamp of when the file was created, in microseconds since the
    /// epoch.
    pub timestamp: u64,
    /// Bitmask of flags. None are defined here.
    pub flags: u64,
}

/// Each record starts with this fixed-size header.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct RecordHeader {
    /// Uniquely identifies the record type, one of [`RecordId`].
    pub id: u32,
    /// Size in bytes of the record including this header.
    pub record_size: u32,
    /// Timestamp of when the record was created, in nanoseconds on the
    /// monotonic clock.
    pub timestamp: u64,
}

/// Describes one jitted function: followed in the file by the
/// NUL-terminated function name and then `size` bytes of native code.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct CodeLoadRecord {
    pub header: RecordHeader,
    /// Process id of the runtime generating the jitted code.
    pub pid: u32,
    /// Thread id of the runtime thread generating the jitted code.
    pub tid: u32,
    /// Virtual address of jitted code start.
    pub virtual_address: u64,
    /// Code start address for the jitted code. By default `virtual_address`
    /// equals `address`.
    pub address: u64,
    /// Size in bytes of the generated jitted code.
    pub size: u64,
    /// Unique identifier for the jitted code, here a counter incremented on
    /// every record.
    pub index: u64,
}

/// Describes the unwind information of the next code-load record: followed
/// in the file by the raw `.eh_frame` bytes, an [`EhFrameHeader`], and zero
/// padding up to an 8-byte boundary.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct UnwindingInfoRecord {
    pub header: RecordHeader,
    /// Size in bytes of the unwind data: the `.eh_frame` plus its header.
    pub unwind_data_size: u64,
    /// Size in bytes of the trailing [`EhFrameHeader`].
    pub eh_frame_hdr_size: u64,
    /// Size the unwind data occupies once mapped, rounded to 16 bytes.
    pub mapped_size: u64,
}

/// The `.eh_frame_hdr` search table perf uses to relate a sampled pc to its
/// FDE. All displacements are negative: the header sits behind the
/// `.eh_frame` it describes.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct EhFrameHeader {
    pub version: u8,
    pub eh_frame_ptr_enc: u8,
    pub fde_count_enc: u8,
    pub table_enc: u8,
    /// Displacement from this field back to the start of the `.eh_frame`.
    pub eh_frame_ptr: i32,
    pub fde_count: i32,
    /// Displacement relating the described code range to the FDE address.
    pub from: i32,
    pub to: i32,
}

/// Interface for driving the creation of jitdump files.
pub struct JitDumpFile {
    jitdump_file: BufWriter<File>,
    map_addr: usize,
    map_size: usize,
    code_index: u64,
}

impl JitDumpFile {
    /// Initialize a JitDumpFile and write out the file header.
    pub fn new(filename: impl AsRef<Path>, e_machine: u32) -> Result<Self> {
        let jitdump_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(filename.as_ref())?;

        // After creating the file, we map the first page of it into our
        // address space with execute permission. The resulting PROT_EXEC
        // mmap event is how perf's kernel listener discovers the dump file.
        let map_size = rustix::param::page_size();
        let map_addr = unsafe {
            rustix::mm::mmap(
                ptr::null_mut(),
                map_size,
                ProtFlags::READ | ProtFlags::EXEC,
                MapFlags::PRIVATE,
                &jitdump_file,
                0,
            )? as usize
        };

        let mut dump = JitDumpFile {
            jitdump_file: BufWriter::with_capacity(2 * 1024 * 1024, jitdump_file),
            map_addr,
            map_size,
            code_index: 0,
        };

        let header = FileHeader {
            magic: 0x4A695444,
            version: 1,
            size: mem::size_of::<FileHeader>() as u32,
            e_machine,
            reserved: 0,
            pid: process::id(),
            timestamp: wall_clock_micros(),
            flags: 0,
        };
        dump.write_struct(&header)?;
        // Push the header to disk right away so the dump is recognizable
        // from the moment the mmap event is seen.
        dump.jitdump_file.flush()?;
        Ok(dump)
    }

    /// Returns the ELF machine id of the host, for [`FileHeader::e_machine`].
    #[allow(trivial_numeric_casts)]
    pub fn host_e_machine() -> u32 {
        match target_lexicon::HOST.architecture {
            Architecture::X86_32(_) => elf::EM_386 as u32,
            Architecture::X86_64 => elf::EM_X86_64 as u32,
            Architecture::Arm(_) => elf::EM_ARM as u32,
            Architecture::Aarch64(_) => elf::EM_AARCH64 as u32,
            Architecture::Riscv32(_) | Architecture::Riscv64(_) => elf::EM_RISCV as u32,
            _ => unimplemented!("unrecognized architecture"),
        }
    }

    /// Returns the current time in nanoseconds on the monotonic clock, the
    /// time base of every record header.
    pub fn get_time_stamp(&self) -> u64 {
        let ts = clock_gettime(ClockId::Monotonic);
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }

    /// Write one code-load record: the fixed part, the NUL-terminated
    /// symbol name, then `len` bytes of code copied from `addr`.
    pub fn dump_code_load_record(
        &mut self,
        record_name: &str,
        addr: *const u8,
        len: usize,
        timestamp: u64,
        pid: u32,
        tid: u32,
    ) -> Result<()> {
        let name_len = record_name.len() + 1;
        let record_size = mem::size_of::<CodeLoadRecord>() + name_len + len;
        self.code_index += 1;

        let record = CodeLoadRecord {
            header: RecordHeader {
                id: RecordId::JitCodeLoad as u32,
                record_size: record_size as u32,
                timestamp,
            },
            pid,
            tid,
            virtual_address: addr as u64,
            address: addr as u64,
            size: len as u64,
            index: self.code_index,
        };

        self.write_struct(&record)?;
        self.jitdump_file.write_all(record_name.as_bytes())?;
        self.jitdump_file.write_all(b"\0")?;
        unsafe {
            let code = slice::from_raw_parts(addr, len);
            self.jitdump_file.write_all(code)?;
        }
        Ok(())
    }

    /// Write one unwinding-info record covering a code range of `code_size`
    /// bytes: the fixed part, the synthesized `.eh_frame`, the
    /// `.eh_frame_hdr`, and padding to an 8-byte boundary.
    pub fn dump_unwinding_info_record(&mut self, code_size: usize, timestamp: u64) -> Result<()> {
        let frame = eh_frame::synthesize(code_size as u32);
        let eh_frame_size = frame.bytes().len();
        let eh_frame_hdr_size = mem::size_of::<EhFrameHeader>();
        let unwind_data_size = eh_frame_size + eh_frame_hdr_size;

        let content_size = mem::size_of::<UnwindingInfoRecord>() + unwind_data_size;
        let padding = align_up(content_size, 8) - content_size;

        let record = UnwindingInfoRecord {
            header: RecordHeader {
                id: RecordId::JitCodeUnwindingInfo as u32,
                record_size: (content_size + padding) as u32,
                timestamp,
            },
            unwind_data_size: unwind_data_size as u64,
            eh_frame_hdr_size: eh_frame_hdr_size as u64,
            mapped_size: align_up(unwind_data_size, 16) as u64,
        };

        // `eh_frame_ptr` rewinds from its own field (4 bytes into the
        // header) over the whole `.eh_frame`; `from`/`to` relate the mapped
        // code range and the CIE/FDE split, again walking backwards.
        let header = EhFrameHeader {
            version: 1,
            eh_frame_ptr_enc: DW_EH_PE_PCREL | DW_EH_PE_SDATA4,
            fde_count_enc: DW_EH_PE_UDATA4,
            table_enc: DW_EH_PE_DATAREL | DW_EH_PE_SDATA4,
            eh_frame_ptr: -((eh_frame_size + 4) as i32),
            fde_count: 1,
            from: -((align_up(code_size, 8) + eh_frame_size) as i32),
            to: -((eh_frame_size - frame.cie_len()) as i32),
        };

        self.write_struct(&record)?;
        self.jitdump_file.write_all(frame.bytes())?;
        self.write_struct(&header)?;
        self.jitdump_file.write_all(&[0u8; 8][..padding])?;
        Ok(())
    }

    /// Push all buffered records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.jitdump_file.flush()?;
        Ok(())
    }

    fn write_struct<T: Copy>(&mut self, value: &T) -> Result<()> {
        unsafe {
            let bytes = slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>());
            self.jitdump_file.write_all(bytes)?;
        }
        Ok(())
    }
}

impl Drop for JitDumpFile {
    fn drop(&mut self) {
        let _ = self.jitdump_file.flush();
        unsafe {
            let _ = rustix::mm::munmap(self.map_addr as *mut _, self.map_size);
        }
    }
}

fn wall_clock_micros() -> u64 {
    let ts = clock_gettime(ClockId::Realtime);
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}
