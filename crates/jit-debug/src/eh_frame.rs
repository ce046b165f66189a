//! Synthesized DWARF call-frame information for jitdump streams.
//!
//! `perf inject -j` turns every code-load record into a small shared object;
//! to let perf unwind through the region the jitdump stream must carry a raw
//! `.eh_frame` section (one CIE plus one FDE) describing it. The code we
//! describe is always the same few-instruction stub, so the CFI program is a
//! fixed per-architecture table and the whole section fits in a few dozen
//! bytes.

/// Pointer encodings used both in the CIE augmentation data and in the
/// `.eh_frame_hdr` search table.
pub const DW_EH_PE_UDATA4: u8 = 0x03;
pub const DW_EH_PE_SDATA4: u8 = 0x0b;
pub const DW_EH_PE_PCREL: u8 = 0x10;
pub const DW_EH_PE_DATAREL: u8 = 0x30;

const DW_CIE_VERSION: u8 = 1;

// Call-frame instruction opcodes. The low-6-bit operand forms
// (`advance_loc`, `offset`, `restore`) take their register/delta in the
// opcode byte itself.
const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xc0;

/// One entry of a per-architecture FDE instruction table. Not every
/// architecture's table uses every form.
#[allow(dead_code)]
enum CfiOp {
    /// `DW_CFA_advance_loc` by this many code-alignment units.
    Advance(u8),
    /// `DW_CFA_def_cfa_offset` to this byte offset from the stack pointer.
    DefCfaOffset(u32),
    /// `DW_CFA_offset`: the register was saved at CFA minus this many
    /// data-alignment units.
    Offset(u8, u32),
    /// `DW_CFA_restore`: the register is back to its CIE rule.
    Restore(u8),
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        // DWARF numbering on x86-64 is not the encoding order of the
        // registers; %rsp is 7 and the return address column is 16.
        const REG_SP: u8 = 7;
        const REG_RA: u8 = 16;

        // sub rsp, 8 / call rcx / add rsp, 8 / ret
        const FDE_PROGRAM: &[CfiOp] = &[
            CfiOp::Advance(4),
            CfiOp::DefCfaOffset(16),
            CfiOp::Advance(6),
            CfiOp::DefCfaOffset(8),
        ];
    } else if #[cfg(target_arch = "aarch64")] {
        const REG_SP: u8 = 31;
        const REG_RA: u8 = 30;
        const REG_FP: u8 = 29;

        // stp x29, x30, [sp, -16]! / mov x29, sp / blr x3 /
        // ldp x29, x30, [sp], 16 / ret
        const FDE_PROGRAM: &[CfiOp] = &[
            CfiOp::Advance(1),
            CfiOp::DefCfaOffset(16),
            CfiOp::Offset(REG_FP, 2),
            CfiOp::Offset(REG_RA, 1),
            CfiOp::Advance(3),
            CfiOp::Restore(REG_FP),
            CfiOp::Restore(REG_RA),
            CfiOp::DefCfaOffset(0),
        ];
    } else {
        compile_error!("no call-frame information table for this architecture");
    }
}

/// The FDE's initial-location field, pc-relative to the field itself. The
/// described range deliberately starts before the stub so samples landing in
/// the caller's prologue still resolve to the stub's FDE.
const FDE_PC_BIAS: i32 = -0x30;

/// A synthesized `.eh_frame` section: one CIE followed by one FDE.
pub struct EhFrame {
    bytes: Vec<u8>,
    cie_len: usize,
}

impl EhFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the CIE, which is also the offset of the FDE.
    pub fn cie_len(&self) -> usize {
        self.cie_len
    }
}

/// Synthesize the `.eh_frame` bytes describing one stub of `code_size`
/// bytes.
pub fn synthesize(code_size: u32) -> EhFrame {
    let mut w = Writer::default();

    // CIE: `zR` augmentation with pc-relative sdata4 FDE pointers, code
    // alignment 1, data alignment -wordsize, and initial rules placing the
    // CFA at the stack pointer and the return address in its slot.
    w.section(|w| {
        w.u32(0);
        w.u8(DW_CIE_VERSION);
        w.str("zR");
        w.uleb128(1);
        w.sleb128(-(core::mem::size_of::<usize>() as i32));
        w.u8(REG_RA);
        w.uleb128(1);
        w.u8(DW_EH_PE_PCREL | DW_EH_PE_SDATA4);
        w.u8(DW_CFA_DEF_CFA);
        w.uleb128(u32::from(REG_SP));
        w.uleb128(core::mem::size_of::<usize>() as u32);
        w.u8(DW_CFA_OFFSET | REG_RA);
        w.uleb128(1);
        w.align_nops();
    });
    let cie_len = w.buf.len();

    // FDE: the architecture's fixed program over `code_size` bytes of code.
    w.section(|w| {
        let cie_offset = w.buf.len() as u32;
        w.u32(cie_offset);
        w.u32(FDE_PC_BIAS as u32);
        w.u32(code_size);
        w.u8(0);
        for op in FDE_PROGRAM {
            match *op {
                CfiOp::Advance(delta) => w.u8(DW_CFA_ADVANCE_LOC | delta),
                CfiOp::DefCfaOffset(offset) => {
                    w.u8(DW_CFA_DEF_CFA_OFFSET);
                    w.uleb128(offset);
                }
                CfiOp::Offset(reg, units) => {
                    w.u8(DW_CFA_OFFSET | reg);
                    w.uleb128(units);
                }
                CfiOp::Restore(reg) => w.u8(DW_CFA_RESTORE | reg),
            }
        }
        w.align_nops();
    });

    EhFrame {
        bytes: w.buf,
        cie_len,
    }
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a NUL-terminated string.
    fn str(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn uleb128(&mut self, mut v: u32) {
        while v >= 0x80 {
            self.buf.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8);
    }

    fn sleb128(&mut self, mut v: i32) {
        while (v.wrapping_add(0x40) as u32) >= 0x80 {
            self.buf.push((v as u8 & 0x7f) | 0x80);
            v >>= 7;
        }
        self.buf.push(v as u8 & 0x7f);
    }

    /// Pad with `DW_CFA_nop` to the native word size.
    fn align_nops(&mut self) {
        while self.buf.len() % core::mem::size_of::<usize>() != 0 {
            self.buf.push(DW_CFA_NOP);
        }
    }

    /// Emit a length-prefixed record: a `u32` length slot, the body, then
    /// the length patched to the body's size.
    fn section(&mut self, body: impl FnOnce(&mut Self)) {
        let len_at = self.buf.len();
        self.u32(0);
        body(self);
        let len = (self.buf.len() - len_at - 4) as u32;
        self.buf[len_at..len_at + 4].copy_from_slice(&len.to_le_bytes());
    }
}
