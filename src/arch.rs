//! The per-architecture stub template.
//!
//! Every trampoline is a byte copy of one assembly template, bracketed by a
//! pair of symbols so its length is known at runtime. The stub must keep
//! its three arguments where the evaluator expects them, call the function
//! pointer arriving in the fourth argument slot, and hand back its return
//! value — and it must preserve the frame-pointer chain, since profilers
//! sampling this process unwind with `fp` when no DWARF is at hand.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
    } else {
        compile_error!("no trampoline stub template for this architecture");
    }
}

extern "C" {
    static perf_trampoline_template_start: u8;
    static perf_trampoline_template_end: u8;
}

/// The template's bytes, as linked into this binary.
pub(crate) fn template_code() -> &'static [u8] {
    unsafe {
        let start = &perf_trampoline_template_start as *const u8;
        let end = &perf_trampoline_template_end as *const u8;
        std::slice::from_raw_parts(start, end as usize - start as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_small_and_nonempty() {
        let code = template_code();
        assert!(!code.is_empty());
        // A stub has to fit many times into one arena chunk's worth of
        // space; anything past a few dozen bytes is a broken template.
        assert!(code.len() <= 64, "template grew to {} bytes", code.len());
    }
}
