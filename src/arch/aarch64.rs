// The evaluator arrives in x3 (fourth argument register); x0-x2 are left
// in place for the forwarded call. Unlike the x86-64 stub
// this one establishes a real frame record, so `fp`-based unwinders walk
// through it naturally.
//
// The unwind tables synthesized for copies of this stub (see the jitdump
// writer) encode exactly these five instructions; changing the template
// means recomputing them.
core::arch::global_asm!(
    "
        .text
        .balign 16
        .globl perf_trampoline_template_start
        .globl perf_trampoline_template_end
    perf_trampoline_template_start:
        stp x29, x30, [sp, #-16]!
        mov x29, sp
        blr x3
        ldp x29, x30, [sp], #16
        ret
    perf_trampoline_template_end:
    "
);
