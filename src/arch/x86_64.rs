// The System V ABI passes the evaluator in %rcx (fourth argument); the
// first three argument registers are left untouched for the forwarded
// call. The stack adjustment keeps %rsp 16-byte aligned at the call
// without touching %rbp, so the caller's frame-pointer chain stays intact.
//
// The unwind tables synthesized for copies of this stub (see the jitdump
// writer) encode exactly these four instructions; changing the template
// means recomputing them.
core::arch::global_asm!(
    "
        .text
        .balign 16
        .globl perf_trampoline_template_start
        .globl perf_trampoline_template_end
    perf_trampoline_template_start:
        sub rsp, 8
        call rcx
        add rsp, 8
        ret
    perf_trampoline_template_end:
    "
);
