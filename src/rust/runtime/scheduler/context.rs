// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Register-level execution context transfer.
//!
//! A suspended context is fully described by its saved stack pointer: [transfer] pushes the callee-saved registers
//! (and the floating-point control words) onto the current stack, stores the resulting stack pointer, loads the
//! target stack pointer, and pops the target's registers back. A fresh context gets a synthetic frame that "returns"
//! into a trampoline, which calls the entry function with one argument.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::scheduler::stack::Stack;
use ::std::ptr;

//======================================================================================================================
// Architecture Support
//======================================================================================================================

::cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", unix, not(target_vendor = "apple")))] {
        ::std::arch::global_asm!(
            ".text",
            ".globl __parallex_context_switch",
            ".p2align 4",
            "__parallex_context_switch:",
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr dword ptr [rsp]",
            "fnstcw word ptr [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
            "",
            ".globl __parallex_context_start",
            ".p2align 4",
            "__parallex_context_start:",
            "mov rdi, r12",
            "call r13",
            "ud2",
        );

        /// Builds the initial frame popped by the first switch into a fresh context.
        unsafe fn prepare_frame(top: *mut u8, entry: usize, arg: usize) -> *mut u8 {
            let top: *mut usize = ((top as usize) & !15) as *mut usize;
            // Two padding words keep the trampoline's call site 16-byte aligned.
            top.sub(1).write(0);
            top.sub(2).write(0);
            top.sub(3).write(__parallex_context_start as usize);
            top.sub(4).write(0); // rbp
            top.sub(5).write(0); // rbx
            top.sub(6).write(arg); // r12
            top.sub(7).write(entry); // r13
            top.sub(8).write(0); // r14
            top.sub(9).write(0); // r15
            // Default MXCSR in the low half, default x87 control word above it.
            top.sub(10).write(((0x037f_u64 as usize) << 32) | 0x1f80);
            top.sub(10) as *mut u8
        }
    } else if #[cfg(all(target_arch = "aarch64", unix, not(target_vendor = "apple")))] {
        ::std::arch::global_asm!(
            ".text",
            ".globl __parallex_context_switch",
            ".p2align 2",
            "__parallex_context_switch:",
            "sub sp, sp, #0xa0",
            "stp x19, x20, [sp, #0x00]",
            "stp x21, x22, [sp, #0x10]",
            "stp x23, x24, [sp, #0x20]",
            "stp x25, x26, [sp, #0x30]",
            "stp x27, x28, [sp, #0x40]",
            "stp x29, x30, [sp, #0x50]",
            "stp d8, d9, [sp, #0x60]",
            "stp d10, d11, [sp, #0x70]",
            "stp d12, d13, [sp, #0x80]",
            "stp d14, d15, [sp, #0x90]",
            "mov x9, sp",
            "str x9, [x0]",
            "mov sp, x1",
            "ldp x19, x20, [sp, #0x00]",
            "ldp x21, x22, [sp, #0x10]",
            "ldp x23, x24, [sp, #0x20]",
            "ldp x25, x26, [sp, #0x30]",
            "ldp x27, x28, [sp, #0x40]",
            "ldp x29, x30, [sp, #0x50]",
            "ldp d8, d9, [sp, #0x60]",
            "ldp d10, d11, [sp, #0x70]",
            "ldp d12, d13, [sp, #0x80]",
            "ldp d14, d15, [sp, #0x90]",
            "add sp, sp, #0xa0",
            "ret",
            "",
            ".globl __parallex_context_start",
            ".p2align 2",
            "__parallex_context_start:",
            "mov x0, x19",
            "blr x20",
            "brk #0",
        );

        /// Builds the initial frame popped by the first switch into a fresh context.
        unsafe fn prepare_frame(top: *mut u8, entry: usize, arg: usize) -> *mut u8 {
            let sp: *mut usize = (((top as usize) & !15) - 0xa0) as *mut usize;
            ptr::write_bytes(sp, 0, 0xa0 / ::std::mem::size_of::<usize>());
            sp.write(arg); // x19
            sp.add(1).write(entry); // x20
            sp.add(11).write(__parallex_context_start as usize); // x30
            sp as *mut u8
        }
    } else {
        compile_error!("lightweight threads are only supported on x86_64 and aarch64 ELF targets");
    }
}

extern "C" {
    /// Saves the running context's stack pointer into `save` and resumes the context whose stack pointer is `load`.
    fn __parallex_context_switch(save: *mut *mut u8, load: *mut u8);
    /// First instruction of every fresh context.
    fn __parallex_context_start();
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Entry function of a fresh context. It must never return.
pub type ContextEntry = extern "C" fn(arg: *mut u8) -> !;

/// A suspended execution context.
pub struct ExecutionContext {
    sp: *mut u8,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ExecutionContext {
    /// A context that has not been saved yet. It becomes valid once it is used as the source of a [transfer].
    pub const fn empty() -> Self {
        Self { sp: ptr::null_mut() }
    }

    /// Initializes `stack` so that the first transfer into the returned context calls `entry(arg)`.
    ///
    /// # Safety
    ///
    /// The stack must outlive the context and must not be in use by any other context.
    pub unsafe fn create(stack: &Stack, entry: ContextEntry, arg: *mut u8) -> Self {
        Self {
            sp: prepare_frame(stack.top(), entry as usize, arg as usize),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Suspends the running context into `from` and resumes `to`. Returns when something transfers back into `from`.
///
/// # Safety
///
/// `to` must hold a context that was created with [ExecutionContext::create] or saved by an earlier transfer, and that
/// is not running on any OS thread. Both pointers must remain valid until the running context is resumed.
#[inline(never)]
pub unsafe fn transfer(from: *mut ExecutionContext, to: *const ExecutionContext) {
    let load: *mut u8 = (*to).sp;
    debug_assert!(!load.is_null(), "transfer into a context that was never saved");
    __parallex_context_switch(ptr::addr_of_mut!((*from).sp), load);
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
