// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::arch::naked_asm;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Callee-saved register image for the System V AMD64 ABI. All xmm registers
/// are caller-saved on this ABI, so nothing beyond the integer set is kept.
#[repr(C)]
#[derive(Default)]
pub struct SavedContext {
    rsp: u64,
    rip: u64,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Prepares `ctx` so that the first [switch] into it begins execution at
/// `entry` on the stack whose highest address is `stack_top`.
///
/// # Safety
///
/// `ctx` must point to writable [SavedContext] memory and `stack_top` must be
/// the top of a live stack mapping.
pub unsafe fn init_context(ctx: *mut SavedContext, stack_top: *mut u8, entry: usize) {
    // The trampoline is entered with rsp 16-byte aligned; its `call` then
    // leaves rsp ≡ 8 (mod 16) at `entry`, as the ABI prescribes.
    let aligned_sp: usize = (stack_top as usize) & !0xF;

    let ctx: &mut SavedContext = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry as u64;
    ctx.r13 = 0;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// Calls the entry function stashed in r12 by [init_context]. The entry
/// function must not return; if it does, trap.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!("call r12", "ud2");
}

/// Saves the current context into `old` and resumes `new`. Returns when a
/// later switch targets `old` again.
///
/// # Safety
///
/// `old` must be writable; `new` must hold either a context prepared by
/// [init_context] or one previously saved by this function, and no other
/// thread may be running on `new`'s stack.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_old: *mut SavedContext, _new: *const SavedContext) {
    naked_asm!(
        // Save callee-saved registers to old (rdi).
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from new (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the new context's resume address.
        "jmp rax",
        // Resume point for a context saved above: rsp still holds the return
        // address pushed by our caller's `call`, so plain `ret` resumes it.
        "2:",
        "ret",
    );
}
