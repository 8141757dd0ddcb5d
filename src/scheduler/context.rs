use core::arch::naked_asm;

/// Resume value for a task put back on the CPU by the scheduler.
pub const SWITCH_RET: u64 = 1;
/// Resume value for a parent woken from `wait` by a child's exit.
pub const EXIT_RET: u64 = 2;
/// Resume value for the driver context when task 1 terminates.
pub const INIT_RET: u64 = 3;

/// CPU register context saved/restored around a context switch.
/// All callee-saved registers on x86_64 System V ABI, plus the resume
/// address.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
}

impl Context {
    /// Create an empty context, to be filled by `save_context` or by
    /// `bootstrap`.
    pub fn empty() -> Self {
        Context {
            rsp: 0, rbp: 0, rbx: 0,
            r12: 0, r13: 0, r14: 0, r15: 0,
            rip: 0,
        }
    }

    /// Build the initial context of a fresh task.
    ///
    /// `stack_top` must be the 16-byte-aligned top of the task's
    /// private stack. Restoring this context enters
    /// `task_entry_trampoline` with the entry function in r12; the
    /// trampoline expects rsp % 16 == 0 at its first instruction.
    pub fn bootstrap(stack_top: usize, entry: fn()) -> Self {
        Context {
            rsp: stack_top as u64,
            rbp: stack_top as u64,
            rbx: 0,
            r12: entry as usize as u64,
            r13: 0,
            r14: 0,
            r15: 0,
            rip: task_entry_trampoline as usize as u64,
        }
    }

    /// Rebase a context saved on one stack so it resumes on a copy of
    /// that stack. The stack pointer always moves; the other saved
    /// registers move only when they hold addresses inside the source
    /// region, since they may just as well carry plain data.
    pub fn relocate(&mut self, src_base: usize, src_top: usize, offset: isize) {
        let shift = |v: &mut u64| {
            let p = *v as usize;
            if p >= src_base && p < src_top {
                *v = (p as isize + offset) as u64;
            }
        };
        self.rsp = (self.rsp as isize + offset) as u64;
        shift(&mut self.rbp);
        shift(&mut self.rbx);
        shift(&mut self.r12);
        shift(&mut self.r13);
        shift(&mut self.r14);
        shift(&mut self.r15);
    }
}

/// Snapshot the current execution context into `ctx`.
///
/// Returns 0 on the saving return. When the snapshot is later resumed
/// through `restore_context`, this call returns again, yielding the
/// sentinel passed to `restore_context`.
///
/// # Safety
/// `ctx` must be valid for writes. A resumed snapshot re-enters the
/// frame that saved it; that frame must still be intact (or be a
/// relocated copy, see `adjust_stack`).
#[unsafe(naked)]
pub unsafe extern "C" fn save_context(ctx: *mut Context) -> u64 {
    naked_asm!(
        // rdi = ctx. [rsp] holds our return address; the saved rsp is
        // the caller's stack pointer after this call returns.
        "mov rax, [rsp]",
        "lea rcx, [rsp + 8]",
        "mov [rdi + 0x00], rcx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov [rdi + 0x38], rax",
        "xor eax, eax",
        "ret",
    );
}

/// Resume execution at the point that saved `ctx`, making the
/// corresponding `save_context` return `sentinel`. Never returns.
///
/// # Safety
/// `ctx` must hold a context previously produced by `save_context`
/// (or `Context::bootstrap`) whose stack is still valid.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(ctx: *const Context, sentinel: u64) -> ! {
    naked_asm!(
        // rdi = ctx, rsi = sentinel.
        "mov rax, rsi",
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "jmp qword ptr [rdi + 0x38]",
    );
}

/// Walk a copied stack region and rebase every slot that still points
/// into the region the copy was taken from, so saved frame pointers
/// and spilled stack addresses chain within the copy.
///
/// `base`/`top` delimit the copy; the source region is the same span
/// shifted back by `offset`. Non-pointer data is left alone unless it
/// happens to collide with the source address range, which a 64 KiB
/// span makes unlikely.
///
/// # Safety
/// `base..top` must be a valid, 8-byte-aligned region owned by the
/// caller, and `offset` must be a multiple of 8.
pub unsafe fn adjust_stack(base: *mut u8, top: *mut u8, offset: isize) {
    let src_base = (base as isize - offset) as usize;
    let src_top = (top as isize - offset) as usize;
    let mut slot = base as *mut usize;
    while (slot as usize) < top as usize {
        let v = unsafe { *slot };
        if v >= src_base && v < src_top {
            unsafe { *slot = (v as isize + offset) as usize };
        }
        slot = unsafe { slot.add(1) };
    }
}

/// First instruction of every task. Restoring a `bootstrap` context
/// lands here with the entry function in r12 and rsp 16-aligned.
#[unsafe(naked)]
unsafe extern "C" fn task_entry_trampoline() -> ! {
    naked_asm!(
        "mov rdi, r12",
        "call {entry}",
        "ud2",
        entry = sym task_entry,
    );
}

/// Run the entry function at the base of a fresh task stack. Control
/// must never fall off the bottom of a simulated stack, so both an
/// ordinary return and a panic turn into `exit`.
extern "C" fn task_entry(entry: fn()) -> ! {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry));
    match outcome {
        Ok(()) => crate::scheduler::exit(0),
        Err(_) => {
            crate::log_error!("task {} panicked; exiting with code 101", crate::scheduler::getpid());
            crate::scheduler::exit(101)
        }
    }
}
