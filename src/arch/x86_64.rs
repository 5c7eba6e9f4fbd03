use crate::config::types::RegisterPriming;

/// Register file as exchanged with `PTRACE_GETREGS`/`PTRACE_SETREGS`.
pub type Registers = libc::user_regs_struct;

/// `int3`: marks normal completion of the block.
pub const SENTINEL: &[u8] = &[0xcc];

/// `syscall; int3`: executed by the tracer to run mmap/mprotect/munmap inside
/// the isolated context.
pub const SYSCALL_STUB: &[u8] = &[0x0f, 0x05, 0xcc];

/// `int3` reports the instruction pointer one byte past the trap.
pub const TRAP_PC_OFFSET: u64 = 1;

/// Top of the user address space the kernel lets a process unmap
/// (`TASK_SIZE` with 4-level paging).
pub const TASK_SIZE: u64 = 0x0000_7fff_ffff_f000;

/// General-purpose registers in priming order.
pub const GPR_NAMES: [&str; 16] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];

/// IF plus the always-one reserved bit; DF clear so string ops walk upwards.
const PRIMED_RFLAGS: u64 = 0x202;

fn gpr_mut(regs: &mut Registers, index: usize) -> &mut u64 {
    match index {
        0 => &mut regs.rax,
        1 => &mut regs.rbx,
        2 => &mut regs.rcx,
        3 => &mut regs.rdx,
        4 => &mut regs.rsi,
        5 => &mut regs.rdi,
        6 => &mut regs.rbp,
        7 => &mut regs.rsp,
        8 => &mut regs.r8,
        9 => &mut regs.r9,
        10 => &mut regs.r10,
        11 => &mut regs.r11,
        12 => &mut regs.r12,
        13 => &mut regs.r13,
        14 => &mut regs.r14,
        _ => &mut regs.r15,
    }
}

/// Read general-purpose register `index` (priming order).
pub fn gpr(regs: &Registers, index: usize) -> u64 {
    let mut copy = *regs;
    *gpr_mut(&mut copy, index)
}

/// Load the priming scheme into every general-purpose register and point the
/// instruction pointer at `entry`.
///
/// The `fs` and `gs` bases get the priming base too, so segment-relative
/// operands land next to the Guarded Region instead of in the caller's
/// thread control block.
pub fn prime_registers(regs: &mut Registers, priming: &RegisterPriming, entry: u64) {
    for index in 0..GPR_NAMES.len() {
        *gpr_mut(regs, index) = priming.value_for(index);
    }
    regs.fs_base = priming.base();
    regs.gs_base = priming.base();
    regs.rip = entry;
    regs.eflags = PRIMED_RFLAGS;
    // Not inside a syscall: keeps the kernel from applying restart fixups.
    regs.orig_rax = u64::MAX;
}

pub fn program_counter(regs: &Registers) -> u64 {
    regs.rip
}

/// Address of the thread control block (`fs` base).
pub fn thread_pointer(regs: &Registers) -> u64 {
    regs.fs_base
}

/// Prepare `regs` so that resuming at `stub` executes syscall `nr` with `args`.
pub fn load_syscall(regs: &mut Registers, stub: u64, nr: libc::c_long, args: [u64; 6]) {
    regs.rax = nr as u64;
    regs.rdi = args[0];
    regs.rsi = args[1];
    regs.rdx = args[2];
    regs.r10 = args[3];
    regs.r8 = args[4];
    regs.r9 = args[5];
    regs.rip = stub;
    regs.orig_rax = u64::MAX;
}

/// Raw kernel return value of an injected syscall (`-errno` on failure).
pub fn syscall_return(regs: &Registers) -> i64 {
    regs.rax as i64
}
