//! Remote syscalls executed inside the stopped isolated context.
//!
//! The code region carries a `syscall; int3` stub right after the sentinel.
//! To run a syscall in the tracee the tracer saves the registers, loads the
//! syscall number and arguments, points the instruction pointer at the stub,
//! continues until the stub's trap, reads the result and restores the saved
//! registers. The tracee resumes exactly where it stopped.

use crate::arch;
use crate::config::types::{DiscoveryError, Result};
use crate::kernel::ptrace::{self, ResumeMode, RseqConfiguration};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

const RSEQ_FLAG_UNREGISTER: u64 = 1;

/// Outcome of an injected syscall: the outer `Result` covers tracing
/// failures, the inner one the kernel's answer.
pub type SyscallOutcome = std::result::Result<u64, Errno>;

/// Runs syscalls in a tracee through the stub at `stub_addr`.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSyscall {
    pid: Pid,
    stub_addr: u64,
}

impl RemoteSyscall {
    pub fn new(pid: Pid, stub_addr: u64) -> Self {
        Self { pid, stub_addr }
    }

    fn stub_trap_pc(&self) -> u64 {
        self.stub_addr + arch::SYSCALL_STUB.len() as u64
    }

    /// Execute syscall `nr`. The tracee must be in a ptrace stop.
    pub fn invoke(&self, nr: libc::c_long, args: [u64; 6]) -> Result<SyscallOutcome> {
        let saved = ptrace::get_registers(self.pid)?;
        let mut regs = saved;
        arch::load_syscall(&mut regs, self.stub_addr, nr, args);
        ptrace::set_registers(self.pid, regs)?;
        ptrace::resume(self.pid, ResumeMode::Continue)?;

        match ptrace::wait_stop(self.pid)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            other => {
                return Err(DiscoveryError::SandboxSetup(format!(
                    "syscall {} stub did not trap: {:?}",
                    nr, other
                )))
            }
        }

        let after = ptrace::get_registers(self.pid)?;
        if arch::program_counter(&after) != self.stub_trap_pc() {
            return Err(DiscoveryError::SandboxSetup(format!(
                "syscall {} stub trapped at {:#x}, expected {:#x}",
                nr,
                arch::program_counter(&after),
                self.stub_trap_pc()
            )));
        }
        ptrace::set_registers(self.pid, saved)?;

        let ret = arch::syscall_return(&after);
        // The kernel reports errors as -4095..=-1.
        if (-4095..0).contains(&ret) {
            Ok(Err(Errno::from_i32((-ret) as i32)))
        } else {
            Ok(Ok(ret as u64))
        }
    }

    /// Map `len` bytes of fresh read/write memory at exactly `addr`.
    pub fn map_fixed(&self, addr: u64, len: u64) -> Result<SyscallOutcome> {
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
        let outcome = self.invoke(
            libc::SYS_mmap,
            [
                addr,
                len,
                (libc::PROT_READ | libc::PROT_WRITE) as u64,
                flags as u64,
                u64::MAX, // fd = -1
                0,
            ],
        )?;
        match outcome {
            Ok(mapped) if mapped != addr => {
                // Hint-only kernels may map elsewhere; undo and refuse.
                let _ = self.unmap(mapped, len)?;
                Ok(Err(Errno::EEXIST))
            }
            other => Ok(other),
        }
    }

    /// Make an existing mapping readable and writable.
    pub fn protect_rw(&self, addr: u64, len: u64) -> Result<SyscallOutcome> {
        self.invoke(
            libc::SYS_mprotect,
            [addr, len, (libc::PROT_READ | libc::PROT_WRITE) as u64, 0, 0, 0],
        )
    }

    pub fn unmap(&self, addr: u64, len: u64) -> Result<SyscallOutcome> {
        self.invoke(libc::SYS_munmap, [addr, len, 0, 0, 0, 0])
    }

    /// Drop the thread's rseq registration so the kernel stops writing to
    /// its area.
    pub fn unregister_rseq(&self, config: &RseqConfiguration) -> Result<SyscallOutcome> {
        self.invoke(
            libc::SYS_rseq,
            [
                config.rseq_abi_pointer,
                config.rseq_abi_size as u64,
                RSEQ_FLAG_UNREGISTER,
                config.signature as u64,
                0,
                0,
            ],
        )
    }
}
