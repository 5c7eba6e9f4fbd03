//! Classification of raw tracee stops into typed events.

use crate::arch;
use crate::config::types::{DiscoveryError, Result};
use crate::kernel::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

const SEGV_MAPERR: i32 = 1;
const SEGV_ACCERR: i32 = 2;
/// Kernel-generated fault without a usable address (#GP, e.g. non-canonical).
const SI_KERNEL: i32 = 0x80;

/// Why an access was refused by the MMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    /// Nothing is mapped at the address.
    Unmapped,
    /// Something is mapped but the access is not permitted.
    Protected,
}

/// One stop of the isolated context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopEvent {
    AccessViolation { addr: u64, kind: AccessKind, pc: u64 },
    Breakpoint { pc: u64 },
    SyscallEntry { pc: u64 },
    Signal { signal: Signal, si_code: i32, pc: u64 },
    Exited(i32),
    Killed(Signal),
}

/// Pure classification of a signal stop, given its siginfo fields.
pub fn classify_signal(signal: Signal, si_code: i32, si_addr: u64, pc: u64) -> StopEvent {
    match (signal, si_code) {
        (Signal::SIGSEGV, SEGV_MAPERR) => StopEvent::AccessViolation {
            addr: si_addr,
            kind: AccessKind::Unmapped,
            pc,
        },
        (Signal::SIGSEGV, SEGV_ACCERR) => StopEvent::AccessViolation {
            addr: si_addr,
            kind: AccessKind::Protected,
            pc,
        },
        (Signal::SIGTRAP, _) => StopEvent::Breakpoint { pc },
        _ => StopEvent::Signal {
            signal,
            si_code,
            pc,
        },
    }
}

/// Turn a wait status of the tracee into a [`StopEvent`], reading registers
/// and siginfo as needed.
pub fn classify_stop(pid: Pid, status: WaitStatus) -> Result<StopEvent> {
    match status {
        WaitStatus::Stopped(_, signal) => {
            let pc = arch::program_counter(&ptrace::get_registers(pid)?);
            let info = ptrace::signal_info(pid)?;
            // SAFETY: si_addr is valid to read for the fault signals we classify
            // by it; for others the value is ignored.
            let si_addr = unsafe { info.si_addr() } as u64;
            Ok(classify_signal(signal, info.si_code, si_addr, pc))
        }
        WaitStatus::PtraceSyscall(_) => {
            let pc = arch::program_counter(&ptrace::get_registers(pid)?);
            Ok(StopEvent::SyscallEntry { pc })
        }
        WaitStatus::Exited(_, code) => Ok(StopEvent::Exited(code)),
        WaitStatus::Signaled(_, signal, _) => Ok(StopEvent::Killed(signal)),
        other => Err(DiscoveryError::execution_fault(
            None,
            format!("unexpected tracee state {:?}", other),
        )),
    }
}

/// Human-readable label for a non-memory signal stop.
pub fn describe_signal(signal: Signal, si_code: i32) -> String {
    match (signal, si_code) {
        (Signal::SIGSEGV, SI_KERNEL) => "general protection fault".to_string(),
        (Signal::SIGILL, _) => "invalid or privileged instruction".to_string(),
        (Signal::SIGBUS, _) => "bus error".to_string(),
        (Signal::SIGFPE, _) => "arithmetic exception".to_string(),
        (signal, code) => format!("unexpected {} (si_code {})", signal, code),
    }
}
