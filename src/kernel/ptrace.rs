//! Thin wrappers over the ptrace and wait primitives used by the tracer.
//!
//! Every call here targets a tracee forked by the calling thread; ptrace
//! requests from any other thread fail with `ESRCH`.

use crate::arch::Registers;
use crate::config::types::{to_setup_error, Result};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// How a stopped tracee is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Stop again at the next syscall entry (sandboxed code is running).
    UntilSyscall,
    /// Run freely until the next signal (tracer-injected syscalls).
    Continue,
}

/// Kill the tracee if the tracer goes away; tag syscall stops.
pub fn set_tracer_options(pid: Pid) -> Result<()> {
    ptrace::setoptions(
        pid,
        Options::PTRACE_O_EXITKILL | Options::PTRACE_O_TRACESYSGOOD,
    )
    .map_err(|e| to_setup_error("ptrace(SETOPTIONS)", e))
}

pub fn get_registers(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).map_err(|e| to_setup_error("ptrace(GETREGS)", e))
}

pub fn set_registers(pid: Pid, regs: Registers) -> Result<()> {
    ptrace::setregs(pid, regs).map_err(|e| to_setup_error("ptrace(SETREGS)", e))
}

pub fn signal_info(pid: Pid) -> Result<libc::siginfo_t> {
    ptrace::getsiginfo(pid).map_err(|e| to_setup_error("ptrace(GETSIGINFO)", e))
}

/// Resume a stopped tracee, suppressing the signal that stopped it.
pub fn resume(pid: Pid, mode: ResumeMode) -> Result<()> {
    match mode {
        ResumeMode::UntilSyscall => {
            ptrace::syscall(pid, None).map_err(|e| to_setup_error("ptrace(SYSCALL)", e))
        }
        ResumeMode::Continue => {
            ptrace::cont(pid, None).map_err(|e| to_setup_error("ptrace(CONT)", e))
        }
    }
}

/// Non-blocking wait; `None` while the tracee is still running.
pub fn poll_stop(pid: Pid) -> Result<Option<WaitStatus>> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => return Ok(Some(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_setup_error("waitpid(tracee)", e)),
        }
    }
}

/// `PTRACE_GET_RSEQ_CONFIGURATION` (Linux 5.13).
const PTRACE_GET_RSEQ_CONFIGURATION: libc::c_uint = 0x420f;

/// Restartable-sequence registration of a tracee thread, as reported by
/// `PTRACE_GET_RSEQ_CONFIGURATION`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RseqConfiguration {
    pub rseq_abi_pointer: u64,
    pub rseq_abi_size: u32,
    pub signature: u32,
    pub flags: u32,
    pub pad: u32,
}

impl RseqConfiguration {
    pub fn is_registered(&self) -> bool {
        self.rseq_abi_pointer != 0
    }
}

/// The tracee's rseq registration; `None` if the kernel cannot report it.
pub fn rseq_configuration(pid: Pid) -> Result<Option<RseqConfiguration>> {
    let mut config = RseqConfiguration::default();
    // SAFETY: the kernel writes at most `size_of::<RseqConfiguration>()`
    // bytes into `config`.
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GET_RSEQ_CONFIGURATION,
            pid.as_raw(),
            std::mem::size_of::<RseqConfiguration>() as *mut libc::c_void,
            &mut config as *mut RseqConfiguration as *mut libc::c_void,
        )
    };
    if ret >= 0 {
        return Ok(Some(config));
    }
    match Errno::last() {
        Errno::EIO | Errno::EINVAL => Ok(None),
        e => Err(to_setup_error("ptrace(GET_RSEQ_CONFIGURATION)", e)),
    }
}

/// Blocking wait for the next stop or exit of the tracee.
pub fn wait_stop(pid: Pid) -> Result<WaitStatus> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(to_setup_error("waitpid(tracee)", e)),
        }
    }
}
