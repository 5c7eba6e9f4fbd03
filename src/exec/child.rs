//! Post-fork routine of the isolated context.
//!
//! Runs between `fork` and the first ptrace stop while the caller may be
//! multi-threaded, so it only uses async-signal-safe calls: no allocation,
//! no locks, no logging. Everything it touches is prepared by the parent.

use crate::core::types::BlockRange;
use std::os::unix::io::RawFd;
use std::ptr;

/// Size of the fixed report the child writes to the parent.
pub const REPORT_LEN: usize = 16;

/// Last step the child reached; doubles as its exit code on failure.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStage {
    Ready = 0,
    ParentDeathSignal = 1,
    TraceMe = 2,
    MapCode = 3,
    ProtectCode = 4,
    MapGuard = 5,
    Resumed = 6,
}

impl ChildStage {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => ChildStage::Ready,
            1 => ChildStage::ParentDeathSignal,
            2 => ChildStage::TraceMe,
            3 => ChildStage::MapCode,
            4 => ChildStage::ProtectCode,
            5 => ChildStage::MapGuard,
            6 => ChildStage::Resumed,
            _ => return None,
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ChildStage::Ready => "ready",
            ChildStage::ParentDeathSignal => "prctl(PR_SET_PDEATHSIG)",
            ChildStage::TraceMe => "ptrace(TRACEME)",
            ChildStage::MapCode => "mmap(code region)",
            ChildStage::ProtectCode => "mprotect(code region)",
            ChildStage::MapGuard => "mmap(guarded region)",
            ChildStage::Resumed => "resumed without tracer",
        }
    }
}

/// Wire form of the child's setup outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildReport {
    pub stage: u32,
    pub errno: i32,
    pub code_addr: u64,
}

impl ChildReport {
    pub fn encode(&self) -> [u8; REPORT_LEN] {
        let mut buf = [0u8; REPORT_LEN];
        buf[0..4].copy_from_slice(&self.stage.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.errno.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.code_addr.to_ne_bytes());
        buf
    }

    pub fn decode(buf: &[u8; REPORT_LEN]) -> Self {
        let mut stage = [0u8; 4];
        let mut errno = [0u8; 4];
        let mut code_addr = [0u8; 8];
        stage.copy_from_slice(&buf[0..4]);
        errno.copy_from_slice(&buf[4..8]);
        code_addr.copy_from_slice(&buf[8..16]);
        Self {
            stage: u32::from_ne_bytes(stage),
            errno: i32::from_ne_bytes(errno),
            code_addr: u64::from_ne_bytes(code_addr),
        }
    }
}

/// Everything the child needs, prepared before `fork`.
pub struct ChildPlan<'a> {
    /// Block, sentinel and syscall stub, in order
    pub image: &'a [u8],
    /// Length of the code region mapping (page multiple)
    pub region_len: usize,
    /// Where the code region must be mapped
    pub code_location: u64,
    /// Initial Guarded Region
    pub guard: BlockRange,
    /// Write end of the report pipe
    pub report_fd: RawFd,
}

fn last_errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

fn map_code(plan: &ChildPlan<'_>) -> Result<u64, (ChildStage, i32)> {
    let code = unsafe {
        libc::mmap(
            plan.code_location as *mut libc::c_void,
            plan.region_len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    };
    if code == libc::MAP_FAILED {
        return Err((ChildStage::MapCode, last_errno()));
    }
    // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
    if code as u64 != plan.code_location {
        unsafe {
            libc::munmap(code, plan.region_len);
        }
        return Err((ChildStage::MapCode, libc::EEXIST));
    }

    unsafe {
        ptr::copy_nonoverlapping(plan.image.as_ptr(), code as *mut u8, plan.image.len());
        if libc::mprotect(code, plan.region_len, libc::PROT_READ | libc::PROT_EXEC) != 0 {
            return Err((ChildStage::ProtectCode, last_errno()));
        }
    }

    Ok(code as u64)
}

fn map_guard(guard: &BlockRange) -> Result<(), (ChildStage, i32)> {
    let addr = unsafe {
        libc::mmap(
            guard.start as *mut libc::c_void,
            guard.len as usize,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err((ChildStage::MapGuard, last_errno()));
    }
    if addr as u64 != guard.start {
        unsafe {
            libc::munmap(addr, guard.len as usize);
        }
        return Err((ChildStage::MapGuard, libc::EEXIST));
    }
    Ok(())
}

/// Fallback bound when `close_range` is unavailable (Linux < 5.9).
const FALLBACK_FD_LIMIT: RawFd = 1024;

/// Ranges `close_range` must cover to close everything except `keep`.
pub fn close_ranges_except(keep: RawFd) -> [(u32, u32); 2] {
    let keep = keep as u32;
    match keep.checked_sub(1) {
        Some(below) => [(0, below), (keep + 1, u32::MAX)],
        None => [(1, 0), (1, u32::MAX)],
    }
}

/// Close every inherited descriptor except `keep`, including other calls'
/// report pipes.
fn close_inherited_fds(keep: RawFd) {
    for (first, last) in close_ranges_except(keep) {
        if first > last {
            continue;
        }
        let ret = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                first as libc::c_uint,
                last as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if ret != 0 {
            let end = (last as u64).min(FALLBACK_FD_LIMIT as u64) as RawFd;
            for fd in first as RawFd..=end {
                unsafe {
                    libc::close(fd);
                }
            }
        }
    }
}

fn build_context(plan: &ChildPlan<'_>) -> Result<u64, (ChildStage, i32)> {
    close_inherited_fds(plan.report_fd);
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
        return Err((ChildStage::ParentDeathSignal, last_errno()));
    }
    nix::sys::ptrace::traceme().map_err(|e| (ChildStage::TraceMe, e as i32))?;
    let code_addr = map_code(plan)?;
    map_guard(&plan.guard)?;
    Ok(code_addr)
}

fn send_report(fd: RawFd, report: &ChildReport) {
    let buf = report.encode();
    unsafe {
        libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
        libc::close(fd);
    }
}

/// Build the isolated context in the freshly forked child and stop for the
/// tracer. Never returns.
pub fn run_child(plan: &ChildPlan<'_>) -> ! {
    match build_context(plan) {
        Ok(code_addr) => {
            send_report(
                plan.report_fd,
                &ChildReport {
                    stage: ChildStage::Ready as u32,
                    errno: 0,
                    code_addr,
                },
            );
            unsafe {
                // Plain kill(2): raise(3) may block signals around the stop.
                libc::kill(libc::getpid(), libc::SIGSTOP);
                // Only reached if the tracer resumes us without new registers.
                libc::_exit(ChildStage::Resumed as i32);
            }
        }
        Err((stage, errno)) => {
            send_report(
                plan.report_fd,
                &ChildReport {
                    stage: stage as u32,
                    errno,
                    code_addr: 0,
                },
            );
            unsafe { libc::_exit(stage as i32) }
        }
    }
}
