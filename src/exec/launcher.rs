/// Sandbox Launcher
///
/// Builds the isolated execution context for one basic block. The setup
/// sequence is fixed and encoded as a type-state chain so it cannot drift:
///
/// 1. fork; the child maps the code region (block, sentinel, syscall stub)
///    and the Guarded Region, requests tracing and stops itself
/// 2. read the child's report, wait for its stop, set tracer options
/// 3. scrub the address space inherited from the caller
/// 4. prime the general-purpose registers and point them at the block
/// 5. start execution
///
/// Forked -> Stopped -> Scrubbed -> Primed -> LaunchedSandbox
///
/// Each step consumes the prior state. Dropping any state kills and reaps the
/// child, so a failed step leaves nothing behind.
use crate::arch;
use crate::config::types::{
    to_setup_error, CodePlacement, DiscoveryError, RegisterPriming, Result, SandboxConfig,
    RANDOMIZED_CODE_RANGE,
};
use crate::core::types::{BlockRange, SandboxLayout};
use crate::exec::child::{run_child, ChildPlan, ChildReport, ChildStage, REPORT_LEN};
use crate::exec::inject::RemoteSyscall;
use crate::kernel::host::HostSupport;
use crate::kernel::memory::{self, align_down, align_up};
use crate::kernel::ptrace::{self, ResumeMode};
use crate::safety::cleanup::{FdGuard, TraceeGuard};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{close, fork, pipe, ForkResult, Pid};
use rand::Rng;
use std::fs::File;
use std::io::Read;
use std::marker::PhantomData;
use std::os::unix::io::FromRawFd;

/// Type-state marker: child forked, setup report not yet read
pub struct Forked;

/// Type-state marker: child stopped under our trace with its mappings in place
pub struct Stopped;

/// Type-state marker: inherited mappings removed
pub struct Scrubbed;

/// Type-state marker: registers primed, ready to run
pub struct Primed;

/// Isolated context with type-state tracking
pub struct Sandbox<S> {
    tracee: TraceeGuard,
    layout: SandboxLayout,
    report: Option<FdGuard>,
    _state: PhantomData<S>,
}

/// Context whose block is executing; handed to the supervisor.
pub struct LaunchedSandbox {
    pub tracee: TraceeGuard,
    pub layout: SandboxLayout,
}

impl<S> Sandbox<S> {
    pub fn layout(&self) -> &SandboxLayout {
        &self.layout
    }

    pub fn pid(&self) -> Result<Pid> {
        self.tracee
            .pid()
            .ok_or_else(|| DiscoveryError::SandboxSetup("tracee already torn down".to_string()))
    }

    fn transition<T>(self) -> Sandbox<T> {
        Sandbox {
            tracee: self.tracee,
            layout: self.layout,
            report: self.report,
            _state: PhantomData,
        }
    }
}

/// Code image: block, completion sentinel, grant stub.
pub fn build_image(code: &[u8]) -> Vec<u8> {
    let mut image = Vec::with_capacity(code.len() + arch::SENTINEL.len() + arch::SYSCALL_STUB.len());
    image.extend_from_slice(code);
    image.extend_from_slice(arch::SENTINEL);
    image.extend_from_slice(arch::SYSCALL_STUB);
    image
}

/// Reject input outside the Launcher's contract before creating anything.
pub fn validate_code(code: &[u8], max_code_len: usize) -> Result<()> {
    if code.is_empty() {
        return Err(DiscoveryError::InvalidCode("empty basic block".to_string()));
    }
    if code.len() > max_code_len {
        return Err(DiscoveryError::InvalidCode(format!(
            "basic block is {} bytes, limit is {}",
            code.len(),
            max_code_len
        )));
    }
    Ok(())
}

/// Page-aligned code location for `placement`.
pub fn choose_code_location(placement: &CodePlacement, page_size: u64) -> u64 {
    match *placement {
        CodePlacement::Fixed(addr) => addr,
        CodePlacement::Randomized => {
            let (start, end) = RANDOMIZED_CODE_RANGE;
            let page = rand::thread_rng().gen_range(start / page_size..end / page_size);
            page * page_size
        }
    }
}

/// Layout the child will be asked to build.
pub fn plan_layout(code_len: usize, config: &SandboxConfig, host: &HostSupport) -> SandboxLayout {
    let block_size = config.block_size.unwrap_or(host.page_size);
    let image_len = (code_len + arch::SENTINEL.len() + arch::SYSCALL_STUB.len()) as u64;
    let region_len = align_up(image_len, host.page_size);
    let code_location = choose_code_location(&config.placement, host.page_size);

    SandboxLayout {
        code_location,
        code_len: code_len as u64,
        code_region: BlockRange::new(code_location, region_len),
        guard_region: BlockRange::new(align_down(config.priming.base(), block_size), block_size),
        block_size,
    }
}

impl Sandbox<Forked> {
    /// Fork the isolated context for `code`.
    pub fn spawn(code: &[u8], config: &SandboxConfig, host: &HostSupport) -> Result<Self> {
        validate_code(code, config.max_code_len)?;

        let layout = plan_layout(code.len(), config, host);
        if layout.code_region.overlaps(&layout.guard_region) {
            return Err(DiscoveryError::SandboxSetup(format!(
                "code region {:#x} overlaps the guarded region {:#x}",
                layout.code_region.start, layout.guard_region.start
            )));
        }
        let image = build_image(code);

        let (read_fd, write_fd) = pipe().map_err(|e| to_setup_error("pipe(report)", e))?;
        let plan = ChildPlan {
            image: &image,
            region_len: layout.code_region.len as usize,
            code_location: layout.code_location,
            guard: layout.guard_region,
            report_fd: write_fd,
        };

        // SAFETY: the child only runs `run_child`, which restricts itself to
        // async-signal-safe calls on memory prepared above.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                unsafe {
                    libc::close(read_fd);
                }
                run_child(&plan)
            }
            Ok(ForkResult::Parent { child }) => {
                let _ = close(write_fd);
                log::debug!("Forked isolated context {} for {} byte block", child, code.len());
                Ok(Sandbox {
                    tracee: TraceeGuard::new(child),
                    layout,
                    report: Some(FdGuard::new(read_fd)),
                    _state: PhantomData,
                })
            }
            Err(e) => {
                let _ = close(read_fd);
                let _ = close(write_fd);
                Err(to_setup_error("fork(sandbox)", e))
            }
        }
    }

    fn read_report(&mut self) -> Result<ChildReport> {
        let fd = self
            .report
            .take()
            .ok_or_else(|| DiscoveryError::SandboxSetup("setup report already consumed".to_string()))?;
        let mut file = unsafe { File::from_raw_fd(fd.into_raw_fd()) };
        let mut buf = [0u8; REPORT_LEN];
        file.read_exact(&mut buf)
            .map_err(|e| to_setup_error("read(setup report)", e))?;
        Ok(ChildReport::decode(&buf))
    }

    /// Wait until the child has built its mappings and stopped for us.
    pub fn await_stop(mut self) -> Result<Sandbox<Stopped>> {
        let pid = self.pid()?;
        let report = self.read_report()?;

        if report.stage != ChildStage::Ready as u32 {
            let step = ChildStage::from_raw(report.stage)
                .map(|stage| stage.describe())
                .unwrap_or("unknown step");
            return Err(DiscoveryError::SandboxSetup(format!(
                "isolated context failed at {}: {}",
                step,
                Errno::from_i32(report.errno)
            )));
        }

        match ptrace::wait_stop(pid)? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            other => {
                self.tracee.record_exit(&other);
                return Err(DiscoveryError::SandboxSetup(format!(
                    "isolated context did not stop for tracing: {:?}",
                    other
                )))
            }
        }
        ptrace::set_tracer_options(pid)?;

        if report.code_addr != self.layout.code_location {
            return Err(DiscoveryError::SandboxSetup(format!(
                "code region mapped at {:#x}, expected {:#x}",
                report.code_addr, self.layout.code_location
            )));
        }

        log::debug!(
            "Isolated context {} stopped; code at {:#x}, guarded region at {:#x}",
            pid,
            self.layout.code_location,
            self.layout.guard_region.start
        );
        Ok(self.transition())
    }
}

/// Gaps between `keep` ranges inside `[0, limit)`.
pub fn unmap_gaps(mut keep: Vec<BlockRange>, limit: u64) -> Vec<BlockRange> {
    keep.sort_by_key(|range| range.start);
    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for range in keep {
        if range.start > cursor {
            gaps.push(BlockRange::new(cursor, range.start.min(limit) - cursor));
        }
        cursor = cursor.max(range.end());
        if cursor >= limit {
            return gaps;
        }
    }
    if cursor < limit {
        gaps.push(BlockRange::new(cursor, limit - cursor));
    }
    gaps
}

impl Sandbox<Stopped> {
    /// Remove every mapping the child inherited from the caller, so accesses
    /// to the caller's memory fault like any other unmapped address.
    ///
    /// The thread's rseq registration goes first: the kernel writes its area
    /// on every preemption and would kill the tracee once it is unmapped.
    /// Kernels that cannot report the registration keep the mapping holding
    /// the thread control block instead.
    pub fn scrub(self, enabled: bool) -> Result<Sandbox<Scrubbed>> {
        if !enabled {
            log::debug!("Address space scrubbing disabled");
            return Ok(self.transition());
        }

        let pid = self.pid()?;
        let maps = memory::read_maps(pid)?;
        let remote = RemoteSyscall::new(pid, self.layout.stub_addr());

        let mut keep = vec![self.layout.code_region, self.layout.guard_region];
        match ptrace::rseq_configuration(pid)? {
            Some(rseq) if rseq.is_registered() => {
                if let Err(errno) = remote.unregister_rseq(&rseq)? {
                    return Err(DiscoveryError::SandboxSetup(format!(
                        "rseq unregister in isolated context: {}",
                        errno
                    )));
                }
                log::trace!("Unregistered rseq area {:#x} in {}", rseq.rseq_abi_pointer, pid);
            }
            Some(_) => {}
            None => {
                let thread_pointer = arch::thread_pointer(&ptrace::get_registers(pid)?);
                if let Some(tcb) = maps.iter().find(|entry| entry.contains(thread_pointer)) {
                    log::warn!(
                        "Kernel cannot report rseq state; keeping thread mapping {:#x}..{:#x} in {}",
                        tcb.start,
                        tcb.end,
                        pid
                    );
                    keep.push(BlockRange::new(tcb.start, tcb.end - tcb.start));
                }
            }
        }

        for gap in unmap_gaps(keep.clone(), arch::TASK_SIZE) {
            if let Err(errno) = remote.unmap(gap.start, gap.len)? {
                return Err(DiscoveryError::SandboxSetup(format!(
                    "munmap({:#x}, {:#x}) in isolated context: {}",
                    gap.start, gap.len, errno
                )));
            }
        }

        let removed = maps
            .iter()
            .filter(|entry| entry.start < arch::TASK_SIZE)
            .filter(|entry| {
                let range = BlockRange::new(entry.start, entry.end - entry.start);
                !keep.iter().any(|kept| kept.overlaps(&range))
            })
            .count();
        log::debug!("Scrubbed {} inherited mappings from {}", removed, pid);
        Ok(self.transition())
    }
}

impl Sandbox<Scrubbed> {
    /// Load the deterministic register state and aim at the block.
    pub fn prime(self, priming: &RegisterPriming) -> Result<Sandbox<Primed>> {
        let pid = self.pid()?;
        let mut regs = ptrace::get_registers(pid)?;
        arch::prime_registers(&mut regs, priming, self.layout.code_location);
        ptrace::set_registers(pid, regs)?;
        Ok(self.transition())
    }
}

impl Sandbox<Primed> {
    /// Start executing the block. Only a primed sandbox can run.
    pub fn start(self) -> Result<LaunchedSandbox> {
        let pid = self.pid()?;
        ptrace::resume(pid, ResumeMode::UntilSyscall)?;
        Ok(LaunchedSandbox {
            tracee: self.tracee,
            layout: self.layout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> HostSupport {
        HostSupport {
            arch: "x86_64".to_string(),
            page_size: 4096,
            mmap_min_addr: 0x10000,
        }
    }

    #[test]
    fn test_image_appends_sentinel_and_stub() {
        let image = build_image(&[0x89, 0xd8]);
        assert_eq!(image, vec![0x89, 0xd8, 0xcc, 0x0f, 0x05, 0xcc]);
    }

    #[test]
    fn test_validate_code_bounds() {
        assert!(matches!(validate_code(&[], 16), Err(DiscoveryError::InvalidCode(_))));
        assert!(matches!(validate_code(&[0x90; 17], 16), Err(DiscoveryError::InvalidCode(_))));
        assert!(validate_code(&[0x90; 16], 16).is_ok());
    }

    #[test]
    fn test_plan_layout_defaults() {
        let layout = plan_layout(7, &SandboxConfig::default(), &host());
        assert_eq!(layout.code_location, crate::config::types::DEFAULT_CODE_LOCATION);
        assert_eq!(layout.code_region.len, 4096);
        assert_eq!(layout.guard_region, BlockRange::new(0x10000, 4096));
        assert_eq!(layout.block_size, 4096);
        assert_eq!(layout.sentinel_addr(), layout.code_location + 7);
    }

    #[test]
    fn test_randomized_location_is_page_aligned_and_in_range() {
        let (start, end) = RANDOMIZED_CODE_RANGE;
        let locations: Vec<u64> = (0..16)
            .map(|_| choose_code_location(&CodePlacement::Randomized, 4096))
            .collect();
        for &addr in &locations {
            assert_eq!(addr % 4096, 0);
            assert!(addr >= start && addr < end);
        }
        assert!(locations.iter().any(|&addr| addr != locations[0]));
    }

    #[test]
    fn test_plan_layout_spills_into_second_page() {
        let layout = plan_layout(4094, &SandboxConfig::default(), &host());
        assert_eq!(layout.code_region.len, 8192);
    }

    #[test]
    fn test_plan_layout_aligns_guard_to_block() {
        let config = SandboxConfig {
            block_size: Some(0x10000),
            priming: RegisterPriming::Uniform(0x12345),
            ..SandboxConfig::default()
        };
        let layout = plan_layout(1, &config, &host());
        assert_eq!(layout.guard_region, BlockRange::new(0x10000, 0x10000));
    }

    #[test]
    fn test_unmap_gaps_skips_kept_ranges() {
        let keep = vec![
            BlockRange::new(0x2000_0000_0000, 0x1000),
            BlockRange::new(0x10000, 0x1000),
            BlockRange::new(0x7f00_0000_0000, 0x21000),
        ];
        let gaps = unmap_gaps(keep, arch::TASK_SIZE);
        assert_eq!(
            gaps,
            vec![
                BlockRange::new(0, 0x10000),
                BlockRange::new(0x11000, 0x2000_0000_0000 - 0x11000),
                BlockRange::new(0x2000_0000_1000, 0x7f00_0000_0000 - 0x2000_0000_1000),
                BlockRange::new(0x7f00_0002_1000, arch::TASK_SIZE - 0x7f00_0002_1000),
            ]
        );
    }

    #[test]
    fn test_unmap_gaps_merges_overlaps() {
        let keep = vec![BlockRange::new(0x1000, 0x3000), BlockRange::new(0x2000, 0x1000)];
        let gaps = unmap_gaps(keep, 0x10000);
        assert_eq!(
            gaps,
            vec![BlockRange::new(0, 0x1000), BlockRange::new(0x4000, 0xc000)]
        );
    }
}
