/// Core types and structures for addrprobe
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default fixed code location: far above the low plausible-access addresses
/// and below the usual PIE/shared-library ranges.
pub const DEFAULT_CODE_LOCATION: u64 = 0x0000_2000_0000_0000;

/// Default register priming value (and therefore the default Guarded Region).
pub const DEFAULT_PRIMING_VALUE: u64 = 0x1_0000;

/// Exclusive upper bound of the x86-64 user address space (4-level paging).
pub const USER_ADDRESS_LIMIT: u64 = 0x0000_8000_0000_0000;

/// Range `[start, end)` a randomized code location is drawn from.
pub const RANDOMIZED_CODE_RANGE: (u64, u64) = (0x0000_1000_0000_0000, 0x0000_4000_0000_0000);

/// Where the block is placed inside the isolated context.
///
/// `Fixed` is the default: identical code always runs at the same
/// `code_location`, so repeated runs are reproducible. `Randomized` draws a
/// fresh page-aligned location from [`RANDOMIZED_CODE_RANGE`] on every call,
/// which surfaces blocks whose behaviour depends on their own address.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CodePlacement {
    Fixed(u64),
    Randomized,
}

impl Default for CodePlacement {
    fn default() -> Self {
        CodePlacement::Fixed(DEFAULT_CODE_LOCATION)
    }
}

/// Deterministic values written into the general-purpose registers before
/// control is transferred to the block.
///
/// Register order for `Distinct` is `rax, rbx, rcx, rdx, rsi, rdi, rbp, rsp,
/// r8 .. r15`; register `i` receives `base + i * stride`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegisterPriming {
    /// Every general-purpose register (including `rsp` and `rbp`) holds the value.
    Uniform(u64),
    Distinct { base: u64, stride: u64 },
}

impl RegisterPriming {
    /// Value assigned to general-purpose register `index`.
    pub fn value_for(&self, index: usize) -> u64 {
        match *self {
            RegisterPriming::Uniform(value) => value,
            RegisterPriming::Distinct { base, stride } => {
                base.wrapping_add(stride.wrapping_mul(index as u64))
            }
        }
    }

    /// Lowest primed value; the Guarded Region is placed at its block.
    pub fn base(&self) -> u64 {
        match *self {
            RegisterPriming::Uniform(value) => value,
            RegisterPriming::Distinct { base, .. } => base,
        }
    }
}

impl Default for RegisterPriming {
    fn default() -> Self {
        RegisterPriming::Uniform(DEFAULT_PRIMING_VALUE)
    }
}

/// Half-open range `[start, end)` of addresses treated as legitimate memory
/// operands. Faults outside it are reported as unresolvable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessWindow {
    pub start: u64,
    pub end: u64,
}

impl AccessWindow {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

impl Default for AccessWindow {
    fn default() -> Self {
        Self {
            start: 0,
            end: USER_ADDRESS_LIMIT,
        }
    }
}

/// Sandbox configuration for one discovery service
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Reporting and grant granularity; `None` uses the host page size
    pub block_size: Option<u64>,
    /// Largest accepted basic block in bytes
    pub max_code_len: usize,
    /// Code placement policy
    pub placement: CodePlacement,
    /// Register priming scheme
    pub priming: RegisterPriming,
    /// Plausible-access window
    pub access_window: AccessWindow,
    /// Distinct blocks that may be granted before the access is unresolvable
    pub max_granted_blocks: usize,
    /// Grant-and-resume cycles before the call times out
    pub max_fault_iterations: u32,
    /// Wall clock budget for one call, in milliseconds
    pub wall_time_limit_ms: u64,
    /// Unmap every mapping the isolated context inherited from the caller
    pub scrub_address_space: bool,
    /// Append audit events as JSON lines to this file
    pub audit_log_path: Option<PathBuf>,
}

impl SandboxConfig {
    pub fn wall_time_limit(&self) -> Duration {
        Duration::from_millis(self.wall_time_limit_ms)
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            // One 4 KiB page minus the sentinel and the grant stub.
            max_code_len: 4092,
            placement: CodePlacement::default(),
            priming: RegisterPriming::default(),
            access_window: AccessWindow::default(),
            max_granted_blocks: 512,
            max_fault_iterations: 256,
            wall_time_limit_ms: 2000,
            scrub_address_space: true,
            audit_log_path: None,
        }
    }
}

/// Memory blocks a basic block touched during one sandboxed execution
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessedAddrs {
    /// Address the block was placed at inside the isolated context
    pub code_location: u64,
    /// Power-of-two alignment granularity of `accessed_blocks`
    pub block_size: u64,
    /// Distinct block-aligned addresses in first-observed order
    pub accessed_blocks: Vec<u64>,
}

/// Which bound a timed-out call exceeded
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutLimit {
    FaultIterations,
    WallClock,
}

impl std::fmt::Display for TimeoutLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutLimit::FaultIterations => write!(f, "fault iteration limit"),
            TimeoutLimit::WallClock => write!(f, "wall clock limit"),
        }
    }
}

/// Error taxonomy for discovery calls
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Sandbox setup error: {0}")]
    SandboxSetup(String),

    #[error("Unresolvable access at {addr:#x}: {reason}")]
    UnresolvableAccess { addr: u64, reason: String },

    #[error("Execution fault{}: {reason}", .pc.map(|pc| format!(" at pc {pc:#x}")).unwrap_or_default())]
    ExecutionFault { pc: Option<u64>, reason: String },

    #[error("Timed out on {limit} after {iterations} fault iterations ({elapsed:?})")]
    Timeout {
        limit: TimeoutLimit,
        iterations: u32,
        elapsed: Duration,
    },

    #[error("Discovery cancelled")]
    Cancelled,

    #[error("Invalid code: {0}")]
    InvalidCode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// Stable short label used by metrics and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            DiscoveryError::SandboxSetup(_) => "sandbox_setup",
            DiscoveryError::UnresolvableAccess { .. } => "unresolvable_access",
            DiscoveryError::ExecutionFault { .. } => "execution_fault",
            DiscoveryError::Timeout { .. } => "timeout",
            DiscoveryError::Cancelled => "cancelled",
            DiscoveryError::InvalidCode(_) => "invalid_code",
            DiscoveryError::Config(_) => "config",
        }
    }

    pub(crate) fn execution_fault(pc: Option<u64>, reason: impl Into<String>) -> Self {
        DiscoveryError::ExecutionFault {
            pc,
            reason: reason.into(),
        }
    }

    pub(crate) fn unresolvable(addr: u64, reason: impl Into<String>) -> Self {
        DiscoveryError::UnresolvableAccess {
            addr,
            reason: reason.into(),
        }
    }
}

/// Map an OS-level failure during sandbox construction into the taxonomy.
pub(crate) fn to_setup_error(prefix: &str, err: impl std::fmt::Display) -> DiscoveryError {
    DiscoveryError::SandboxSetup(format!("{prefix}: {err}"))
}

/// Result type for addrprobe operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
