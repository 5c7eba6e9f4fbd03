// Config validation
// Startup validation of a SandboxConfig against the host it will run on.
// Errors are fatal and reported together; warnings are logged.

use crate::arch;
use crate::config::types::{
    CodePlacement, DiscoveryError, RegisterPriming, Result, SandboxConfig, USER_ADDRESS_LIMIT,
};
use crate::core::types::BlockRange;
use crate::kernel::host::HostSupport;
use crate::kernel::memory::align_down;

/// Validation result with detailed errors
#[derive(Debug)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate config at startup; any error fails the whole config.
pub fn validate_config(config: &SandboxConfig, host: &HostSupport) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_block_size(config, host, &mut result);
    validate_limits(config, &mut result);
    validate_window(config, &mut result);
    validate_layout(config, host, &mut result);

    for warning in &result.warnings {
        log::warn!("Sandbox config: {}", warning);
    }

    if !result.is_valid() {
        return Err(DiscoveryError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn effective_block_size(config: &SandboxConfig, host: &HostSupport) -> u64 {
    config.block_size.unwrap_or(host.page_size)
}

fn validate_block_size(config: &SandboxConfig, host: &HostSupport, result: &mut ValidationResult) {
    let block_size = effective_block_size(config, host);
    if !block_size.is_power_of_two() {
        result.add_error(format!("block_size {:#x} is not a power of two", block_size));
    } else if block_size < host.page_size {
        result.add_error(format!(
            "block_size {:#x} is smaller than the host page size {:#x}",
            block_size, host.page_size
        ));
    }
}

fn validate_limits(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.max_code_len == 0 {
        result.add_error("max_code_len cannot be zero".to_string());
    }
    if config.max_granted_blocks == 0 {
        result.add_error("max_granted_blocks cannot be zero".to_string());
    }
    if config.max_fault_iterations == 0 {
        result.add_error("max_fault_iterations cannot be zero".to_string());
    }
    if config.wall_time_limit_ms == 0 {
        result.add_error("wall_time_limit_ms cannot be zero".to_string());
    }

    if config.max_granted_blocks > config.max_fault_iterations as usize {
        result.add_warning(format!(
            "max_granted_blocks {} exceeds max_fault_iterations {}; the iteration limit is hit first",
            config.max_granted_blocks, config.max_fault_iterations
        ));
    }
    if !config.scrub_address_space {
        result.add_warning(
            "scrub_address_space is disabled; accesses to inherited mappings go unreported"
                .to_string(),
        );
    }
    if let RegisterPriming::Distinct { stride: 0, .. } = config.priming {
        result.add_warning("Distinct priming with stride 0 behaves like Uniform".to_string());
    }
}

fn validate_window(config: &SandboxConfig, result: &mut ValidationResult) {
    let window = config.access_window;
    if window.start >= window.end {
        result.add_error(format!(
            "access_window [{:#x}, {:#x}) is empty",
            window.start, window.end
        ));
    }
    if window.end > USER_ADDRESS_LIMIT {
        result.add_error(format!(
            "access_window end {:#x} is above the user address limit {:#x}",
            window.end, USER_ADDRESS_LIMIT
        ));
    }
}

fn validate_layout(config: &SandboxConfig, host: &HostSupport, result: &mut ValidationResult) {
    let block_size = effective_block_size(config, host);
    if !block_size.is_power_of_two() {
        return;
    }

    let guard = BlockRange::new(align_down(config.priming.base(), block_size), block_size);
    if guard.start < host.mmap_min_addr {
        result.add_error(format!(
            "guarded region {:#x} is below vm.mmap_min_addr {:#x}; choose a higher priming base",
            guard.start, host.mmap_min_addr
        ));
    }
    match guard.checked_end() {
        Some(end) if end <= arch::TASK_SIZE => {}
        _ => result.add_error(format!(
            "guarded region {:#x} is outside the user address space",
            guard.start
        )),
    }
    if !config.access_window.contains(guard.start) {
        result.add_warning(format!(
            "guarded region {:#x} lies outside the access window; register-relative accesses will be unresolvable",
            guard.start
        ));
    }

    if let CodePlacement::Fixed(addr) = config.placement {
        let region_len = (config.max_code_len as u64)
            .checked_add((arch::SENTINEL.len() + arch::SYSCALL_STUB.len()) as u64)
            .and_then(|image_len| image_len.checked_add(host.page_size - 1))
            .map(|padded| align_down(padded, host.page_size));
        let region_len = match region_len {
            Some(len) => len,
            None => {
                result.add_error(format!(
                    "max_code_len {} does not fit in the address space",
                    config.max_code_len
                ));
                return;
            }
        };
        let code = BlockRange::new(addr, region_len);

        if addr % host.page_size != 0 {
            result.add_error(format!("fixed code location {:#x} is not page aligned", addr));
        }
        if addr < host.mmap_min_addr {
            result.add_error(format!(
                "fixed code location {:#x} is below vm.mmap_min_addr {:#x}",
                addr, host.mmap_min_addr
            ));
        }
        match code.checked_end() {
            Some(end) if end <= arch::TASK_SIZE => {}
            _ => result.add_error(format!(
                "fixed code region {:#x} (+{:#x}) is outside the user address space",
                code.start, code.len
            )),
        }
        if code.overlaps(&guard) {
            result.add_error(format!(
                "fixed code region {:#x} overlaps the guarded region {:#x}",
                code.start, guard.start
            ));
        }
    }
}
