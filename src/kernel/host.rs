//! Explicitly owned host facts, probed once per discovery service.

use crate::config::types::Result;
use crate::kernel::memory;
use serde::{Deserialize, Serialize};

/// Architecture and kernel parameters every discovery call depends on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSupport {
    pub arch: String,
    pub page_size: u64,
    pub mmap_min_addr: u64,
}

impl HostSupport {
    pub fn probe() -> Result<Self> {
        let host = Self {
            arch: std::env::consts::ARCH.to_string(),
            page_size: memory::page_size()?,
            mmap_min_addr: memory::mmap_min_addr(),
        };
        log::debug!("Probed host support: {:?}", host);
        Ok(host)
    }
}
