//! Host memory facts and `/proc/<pid>/maps` parsing.

use crate::config::types::{to_setup_error, Result};
use nix::unistd::{sysconf, Pid, SysconfVar};
use std::fs;

/// Kernel default for `vm.mmap_min_addr` on most distributions.
const DEFAULT_MMAP_MIN_ADDR: u64 = 0x1_0000;

/// Host page size in bytes.
pub fn page_size() -> Result<u64> {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => Ok(size as u64),
        Ok(_) => Err(to_setup_error("sysconf(PAGE_SIZE)", "not reported")),
        Err(e) => Err(to_setup_error("sysconf(PAGE_SIZE)", e)),
    }
}

/// Lowest address the kernel lets an unprivileged process map.
pub fn mmap_min_addr() -> u64 {
    match fs::read_to_string("/proc/sys/vm/mmap_min_addr") {
        Ok(text) => text.trim().parse().unwrap_or_else(|e| {
            log::warn!("Unparseable vm.mmap_min_addr {:?}: {}", text.trim(), e);
            DEFAULT_MMAP_MIN_ADDR
        }),
        Err(e) => {
            log::debug!("vm.mmap_min_addr unavailable ({}), assuming {:#x}", e, DEFAULT_MMAP_MIN_ADDR);
            DEFAULT_MMAP_MIN_ADDR
        }
    }
}

pub fn align_down(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    addr & !(align - 1)
}

pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub path: Option<String>,
}

impl MapEntry {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

fn parse_map_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?.to_string();
    // offset, dev, inode
    let _ = fields.next()?;
    let _ = fields.next()?;
    let _ = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    let (start, end) = range.split_once('-')?;
    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        path: if path.is_empty() { None } else { Some(path) },
    })
}

/// Parse the text of a maps file, skipping malformed lines.
pub fn parse_maps(text: &str) -> Vec<MapEntry> {
    text.lines()
        .filter_map(|line| {
            let entry = parse_map_line(line);
            if entry.is_none() && !line.trim().is_empty() {
                log::warn!("Skipping malformed maps line: {}", line);
            }
            entry
        })
        .collect()
}

pub fn read_maps(pid: Pid) -> Result<Vec<MapEntry>> {
    let path = format!("/proc/{}/maps", pid);
    let text = fs::read_to_string(&path).map_err(|e| to_setup_error(&path, e))?;
    Ok(parse_maps(&text))
}
