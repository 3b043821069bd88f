//! Resident memory sampling for managed processes

use std::process::Command;

/// Source of resident-set-size samples
pub trait MemoryProbe {
    /// RSS of `pid` in bytes, or `None` when it cannot be read
    fn resident_bytes(&self, pid: u32) -> Option<u64>;
}

/// Reads `/proc/<pid>/status` on Linux and falls back to `ps` elsewhere
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemoryProbe;

impl MemoryProbe for OsMemoryProbe {
    fn resident_bytes(&self, pid: u32) -> Option<u64> {
        if cfg!(target_os = "linux") {
            resident_bytes_linux(pid)
        } else {
            resident_bytes_ps(pid)
        }
    }
}

fn resident_bytes_linux(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss(&status)
}

fn resident_bytes_ps(pid: u32) -> Option<u64> {
    // ps reports RSS in KiB
    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let kb: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(kb * 1024)
}

/// Extract `VmRSS` from a `/proc/<pid>/status` document, in bytes
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| extract_status_value(line, "VmRSS"))
        .map(|kb| kb * 1024)
}

fn extract_status_value(line: &str, key: &str) -> Option<u64> {
    // Format: "VmRSS:     12345 kB"
    let rest = line.strip_prefix(key)?.strip_prefix(':')?;
    rest.split_whitespace().next()?.parse::<u64>().ok()
}
