//! Status file for supervisor process information.
//!
//! The running supervisor rewrites a JSON snapshot every tick; `procd status`
//! reads it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Information about a single managed instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    /// App name from the descriptor
    pub name: String,
    pub instance: u32,
    /// Process ID (if running)
    pub pid: Option<u32>,
    pub state: String,
    pub restarts: u32,
    /// Last resident memory sample in bytes
    pub memory_bytes: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub last_exit_code: Option<i32>,
}

/// Full supervisor status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub supervisor_pid: u32,
    pub started_at: DateTime<Utc>,
    pub descriptor: String,
    pub profile: Option<String>,
    pub processes: Vec<InstanceStatus>,
}

impl SupervisorStatus {
    pub fn new(descriptor: &Path, profile: Option<&str>) -> Self {
        Self {
            supervisor_pid: std::process::id(),
            started_at: Utc::now(),
            descriptor: descriptor.display().to_string(),
            profile: profile.map(str::to_string),
            processes: Vec::new(),
        }
    }

    /// Write the snapshot, replacing the previous file atomically
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)
    }

    pub fn read(path: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn remove(path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Human-readable table, one row per instance
    pub fn render(&self) -> String {
        let mut out = format!(
            "procd pid {} since {} ({}, profile {})\n",
            self.supervisor_pid,
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            self.descriptor,
            self.profile.as_deref().unwrap_or("default"),
        );
        out.push_str(&format!(
            "{:<24} {:>3} {:>8} {:<16} {:>8} {:>10} {:>8}\n",
            "NAME", "ID", "PID", "STATE", "RESTARTS", "MEMORY", "UPTIME"
        ));
        for p in &self.processes {
            out.push_str(&format!(
                "{:<24} {:>3} {:>8} {:<16} {:>8} {:>10} {:>8}\n",
                p.name,
                p.instance,
                p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
                p.state,
                p.restarts,
                p.memory_bytes
                    .map(format_bytes)
                    .unwrap_or_else(|| "-".into()),
                p.uptime_secs
                    .map(|s| format!("{s}s"))
                    .unwrap_or_else(|| "-".into()),
            ));
        }
        out
    }
}

fn format_bytes(bytes: u64) -> String {
    const MIB: u64 = 1024 * 1024;
    if bytes >= 1024 * MIB {
        format!("{:.1}G", bytes as f64 / (1024 * MIB) as f64)
    } else {
        format!("{:.1}M", bytes as f64 / MIB as f64)
    }
}
