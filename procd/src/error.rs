//! Error taxonomy for the supervisor
//!
//! Configuration errors are fatal before anything starts. The remaining
//! variants describe what happened to a managed process and are written
//! to that process's error log as well as to tracing.

use std::path::PathBuf;

/// Errors surfaced while loading descriptors or supervising processes
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Descriptor is missing required fields or holds invalid values.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Executable could not be resolved or the OS refused to start it.
    #[error("failed to spawn {name} ({program}): {reason}")]
    Spawn {
        name: String,
        program: PathBuf,
        reason: String,
    },

    /// Managed process exited without being asked to.
    #[error("{name} (pid {pid}) exited unexpectedly with {}", describe_exit(.code))]
    RuntimeCrash {
        name: String,
        pid: u32,
        code: Option<i32>,
    },

    /// Resident memory went over `max_memory_restart`.
    #[error("{name} (pid {pid}) uses {rss_bytes} bytes, limit is {limit_bytes} bytes")]
    MemoryLimitExceeded {
        name: String,
        pid: u32,
        rss_bytes: u64,
        limit_bytes: u64,
    },
}

impl SupervisorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;
