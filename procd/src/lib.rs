//! procd: a small supervisor for long-running processes
//!
//! Reads a pm2-style process descriptor, launches each app with the
//! selected environment profile, redirects its output to log files and
//! keeps it alive: restart on exit, restart over a memory ceiling,
//! restart on file changes when watching.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod launch;
pub mod logs;
pub mod memory;
pub mod status;
pub mod supervisor;
pub mod watch;

pub use descriptor::{Descriptor, ManagedProcessSpec};
pub use error::{Result, SupervisorError};
pub use launch::{LaunchPlan, OsLauncher};
pub use memory::OsMemoryProbe;
pub use supervisor::{ProcessState, Supervisor, SupervisorOptions};
