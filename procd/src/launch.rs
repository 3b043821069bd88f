//! Launching managed processes
//!
//! A [`LaunchPlan`] is the fully resolved form of one instance of a spec:
//! program, arguments, environment overrides, working directory and log
//! files. [`OsLauncher`] turns a plan into a running child whose output is
//! pumped into the log files.

use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::descriptor::ManagedProcessSpec;
use crate::error::{Result, SupervisorError};
use crate::logs;

/// How a managed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Fully resolved launch parameters for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub name: String,
    pub instance: u32,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Variables set on top of the supervisor's own environment
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    /// chrono format for line timestamps, `None` when `time` is off
    pub timestamp_format: Option<String>,
}

impl LaunchPlan {
    /// Resolve `spec` for `instance` under the selected profile.
    ///
    /// Relative paths in the app resolve against the process working
    /// directory, which itself defaults to the descriptor's directory.
    pub fn build(
        spec: &ManagedProcessSpec,
        profile: Option<&str>,
        instance: u32,
        base_dir: &Path,
        log_dir: &Path,
    ) -> Result<Self> {
        let cwd = match &spec.cwd {
            Some(cwd) => base_dir.join(cwd),
            None => base_dir.to_path_buf(),
        };

        let (program, args) = match spec.wrapper_program() {
            Some(wrapper) => {
                let mut args = spec.interpreter_args.clone();
                args.push(spec.executable_path.to_string_lossy().into_owned());
                args.extend(spec.args.iter().cloned());
                (PathBuf::from(wrapper), args)
            }
            None => (
                anchor_program(&spec.executable_path, &cwd),
                spec.args.clone(),
            ),
        };

        let mut env = spec.environment(profile)?;
        env.insert(spec.instance_var.clone(), instance.to_string());

        let split_logs = spec.instance_count > 1 && !spec.merge_logs;
        let stdout_log = log_path(
            spec.stdout_log_path.as_deref(),
            &cwd,
            log_dir,
            &format!("{}-out.log", spec.name),
            split_logs.then_some(instance),
        );
        let stderr_log = log_path(
            spec.stderr_log_path.as_deref(),
            &cwd,
            log_dir,
            &format!("{}-error.log", spec.name),
            split_logs.then_some(instance),
        );

        Ok(Self {
            name: spec.name.clone(),
            instance,
            program,
            args,
            env,
            cwd,
            stdout_log,
            stderr_log,
            timestamp_format: spec
                .timestamp_logs
                .then(|| spec.log_date_format.clone()),
        })
    }

    /// Label used in logs, e.g. `bot#0`
    pub fn label(&self) -> String {
        format!("{}#{}", self.name, self.instance)
    }

    fn spawn_error(&self, reason: impl Into<String>) -> SupervisorError {
        SupervisorError::Spawn {
            name: self.label(),
            program: self.program.clone(),
            reason: reason.into(),
        }
    }
}

/// Relative paths with a directory part are pinned to `cwd`; bare names are
/// left for a `PATH` lookup.
fn anchor_program(program: &Path, cwd: &Path) -> PathBuf {
    if program.is_absolute() || is_bare_name(program) {
        program.to_path_buf()
    } else {
        cwd.join(program)
    }
}

fn is_bare_name(program: &Path) -> bool {
    program.components().count() == 1 && program.parent() == Some(Path::new(""))
}

fn log_path(
    configured: Option<&Path>,
    cwd: &Path,
    log_dir: &Path,
    default_name: &str,
    instance_suffix: Option<u32>,
) -> PathBuf {
    let path = match configured {
        Some(path) => cwd.join(path),
        None => log_dir.join(default_name),
    };
    match instance_suffix {
        Some(instance) => with_instance_suffix(&path, instance),
        None => path,
    }
}

fn with_instance_suffix(path: &Path, instance: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}-{instance}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{instance}"),
    };
    path.with_file_name(file_name)
}

/// Locate the program a plan will execute.
///
/// Paths must exist and be executable; bare names are searched in `PATH`.
pub fn resolve_program(plan: &LaunchPlan) -> Result<PathBuf> {
    let program = &plan.program;
    if is_bare_name(program) {
        return which::which(program)
            .map_err(|e| plan.spawn_error(format!("not found in PATH: {e}")));
    }

    let metadata = std::fs::metadata(program)
        .map_err(|e| plan.spawn_error(format!("cannot access executable: {e}")))?;
    if !metadata.is_file() {
        return Err(plan.spawn_error("not a regular file"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(plan.spawn_error("file is not executable"));
        }
    }
    Ok(program.clone())
}

/// A running managed process
pub trait ProcessHandle {
    fn pid(&self) -> u32;

    /// Non-blocking exit check; reports each exit exactly once
    fn try_wait(&mut self) -> io::Result<Option<ExitReport>>;

    /// Ask the process to stop, killing it once `grace` has passed
    fn terminate(&mut self, grace: Duration) -> io::Result<ExitReport>;
}

/// Starts processes from launch plans
pub trait Launcher {
    type Handle: ProcessHandle;

    fn launch(&mut self, plan: &LaunchPlan) -> Result<Self::Handle>;
}

/// Spawns real OS processes with redirected output
#[derive(Debug, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    type Handle = OsProcess;

    fn launch(&mut self, plan: &LaunchPlan) -> Result<OsProcess> {
        let program = resolve_program(plan)?;

        let mut command = Command::new(&program);
        command
            .args(&plan.args)
            .envs(&plan.env)
            .current_dir(&plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group so stop signals reach the whole tree
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| plan.spawn_error(e.to_string()))?;
        let pid = child.id();
        debug!("{} spawned {} (PID {pid})", plan.label(), program.display());

        if let Some(stdout) = child.stdout.take() {
            if let Err(e) = logs::spawn_pump(
                format!("{}-out", plan.label()),
                stdout,
                &plan.stdout_log,
                plan.timestamp_format.clone(),
            ) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(plan.spawn_error(format!(
                    "cannot open {}: {e}",
                    plan.stdout_log.display()
                )));
            }
        }
        if let Some(stderr) = child.stderr.take() {
            if let Err(e) = logs::spawn_pump(
                format!("{}-err", plan.label()),
                stderr,
                &plan.stderr_log,
                plan.timestamp_format.clone(),
            ) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(plan.spawn_error(format!(
                    "cannot open {}: {e}",
                    plan.stderr_log.display()
                )));
            }
        }

        Ok(OsProcess { child })
    }
}

/// Child process spawned by [`OsLauncher`]
#[derive(Debug)]
pub struct OsProcess {
    child: Child,
}

impl ProcessHandle for OsProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitReport>> {
        Ok(self.child.try_wait()?.map(ExitReport::from_status))
    }

    fn terminate(&mut self, grace: Duration) -> io::Result<ExitReport> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(ExitReport::from_status(status));
        }

        send_sigterm(self.child.id());

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait()? {
                return Ok(ExitReport::from_status(status));
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        warn!(
            "PID {} did not stop within {grace:?}, sending SIGKILL",
            self.child.id()
        );
        kill_group(self.child.id());
        let _ = self.child.kill();
        self.child.wait().map(ExitReport::from_status)
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match kill(Pid::from_raw(-raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => {
            warn!("Failed to send {signal:?} to process group {pid}: {e}");
            let _ = kill(Pid::from_raw(raw), signal);
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}
