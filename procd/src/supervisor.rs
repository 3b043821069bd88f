//! Process supervisor
//!
//! Launches every instance of every app in a descriptor, restarts them on
//! exit when `autorestart` is set, restarts them when they go over their
//! memory ceiling or when watched files change, and stops them on request.
//! All time-dependent decisions take `now` so the loop can be driven by
//! tests.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::ProcdConfig;
use crate::descriptor::{Descriptor, ManagedProcessSpec};
use crate::error::{Result, SupervisorError};
use crate::launch::{ExitReport, LaunchPlan, Launcher, ProcessHandle};
use crate::logs;
use crate::memory::MemoryProbe;
use crate::status::InstanceStatus;
use crate::watch::{AppWatcher, ChangeFilter};

/// Lifecycle state of one managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Exited; waiting for `restart_delay` before relaunching
    RestartPending,
    /// Gave up: crash loop limit hit or spawn failed without autorestart
    Errored,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::RestartPending => "restart_pending",
            ProcessState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Supervisor-wide policy knobs
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub log_dir: PathBuf,
    pub max_restart_attempts: u32,
    pub restart_window: Duration,
    pub memory_check_interval: Duration,
    pub watch_debounce: Duration,
}

impl From<&ProcdConfig> for SupervisorOptions {
    fn from(config: &ProcdConfig) -> Self {
        Self {
            log_dir: config.supervisor.log_dir.clone(),
            max_restart_attempts: config.restart.max_restart_attempts,
            restart_window: config.restart_window(),
            memory_check_interval: config.memory_check_interval(),
            watch_debounce: config.watch_debounce(),
        }
    }
}

/// One running copy of an app
struct ManagedInstance<H> {
    spec: Arc<ManagedProcessSpec>,
    plan: LaunchPlan,
    process: Option<H>,
    state: ProcessState,
    started_at: Option<Instant>,
    restart_count: u32,
    window_restarts: u32,
    last_restart: Option<Instant>,
    restart_due: Option<Instant>,
    last_memory: Option<u64>,
    last_memory_check: Option<Instant>,
    last_exit: Option<ExitReport>,
}

impl<H: ProcessHandle> ManagedInstance<H> {
    fn new(spec: Arc<ManagedProcessSpec>, plan: LaunchPlan) -> Self {
        Self {
            spec,
            plan,
            process: None,
            state: ProcessState::Stopped,
            started_at: None,
            restart_count: 0,
            window_restarts: 0,
            last_restart: None,
            restart_due: None,
            last_memory: None,
            last_memory_check: None,
            last_exit: None,
        }
    }

    fn label(&self) -> String {
        self.plan.label()
    }

    fn record(&self, message: &str) {
        logs::record_event(&self.plan.stderr_log, message, &self.spec.log_date_format);
    }

    /// Count an automatic restart against the crash-loop window
    fn consume_restart(&mut self, now: Instant, max_attempts: u32, window: Duration) -> bool {
        if let Some(last) = self.last_restart {
            if now.saturating_duration_since(last) > window {
                // New window
                self.window_restarts = 0;
            }
        }

        if self.window_restarts >= max_attempts {
            return false;
        }

        self.window_restarts += 1;
        self.restart_count += 1;
        self.last_restart = Some(now);
        true
    }

    fn status(&self, now: Instant) -> InstanceStatus {
        InstanceStatus {
            name: self.spec.name.clone(),
            instance: self.plan.instance,
            pid: self.process.as_ref().map(ProcessHandle::pid),
            state: self.state.to_string(),
            restarts: self.restart_count,
            memory_bytes: self.last_memory,
            uptime_secs: match (self.state, self.started_at) {
                (ProcessState::Running, Some(at)) => Some(now.saturating_duration_since(at).as_secs()),
                _ => None,
            },
            last_exit_code: self.last_exit.and_then(|exit| exit.code),
        }
    }
}

/// Supervisor that manages every app of a descriptor
pub struct Supervisor<L: Launcher, M: MemoryProbe> {
    launcher: L,
    probe: M,
    options: SupervisorOptions,
    profile: Option<String>,
    base_dir: PathBuf,
    instances: Vec<ManagedInstance<L::Handle>>,
    watchers: HashMap<String, AppWatcher>,
}

impl<L: Launcher, M: MemoryProbe> Supervisor<L, M> {
    /// Build instances for every app. Nothing is started yet.
    pub fn new(
        launcher: L,
        probe: M,
        options: SupervisorOptions,
        descriptor: &Descriptor,
        profile: Option<&str>,
    ) -> Result<Self> {
        descriptor.check_profile(profile)?;

        let mut supervisor = Self {
            launcher,
            probe,
            options,
            profile: profile.map(str::to_string),
            base_dir: descriptor.base_dir.clone(),
            instances: Vec::new(),
            watchers: HashMap::new(),
        };
        for spec in &descriptor.apps {
            supervisor.add_app(Arc::new(spec.clone()))?;
        }
        Ok(supervisor)
    }

    fn add_app(&mut self, spec: Arc<ManagedProcessSpec>) -> Result<()> {
        for index in 0..spec.instance_count {
            let plan = LaunchPlan::build(
                &spec,
                self.profile.as_deref(),
                index,
                &self.base_dir,
                &self.options.log_dir,
            )?;
            self.instances.push(ManagedInstance::new(spec.clone(), plan));
        }
        Ok(())
    }

    pub fn app_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for instance in &self.instances {
            if !names.contains(&instance.spec.name) {
                names.push(instance.spec.name.clone());
            }
        }
        names
    }

    fn indices_of(&self, name: &str) -> Result<Vec<usize>> {
        let indices: Vec<usize> = self
            .instances
            .iter()
            .enumerate()
            .filter(|(_, inst)| inst.spec.name == name)
            .map(|(idx, _)| idx)
            .collect();
        if indices.is_empty() {
            return Err(SupervisorError::config(format!("no app named '{name}'")));
        }
        Ok(indices)
    }

    /// Start every app
    pub fn start_all(&mut self, now: Instant) {
        for name in self.app_names() {
            if let Err(e) = self.start(&name, now) {
                error!("Failed to start {name}: {e}");
            }
        }
    }

    /// Start all stopped or errored instances of `name`
    pub fn start(&mut self, name: &str, now: Instant) -> Result<()> {
        for idx in self.indices_of(name)? {
            let instance = &mut self.instances[idx];
            if matches!(instance.state, ProcessState::Stopped | ProcessState::Errored) {
                instance.window_restarts = 0;
                instance.restart_due = None;
                self.launch_instance(idx, now);
            }
        }
        self.ensure_watcher(name);
        Ok(())
    }

    /// Stop every instance of `name`; no automatic restart follows
    pub fn stop(&mut self, name: &str) -> Result<()> {
        for idx in self.indices_of(name)? {
            self.stop_instance(idx);
        }
        self.watchers.remove(name);
        Ok(())
    }

    /// Stop and relaunch every instance of `name`
    pub fn restart(&mut self, name: &str, now: Instant) -> Result<()> {
        for idx in self.indices_of(name)? {
            self.stop_instance(idx);
            self.instances[idx].restart_count += 1;
            self.launch_instance(idx, now);
        }
        Ok(())
    }

    /// Stop all managed processes
    pub fn stop_all(&mut self) {
        info!("Stopping all processes...");
        self.watchers.clear();
        for idx in 0..self.instances.len() {
            self.stop_instance(idx);
        }
        info!("All processes stopped");
    }

    /// Return the number of running instances
    pub fn running_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|inst| inst.state == ProcessState::Running)
            .count()
    }

    pub fn state_of(&self, name: &str, instance: u32) -> Option<ProcessState> {
        self.instances
            .iter()
            .find(|inst| inst.spec.name == name && inst.plan.instance == instance)
            .map(|inst| inst.state)
    }

    pub fn status(&self, now: Instant) -> Vec<InstanceStatus> {
        self.instances.iter().map(|inst| inst.status(now)).collect()
    }

    /// One supervision pass over every instance
    pub fn tick(&mut self, now: Instant) {
        let quiet = self.options.watch_debounce;
        let changed: Vec<String> = self
            .watchers
            .iter_mut()
            .filter_map(|(name, watcher)| watcher.poll(now, quiet).then(|| name.clone()))
            .collect();
        for name in changed {
            info!("Files changed for {name}, restarting");
            for idx in self.indices_of(&name).unwrap_or_default() {
                if self.instances[idx].state == ProcessState::Running {
                    self.instances[idx].record("file change detected, restarting");
                    self.stop_instance(idx);
                    self.instances[idx].restart_count += 1;
                    self.launch_instance(idx, now);
                }
            }
        }

        for idx in 0..self.instances.len() {
            match self.instances[idx].state {
                ProcessState::Running => {
                    if !self.check_exit(idx, now) {
                        self.check_memory(idx, now);
                    }
                }
                ProcessState::RestartPending => {
                    let due = self.instances[idx].restart_due.unwrap_or(now);
                    if now >= due {
                        self.launch_instance(idx, now);
                    }
                }
                _ => {}
            }
        }
    }

    /// Handle an exited process. Returns true when an exit was observed.
    fn check_exit(&mut self, idx: usize, now: Instant) -> bool {
        let max_attempts = self.max_attempts(idx);
        let window = self.options.restart_window;
        let instance = &mut self.instances[idx];
        let Some(process) = instance.process.as_mut() else {
            return false;
        };
        let pid = process.pid();

        let exit = match process.try_wait() {
            Ok(Some(exit)) => exit,
            Ok(None) => return false,
            Err(e) => {
                // Lost track of the child: make sure it is gone before replacing it
                error!("Error checking {} (PID {pid}): {e}", instance.plan.label());
                process
                    .terminate(instance.spec.kill_timeout())
                    .unwrap_or(ExitReport {
                        code: None,
                        signal: None,
                    })
            }
        };

        instance.process = None;
        instance.started_at = None;
        instance.last_memory = None;
        instance.last_exit = Some(exit);

        if exit.success() {
            let message = format!("{} (pid {pid}) exited with code 0", instance.label());
            info!("{message}");
            instance.record(&message);
        } else {
            let crash = SupervisorError::RuntimeCrash {
                name: instance.label(),
                pid,
                code: exit.code,
            };
            warn!("{crash}");
            instance.record(&crash.to_string());
        }

        if !instance.spec.auto_restart {
            instance.state = if exit.success() {
                ProcessState::Stopped
            } else {
                ProcessState::Errored
            };
            return true;
        }

        if instance.consume_restart(now, max_attempts, window) {
            let delay = instance.spec.restart_delay();
            info!(
                "Restarting {} in {delay:?} (attempt {})",
                instance.label(),
                instance.window_restarts
            );
            instance.state = ProcessState::RestartPending;
            instance.restart_due = Some(now + delay);
        } else {
            let message = format!(
                "{} exceeded max restart attempts ({max_attempts}), not restarting",
                instance.label()
            );
            error!("{message}");
            instance.record(&message);
            instance.state = ProcessState::Errored;
        }
        true
    }

    fn check_memory(&mut self, idx: usize, now: Instant) {
        let interval = self.options.memory_check_interval;
        let instance = &mut self.instances[idx];
        let Some(limit) = instance.spec.max_memory_restart else {
            return;
        };
        if let Some(last) = instance.last_memory_check {
            if now.saturating_duration_since(last) < interval {
                return;
            }
        }
        let Some(pid) = instance.process.as_ref().map(ProcessHandle::pid) else {
            return;
        };

        instance.last_memory_check = Some(now);
        let Some(rss) = self.probe.resident_bytes(pid) else {
            return;
        };
        instance.last_memory = Some(rss);
        if rss <= limit {
            return;
        }

        let exceeded = SupervisorError::MemoryLimitExceeded {
            name: instance.label(),
            pid,
            rss_bytes: rss,
            limit_bytes: limit,
        };
        warn!("{exceeded}, restarting");
        instance.record(&format!("{exceeded}, restarting"));

        self.stop_instance(idx);
        let instance = &mut self.instances[idx];
        instance.restart_count += 1;
        self.launch_instance(idx, now);
    }

    fn max_attempts(&self, idx: usize) -> u32 {
        self.instances[idx]
            .spec
            .max_restarts
            .unwrap_or(self.options.max_restart_attempts)
    }

    /// Spawn one instance; spawn failures follow the restart policy
    fn launch_instance(&mut self, idx: usize, now: Instant) {
        let max_attempts = self.max_attempts(idx);
        let window = self.options.restart_window;
        let instance = &mut self.instances[idx];
        instance.state = ProcessState::Starting;
        instance.restart_due = None;

        match self.launcher.launch(&instance.plan) {
            Ok(process) => {
                info!("{} started with PID {}", instance.label(), process.pid());
                instance.process = Some(process);
                instance.state = ProcessState::Running;
                instance.started_at = Some(now);
                instance.last_memory = None;
                instance.last_memory_check = None;
            }
            Err(e) => {
                error!("{e}");
                instance.record(&e.to_string());
                if instance.spec.auto_restart && instance.consume_restart(now, max_attempts, window)
                {
                    instance.state = ProcessState::RestartPending;
                    instance.restart_due = Some(now + instance.spec.restart_delay());
                } else {
                    instance.state = ProcessState::Errored;
                }
            }
        }
    }

    fn stop_instance(&mut self, idx: usize) {
        let instance = &mut self.instances[idx];
        instance.restart_due = None;
        let Some(mut process) = instance.process.take() else {
            if instance.state != ProcessState::Errored {
                instance.state = ProcessState::Stopped;
            }
            return;
        };

        instance.state = ProcessState::Stopping;
        let pid = process.pid();
        info!("Stopping {} (PID {pid})", instance.label());
        match process.terminate(instance.spec.kill_timeout()) {
            Ok(exit) => {
                info!("{} exited: {exit:?}", instance.label());
                instance.last_exit = Some(exit);
            }
            Err(e) => warn!("Error stopping {}: {e}", instance.label()),
        }
        instance.state = ProcessState::Stopped;
        instance.started_at = None;
        instance.last_memory = None;
    }

    fn ensure_watcher(&mut self, name: &str) {
        if self.watchers.contains_key(name) {
            return;
        }
        let Some(instance) = self.instances.iter().find(|inst| inst.spec.name == name) else {
            return;
        };
        if !instance.spec.watch {
            return;
        }

        let log_files: Vec<PathBuf> = self
            .instances
            .iter()
            .filter(|inst| inst.spec.name == name)
            .flat_map(|inst| [inst.plan.stdout_log.clone(), inst.plan.stderr_log.clone()])
            .collect();
        let filter = ChangeFilter::new(instance.spec.ignore_watch.clone(), log_files);
        let root = instance.plan.cwd.clone();

        match AppWatcher::start(&root, filter) {
            Ok(watcher) => {
                info!("Watching {} for changes to {name}", root.display());
                self.watchers.insert(name.to_string(), watcher);
            }
            Err(e) => warn!("Failed to watch {} for {name}: {e}", root.display()),
        }
    }

    /// Apply a freshly loaded descriptor.
    ///
    /// Removed apps are stopped, changed apps are restarted with the new
    /// spec, new apps are started and unchanged apps keep running.
    pub fn reload(&mut self, descriptor: &Descriptor, now: Instant) -> Result<()> {
        descriptor.check_profile(self.profile.as_deref())?;
        if descriptor.base_dir != self.base_dir {
            warn!(
                "Descriptor directory changed from {} to {}",
                self.base_dir.display(),
                descriptor.base_dir.display()
            );
        }

        let mut plans: Vec<(Arc<ManagedProcessSpec>, Vec<LaunchPlan>)> = Vec::new();
        for spec in &descriptor.apps {
            let plans_for_app = (0..spec.instance_count)
                .map(|index| {
                    LaunchPlan::build(
                        spec,
                        self.profile.as_deref(),
                        index,
                        &descriptor.base_dir,
                        &self.options.log_dir,
                    )
                })
                .collect::<Result<Vec<_>>>()?;
            plans.push((Arc::new(spec.clone()), plans_for_app));
        }
        self.base_dir = descriptor.base_dir.clone();

        for name in self.app_names() {
            let unchanged = plans
                .iter()
                .find(|(spec, _)| spec.name == name)
                .is_some_and(|(spec, new_plans)| {
                    let current: Vec<&ManagedInstance<L::Handle>> = self
                        .instances
                        .iter()
                        .filter(|inst| inst.spec.name == name)
                        .collect();
                    current.len() == new_plans.len()
                        && current
                            .iter()
                            .zip(new_plans)
                            .all(|(inst, plan)| *inst.spec == **spec && inst.plan == *plan)
                });
            if unchanged {
                continue;
            }
            info!("Stopping {name} for reload");
            self.stop(&name)?;
            self.instances.retain(|inst| inst.spec.name != name);
        }

        for (spec, plans_for_app) in plans {
            if self.instances.iter().any(|inst| inst.spec.name == spec.name) {
                continue;
            }
            for plan in plans_for_app {
                self.instances.push(ManagedInstance::new(spec.clone(), plan));
            }
            info!("Starting {} after reload", spec.name);
            self.start(&spec.name, now)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{parse, DescriptorFormat};
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashSet};
    use std::io;
    use std::rc::Rc;

    const GIB: u64 = 1024 * 1024 * 1024;

    #[derive(Default)]
    struct World {
        launches: Vec<LaunchPlan>,
        next_pid: u32,
        exits: HashMap<u32, ExitReport>,
        wait_errors: HashSet<u32>,
        terminated: Vec<u32>,
        spawn_failures: u32,
        memory: HashMap<u32, u64>,
    }

    #[derive(Clone, Default)]
    struct Shared(Rc<RefCell<World>>);

    impl Shared {
        fn launches(&self) -> usize {
            self.0.borrow().launches.len()
        }

        fn last_pid(&self) -> u32 {
            self.0.borrow().next_pid
        }

        fn exit(&self, pid: u32, code: i32) {
            self.0.borrow_mut().exits.insert(
                pid,
                ExitReport {
                    code: Some(code),
                    signal: None,
                },
            );
        }

        fn set_memory(&self, pid: u32, bytes: u64) {
            self.0.borrow_mut().memory.insert(pid, bytes);
        }
    }

    struct FakeLauncher(Shared);

    struct FakeProcess {
        pid: u32,
        world: Shared,
    }

    impl Launcher for FakeLauncher {
        type Handle = FakeProcess;

        fn launch(&mut self, plan: &LaunchPlan) -> Result<FakeProcess> {
            let mut world = self.0 .0.borrow_mut();
            if world.spawn_failures > 0 {
                world.spawn_failures -= 1;
                return Err(SupervisorError::Spawn {
                    name: plan.label(),
                    program: plan.program.clone(),
                    reason: "No such file or directory".into(),
                });
            }
            world.next_pid += 1;
            world.launches.push(plan.clone());
            Ok(FakeProcess {
                pid: world.next_pid,
                world: self.0.clone(),
            })
        }
    }

    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn try_wait(&mut self) -> io::Result<Option<ExitReport>> {
            let mut world = self.world.0.borrow_mut();
            if world.wait_errors.contains(&self.pid) {
                return Err(io::Error::other("No child processes"));
            }
            Ok(world.exits.remove(&self.pid))
        }

        fn terminate(&mut self, _grace: Duration) -> io::Result<ExitReport> {
            self.world.0.borrow_mut().terminated.push(self.pid);
            Ok(ExitReport {
                code: None,
                signal: Some(15),
            })
        }
    }

    struct FakeProbe(Shared);

    impl MemoryProbe for FakeProbe {
        fn resident_bytes(&self, pid: u32) -> Option<u64> {
            self.0 .0.borrow().memory.get(&pid).copied()
        }
    }

    struct Harness {
        world: Shared,
        supervisor: Supervisor<FakeLauncher, FakeProbe>,
        _logs: tempfile::TempDir,
        log_dir: PathBuf,
    }

    fn harness(json: &str, profile: Option<&str>) -> Harness {
        let logs = tempfile::tempdir().unwrap();
        let log_dir = logs.path().to_path_buf();
        let descriptor = Descriptor {
            base_dir: PathBuf::from("/srv/bot"),
            apps: parse(json, DescriptorFormat::Json).unwrap(),
        };
        let options = SupervisorOptions {
            log_dir: log_dir.clone(),
            max_restart_attempts: 3,
            restart_window: Duration::from_secs(60),
            memory_check_interval: Duration::ZERO,
            watch_debounce: Duration::from_millis(100),
        };
        let world = Shared::default();
        let supervisor = Supervisor::new(
            FakeLauncher(world.clone()),
            FakeProbe(world.clone()),
            options,
            &descriptor,
            profile,
        )
        .unwrap();
        Harness {
            world,
            supervisor,
            _logs: logs,
            log_dir,
        }
    }

    const BOT: &str = r#"{"apps": [{
        "name": "bot",
        "script": "./bot-bin",
        "interpreter": "none",
        "autorestart": true,
        "max_memory_restart": 1073741824,
        "env": {"NODE_ENV": "development"},
        "env_production": {"NODE_ENV": "production"}
    }]}"#;

    #[test]
    fn test_start_uses_selected_profile() {
        let mut h = harness(BOT, Some("production"));
        h.supervisor.start_all(Instant::now());

        assert_eq!(h.world.launches(), 1);
        assert_eq!(h.supervisor.running_count(), 1);
        let world = h.world.0.borrow();
        let plan = &world.launches[0];
        assert_eq!(plan.env["NODE_ENV"], "production");
        assert_eq!(plan.program, PathBuf::from("/srv/bot/bot-bin"));
        assert_eq!(plan.stdout_log, h.log_dir.join("bot-out.log"));
        assert_eq!(plan.stderr_log, h.log_dir.join("bot-error.log"));
    }

    #[test]
    fn test_unknown_profile_rejected_before_start() {
        let descriptor = Descriptor {
            base_dir: PathBuf::from("."),
            apps: parse(BOT, DescriptorFormat::Json).unwrap(),
        };
        let world = Shared::default();
        let result = Supervisor::new(
            FakeLauncher(world.clone()),
            FakeProbe(world),
            SupervisorOptions {
                log_dir: PathBuf::from("logs"),
                max_restart_attempts: 3,
                restart_window: Duration::from_secs(60),
                memory_check_interval: Duration::ZERO,
                watch_debounce: Duration::ZERO,
            },
            &descriptor,
            Some("staging"),
        );
        assert!(matches!(result, Err(SupervisorError::Configuration(_))));
    }

    #[test]
    fn test_single_exit_triggers_exactly_one_relaunch() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let pid = h.world.last_pid();

        h.world.exit(pid, 1);
        h.supervisor.tick(t0 + Duration::from_millis(10));
        h.supervisor.tick(t0 + Duration::from_millis(20));
        h.supervisor.tick(t0 + Duration::from_millis(30));

        assert_eq!(h.world.launches(), 2);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
        let status = h.supervisor.status(t0 + Duration::from_millis(30));
        assert_eq!(status[0].restarts, 1);
        assert_eq!(status[0].last_exit_code, Some(1));
        assert_eq!(status[0].pid, Some(pid + 1));

        let error_log = std::fs::read_to_string(h.log_dir.join("bot-error.log")).unwrap();
        assert!(error_log.contains("exited unexpectedly with exit code 1"));
    }

    #[test]
    fn test_restart_delay_is_honored() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "restart_delay": 2000}]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.world.exit(h.world.last_pid(), 0);
        h.supervisor.tick(t0 + Duration::from_secs(1));
        assert_eq!(
            h.supervisor.state_of("bot", 0),
            Some(ProcessState::RestartPending)
        );
        h.supervisor.tick(t0 + Duration::from_millis(2500));
        assert_eq!(h.world.launches(), 1);
        h.supervisor.tick(t0 + Duration::from_millis(3000));
        assert_eq!(h.world.launches(), 2);
    }

    #[test]
    fn test_no_relaunch_without_autorestart() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "autorestart": false}]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.world.exit(h.world.last_pid(), 2);
        h.supervisor.tick(t0);
        h.supervisor.tick(t0 + Duration::from_secs(5));

        assert_eq!(h.world.launches(), 1);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Errored));
    }

    #[test]
    fn test_crash_loop_limit() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "max_restarts": 2}]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        for step in 1..=3 {
            h.world.exit(h.world.last_pid(), 1);
            let now = t0 + Duration::from_secs(step);
            h.supervisor.tick(now);
            h.supervisor.tick(now);
        }

        assert_eq!(h.world.launches(), 3);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Errored));
        let error_log = std::fs::read_to_string(h.log_dir.join("bot-error.log")).unwrap();
        assert!(error_log.contains("exceeded max restart attempts (2)"));
    }

    #[test]
    fn test_crash_loop_window_resets() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "max_restarts": 1}]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.world.exit(h.world.last_pid(), 1);
        h.supervisor.tick(t0);
        h.supervisor.tick(t0);
        assert_eq!(h.world.launches(), 2);

        // Outside the 60s window the counter starts over
        let later = t0 + Duration::from_secs(120);
        h.world.exit(h.world.last_pid(), 1);
        h.supervisor.tick(later);
        h.supervisor.tick(later);
        assert_eq!(h.world.launches(), 3);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
    }

    #[test]
    fn test_memory_over_limit_forces_restart() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let pid = h.world.last_pid();

        h.world.set_memory(pid, GIB + GIB / 10);
        h.supervisor.tick(t0 + Duration::from_secs(1));

        assert_eq!(h.world.0.borrow().terminated, vec![pid]);
        assert_eq!(h.world.launches(), 2);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
        let error_log = std::fs::read_to_string(h.log_dir.join("bot-error.log")).unwrap();
        assert!(error_log.contains(&format!("limit is {GIB} bytes")));
    }

    #[test]
    fn test_memory_under_limit_keeps_running() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let pid = h.world.last_pid();

        h.world.set_memory(pid, GIB - GIB / 10);
        h.supervisor.tick(t0 + Duration::from_secs(1));

        assert!(h.world.0.borrow().terminated.is_empty());
        assert_eq!(h.world.launches(), 1);
        let status = h.supervisor.status(t0 + Duration::from_secs(1));
        assert_eq!(status[0].memory_bytes, Some(GIB - GIB / 10));
    }

    #[test]
    fn test_memory_restart_ignores_autorestart() {
        let json = r#"{"apps": [{
            "name": "bot", "script": "./bot",
            "autorestart": false, "max_memory_restart": "1G"
        }]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        h.world.set_memory(h.world.last_pid(), 2 * GIB);
        h.supervisor.tick(t0);
        assert_eq!(h.world.launches(), 2);
    }

    #[test]
    fn test_memory_checks_respect_interval() {
        let mut h = harness(BOT, None);
        h.supervisor.options.memory_check_interval = Duration::from_secs(30);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let pid = h.world.last_pid();

        h.supervisor.tick(t0);
        h.world.set_memory(pid, 2 * GIB);
        h.supervisor.tick(t0 + Duration::from_secs(10));
        assert_eq!(h.world.launches(), 1);
        h.supervisor.tick(t0 + Duration::from_secs(31));
        assert_eq!(h.world.launches(), 2);
    }

    #[test]
    fn test_spawn_failure_follows_restart_policy() {
        let mut h = harness(BOT, None);
        h.world.0.borrow_mut().spawn_failures = 1;
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        assert_eq!(
            h.supervisor.state_of("bot", 0),
            Some(ProcessState::RestartPending)
        );

        h.supervisor.tick(t0);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
        let error_log = std::fs::read_to_string(h.log_dir.join("bot-error.log")).unwrap();
        assert!(error_log.contains("failed to spawn bot#0"));
    }

    #[test]
    fn test_spawn_failure_without_autorestart_is_fatal() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "autorestart": false}]}"#;
        let mut h = harness(json, None);
        h.world.0.borrow_mut().spawn_failures = 1;
        h.supervisor.start_all(Instant::now());
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Errored));
        h.supervisor.tick(Instant::now());
        assert_eq!(h.world.launches(), 0);
    }

    #[test]
    fn test_instances_launch_with_index() {
        let json = r#"{"apps": [{
            "name": "bot", "script": "./bot",
            "exec_mode": "cluster", "instances": 3
        }]}"#;
        let mut h = harness(json, None);
        h.supervisor.start_all(Instant::now());

        assert_eq!(h.supervisor.running_count(), 3);
        let world = h.world.0.borrow();
        let indexes: Vec<&str> = world
            .launches
            .iter()
            .map(|plan| plan.env["NODE_APP_INSTANCE"].as_str())
            .collect();
        assert_eq!(indexes, vec!["0", "1", "2"]);
        assert_eq!(world.launches[2].stdout_log, h.log_dir.join("bot-out-2.log"));
    }

    #[test]
    fn test_stop_and_start_by_name() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.supervisor.stop("bot").unwrap();
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Stopped));
        h.supervisor.tick(t0);
        assert_eq!(h.world.launches(), 1);

        h.supervisor.start("bot", t0).unwrap();
        assert_eq!(h.world.launches(), 2);
        assert!(h.supervisor.stop("nope").unwrap_err().is_configuration());
    }

    #[test]
    fn test_restart_by_name() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let first = h.world.last_pid();

        h.supervisor.restart("bot", t0).unwrap();
        assert_eq!(h.world.0.borrow().terminated, vec![first]);
        assert_eq!(h.world.launches(), 2);
        assert_eq!(h.supervisor.status(t0)[0].restarts, 1);
    }

    #[test]
    fn test_stop_all() {
        let json = r#"{"apps": [
            {"name": "bot", "script": "./bot"},
            {"name": "worker", "script": "./worker", "instances": 2}
        ]}"#;
        let mut h = harness(json, None);
        h.supervisor.start_all(Instant::now());
        assert_eq!(h.supervisor.running_count(), 3);

        h.supervisor.stop_all();
        assert_eq!(h.supervisor.running_count(), 0);
        assert_eq!(h.world.0.borrow().terminated.len(), 3);
    }

    #[test]
    fn test_clean_exit_is_not_reported_as_crash() {
        let json = r#"{"apps": [{"name": "bot", "script": "./bot", "autorestart": false}]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.world.exit(h.world.last_pid(), 0);
        h.supervisor.tick(t0);

        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Stopped));
        let error_log = std::fs::read_to_string(h.log_dir.join("bot-error.log")).unwrap();
        assert!(error_log.contains("exited with code 0"));
        assert!(!error_log.contains("unexpectedly"));
    }

    #[test]
    fn test_wait_error_terminates_before_relaunch() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        let pid = h.world.last_pid();

        h.world.0.borrow_mut().wait_errors.insert(pid);
        h.supervisor.tick(t0);
        assert_eq!(h.world.0.borrow().terminated, vec![pid]);

        h.supervisor.tick(t0);
        assert_eq!(h.world.launches(), 2);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
    }

    #[test]
    fn test_memory_restart_does_not_extend_crash_window() {
        let json = r#"{"apps": [{
            "name": "bot", "script": "./bot",
            "max_restarts": 1, "max_memory_restart": "1G"
        }]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        h.world.exit(h.world.last_pid(), 1);
        h.supervisor.tick(t0);
        h.supervisor.tick(t0);
        assert_eq!(h.world.launches(), 2);

        let t1 = t0 + Duration::from_secs(61);
        h.world.set_memory(h.world.last_pid(), 2 * GIB);
        h.supervisor.tick(t1);
        assert_eq!(h.world.launches(), 3);

        // The crash window started at t0, so this crash opens a new one
        let t2 = t0 + Duration::from_secs(62);
        h.world.exit(h.world.last_pid(), 1);
        h.supervisor.tick(t2);
        h.supervisor.tick(t2);
        assert_eq!(h.world.launches(), 4);
        assert_eq!(h.supervisor.state_of("bot", 0), Some(ProcessState::Running));
    }

    #[test]
    fn test_reload_relaunches_when_directory_moves() {
        let mut h = harness(BOT, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);

        let moved = Descriptor {
            base_dir: PathBuf::from("/srv/bot-v2"),
            apps: parse(BOT, DescriptorFormat::Json).unwrap(),
        };
        h.supervisor.reload(&moved, t0).unwrap();

        assert_eq!(h.world.launches(), 2);
        assert_eq!(h.world.0.borrow().terminated.len(), 1);
        let world = h.world.0.borrow();
        assert_eq!(
            world.launches[1].program,
            PathBuf::from("/srv/bot-v2/bot-bin")
        );
    }

    #[test]
    fn test_reload_applies_changes() {
        let json = r#"{"apps": [
            {"name": "bot", "script": "./bot"},
            {"name": "worker", "script": "./worker"},
            {"name": "old", "script": "./old"}
        ]}"#;
        let mut h = harness(json, None);
        let t0 = Instant::now();
        h.supervisor.start_all(t0);
        assert_eq!(h.world.launches(), 3);

        let updated = r#"{"apps": [
            {"name": "bot", "script": "./bot"},
            {"name": "worker", "script": "./worker", "env": {"LEVEL": "2"}},
            {"name": "new", "script": "./new"}
        ]}"#;
        let descriptor = Descriptor {
            base_dir: PathBuf::from("/srv/bot"),
            apps: parse(updated, DescriptorFormat::Json).unwrap(),
        };
        h.supervisor.reload(&descriptor, t0).unwrap();

        let mut names = h.supervisor.app_names();
        names.sort();
        assert_eq!(names, vec!["bot", "new", "worker"]);
        assert_eq!(h.supervisor.running_count(), 3);
        // worker restarted, new started; bot untouched
        assert_eq!(h.world.launches(), 5);
        assert_eq!(h.world.0.borrow().terminated.len(), 2);

        let world = h.world.0.borrow();
        let worker = world.launches.iter().rev().find(|p| p.name == "worker").unwrap();
        assert_eq!(
            worker.env,
            BTreeMap::from([
                ("LEVEL".to_string(), "2".to_string()),
                ("NODE_APP_INSTANCE".to_string(), "0".to_string()),
            ])
        );
    }
}
