//! procd: process supervisor
//!
//! Responsibilities:
//! - Load and validate a process descriptor (JSON or TOML)
//! - Start every app with the selected environment profile
//! - Supervise: restart on exit, on memory overuse and on file changes
//! - Reload the descriptor on SIGHUP, stop everything on SIGTERM/SIGINT
//! - Publish a status snapshot for `procd status`

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use procd::config::{self, ProcdConfig, DEFAULT_CONFIG_PATH};
use procd::descriptor::{self, Descriptor};
use procd::status::SupervisorStatus;
use procd::{OsLauncher, OsMemoryProbe, Supervisor, SupervisorOptions};

#[derive(Parser, Debug)]
#[command(name = "procd", version, about = "Supervise long-running processes")]
struct Cli {
    /// Supervisor settings file
    #[arg(long, global = true, env = "PROCD_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start and supervise the apps of a descriptor
    Start {
        descriptor: PathBuf,
        /// Environment profile, e.g. `production` for `env_production`
        #[arg(long)]
        env: Option<String>,
        /// Only run these apps (comma separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Check a descriptor without starting anything
    Validate {
        descriptor: PathBuf,
        #[arg(long)]
        env: Option<String>,
    },
    /// Show the status of a running supervisor
    Status {
        #[arg(long)]
        json: bool,
    },
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("procd: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = config::load_config_from(&cli.config)?;
    init_logging(&config.supervisor.log_level, &config.supervisor.log_format);

    match cli.command {
        Command::Start {
            descriptor,
            env,
            only,
        } => start(&config, &descriptor, env.as_deref(), &only),
        Command::Validate { descriptor, env } => validate(&descriptor, env.as_deref()),
        Command::Status { json } => show_status(&config, json),
    }
}

fn init_logging(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_timer(tracing_subscriber::fmt::time::uptime())
                    .compact(),
            )
            .init();
    }
}

fn load_descriptor(path: &Path, profile: Option<&str>, only: &[String]) -> Result<Descriptor> {
    let mut descriptor = descriptor::load(path)?;
    if !only.is_empty() {
        for name in only {
            if descriptor.app(name).is_none() {
                bail!("no app named '{name}' in {}", path.display());
            }
        }
        descriptor.apps.retain(|app| only.contains(&app.name));
    }
    descriptor.check_profile(profile)?;
    Ok(descriptor)
}

fn validate(path: &Path, profile: Option<&str>) -> Result<()> {
    let descriptor = load_descriptor(path, profile, &[])?;
    for app in &descriptor.apps {
        println!(
            "{}: {} ({} instance(s), {:?}, autorestart={})",
            app.name,
            app.executable_path.display(),
            app.instance_count,
            app.exec_mode,
            app.auto_restart
        );
    }
    println!("{} is valid", path.display());
    Ok(())
}

fn show_status(config: &ProcdConfig, json: bool) -> Result<()> {
    let path = &config.supervisor.status_file;
    let status = SupervisorStatus::read(path)
        .with_context(|| format!("No running supervisor found (status file {})", path.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", status.render());
    }
    Ok(())
}

fn start(
    config: &ProcdConfig,
    descriptor_path: &Path,
    profile: Option<&str>,
    only: &[String],
) -> Result<()> {
    info!("procd v{} starting", env!("CARGO_PKG_VERSION"));

    let descriptor = load_descriptor(descriptor_path, profile, only)?;
    info!(
        "Loaded {} app(s) from {} (profile {})",
        descriptor.apps.len(),
        descriptor_path.display(),
        profile.unwrap_or(descriptor::DEFAULT_PROFILE)
    );

    setup_signal_handlers();

    let mut supervisor = Supervisor::new(
        OsLauncher,
        OsMemoryProbe,
        SupervisorOptions::from(config),
        &descriptor,
        profile,
    )?;
    supervisor.start_all(Instant::now());
    info!("{} process(es) running", supervisor.running_count());

    let status_path = &config.supervisor.status_file;
    let mut status = SupervisorStatus::new(descriptor_path, profile);

    while !SHUTDOWN.load(Ordering::SeqCst) {
        if RELOAD.swap(false, Ordering::SeqCst) {
            info!("SIGHUP received, reloading {}", descriptor_path.display());
            match load_descriptor(descriptor_path, profile, only)
                .and_then(|descriptor| {
                    supervisor
                        .reload(&descriptor, Instant::now())
                        .map_err(Into::into)
                })
            {
                Ok(()) => info!("Reload complete"),
                Err(e) => error!("Reload failed, keeping current apps: {e:#}"),
            }
        }

        let now = Instant::now();
        supervisor.tick(now);

        status.processes = supervisor.status(now);
        if let Err(e) = status.write(status_path) {
            warn!("Failed to write status file {}: {e}", status_path.display());
        }

        std::thread::sleep(config.poll_interval());
    }

    info!("Shutdown requested");
    supervisor.stop_all();
    if let Err(e) = SupervisorStatus::remove(status_path) {
        warn!("Failed to remove status file: {e}");
    }
    info!("procd stopped");
    Ok(())
}

#[cfg(unix)]
fn setup_signal_handlers() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: the handlers only store to atomics
    unsafe {
        for sig in [Signal::SIGTERM, Signal::SIGINT] {
            if let Err(e) = signal(sig, SigHandler::Handler(handle_shutdown)) {
                warn!("Failed to install {sig:?} handler: {e}");
            }
        }
        if let Err(e) = signal(Signal::SIGHUP, SigHandler::Handler(handle_reload)) {
            warn!("Failed to install SIGHUP handler: {e}");
        }
    }
}

#[cfg(not(unix))]
fn setup_signal_handlers() {}

#[cfg(unix)]
extern "C" fn handle_shutdown(_sig: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn handle_reload(_sig: nix::libc::c_int) {
    RELOAD.store(true, Ordering::SeqCst);
}
