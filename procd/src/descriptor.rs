//! Process descriptor loading and validation
//!
//! A descriptor is an ecosystem-style file listing one or more apps:
//!
//! ```json
//! { "apps": [{ "name": "bot", "script": "./bot", "interpreter": "none" }] }
//! ```
//!
//! JSON and TOML (`[[apps]]` tables) are accepted. Every app becomes an
//! immutable [`ManagedProcessSpec`]; the selected environment profile is not
//! stored on the app and is chosen per launch.

use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SupervisorError};

/// Profile used when the invocation does not name one (the `env` key)
pub const DEFAULT_PROFILE: &str = "default";

/// Interpreter sentinel meaning "execute the binary directly"
pub const INTERPRETER_NONE: &str = "none";

const PROFILE_KEY_PREFIX: &str = "env_";
const DEFAULT_LOG_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DEFAULT_KILL_TIMEOUT_MS: u64 = 1600;
const DEFAULT_INSTANCE_VAR: &str = "NODE_APP_INSTANCE";

/// How the supervisor runs the configured instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Single plain child process per instance
    Fork,
    /// Several copies of the same program, each with its own instance index
    Cluster,
}

/// Wrapper program used to start the executable
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpreter {
    /// The `"none"` sentinel: run the executable itself
    None,
    /// Run this program with the executable path as its first argument
    Program(String),
}

/// Everything the supervisor needs to launch and keep alive one app
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcessSpec {
    pub name: String,
    pub executable_path: PathBuf,
    pub args: Vec<String>,
    pub interpreter: Option<Interpreter>,
    pub interpreter_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub instance_count: u32,
    pub exec_mode: ExecMode,
    pub auto_restart: bool,
    pub watch: bool,
    pub ignore_watch: Vec<String>,
    /// Resident memory ceiling in bytes
    pub max_memory_restart: Option<u64>,
    pub max_restarts: Option<u32>,
    pub restart_delay_ms: u64,
    pub kill_timeout_ms: u64,
    pub environment_profiles: BTreeMap<String, BTreeMap<String, String>>,
    pub stdout_log_path: Option<PathBuf>,
    pub stderr_log_path: Option<PathBuf>,
    pub timestamp_logs: bool,
    pub log_date_format: String,
    pub merge_logs: bool,
    pub instance_var: String,
}

impl ManagedProcessSpec {
    /// Minimal spec with the same defaults the loader applies
    pub fn new(name: impl Into<String>, executable_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            executable_path: executable_path.into(),
            args: Vec::new(),
            interpreter: None,
            interpreter_args: Vec::new(),
            cwd: None,
            instance_count: 1,
            exec_mode: ExecMode::Fork,
            auto_restart: true,
            watch: false,
            ignore_watch: Vec::new(),
            max_memory_restart: None,
            max_restarts: None,
            restart_delay_ms: 0,
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            environment_profiles: BTreeMap::new(),
            stdout_log_path: None,
            stderr_log_path: None,
            timestamp_logs: false,
            log_date_format: DEFAULT_LOG_DATE_FORMAT.to_string(),
            merge_logs: false,
            instance_var: DEFAULT_INSTANCE_VAR.to_string(),
        }
    }

    /// Environment variables of the selected profile.
    ///
    /// `None` selects the default profile, which may be absent (empty map).
    /// A named profile that the app does not declare is a configuration error.
    pub fn environment(&self, profile: Option<&str>) -> Result<BTreeMap<String, String>> {
        match profile {
            None | Some(DEFAULT_PROFILE) => Ok(self
                .environment_profiles
                .get(DEFAULT_PROFILE)
                .cloned()
                .unwrap_or_default()),
            Some(name) => self.environment_profiles.get(name).cloned().ok_or_else(|| {
                SupervisorError::config(format!(
                    "app '{}' has no environment profile '{name}' (expected key env_{name})",
                    self.name
                ))
            }),
        }
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// True when the interpreter marker asks for a wrapper program
    pub fn wrapper_program(&self) -> Option<&str> {
        match &self.interpreter {
            Some(Interpreter::Program(program)) => Some(program),
            Some(Interpreter::None) | None => None,
        }
    }
}

/// On-disk encoding of a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorFormat {
    Json,
    Toml,
}

impl DescriptorFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("json") | None => Ok(Self::Json),
            Some("toml") => Ok(Self::Toml),
            Some("js") | Some("cjs") | Some("mjs") => Err(SupervisorError::config(format!(
                "{} is a JavaScript descriptor; export it as JSON (ecosystem.config.json) or TOML",
                path.display()
            ))),
            Some(other) => Err(SupervisorError::config(format!(
                "unsupported descriptor extension '.{other}' for {}",
                path.display()
            ))),
        }
    }
}

/// A loaded descriptor file
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    /// Directory relative paths in the apps resolve against
    pub base_dir: PathBuf,
    pub apps: Vec<ManagedProcessSpec>,
}

impl Descriptor {
    pub fn app(&self, name: &str) -> Option<&ManagedProcessSpec> {
        self.apps.iter().find(|app| app.name == name)
    }

    /// Fail early when any app lacks the requested profile
    pub fn check_profile(&self, profile: Option<&str>) -> Result<()> {
        for app in &self.apps {
            app.environment(profile)?;
        }
        Ok(())
    }
}

/// Load and validate a descriptor file
pub fn load(path: &Path) -> Result<Descriptor> {
    let format = DescriptorFormat::from_path(path)?;
    let content = fs::read_to_string(path).map_err(|e| {
        SupervisorError::config(format!("failed to read descriptor {}: {e}", path.display()))
    })?;

    // Children run with their own cwd, so every path they see must be absolute
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let base_dir = std::path::absolute(parent).map_err(|e| {
        SupervisorError::config(format!(
            "cannot resolve descriptor directory {}: {e}",
            parent.display()
        ))
    })?;

    let apps = parse(&content, format)?;
    debug!("Loaded {} app(s) from {}", apps.len(), path.display());
    Ok(Descriptor { base_dir, apps })
}

/// Parse descriptor text into validated specs
pub fn parse(content: &str, format: DescriptorFormat) -> Result<Vec<ManagedProcessSpec>> {
    let root: Value = match format {
        DescriptorFormat::Json => serde_json::from_str(content)
            .map_err(|e| SupervisorError::config(format!("invalid JSON descriptor: {e}")))?,
        DescriptorFormat::Toml => toml::from_str(content)
            .map_err(|e| SupervisorError::config(format!("invalid TOML descriptor: {e}")))?,
    };

    let entries = match root {
        Value::Object(mut map) => match map.remove("apps") {
            Some(Value::Array(apps)) => apps,
            Some(_) => return Err(SupervisorError::config("'apps' must be a list")),
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(SupervisorError::config(
                "descriptor must be an object with an 'apps' list",
            ))
        }
    };

    if entries.is_empty() {
        return Err(SupervisorError::config("descriptor declares no apps"));
    }

    let mut specs = Vec::with_capacity(entries.len());
    let mut seen = HashSet::new();
    for (idx, entry) in entries.into_iter().enumerate() {
        let raw: RawApp = serde_json::from_value(entry)
            .map_err(|e| SupervisorError::config(format!("app #{idx}: {e}")))?;
        let spec = raw
            .into_spec()
            .map_err(|e| SupervisorError::config(format!("app #{idx}: {}", config_message(e))))?;
        if !seen.insert(spec.name.clone()) {
            return Err(SupervisorError::config(format!(
                "app name '{}' is declared more than once",
                spec.name
            )));
        }
        specs.push(spec);
    }

    Ok(specs)
}

fn config_message(err: SupervisorError) -> String {
    match err {
        SupervisorError::Configuration(message) => message,
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawArgs {
    Single(String),
    Many(Vec<String>),
}

impl RawArgs {
    fn into_vec(self) -> Vec<String> {
        match self {
            RawArgs::Single(line) => line.split_whitespace().map(str::to_string).collect(),
            RawArgs::Many(values) => values,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawApp {
    name: Option<String>,
    #[serde(alias = "executablePath", alias = "executable_path")]
    script: Option<String>,
    args: Option<RawArgs>,
    interpreter: Option<String>,
    interpreter_args: Option<RawArgs>,
    cwd: Option<PathBuf>,
    instances: Option<i64>,
    exec_mode: Option<String>,
    autorestart: Option<bool>,
    watch: Option<bool>,
    ignore_watch: Option<Vec<String>>,
    max_memory_restart: Option<Value>,
    max_restarts: Option<u32>,
    restart_delay: Option<u64>,
    kill_timeout: Option<u64>,
    env: Option<Map<String, Value>>,
    #[serde(alias = "output")]
    out_file: Option<PathBuf>,
    #[serde(alias = "error")]
    error_file: Option<PathBuf>,
    time: Option<bool>,
    log_date_format: Option<String>,
    merge_logs: Option<bool>,
    instance_var: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, Value>,
}

impl RawApp {
    fn into_spec(self) -> Result<ManagedProcessSpec> {
        let name = required_str(self.name, "name")?;
        if name.contains('/') || name.contains('\\') {
            return Err(SupervisorError::config(format!(
                "name '{name}' must not contain path separators"
            )));
        }
        let script = required_str(self.script, "script")?;

        let mut spec = ManagedProcessSpec::new(name, script);
        spec.args = self.args.map(RawArgs::into_vec).unwrap_or_default();
        spec.interpreter = self.interpreter.map(parse_interpreter).transpose()?;
        spec.interpreter_args = self.interpreter_args.map(RawArgs::into_vec).unwrap_or_default();
        spec.cwd = self.cwd;

        if let Some(instances) = self.instances {
            spec.instance_count = u32::try_from(instances)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    SupervisorError::config(format!(
                        "instances must be at least 1, got {instances}"
                    ))
                })?;
        }
        if let Some(mode) = self.exec_mode {
            spec.exec_mode = parse_exec_mode(&mode)?;
        }

        spec.auto_restart = self.autorestart.unwrap_or(true);
        spec.watch = self.watch.unwrap_or(false);
        spec.ignore_watch = self.ignore_watch.unwrap_or_default();
        spec.max_memory_restart = self
            .max_memory_restart
            .as_ref()
            .map(parse_memory_size)
            .transpose()?;
        spec.max_restarts = self.max_restarts;
        spec.restart_delay_ms = self.restart_delay.unwrap_or(0);
        spec.kill_timeout_ms = self.kill_timeout.unwrap_or(DEFAULT_KILL_TIMEOUT_MS);

        if let Some(env) = self.env {
            spec.environment_profiles
                .insert(DEFAULT_PROFILE.to_string(), env_profile(&env, "env")?);
        }
        for (key, value) in self.extra {
            let Some(profile) = key.strip_prefix(PROFILE_KEY_PREFIX) else {
                debug!("Ignoring unknown key '{key}' for app '{}'", spec.name);
                continue;
            };
            if profile.is_empty() {
                return Err(SupervisorError::config("'env_' is missing a profile name"));
            }
            let Value::Object(map) = value else {
                return Err(SupervisorError::config(format!("{key} must be an object")));
            };
            spec.environment_profiles
                .insert(profile.to_string(), env_profile(&map, &key)?);
        }

        spec.stdout_log_path = self.out_file;
        spec.stderr_log_path = self.error_file;
        spec.timestamp_logs = self.time.unwrap_or(false);
        if let Some(format) = self.log_date_format {
            validate_date_format(&format)?;
            spec.log_date_format = format;
        }
        spec.merge_logs = self.merge_logs.unwrap_or(false);
        if let Some(var) = self.instance_var {
            if var.trim().is_empty() {
                return Err(SupervisorError::config("instance_var cannot be empty"));
            }
            spec.instance_var = var;
        }

        Ok(spec)
    }
}

fn required_str(value: Option<String>, field: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(SupervisorError::config(format!("'{field}' cannot be empty"))),
        None => Err(SupervisorError::config(format!(
            "missing required field '{field}'"
        ))),
    }
}

fn parse_interpreter(value: String) -> Result<Interpreter> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SupervisorError::config(
            "interpreter cannot be empty (use \"none\" for direct execution)",
        ));
    }
    if trimmed.eq_ignore_ascii_case(INTERPRETER_NONE) {
        Ok(Interpreter::None)
    } else {
        Ok(Interpreter::Program(trimmed.to_string()))
    }
}

fn parse_exec_mode(value: &str) -> Result<ExecMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "fork" | "fork_mode" => Ok(ExecMode::Fork),
        "cluster" | "cluster_mode" => Ok(ExecMode::Cluster),
        other => Err(SupervisorError::config(format!(
            "unknown exec_mode '{other}' (expected fork or cluster)"
        ))),
    }
}

fn env_profile(map: &Map<String, Value>, key: &str) -> Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for (var, value) in map {
        let value = match value {
            Value::String(v) => v.clone(),
            Value::Number(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            _ => {
                return Err(SupervisorError::config(format!(
                    "{key}.{var} must be a string, number or boolean"
                )))
            }
        };
        vars.insert(var.clone(), value);
    }
    Ok(vars)
}

fn validate_date_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(SupervisorError::config(format!(
            "invalid log_date_format '{format}'"
        )));
    }
    Ok(())
}

/// Parse `max_memory_restart` into bytes.
///
/// Integers are bytes. Strings take an optional `K`, `M` or `G` suffix
/// (binary multiples), e.g. `"1G"`, `"512M"`, `"1.5G"`.
pub fn parse_memory_size(value: &Value) -> Result<u64> {
    let bytes = match value {
        Value::Number(number) => number.as_u64().ok_or_else(|| {
            SupervisorError::config("max_memory_restart must be a positive integer of bytes")
        })?,
        Value::String(text) => parse_memory_size_str(text)?,
        _ => {
            return Err(SupervisorError::config(
                "max_memory_restart must be a string like '1G' or a number of bytes",
            ))
        }
    };
    if bytes == 0 {
        return Err(SupervisorError::config(
            "max_memory_restart must be greater than zero",
        ));
    }
    Ok(bytes)
}

fn parse_memory_size_str(input: &str) -> Result<u64> {
    let normalized = input.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return Err(SupervisorError::config("max_memory_restart cannot be empty"));
    }

    let split_idx = normalized
        .find(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .unwrap_or(normalized.len());
    let (number_part, unit_part) = normalized.split_at(split_idx);
    let number: f64 = number_part.parse().map_err(|_| {
        SupervisorError::config(format!("invalid max_memory_restart value '{input}'"))
    })?;

    let multiplier: u64 = match unit_part.trim() {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(SupervisorError::config(format!(
                "unsupported max_memory_restart unit '{other}'"
            )))
        }
    };

    let bytes = (number * multiplier as f64).ceil();
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(SupervisorError::config(format!(
            "max_memory_restart value '{input}' is too large"
        )));
    }
    Ok(bytes as u64)
}
