// Config module - Declarative process descriptors and supervisor settings

mod settings;
mod size;

pub use settings::{SupervisorSettings, DEFAULT_LOG_DIR, DEFAULT_SOCKET_PATH};
pub use size::parse_memory_size;

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Signals accepted for `kill_signal`
pub const VALID_SIGNALS: [&str; 7] = [
    "SIGTERM", "SIGINT", "SIGQUIT", "SIGKILL", "SIGHUP", "SIGUSR1", "SIGUSR2",
];

const MAX_INSTANCES: usize = 100;

/// Log destinations for one process instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub out: PathBuf,
    pub err: PathBuf,
    pub combined: Option<PathBuf>,
}

impl LogPaths {
    /// Paths for instance `index`; multi-instance apps get a `-<index>` suffix
    pub fn for_instance(&self, index: usize, instances: usize) -> LogPaths {
        if instances <= 1 {
            return self.clone();
        }
        LogPaths {
            out: with_instance_suffix(&self.out, index),
            err: with_instance_suffix(&self.err, index),
            combined: self
                .combined
                .as_ref()
                .map(|p| with_instance_suffix(p, index)),
        }
    }
}

fn with_instance_suffix(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, index, ext.to_string_lossy()),
        None => format!("{}-{}", stem, index),
    };
    path.with_file_name(file_name)
}

/// Immutable description of one supervised application
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    /// Application name (unique identifier)
    pub name: String,
    /// Program to execute (interpreter when one is declared)
    pub command: PathBuf,
    /// Arguments passed to `command`
    pub args: Vec<String>,
    /// Working directory for the process
    pub cwd: Option<PathBuf>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
    /// Restart automatically after an unexpected exit
    pub autorestart: bool,
    /// Resident memory limit in bytes
    pub memory_limit: Option<u64>,
    /// Log destinations (before per-instance suffixing)
    pub logs: LogPaths,
    /// Number of instances to run
    pub instances: usize,
    /// Prefix each log line with a timestamp
    pub time: bool,
    /// Signal sent on graceful stop
    pub kill_signal: String,
    /// Grace period before SIGKILL
    pub kill_timeout: Duration,
    /// Failures tolerated within `restart_window` before giving up
    pub max_restarts: usize,
    pub restart_window: Duration,
    /// Fixed delay before an automatic restart
    pub restart_delay: Duration,
    /// Base delay for exponential backoff, overrides `restart_delay` when set
    pub exp_backoff_restart_delay: Option<Duration>,
}

impl ProcessSpec {
    /// Name of instance `index`
    pub fn instance_name(&self, index: usize) -> String {
        if self.instances > 1 {
            format!("{}-{}", self.name, index)
        } else {
            self.name.clone()
        }
    }

    /// Log destinations of instance `index`
    pub fn instance_logs(&self, index: usize) -> LogPaths {
        self.logs.for_instance(index, self.instances)
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ArgsValue {
    Line(String),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MemoryValue {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl EnvValue {
    fn into_string(self) -> String {
        match self {
            EnvValue::Text(s) => s,
            EnvValue::Integer(i) => i.to_string(),
            EnvValue::Float(f) => f.to_string(),
            EnvValue::Bool(b) => b.to_string(),
        }
    }
}

/// One app entry exactly as written in the file
#[derive(Debug, Deserialize)]
struct AppDeclaration {
    name: Option<String>,
    script: Option<String>,
    args: Option<ArgsValue>,
    interpreter: Option<String>,
    cwd: Option<String>,
    #[serde(default = "default_instances")]
    instances: usize,
    #[serde(default = "default_autorestart")]
    autorestart: bool,
    /// Accepted for compatibility, file watching is not supported
    #[serde(default)]
    #[allow(dead_code)]
    watch: Option<serde_json::Value>,
    max_memory_restart: Option<MemoryValue>,
    #[serde(default)]
    env: BTreeMap<String, EnvValue>,
    error_file: Option<String>,
    out_file: Option<String>,
    log_file: Option<String>,
    #[serde(default)]
    time: bool,
    #[serde(default = "default_kill_signal", alias = "stop_signal")]
    kill_signal: String,
    #[serde(default = "default_kill_timeout")]
    kill_timeout: u64,
    #[serde(default = "default_max_restarts")]
    max_restarts: usize,
    #[serde(default = "default_restart_window")]
    restart_window: u64,
    #[serde(default)]
    restart_delay: u64,
    exp_backoff_restart_delay: Option<u64>,
}

// Default value functions for serde
fn default_instances() -> usize {
    1
}

fn default_autorestart() -> bool {
    true
}

fn default_kill_signal() -> String {
    "SIGTERM".to_string()
}

fn default_kill_timeout() -> u64 {
    5000
}

fn default_max_restarts() -> usize {
    10
}

fn default_restart_window() -> u64 {
    60
}

/// Reads app declarations from TOML or JSON files
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    log_dir: PathBuf,
}

impl ConfigLoader {
    /// `log_dir` hosts the default log files of apps that declare none
    pub fn new<P: AsRef<Path>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.as_ref().to_path_buf(),
        }
    }

    /// Load every app in `path`, failing on the first invalid one
    pub fn load(&self, path: &Path) -> Result<Vec<ProcessSpec>, ConfigError> {
        let (specs, mut failures) = self.load_each(path)?;
        if !failures.is_empty() {
            return Err(failures.remove(0).1);
        }
        Ok(specs)
    }

    /// Load every app in `path`, validating each one separately
    ///
    /// Syntax errors still fail the whole file. Per-app failures come back
    /// labelled with the app name (or its position when unnamed).
    pub fn load_each(
        &self,
        path: &Path,
    ) -> Result<(Vec<ProcessSpec>, Vec<(String, ConfigError)>), ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::MalformedSyntax(format!("failed to read {}: {}", path.display(), e))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let root = parse_document(&contents, extension)?;
        let entries = split_apps(root)?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let base_dir = if base_dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base_dir
        };

        let mut specs = Vec::new();
        let mut failures = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for (position, entry) in entries.into_iter().enumerate() {
            let label = entry
                .get("name")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("app #{}", position + 1));

            let result = serde_json::from_value::<AppDeclaration>(entry)
                .map_err(|e| ConfigError::invalid(&label, e.to_string()))
                .and_then(|decl| self.resolve(decl, &base_dir));

            match result {
                Ok(spec) if !seen.insert(spec.name.clone()) => failures.push((
                    label,
                    ConfigError::invalid("name", format!("duplicate app name '{}'", spec.name)),
                )),
                Ok(spec) => specs.push(spec),
                Err(e) => failures.push((label, e)),
            }
        }

        Ok((specs, failures))
    }

    /// Turn a declaration into a validated spec
    fn resolve(&self, decl: AppDeclaration, base_dir: &Path) -> Result<ProcessSpec, ConfigError> {
        let name = decl
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField("name".to_string()))?;
        if name.contains('/') || name.chars().any(char::is_whitespace) {
            return Err(ConfigError::invalid(
                "name",
                "must not contain '/' or whitespace",
            ));
        }

        let script = decl
            .script
            .map(|s| expand_env(&s))
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingField("script".to_string()))?;

        let cwd = decl
            .cwd
            .map(|c| absolutize(base_dir, Path::new(&expand_env(&c))));
        if let Some(ref dir) = cwd {
            if !dir.is_dir() {
                return Err(ConfigError::invalid(
                    "cwd",
                    format!("working directory does not exist: {}", dir.display()),
                ));
            }
        }
        let run_dir = cwd.clone().unwrap_or_else(|| base_dir.to_path_buf());

        let mut args = match decl.args {
            None => Vec::new(),
            Some(ArgsValue::List(list)) => list,
            Some(ArgsValue::Line(line)) => shell_words::split(&line)
                .map_err(|e| ConfigError::invalid("args", e.to_string()))?,
        };
        args = args.iter().map(|a| expand_env(a)).collect();

        let interpreter = decl
            .interpreter
            .map(|i| expand_env(&i))
            .filter(|i| !i.is_empty() && i != "none");

        let command = match interpreter {
            Some(interp) => {
                args.insert(0, script);
                resolve_program(&run_dir, &interp)
            }
            None => resolve_program(&run_dir, &script),
        };

        if decl.instances == 0 {
            return Err(ConfigError::invalid("instances", "must be at least 1"));
        }
        if decl.instances > MAX_INSTANCES {
            return Err(ConfigError::invalid(
                "instances",
                format!("cannot exceed {}", MAX_INSTANCES),
            ));
        }

        let memory_limit = match decl.max_memory_restart {
            None => None,
            Some(MemoryValue::Bytes(0)) => {
                return Err(ConfigError::invalid(
                    "max_memory_restart",
                    "must be a positive byte count",
                ))
            }
            Some(MemoryValue::Bytes(n)) => Some(n),
            Some(MemoryValue::Text(text)) => Some(parse_memory_size(&text)?),
        };

        if decl.max_restarts == 0 {
            return Err(ConfigError::invalid("max_restarts", "must be at least 1"));
        }
        if decl.restart_window == 0 {
            return Err(ConfigError::invalid("restart_window", "must be at least 1"));
        }

        if !VALID_SIGNALS.contains(&decl.kill_signal.as_str()) {
            return Err(ConfigError::invalid(
                "kill_signal",
                format!(
                    "unknown signal {}, expected one of: {}",
                    decl.kill_signal,
                    VALID_SIGNALS.join(", ")
                ),
            ));
        }

        let log_path = |value: Option<String>, default_suffix: &str| -> PathBuf {
            match value {
                Some(p) => absolutize(&run_dir, Path::new(&expand_env(&p))),
                None => self.log_dir.join(format!("{}-{}.log", name, default_suffix)),
            }
        };
        let logs = LogPaths {
            out: log_path(decl.out_file, "out"),
            err: log_path(decl.error_file, "error"),
            combined: decl
                .log_file
                .map(|p| absolutize(&run_dir, Path::new(&expand_env(&p)))),
        };

        let env = decl
            .env
            .into_iter()
            .map(|(k, v)| (k, expand_env(&v.into_string())))
            .collect();

        Ok(ProcessSpec {
            name,
            command,
            args,
            cwd,
            env,
            autorestart: decl.autorestart,
            memory_limit,
            logs,
            instances: decl.instances,
            time: decl.time,
            kill_signal: decl.kill_signal,
            kill_timeout: Duration::from_millis(decl.kill_timeout),
            max_restarts: decl.max_restarts,
            restart_window: Duration::from_secs(decl.restart_window),
            restart_delay: Duration::from_millis(decl.restart_delay),
            exp_backoff_restart_delay: decl.exp_backoff_restart_delay.map(Duration::from_millis),
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new(SupervisorSettings::default().log_dir)
    }
}

/// Load every app in `path` with default log locations
pub fn load(path: &Path) -> Result<Vec<ProcessSpec>, ConfigError> {
    ConfigLoader::default().load(path)
}

fn parse_document(contents: &str, extension: &str) -> Result<serde_json::Value, ConfigError> {
    match extension {
        "toml" => {
            let table: toml::Table = toml::from_str(contents)
                .map_err(|e| ConfigError::MalformedSyntax(format!("invalid TOML: {}", e)))?;
            serde_json::to_value(table)
                .map_err(|e| ConfigError::MalformedSyntax(format!("invalid TOML: {}", e)))
        }
        "json" => serde_json::from_str(contents)
            .map_err(|e| ConfigError::MalformedSyntax(format!("invalid JSON: {}", e))),
        other => Err(ConfigError::MalformedSyntax(format!(
            "unsupported file format '{}', use .toml or .json",
            other
        ))),
    }
}

/// Accepts `{apps: [...]}`, `{processes: [...]}`, a bare list, or a single app
fn split_apps(root: serde_json::Value) -> Result<Vec<serde_json::Value>, ConfigError> {
    use serde_json::Value;

    let entries = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("apps").or_else(|| map.remove("processes")) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ConfigError::MalformedSyntax(
                    "'apps' must be a list of app declarations".to_string(),
                ))
            }
            None => vec![Value::Object(map)],
        },
        _ => {
            return Err(ConfigError::MalformedSyntax(
                "expected an app declaration or a list of them".to_string(),
            ))
        }
    };

    if entries.is_empty() {
        return Err(ConfigError::MissingField("apps".to_string()));
    }
    if let Some(bad) = entries.iter().position(|e| !e.is_object()) {
        return Err(ConfigError::MalformedSyntax(format!(
            "app #{} is not a table",
            bad + 1
        )));
    }
    Ok(entries)
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Bare program names stay for PATH lookup, relative paths anchor at `run_dir`
fn resolve_program(run_dir: &Path, program: &str) -> PathBuf {
    if program.contains('/') {
        absolutize(run_dir, Path::new(program))
    } else {
        PathBuf::from(program)
    }
}

/// Expand `$VAR` and `${VAR}` from the supervisor's environment, leaving unknown ones as written
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (var, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(var) {
            Ok(value) if !var.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    out
}
