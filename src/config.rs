//! Job configuration: remote layout, per-client options and teardown policy.
//!
//! Per-client options arrive as loosely typed YAML/JSON. They are parsed into
//! [`RawClientConfig`] and validated exactly once into [`ClientConfig`]; the
//! launcher and teardown coordinator only ever see the validated form.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use crate::types::HostName;

/// Key of the task section in a job file and in `overrides`.
pub const TASK_NAME: &str = "fuse";

/// How daemon-helper should stop the daemon when asked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonSignal {
    /// SIGKILL; fine for a plain daemon.
    Kill,
    /// SIGTERM; coverage and valgrind wrappers need a chance to flush.
    Term,
}

impl DaemonSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonSignal::Kill => "kill",
            DaemonSignal::Term => "term",
        }
    }
}

/// Valgrind arguments: a single argument or a list of them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ValgrindArgs {
    One(String),
    Many(Vec<String>),
}

impl ValgrindArgs {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            ValgrindArgs::One(arg) => vec![arg],
            ValgrindArgs::Many(args) => args,
        }
    }
}

/// Per-client options exactly as written in the job file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawClientConfig {
    #[serde(default)]
    pub valgrind: Option<ValgrindArgs>,
    #[serde(default)]
    pub coverage: bool,
    /// Seconds to wait for the daemon to exit after unmount.
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub cleanup_on_failure: bool,
}

impl RawClientConfig {
    /// Parse a per-client entry; `null` means "all defaults".
    pub fn from_value(value: &Value) -> anyhow::Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn validate(self) -> Result<ClientConfig, String> {
        let exit_timeout = match self.timeout {
            None => None,
            Some(secs) if secs > 0.0 => Some(
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| format!("timeout {} is out of range: {}", secs, e))?,
            ),
            Some(secs) => {
                return Err(format!(
                    "timeout must be a positive number of seconds, got {}",
                    secs
                ));
            }
        };

        let instrumentation_args = self.valgrind.map(ValgrindArgs::into_vec).unwrap_or_default();
        if instrumentation_args.iter().any(|a| a.trim().is_empty()) {
            return Err("valgrind arguments must not be empty strings".to_string());
        }

        let daemon_signal = if self.coverage || !instrumentation_args.is_empty() {
            DaemonSignal::Term
        } else {
            DaemonSignal::Kill
        };

        Ok(ClientConfig {
            daemon_signal,
            instrumentation_args,
            exit_timeout,
            cleanup_on_failure: self.cleanup_on_failure,
        })
    }
}

/// Validated, immutable per-client options.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub daemon_signal: DaemonSignal,
    /// Valgrind arguments; empty means the daemon runs uninstrumented.
    pub instrumentation_args: Vec<String>,
    /// Bound on the daemon-exit wait; `None` waits forever.
    pub exit_timeout: Option<Duration>,
    pub cleanup_on_failure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            daemon_signal: DaemonSignal::Kill,
            instrumentation_args: Vec::new(),
            exit_timeout: None,
            cleanup_on_failure: false,
        }
    }
}

impl ClientConfig {
    pub fn is_instrumented(&self) -> bool {
        !self.instrumentation_args.is_empty()
    }
}

/// Where things live on the remote hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchLayout {
    pub test_dir: String,
    pub mount_prefix: String,
    pub enable_coredump: Option<String>,
    pub coverage_wrapper: Option<String>,
    pub coverage_dir: Option<String>,
    pub daemon_helper: Option<String>,
    pub daemon_binary: Option<String>,
    pub cluster_conf: Option<String>,
    pub valgrind_log_dir: Option<String>,
    /// Process name handed to `killall` when a daemon will not exit.
    pub daemon_process_name: String,
}

impl Default for LaunchLayout {
    fn default() -> Self {
        Self {
            test_dir: "/tmp/cephtest".to_string(),
            mount_prefix: "mnt.".to_string(),
            enable_coredump: None,
            coverage_wrapper: None,
            coverage_dir: None,
            daemon_helper: None,
            daemon_binary: None,
            cluster_conf: None,
            valgrind_log_dir: None,
            daemon_process_name: "ceph-fuse".to_string(),
        }
    }
}

impl LaunchLayout {
    fn under_test_dir(&self, explicit: &Option<String>, rel: &str) -> String {
        explicit
            .clone()
            .unwrap_or_else(|| format!("{}/{}", self.test_dir.trim_end_matches('/'), rel))
    }

    pub fn enable_coredump(&self) -> String {
        self.under_test_dir(&self.enable_coredump, "enable-coredump")
    }

    pub fn coverage_wrapper(&self) -> String {
        self.under_test_dir(&self.coverage_wrapper, "binary/usr/local/bin/ceph-coverage")
    }

    pub fn coverage_dir(&self) -> String {
        self.under_test_dir(&self.coverage_dir, "archive/coverage")
    }

    pub fn daemon_helper(&self) -> String {
        self.under_test_dir(&self.daemon_helper, "daemon-helper")
    }

    pub fn daemon_binary(&self) -> String {
        self.under_test_dir(&self.daemon_binary, "binary/usr/local/bin/ceph-fuse")
    }

    pub fn cluster_conf(&self) -> String {
        self.under_test_dir(&self.cluster_conf, "ceph.conf")
    }

    pub fn valgrind_log_dir(&self) -> String {
        self.under_test_dir(&self.valgrind_log_dir, "archive/log/valgrind")
    }
}

/// Controls how the teardown loop reacts to failures it is not told to
/// tolerate, and how long it keeps killing a daemon that will not exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownPolicy {
    /// Stop at the first untolerated failure, leaving later clients mounted.
    pub abort_on_error: bool,
    /// Give up after this many forced kills; `None` keeps trying forever.
    pub max_kill_attempts: Option<u32>,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            abort_on_error: true,
            max_kill_attempts: None,
        }
    }
}

/// Polling parameters for the mount-ready check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountWaitConfig {
    pub timeout_secs: u64,
    pub interval_secs: u64,
}

impl Default for MountWaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            interval_secs: 5,
        }
    }
}

impl MountWaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One host of the cluster inventory and the roles it carries.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub host: HostName,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A whole job file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub layout: LaunchLayout,
    #[serde(default)]
    pub cluster: Vec<HostEntry>,
    /// `null`, a list of client roles, or a map of role to options.
    #[serde(default)]
    pub fuse: Value,
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
    #[serde(default)]
    pub teardown: TeardownPolicy,
    #[serde(default)]
    pub mount_wait: MountWaitConfig,
}

impl JobConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let mut job: JobConfig = serde_yaml::from_str(raw)?;
        job.expand_env();
        Ok(job)
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading job file {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing job file {}", path.display()))
    }

    /// Overrides that apply to the fuse task.
    pub fn task_overrides(&self) -> Value {
        self.overrides.get(TASK_NAME).cloned().unwrap_or(Value::Null)
    }

    fn expand_env(&mut self) {
        for entry in &mut self.cluster {
            entry.host = HostName::new(expand_env_vars(entry.host.as_str()));
        }
        expand_value(&mut self.fuse);
        for value in self.overrides.values_mut() {
            expand_value(value);
        }
    }
}

/// Locate the job file: explicit flag, then `FUSE_JOB`, then `./job.yaml`.
pub fn resolve_job_path(explicit: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p);
    }

    if let Ok(p) = env::var("FUSE_JOB") {
        return Ok(PathBuf::from(p));
    }

    let candidate = PathBuf::from("job.yaml");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find a job file (pass --job, set FUSE_JOB or create ./job.yaml)"
    ))
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_env_vars(s),
        Value::Array(items) => items.iter_mut().for_each(expand_value),
        Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}
