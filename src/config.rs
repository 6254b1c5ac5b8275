// ABOUTME: Configuration for the kernel pool service
//
// Defines PoolConfig with all tunable parameters:
// - Listen address for the TCP front end
// - Sweep interval and idle threshold for kernel eviction
// - Optional whole-process auto-exit
// - Kernel kinds (command lines) that can be instantiated

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the built-in kernel kind
pub const DEFAULT_KIND: &str = "python3";

/// Interpreter loop run by the built-in `python3` kind
const PYTHON_SHIM: &str = include_str!("runtime/shim.py");

/// How to launch one kind of kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSpec {
    /// Executable to spawn
    pub command: String,

    /// Arguments for the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the kernel process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl KernelSpec {
    /// Spec for the built-in python kernel
    pub fn builtin_python() -> Self {
        Self {
            command: "python3".to_string(),
            args: vec!["-u".to_string(), "-c".to_string(), PYTHON_SHIM.to_string()],
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Configuration for the kernel pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Address the TCP front end binds to
    pub listen_addr: String,

    /// Kind used when a request does not name one
    pub default_kind: String,

    // === Eviction ===
    /// Period of the idle sweeper
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Kernels untouched for longer than this are shut down by the sweeper
    #[serde(with = "duration_secs")]
    pub idle_threshold: Duration,

    // === Auto exit ===
    /// Exit the whole process after this long without any request
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub auto_exit_after: Option<Duration>,

    /// How often the auto-exit watchdog checks for inactivity
    #[serde(with = "duration_secs")]
    pub auto_exit_check_interval: Duration,

    // === Kernel processes ===
    /// Events buffered per kernel before slow subscribers start lagging
    pub event_buffer: usize,

    /// Time between SIGTERM and SIGKILL when shutting a kernel down
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Directory for JSON log files (default: ~/.kernelpool/logs/)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Kernel kinds by name
    pub kernels: HashMap<String, KernelSpec>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let mut kernels = HashMap::new();
        kernels.insert(DEFAULT_KIND.to_string(), KernelSpec::builtin_python());

        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            default_kind: DEFAULT_KIND.to_string(),

            sweep_interval: Duration::from_secs(60 * 60),
            idle_threshold: Duration::from_secs(60 * 60),

            auto_exit_after: None,
            auto_exit_check_interval: Duration::from_secs(300),

            event_buffer: 1024,
            shutdown_grace: Duration::from_secs(2),
            log_dir: None,

            kernels,
        }
    }
}

impl PoolConfig {
    /// Load configuration from default locations, or only from `explicit` if given
    ///
    /// Files are layered in precedence order; keys set in a later file win,
    /// keys it leaves out keep the value from earlier files or the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let paths = match explicit {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {}", path.display());
                }
                vec![path.to_path_buf()]
            }
            None => Self::get_config_paths(),
        };

        let mut merged = toml::Table::new();
        for path in paths.iter().filter(|p| p.exists()) {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            let table: toml::Table = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?;
            merge_tables(&mut merged, table);
        }

        let mut config: Self = toml::Value::Table(merged)
            .try_into()
            .context("Failed to parse config")?;

        // Built-in kinds stay available unless a file redefines them
        for (kind, spec) in Self::default().kernels {
            config.kernels.entry(kind).or_insert(spec);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pool cannot run with
    pub fn validate(&self) -> Result<()> {
        if !self.kernels.contains_key(&self.default_kind) {
            anyhow::bail!(
                "Default kernel kind '{}' has no kernel spec",
                self.default_kind
            );
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep_interval must be greater than zero");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than zero");
        }
        if let Some((kind, _)) = self.kernels.iter().find(|(_, s)| s.command.is_empty()) {
            anyhow::bail!("Kernel kind '{kind}' has an empty command");
        }
        Ok(())
    }

    /// Get configuration file paths in order of precedence (lowest first)
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![];

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".kernelpool").join("config.toml"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".kernelpool").join("config.toml"));
        }

        paths
    }

    /// Directory for log files, defaulting to ~/.kernelpool/logs
    pub fn get_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".kernelpool")
                .join("logs")
        })
    }
}

/// Recursively overlay `overlay` onto `base`
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Serde helper for Duration as seconds (u64)
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
