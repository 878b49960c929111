use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from threadwatch.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub termination: TerminationConfig,
    pub corroboration: CorroborationConfig,
    pub counter: CounterConfig,
    pub markers: MarkerConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Worker thread count handed to targets via `{threads}`.
    pub threads: u32,
    pub check_interval_secs: f64,
    pub poll_tick_ms: u64,
    pub global_timeout_secs: f64,
    /// Consecutive deadlock-candidate samples needed to confirm a deadlock.
    pub confidence_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminationConfig {
    pub grace_period_ms: u64,
    pub kill_wait_ms: u64,
    pub handle_kill_wait_ms: u64,
}

/// Thresholds for the post-run deadlock corroboration pass.
///
/// These are tunable heuristics, not empirically validated bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorroborationConfig {
    pub idle_wall_secs: f64,
    pub idle_cpus: f64,
    pub timeout_idle_cpus: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarkerConfig {
    pub deadlock: String,
    pub data_race: String,
    /// All-clear line containing the race marker; matches inside it are ignored.
    pub data_race_clear: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

// --- Default implementations ---

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            check_interval_secs: 0.5,
            poll_tick_ms: 100,
            global_timeout_secs: 300.0,
            confidence_threshold: 3,
        }
    }
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 500,
            kill_wait_ms: 2000,
            handle_kill_wait_ms: 500,
        }
    }
}

impl Default for CorroborationConfig {
    fn default() -> Self {
        Self {
            idle_wall_secs: 5.0,
            idle_cpus: 0.1,
            timeout_idle_cpus: 0.2,
        }
    }
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command: "perf".to_string(),
            args: vec![
                "stat".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "--".to_string(),
            ],
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            deadlock: "DEADLOCK".to_string(),
            data_race: "DATA RACE".to_string(),
            data_race_clear: "No data race".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.global_timeout_secs)
    }
}

impl TargetConfig {
    /// Arguments with `{threads}` placeholders replaced.
    pub fn resolved_args(&self, threads: u32) -> Vec<String> {
        let threads = threads.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{threads}", &threads))
            .collect()
    }
}

/// Errors from loading or validating the configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.supervisor;
        if !(s.check_interval_secs > 0.0) || !s.check_interval_secs.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "supervisor.check_interval_secs must be positive, got {}",
                s.check_interval_secs
            )));
        }
        if !(s.global_timeout_secs > 0.0) || !s.global_timeout_secs.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "supervisor.global_timeout_secs must be positive, got {}",
                s.global_timeout_secs
            )));
        }
        if s.poll_tick_ms == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.poll_tick_ms must be greater than 0".to_string(),
            ));
        }
        if s.confidence_threshold == 0 {
            return Err(ConfigError::Invalid(
                "supervisor.confidence_threshold must be at least 1".to_string(),
            ));
        }
        if self.counter.enabled && self.counter.command.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "counter.command is empty but the counter tool is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
