use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use serde::Deserialize;

/// Placeholder substituted with the in-sandbox path of the submitted source file
pub const SOURCE_PLACEHOLDER: &str = "%SOURCE%";

#[derive(Parser)]
#[command(name = "gradebox", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    /// Grade the submissions that are pending right now, then exit
    #[arg(long = "once", default_value_t = false)]
    pub once: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> Result<Config> {
        Config::from_path(&self.config_path)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub limits: ResourceLimits,
    pub backend: BackendConfig,
    pub languages: Vec<LanguageConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            bail!("engine.max_concurrency must not be 0");
        }
        if self.limits.wall_clock_timeout_ms == 0 {
            bail!("limits.wall_clock_timeout_ms must not be 0");
        }
        if self.limits.memory_cap_mb == 0 {
            bail!("limits.memory_cap_mb must not be 0");
        }
        if self.languages.is_empty() {
            bail!("at least one language must be configured");
        }

        let mut seen = HashSet::new();
        for language in &self.languages {
            if !seen.insert(language.name.as_str()) {
                bail!("language {} is configured twice", language.name);
            }
            if !language.command.iter().any(|a| a.contains(SOURCE_PLACEHOLDER)) {
                bail!(
                    "command of language {} does not reference {SOURCE_PLACEHOLDER}",
                    language.name
                );
            }
            if language.file_name.contains('/') {
                bail!("file_name of language {} must be a bare name", language.name);
            }
            if matches!(self.backend, BackendConfig::Docker { .. }) && language.image.is_none() {
                bail!("language {} needs an image for the docker backend", language.name);
            }
        }

        Ok(())
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound of submissions graded (and sandboxes alive) at once
    pub max_concurrency: usize,
    /// Admitted submissions allowed to wait for a free slot
    pub queue_depth: usize,
    /// Keep released sandboxes and scrub them instead of creating new ones
    pub reuse_sandboxes: bool,
    pub poll_interval_ms: u64,
    pub comparison: Comparison,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_depth: 40,
            reuse_sandboxes: false,
            poll_interval_ms: 500,
            comparison: Comparison::Exact,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

/// Limits applied to every sandbox
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    /// Fraction of one CPU the program may use
    pub cpu_share: f64,
    pub memory_cap_mb: u64,
    pub wall_clock_timeout_ms: u64,
    pub process_count_cap: u32,
    /// Captured stdout beyond this size is a limit violation
    pub output_cap_kb: u64,
    pub stderr_excerpt_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_share: 1.0,
            memory_cap_mb: 256,
            wall_clock_timeout_ms: 2000,
            process_count_cap: 16,
            output_cap_kb: 16384,
            stderr_excerpt_bytes: 2048,
        }
    }
}

impl ResourceLimits {
    pub fn wall_clock_timeout(&self) -> Duration {
        Duration::from_millis(self.wall_clock_timeout_ms)
    }

    pub fn memory_cap_kb(&self) -> u64 {
        self.memory_cap_mb * 1024
    }

    pub fn output_cap_bytes(&self) -> usize {
        (self.output_cap_kb * 1024) as usize
    }
}

/// How captured stdout is compared with the expected output
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Trailing whitespace of the whole output is ignored, everything else must match
    #[default]
    Exact,
    /// Trailing whitespace of every line and trailing empty lines are ignored
    Lenient,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    Process {
        /// Run each program in a fresh network namespace
        #[serde(default = "default_true")]
        unshare_network: bool,
        work_root: Option<PathBuf>,
        /// Delegated cgroup v2 directory for per-sandbox pids cgroups
        cgroup_root: Option<PathBuf>,
    },
    Isolate {
        #[serde(default = "default_isolate_binary")]
        binary: String,
        #[serde(default)]
        first_box_id: u32,
        #[serde(default = "default_box_count")]
        box_count: u32,
        work_root: Option<PathBuf>,
    },
    Docker {
        #[serde(default = "default_docker_binary")]
        binary: String,
        /// OCI runtime, e.g. `runsc` or `kata-runtime` for microVM isolation
        runtime: Option<String>,
    },
}

fn default_true() -> bool {
    true
}

fn default_isolate_binary() -> String {
    "isolate".to_string()
}

fn default_box_count() -> u32 {
    64
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct LanguageConfig {
    pub name: String,
    pub file_name: String,
    /// Run command; `%SOURCE%` is replaced by the in-sandbox source path
    pub command: Vec<String>,
    /// Container image, required by the docker backend
    pub image: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        serde_json::from_value(serde_json::json!({
            "backend": { "type": "process", "unshare_network": false },
            "languages": [
                { "name": "sh", "file_name": "main.sh", "command": ["/bin/sh", "%SOURCE%"] }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_config_deserialization() {
        let config = Config::from_path("data/example.json").unwrap();
        assert_eq!(config.engine.max_concurrency, 10);
        assert_eq!(config.engine.comparison, Comparison::Exact);
        assert_eq!(config.limits.wall_clock_timeout_ms, 2000);
        assert!(matches!(config.backend, BackendConfig::Docker { .. }));
        assert_eq!(config.languages[0].name, "python");
        assert_eq!(
            config.languages[0].image.as_deref(),
            Some("python:3.12-slim")
        );
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.limits, ResourceLimits::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.engine.queue_depth, 40);
        assert_eq!(
            config.backend,
            BackendConfig::Process {
                unshare_network: false,
                work_root: None,
                cgroup_root: None,
            }
        );
    }

    #[test]
    fn test_validation_rejects_command_without_source() {
        let mut config = sample();
        config.languages[0].command = vec!["/bin/sh".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_language() {
        let mut config = sample();
        let again = config.languages[0].clone();
        config.languages.push(again);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_image_for_docker() {
        let mut config = sample();
        config.backend = BackendConfig::Docker {
            binary: "docker".to_string(),
            runtime: None,
        };
        assert!(config.validate().is_err());
        config.languages[0].image = Some("alpine:3".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = sample();
        config.engine.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
