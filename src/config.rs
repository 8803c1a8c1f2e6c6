//! Configuration management for ciwatch
//!
//! This module defines the main `Config` struct and its sub-structs,
//! responsible for holding all application settings. It uses the `figment`
//! crate to layer built-in defaults, an optional TOML file, `CIWATCH_`
//! environment variables and command-line arguments, in that order.
//!
//! The CI run context (repository, run id, runner name, token) is not part of
//! `Config`; it is read from the variables the CI system itself sets, see
//! [`CiContext`].

use crate::cli::Cli;
use anyhow::{bail, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Directory holding the state file, daemon log and tracer output.
    pub state_dir: PathBuf,
    pub collector: CollectorConfig,
    pub server: ServerConfig,
    pub tracer: TracerConfig,
    pub identity: IdentityConfig,
    pub reporter: ReporterConfig,
}

/// Configuration for the periodic stat collector.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CollectorConfig {
    /// Target cadence of scheduled ticks in milliseconds.
    pub interval_ms: u64,
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Configuration for the daemon's loopback control server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ServerConfig {
    /// First port tried when searching for a free one.
    pub base_port: u16,
    /// A fixed port, skipping the search.
    #[serde(default)]
    pub port: Option<u16>,
}

/// Configuration for the process tracer.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TracerConfig {
    /// Whether to start the tracer at all.
    pub enabled: bool,
    /// Directory containing the platform tracer executables.
    pub binary_dir: PathBuf,
    /// Launch and signal the tracer through `sudo`.
    pub use_sudo: bool,
    /// How long to wait before checking that the tracer is still alive.
    pub startup_grace_ms: u64,
    /// How long `finish` waits for the stopped tracer to exit and flush.
    pub stop_timeout_ms: u64,
    /// Drop commands shorter than this many milliseconds; `-1` keeps all.
    pub min_duration: i64,
    /// Keep commands of well-known system utilities.
    pub trace_system_processes: bool,
}

/// Configuration for job identity resolution.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IdentityConfig {
    /// Base URL of the job-listing API.
    pub api_url: String,
    /// Token for the job-listing API. Falls back to `GITHUB_TOKEN`.
    #[serde(default)]
    pub token: Option<String>,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub page_size: u32,
}

/// Configuration for telemetry delivery.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ReporterConfig {
    /// Base URL of the telemetry collector.
    pub base_url: String,
    /// Base URL of the on-demand API key endpoint.
    pub on_demand_base_url: String,
    /// A preconfigured API key; when absent one is requested on demand.
    #[serde(default)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Config {
    /// Loads the configuration, layering defaults, the optional config file,
    /// `CIWATCH_` environment variables (`__` separates sections) and the
    /// command line.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = &cli.config_file {
            if !path.exists() {
                bail!("Config file not found at specified path: {}", path.display());
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: Config = figment
            .merge(Env::prefixed("CIWATCH_").split("__"))
            .merge(cli.clone())
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.collector.interval_ms == 0 {
            bail!("collector.interval_ms must be greater than zero");
        }
        if self.identity.max_attempts == 0 {
            bail!("identity.max_attempts must be at least 1");
        }
        if !(1..=100).contains(&self.identity.page_size) {
            bail!("identity.page_size must be between 1 and 100");
        }
        if self.tracer.min_duration < -1 {
            bail!("tracer.min_duration must be -1 or a non-negative number of milliseconds");
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    std::env::var_os("RUNNER_TEMP")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join("ciwatch")
}

fn default_tracer_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("proc-tracer")))
        .unwrap_or_else(|| PathBuf::from("proc-tracer"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            state_dir: default_state_dir(),
            collector: CollectorConfig { interval_ms: 5000 },
            server: ServerConfig {
                base_port: 10000,
                port: None,
            },
            tracer: TracerConfig {
                enabled: true,
                binary_dir: default_tracer_dir(),
                use_sudo: true,
                startup_grace_ms: 1000,
                stop_timeout_ms: 5000,
                min_duration: -1,
                trace_system_processes: false,
            },
            identity: IdentityConfig {
                api_url: "https://api.github.com".to_string(),
                token: None,
                max_attempts: 10,
                retry_delay_ms: 1000,
                page_size: 100,
            },
            reporter: ReporterConfig {
                base_url: "https://api.service.runforesight.com".to_string(),
                on_demand_base_url: "https://api-public.service.runforesight.com".to_string(),
                api_key: None,
                timeout_secs: 10,
            },
        }
    }
}

/// The CI run this process belongs to, as described by the CI environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CiContext {
    pub repo_owner: String,
    pub repo_name: String,
    pub run_id: u64,
    pub run_attempt: Option<String>,
    pub runner_name: Option<String>,
    pub token: Option<String>,
}

impl CiContext {
    /// Reads the context from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the context through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let repository = lookup("GITHUB_REPOSITORY").context("GITHUB_REPOSITORY is not set")?;
        let (owner, name) = repository
            .split_once('/')
            .with_context(|| format!("GITHUB_REPOSITORY '{}' is not 'owner/name'", repository))?;
        let run_id = lookup("GITHUB_RUN_ID")
            .context("GITHUB_RUN_ID is not set")?
            .parse::<u64>()
            .context("GITHUB_RUN_ID is not a number")?;

        Ok(Self {
            repo_owner: owner.to_string(),
            repo_name: name.to_string(),
            run_id,
            run_attempt: lookup("GITHUB_RUN_ATTEMPT"),
            runner_name: lookup("RUNNER_NAME"),
            token: lookup("GITHUB_TOKEN").filter(|t| !t.is_empty()),
        })
    }

    /// `owner/name`.
    pub fn repo_full_name(&self) -> String {
        format!("{}/{}", self.repo_owner, self.repo_name)
    }
}
