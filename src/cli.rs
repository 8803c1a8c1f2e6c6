//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using the
//! `clap` crate. The global flags are merged over the configuration file and
//! environment variables through the `figment::Provider` implementation below.

use clap::{Parser, Subcommand};
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::path::PathBuf;

/// A CI job telemetry sidecar: samples system resources, traces processes and
/// reports both when the job ends.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(short, long = "config-file", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Log level filter (e.g. `info`, `debug`).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Sampling interval in seconds.
    #[arg(long, value_name = "SECONDS", global = true)]
    pub stat_frequency: Option<u64>,

    /// Directory for the state file, daemon log and tracer output.
    #[arg(long, value_name = "DIR", global = true)]
    pub state_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Job start: launch the telemetry daemon and the process tracer.
    Start,
    /// Run the telemetry daemon in the foreground.
    Daemon {
        /// Loopback port for the control server.
        #[arg(long)]
        port: u16,
    },
    /// Job end: collect, stop the tracer and report everything.
    Finish,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(level) = &self.log_level {
            dict.insert("log_level".into(), Value::from(level.clone()));
        }

        if let Some(dir) = &self.state_dir {
            dict.insert(
                "state_dir".into(),
                Value::from(dir.to_string_lossy().into_owned()),
            );
        }

        // Zero means "use the default cadence".
        if let Some(seconds) = self.stat_frequency.filter(|s| *s > 0) {
            let mut collector = Dict::new();
            collector.insert("interval_ms".into(), Value::from(seconds.saturating_mul(1000)));
            dict.insert("collector".into(), Value::from(collector));
        }

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
