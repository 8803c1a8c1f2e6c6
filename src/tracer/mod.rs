//! # Process Tracer Supervision
//!
//! The tracer is an external, root-privileged executable that observes every
//! process on the host and writes one JSON record per event to an output file.
//! It is started by the `start` invocation and stopped by the `finish`
//! invocation, two different processes, so the only handle on it is the pid
//! persisted in the [`StateStore`].
//!
//! Tracing is best-effort: an unsupported OS, a tracer that dies on startup or
//! a signal that cannot be delivered is logged and reported as a
//! [`TracerState`], never as an error to the caller.

pub mod ingest;

use crate::config::TracerConfig;
use crate::state::{StateError, StateStore};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;
use sysinfo::{ProcessStatus, System};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub use ingest::{ParseOptions, TraceIngest};

/// File the tracer writes its records to, inside the state directory.
pub const OUTPUT_FILE_NAME: &str = "proc-trace.out";
/// File capturing the tracer's stderr, inside the state directory.
pub const ERROR_FILE_NAME: &str = "proc_tracer_error";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TracerError {
    #[error("failed to launch tracer {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tracer exited during startup ({status})")]
    ExitedEarly { status: ExitStatus },

    #[error("failed to signal tracer pid {pid}: {reason}")]
    Signal { pid: i32, reason: String },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Lifecycle of the tracer as seen by one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracerState {
    /// Never launched: unsupported OS, disabled, or failed to start.
    NotStarted,
    /// Launched and confirmed alive after the startup grace period.
    Running { pid: i32 },
    /// A stop was attempted but the signal was not confirmed delivered.
    StopRequested { pid: i32 },
    /// The stop signal was delivered and the tracer exited, or the wait for
    /// it to exit ran out.
    Stopped,
}

impl TracerState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, TracerState::Stopped)
    }
}

/// Operating system identity used to pick a tracer build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRelease {
    pub distro: String,
    pub release: String,
}

impl OsRelease {
    pub fn new(distro: &str, release: &str) -> Self {
        Self {
            distro: distro.to_string(),
            release: release.to_string(),
        }
    }

    /// The running system, when the distribution can be identified.
    pub fn current() -> Option<Self> {
        Some(Self {
            distro: System::name()?,
            release: System::os_version()?,
        })
    }

    pub fn major_version(&self) -> Option<u32> {
        self.release.split('.').next()?.trim().parse().ok()
    }
}

/// The tracer executable built for `os`, if the platform is supported.
pub fn tracer_binary_for(os: &OsRelease) -> Option<&'static str> {
    if os.distro != "Ubuntu" {
        return None;
    }
    match os.major_version()? {
        20 => Some("proc_tracer_ubuntu-20"),
        22 => Some("proc_tracer_ubuntu-22"),
        _ => None,
    }
}

/// Starts and stops the detached tracer across orchestrator invocations.
pub struct TracerSupervisor {
    config: TracerConfig,
    state_dir: PathBuf,
    store: StateStore,
    os: Option<OsRelease>,
}

impl TracerSupervisor {
    pub fn new(config: TracerConfig, state_dir: &Path) -> Self {
        Self {
            config,
            state_dir: state_dir.to_path_buf(),
            store: StateStore::new(state_dir),
            os: OsRelease::current(),
        }
    }

    /// Overrides the detected operating system.
    pub fn with_os_release(mut self, os: Option<OsRelease>) -> Self {
        self.os = os;
        self
    }

    /// Where the tracer writes its records.
    pub fn output_path(&self) -> PathBuf {
        self.state_dir.join(OUTPUT_FILE_NAME)
    }

    fn error_path(&self) -> PathBuf {
        self.state_dir.join(ERROR_FILE_NAME)
    }

    /// Launches the tracer if the platform supports it.
    #[instrument(skip_all)]
    pub async fn start(&self) -> TracerState {
        info!("Starting process tracer ...");
        match self.try_start().await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Unable to start process tracer");
                TracerState::NotStarted
            }
        }
    }

    async fn try_start(&self) -> Result<TracerState, TracerError> {
        if !self.config.enabled {
            info!("Process tracing disabled by configuration");
            return Ok(TracerState::NotStarted);
        }

        let Some(binary) = self.os.as_ref().and_then(tracer_binary_for) else {
            info!(os = ?self.os, "Process tracing disabled because of unsupported OS");
            return Ok(TracerState::NotStarted);
        };
        info!(binary, "Using process tracer");

        let binary_path = self.config.binary_dir.join(binary);
        let output_path = self.output_path();
        std::fs::create_dir_all(&self.state_dir).map_err(|source| TracerError::Spawn {
            path: self.state_dir.clone(),
            source,
        })?;
        let stderr = File::create(self.error_path()).map_err(|source| TracerError::Spawn {
            path: self.error_path(),
            source,
        })?;

        let mut command = if self.config.use_sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg("-E").arg(&binary_path);
            sudo
        } else {
            Command::new(&binary_path)
        };
        command
            .arg("-f")
            .arg("json")
            .arg("-o")
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr))
            // Own process group: a Ctrl-C aimed at the job must not reach it.
            .process_group(0);

        let mut child = command.spawn().map_err(|source| TracerError::Spawn {
            path: binary_path.clone(),
            source,
        })?;
        let pid = child.id() as i32;
        debug!(pid, "Process tracer spawned, waiting for it to settle");

        tokio::time::sleep(Duration::from_millis(self.config.startup_grace_ms)).await;

        if let Ok(Some(status)) = child.try_wait() {
            self.log_tracer_errors();
            return Err(TracerError::ExitedEarly { status });
        }
        // Dropping the handle neither kills nor waits for the tracer.
        drop(child);

        self.store.update(|state| {
            state.tracer_pid = Some(pid);
            state.tracer_output = Some(output_path.clone());
        })?;

        info!(pid, output = %output_path.display(), "Started process tracer");
        Ok(TracerState::Running { pid })
    }

    fn log_tracer_errors(&self) {
        match std::fs::read_to_string(self.error_path()) {
            Ok(content) => {
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    info!("{}", line);
                }
            }
            Err(e) => debug!(error = %e, "No tracer error output available"),
        }
    }

    /// Sends the graceful-stop signal to the tracer recorded at start.
    #[instrument(skip_all)]
    pub async fn stop(&self) -> TracerState {
        info!("Finishing process tracer ...");

        let pid = match self.store.load() {
            Ok(state) => state.tracer_pid,
            Err(e) => {
                error!(error = %e, "Unable to read tracer state");
                None
            }
        };
        let Some(pid) = pid else {
            info!("Skipped finishing process tracer since process tracer didn't start");
            return TracerState::NotStarted;
        };

        debug!(pid, "Interrupting process tracer to stop gracefully ...");
        match self.interrupt(pid).await {
            Ok(()) => {
                if let Err(e) = self.store.update(|state| state.tracer_pid = None) {
                    warn!(error = %e, "Unable to clear tracer pid");
                }
                self.wait_for_exit(pid).await;
                info!("Finished process tracer");
                TracerState::Stopped
            }
            Err(e) => {
                error!(error = %e, "Unable to finish process tracer");
                TracerState::StopRequested { pid }
            }
        }
    }

    /// Polls until the tracer has exited, so its output file is complete.
    async fn wait_for_exit(&self, pid: i32) {
        let timeout = Duration::from_millis(self.config.stop_timeout_ms);
        let waited = tokio::time::timeout(timeout, async {
            while is_alive(pid) {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
            }
        })
        .await;
        match waited {
            Ok(()) => debug!(pid, "Process tracer exited"),
            Err(_) => warn!(
                pid,
                timeout_ms = self.config.stop_timeout_ms,
                "Process tracer still running, its output may be incomplete"
            ),
        }
    }

    async fn interrupt(&self, pid: i32) -> Result<(), TracerError> {
        match kill(Pid::from_raw(pid), Signal::SIGINT) {
            Ok(()) => Ok(()),
            // Already gone; whatever it flushed is on disk.
            Err(Errno::ESRCH) => {
                warn!(pid, "Process tracer already exited");
                Ok(())
            }
            // Root-owned when launched through sudo.
            Err(Errno::EPERM) if self.config.use_sudo => self.interrupt_with_sudo(pid).await,
            Err(e) => Err(TracerError::Signal {
                pid,
                reason: e.to_string(),
            }),
        }
    }

    async fn interrupt_with_sudo(&self, pid: i32) -> Result<(), TracerError> {
        let status = tokio::process::Command::new("sudo")
            .args(["-n", "kill", "-s", "INT", &pid.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await
            .map_err(|e| TracerError::Signal {
                pid,
                reason: e.to_string(),
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(TracerError::Signal {
                pid,
                reason: format!("sudo kill exited with {}", status),
            })
        }
    }
}

/// Whether `pid` is still a running process.
///
/// EPERM means the process exists but belongs to root. A zombie has exited
/// and only waits for its parent to reap it.
pub fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    let pid = sysinfo::Pid::from_u32(pid as u32);
    let mut system = System::new();
    if !system.refresh_process(pid) {
        return false;
    }
    system
        .process(pid)
        .is_some_and(|process| process.status() == ProcessStatus::Zombie)
}
