//! # Job Start and Finish
//!
//! `ciwatch start` runs when the CI job begins: it picks the daemon port,
//! launches the daemon detached and starts the process tracer.
//!
//! `ciwatch finish` runs when the job ends: it triggers a final sample, stops
//! the tracer, resolves the job identity while fetching the metric buffer,
//! ingests the trace output and reports both payloads.
//!
//! Neither entry point is allowed to fail the CI job. Every degraded feature
//! is logged and shows up only as missing telemetry.

use crate::{
    collector::server::find_free_port,
    config::{CiContext, Config},
    core::{JobInfo, JobListing, MetricSnapshot, TelemetryData, TelemetryEnvelope},
    identity::{GitHubJobListing, IdentityResolver, ResolverPolicy},
    reporter::{build_metadata, HttpTelemetrySink, Reporter, SendOutcome, StaticOrOnDemandKey},
    state::{PersistedState, StateStore},
    tracer::{OsRelease, ParseOptions, TraceIngest, TracerState, TracerSupervisor},
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Daemon output, inside the state directory.
pub const DAEMON_LOG_FILE_NAME: &str = "daemon.log";

/// HTTP client for the daemon's control server.
pub struct DaemonClient {
    client: reqwest::Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build daemon client")?;
        Ok(Self {
            client,
            base_url: format!("http://127.0.0.1:{}", port),
        })
    }

    /// Asks the daemon for one out-of-band sample.
    pub async fn trigger_collect(&self) -> Result<()> {
        self.client
            .post(format!("{}/collect", self.base_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// The daemon's whole metric buffer.
    pub async fn fetch_metrics(&self) -> Result<Vec<MetricSnapshot>> {
        let payload: TelemetryData = self
            .client
            .get(format!("{}/metrics", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match payload {
            TelemetryData::Metric { data, .. } => Ok(data),
            TelemetryData::Process { .. } => bail!("daemon returned a process payload"),
        }
    }
}

/// What `start` set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub port: u16,
    pub daemon_pid: Option<i32>,
    pub tracer: TracerState,
}

/// What `finish` collected and delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishReport {
    pub tracer: TracerState,
    pub job: JobInfo,
    pub metric_count: usize,
    pub process_count: usize,
    /// `None` when reporting was skipped before any send was attempted.
    pub metrics_sent: Option<SendOutcome>,
    pub processes_sent: Option<SendOutcome>,
}

pub struct Orchestrator {
    config: Config,
    store: StateStore,
    ci_context: Option<CiContext>,
    job_listing_override: Option<Arc<dyn JobListing>>,
    os_release_override: Option<Option<OsRelease>>,
    daemon_exe: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let store = StateStore::new(&config.state_dir);
        Self {
            config,
            store,
            ci_context: None,
            job_listing_override: None,
            os_release_override: None,
            daemon_exe: None,
        }
    }

    /// Uses `ctx` instead of reading the CI environment.
    pub fn ci_context(mut self, ctx: CiContext) -> Self {
        self.ci_context = Some(ctx);
        self
    }

    /// Overrides the job listing API for testing.
    pub fn job_listing_override(mut self, listing: Arc<dyn JobListing>) -> Self {
        self.job_listing_override = Some(listing);
        self
    }

    /// Overrides OS detection for the tracer.
    pub fn os_release_override(mut self, os: Option<OsRelease>) -> Self {
        self.os_release_override = Some(os);
        self
    }

    /// Launches `exe` as the daemon instead of the current executable.
    pub fn daemon_exe(mut self, exe: PathBuf) -> Self {
        self.daemon_exe = Some(exe);
        self
    }

    fn tracer(&self) -> TracerSupervisor {
        let tracer = TracerSupervisor::new(self.config.tracer.clone(), &self.config.state_dir);
        match &self.os_release_override {
            Some(os) => tracer.with_os_release(os.clone()),
            None => tracer,
        }
    }

    fn ci(&self) -> Result<CiContext> {
        match &self.ci_context {
            Some(ctx) => Ok(ctx.clone()),
            None => CiContext::from_env(),
        }
    }

    /// Job start: daemon and tracer.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<StartReport> {
        let port = match self.config.server.port {
            Some(port) => port,
            None => find_free_port(self.config.server.base_port)
                .context("Failed to find a free port for the daemon")?,
        };

        // A fresh job starts from a clean slate.
        self.store.save(&PersistedState {
            server_port: Some(port),
            started_at: Some(Utc::now().timestamp() * 1000),
            ..PersistedState::default()
        })?;

        let daemon_pid = match self.spawn_daemon(port) {
            Ok(pid) => {
                self.store.update(|state| state.daemon_pid = Some(pid))?;
                info!(pid, port, "Started telemetry daemon");
                Some(pid)
            }
            Err(e) => {
                error!(error = %e, "Unable to start telemetry daemon");
                None
            }
        };

        let tracer = self.tracer().start().await;
        Ok(StartReport {
            port,
            daemon_pid,
            tracer,
        })
    }

    fn spawn_daemon(&self, port: u16) -> Result<i32> {
        let exe = match &self.daemon_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe().context("Failed to locate the ciwatch executable")?,
        };

        let state_dir = &self.config.state_dir;
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
        let log_path = state_dir.join(DAEMON_LOG_FILE_NAME);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("Failed to open {}", log_path.display()))?;

        // The daemon sees the effective settings through the environment layer.
        let child = Command::new(&exe)
            .arg("daemon")
            .arg("--port")
            .arg(port.to_string())
            .env("CIWATCH_STATE_DIR", state_dir)
            .env("CIWATCH_LOG_LEVEL", &self.config.log_level)
            .env(
                "CIWATCH_COLLECTOR__INTERVAL_MS",
                self.config.collector.interval_ms.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to launch {}", exe.display()))?;
        Ok(child.id() as i32)
    }

    /// Job end: collect everything and report it.
    #[instrument(skip_all)]
    pub async fn finish(&self) -> Result<FinishReport> {
        let state = self.store.load().unwrap_or_else(|e| {
            warn!(error = %e, "Unable to read saved state");
            PersistedState::default()
        });

        let daemon = match state.server_port {
            Some(port) => Some(DaemonClient::new(port)?),
            None => {
                info!("Skipped stat collection since the daemon port is unknown");
                None
            }
        };
        if let Some(client) = &daemon {
            debug!("Triggering final stat collection");
            if let Err(e) = client.trigger_collect().await {
                warn!(error = %e, "Unable to trigger final stat collection");
            }
        }

        let tracer = self.tracer();
        let tracer_state = tracer.stop().await;

        let ctx = match self.ci() {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                warn!(error = %e, "CI run context is unavailable");
                None
            }
        };

        let (job, metrics) = tokio::join!(
            self.resolve_job(&state, ctx.as_ref()),
            fetch_metrics(daemon.as_ref())
        );
        if let Err(e) = self.store.update(|s| s.set_job(&job)) {
            warn!(error = %e, "Unable to save job identity");
        }

        self.stop_daemon(state.daemon_pid);

        let commands = if tracer_state.is_stopped() {
            let path = state.tracer_output.unwrap_or_else(|| tracer.output_path());
            TraceIngest::default().parse(&path, &ParseOptions::from(&self.config.tracer))
        } else {
            Vec::new()
        };

        let mut report = FinishReport {
            tracer: tracer_state,
            job: job.clone(),
            metric_count: metrics.len(),
            process_count: commands.len(),
            metrics_sent: None,
            processes_sent: None,
        };

        let Some(ctx) = ctx else {
            warn!("Skipped sending telemetry since the CI run context is unavailable");
            return Ok(report);
        };

        let created_at = state
            .started_at
            .unwrap_or_else(|| Utc::now().timestamp() * 1000);
        let meta_data = build_metadata(&ctx, &job, created_at);
        let reporter = Reporter::new(
            Arc::new(StaticOrOnDemandKey::new(&self.config.reporter, &ctx)?),
            Arc::new(HttpTelemetrySink::new(&self.config.reporter)?),
        );

        report.metrics_sent = Some(
            reporter
                .send(&TelemetryEnvelope {
                    meta_data: meta_data.clone(),
                    telemetry_data: TelemetryData::metric(metrics),
                })
                .await,
        );
        report.processes_sent = Some(
            reporter
                .send(&TelemetryEnvelope {
                    meta_data,
                    telemetry_data: TelemetryData::process(commands),
                })
                .await,
        );
        Ok(report)
    }

    async fn resolve_job(&self, state: &PersistedState, ctx: Option<&CiContext>) -> JobInfo {
        if state.job_id.is_some() {
            debug!(job_id = ?state.job_id, "Using saved job identity");
            return state.job();
        }
        let Some(ctx) = ctx else {
            return JobInfo::default();
        };
        let Some(runner_name) = ctx.runner_name.as_deref() else {
            info!("Skipped job identity resolution since the runner name is unknown");
            return JobInfo::default();
        };

        let listing = match &self.job_listing_override {
            Some(listing) => listing.clone(),
            None => {
                let token = self.config.identity.token.clone().or_else(|| ctx.token.clone());
                match GitHubJobListing::new(&self.config.identity.api_url, ctx, token) {
                    Ok(listing) => Arc::new(listing) as Arc<dyn JobListing>,
                    Err(e) => {
                        warn!(error = %e, "Unable to create job listing client");
                        return JobInfo::default();
                    }
                }
            }
        };

        IdentityResolver::new(listing, ResolverPolicy::from(&self.config.identity))
            .resolve(runner_name)
            .await
            .into()
    }

    fn stop_daemon(&self, pid: Option<i32>) {
        let Some(pid) = pid else {
            return;
        };
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {
                debug!(pid, "Stopped telemetry daemon");
                if let Err(e) = self.store.update(|s| s.daemon_pid = None) {
                    warn!(error = %e, "Unable to clear daemon pid");
                }
            }
            Err(e) => warn!(pid, error = %e, "Unable to stop telemetry daemon"),
        }
    }
}

async fn fetch_metrics(daemon: Option<&DaemonClient>) -> Vec<MetricSnapshot> {
    let Some(client) = daemon else {
        return Vec::new();
    };
    match client.fetch_metrics().await {
        Ok(metrics) => {
            debug!(count = metrics.len(), "Fetched metrics from daemon");
            metrics
        }
        Err(e) => {
            warn!(error = %e, "Unable to fetch metrics from daemon");
            Vec::new()
        }
    }
}
