//! The telemetry daemon: periodic sampling behind the loopback control server.

use crate::{
    collector::{system::default_sources, ControlServer, Scheduler, StatCollector},
    config::Config,
    core::MetricSource,
    task_manager::TaskManager,
};
use anyhow::{bail, Context, Result};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

/// A handle to the running daemon.
pub struct Daemon {
    task_manager: TaskManager,
    local_addr: SocketAddr,
    collector: Arc<StatCollector>,
}

impl Daemon {
    pub fn builder(config: Config) -> DaemonBuilder {
        DaemonBuilder::new(config)
    }

    /// Address the control server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The collector shared by the scheduler and the control server.
    pub fn collector(&self) -> Arc<StatCollector> {
        self.collector.clone()
    }

    /// Waits for the shutdown signal, then for every task to finish.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.task_manager.shutdown_rx();
        // An error means the sender is gone, which is a shutdown too.
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("Shutdown signal received, stopping daemon tasks");

        let panicked = self.task_manager.shutdown().await;
        if panicked > 0 {
            bail!("{} daemon task(s) panicked", panicked);
        }
        info!("Daemon stopped");
        Ok(())
    }
}

/// Builds a [`Daemon`], with hooks to replace its collaborators in tests.
pub struct DaemonBuilder {
    config: Config,
    port: Option<u16>,
    sources_override: Option<Vec<Arc<dyn MetricSource>>>,
}

impl DaemonBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            port: None,
            sources_override: None,
        }
    }

    /// The control server port. Falls back to `server.port`, then to any free port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Overrides the system metric sources for testing.
    pub fn sources_override(mut self, sources: Vec<Arc<dyn MetricSource>>) -> Self {
        self.sources_override = Some(sources);
        self
    }

    /// Binds the control server and spawns the scheduler and server tasks.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<Daemon> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        let sources = self.sources_override.unwrap_or_else(default_sources);
        let domains: Vec<_> = sources.iter().map(|s| s.domain()).collect();
        debug!(?domains, "Initializing stat collector");
        let collector = Arc::new(StatCollector::new(sources));

        let port = self.port.or(config.server.port).unwrap_or(0);
        let server = ControlServer::bind(port, collector.clone(), task_manager.shutdown_rx())
            .await
            .with_context(|| format!("Failed to bind control server on port {}", port))?;
        let local_addr = server.local_addr()?;

        task_manager.spawn("ControlServer", server.run());
        let scheduler = Scheduler::new(collector.clone(), config.collector.interval());
        task_manager.spawn("Scheduler", scheduler.run(task_manager.shutdown_rx()));

        info!(%local_addr, interval_ms = config.collector.interval_ms, "Daemon started");
        Ok(Daemon {
            task_manager,
            local_addr,
            collector,
        })
    }
}
