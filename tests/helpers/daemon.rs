#![allow(dead_code)]
//! Test helpers for running an in-process daemon.

use super::fake_sources::{as_sources, recording_sources, RecordingSource};
use anyhow::Result;
use ciwatch::{collector::StatCollector, config::Config, core::MetricSource, daemon::Daemon};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::timeout};

/// A daemon running on an ephemeral loopback port.
pub struct TestDaemon {
    pub addr: SocketAddr,
    pub collector: Arc<StatCollector>,
    pub sources: Vec<Arc<RecordingSource>>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl TestDaemon {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Waits until the buffer holds at least `count` snapshots.
    pub async fn wait_for_snapshots(&self, count: usize) {
        timeout(Duration::from_secs(5), async {
            while self.collector.len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("daemon did not collect in time");
    }

    /// Signals shutdown and waits for the daemon to stop.
    pub async fn shutdown(self, timeout_duration: Duration) -> Result<()> {
        self.shutdown_tx.send(true)?;
        match timeout(timeout_duration, self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow::anyhow!("Daemon failed to shut down within the timeout")),
        }
    }
}

pub struct TestDaemonBuilder {
    pub config: Config,
    sources: Vec<Arc<RecordingSource>>,
    extra_sources: Vec<Arc<dyn MetricSource>>,
}

impl TestDaemonBuilder {
    /// A daemon with one recording source per domain and an interval long
    /// enough that only the initial tick fires during a test.
    pub fn new() -> Self {
        let mut config = Config::default();
        config.collector.interval_ms = 3_600_000;
        Self {
            config,
            sources: recording_sources(),
            extra_sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Arc<RecordingSource>>) -> Self {
        self.sources = sources;
        self
    }

    pub fn with_extra_source(mut self, source: Arc<dyn MetricSource>) -> Self {
        self.extra_sources.push(source);
        self
    }

    pub async fn start(self) -> TestDaemon {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sources = as_sources(&self.sources);
        sources.extend(self.extra_sources);

        let daemon = Daemon::builder(self.config)
            .port(0)
            .sources_override(sources)
            .build(shutdown_rx)
            .await
            .expect("daemon should build");

        let addr = daemon.local_addr();
        let collector = daemon.collector();
        let handle = tokio::spawn(daemon.run());

        TestDaemon {
            addr,
            collector,
            sources: self.sources,
            shutdown_tx,
            handle,
        }
    }
}
