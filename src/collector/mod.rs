//! # Stat Collector
//!
//! The daemon side of ciwatch: the append-only [`MetricBuffer`], the
//! [`StatCollector`] that runs one sampling pass ("tick") across every
//! resource domain, the drift-compensated [`scheduler::Scheduler`] and the
//! loopback [`server::ControlServer`].
//!
//! A tick samples all domains concurrently and appends each snapshot as soon
//! as its source settles. A failing source only loses its own snapshot for
//! that tick.

pub mod scheduler;
pub mod server;
pub mod system;

use crate::core::{Domain, MetricSnapshot, MetricSource};
use chrono::Utc;
use futures::future::join_all;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, warn};

pub use scheduler::{Scheduler, Timeline};
pub use server::ControlServer;

#[derive(Error, Debug, Clone)]
pub enum SampleError {
    #[error("{domain} query failed: {reason}")]
    Query { domain: Domain, reason: String },

    #[error("{0} sampling is not supported on this platform")]
    Unsupported(Domain),

    #[error("{domain} sampler task failed: {reason}")]
    Task { domain: Domain, reason: String },
}

/// Process-lifetime, append-only sequence of snapshots in collection order.
#[derive(Debug, Default, Clone)]
pub struct MetricBuffer {
    snapshots: Vec<MetricSnapshot>,
}

impl MetricBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, snapshot: MetricSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn snapshots(&self) -> &[MetricSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// What caused a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOrigin {
    Scheduled,
    Triggered,
}

/// Outcome of one sampling pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickReport {
    /// Snapshots appended to the buffer.
    pub collected: usize,
    /// Domains whose snapshot was omitted.
    pub failed: usize,
    /// Time since the previous tick; zero on the first.
    pub time_interval: Duration,
}

/// Baseline of the previous tick.
#[derive(Debug, Clone, Copy)]
struct LastTick {
    at: Instant,
    time_ms: i64,
}

/// Runs ticks against a set of sources and owns the shared buffer.
pub struct StatCollector {
    sources: Vec<Arc<dyn MetricSource>>,
    buffer: Arc<Mutex<MetricBuffer>>,
    // Held across a whole tick so a triggered tick never interleaves with a
    // scheduled one.
    last_tick: tokio::sync::Mutex<Option<LastTick>>,
}

impl std::fmt::Debug for StatCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCollector")
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl StatCollector {
    pub fn new(sources: Vec<Arc<dyn MetricSource>>) -> Self {
        Self {
            sources,
            buffer: Arc::new(Mutex::new(MetricBuffer::new())),
            last_tick: tokio::sync::Mutex::new(None),
        }
    }

    /// Runs one sampling pass across every source.
    ///
    /// Sources are queried concurrently; the call returns once all of them
    /// have settled.
    pub async fn collect(&self, origin: TickOrigin) -> TickReport {
        let mut last_tick = self.last_tick.lock().await;

        let now = Instant::now();
        // Wall clocks can step backwards; keep `time` non-decreasing.
        let time_ms = match *last_tick {
            Some(prev) => Utc::now().timestamp_millis().max(prev.time_ms),
            None => Utc::now().timestamp_millis(),
        };
        let time_interval = last_tick
            .map(|prev| now.saturating_duration_since(prev.at))
            .unwrap_or(Duration::ZERO);
        *last_tick = Some(LastTick { at: now, time_ms });

        debug!(?origin, time_ms, interval_ms = time_interval.as_millis() as u64, "Collecting stats");

        let samples = self.sources.iter().map(|source| {
            let source = source.clone();
            let buffer = self.buffer.clone();
            async move {
                let domain = source.domain();
                match source.sample(time_interval).await {
                    Ok(points) if points.is_empty() => {
                        warn!(%domain, "Sampler returned no points, snapshot omitted");
                        false
                    }
                    Ok(points) => {
                        let snapshot = MetricSnapshot {
                            domain,
                            group: domain.group().to_string(),
                            time: time_ms,
                            points,
                        };
                        buffer
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(snapshot);
                        true
                    }
                    Err(e) => {
                        error!(%domain, error = %e, "Unable to collect stats");
                        false
                    }
                }
            }
        });

        let results = join_all(samples).await;
        let collected = results.iter().filter(|ok| **ok).count();
        TickReport {
            collected,
            failed: results.len() - collected,
            time_interval,
        }
    }

    /// Copies the current buffer contents out.
    pub fn snapshots(&self) -> Vec<MetricSnapshot> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshots()
            .to_vec()
    }

    /// Number of snapshots collected so far.
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
