//! Drift-compensated periodic sampling.
//!
//! Tick `n` fires at `origin + n * interval`. The next fire time is derived
//! from the previous *target*, never from the moment a tick finished, so a
//! slow tick delays only itself and lag does not accumulate over a long job.
//! Out-of-band ticks go straight to the [`StatCollector`] and never touch the
//! timeline.

use super::{StatCollector, TickOrigin};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace};

/// Smallest interval the scheduler accepts.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A fixed schedule of tick targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeline {
    origin: Instant,
    interval: Duration,
}

impl Timeline {
    pub fn new(origin: Instant, interval: Duration) -> Self {
        Self {
            origin,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Target fire time of tick `n`.
    pub fn target(&self, n: u32) -> Instant {
        self.origin + self.interval * n
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Fires scheduled ticks on a [`StatCollector`] until shutdown.
pub struct Scheduler {
    collector: Arc<StatCollector>,
    interval: Duration,
}

impl Scheduler {
    pub fn new(collector: Arc<StatCollector>, interval: Duration) -> Self {
        Self {
            collector,
            interval: interval.max(MIN_INTERVAL),
        }
    }

    /// Returns a future that fires ticks until a shutdown signal is received.
    ///
    /// The first tick fires immediately.
    pub fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> impl Future<Output = ()> {
        async move {
            let timeline = Timeline::new(Instant::now(), self.interval);
            info!(
                interval_ms = timeline.interval().as_millis() as u64,
                "Stat collector scheduler started"
            );

            let mut tick: u32 = 0;
            loop {
                let target = timeline.target(tick);
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!("Scheduler received shutdown signal.");
                        break;
                    }
                    _ = sleep_until(target) => {}
                }

                let lag = Instant::now().saturating_duration_since(target);
                let report = self.collector.collect(TickOrigin::Scheduled).await;
                trace!(
                    tick,
                    lag_ms = lag.as_millis() as u64,
                    collected = report.collected,
                    failed = report.failed,
                    "Scheduled tick complete"
                );
                tick = tick.saturating_add(1);
            }
            info!("Stat collector scheduler finished.");
        }
    }
}
