#[path = "../helpers/mod.rs"]
mod helpers;

use ciwatch::collector::{Scheduler, StatCollector, TickOrigin};
use ciwatch::core::Domain;
use helpers::fake_sources::{as_sources, recording_sources, RecordingSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};

const INTERVAL: Duration = Duration::from_millis(5000);

fn ms(values: &[u64]) -> Vec<Duration> {
    values.iter().map(|v| Duration::from_millis(*v)).collect()
}

#[tokio::test(start_paused = true)]
async fn ticks_fire_on_the_timeline() {
    let sources = recording_sources();
    let collector = Arc::new(StatCollector::new(as_sources(&sources)));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let origin = Instant::now();
    tokio::spawn(Scheduler::new(collector.clone(), INTERVAL).run(shutdown_rx));
    sleep(Duration::from_millis(10_001)).await;

    for source in &sources {
        assert_eq!(source.offsets_from(origin), ms(&[0, 5000, 10_000]));
    }
    assert_eq!(collector.len(), 12);

    let snapshots = collector.snapshots();
    for domain in Domain::ALL {
        let times: Vec<i64> = snapshots
            .iter()
            .filter(|s| s.domain == domain)
            .map(|s| s.time)
            .collect();
        assert_eq!(times.len(), 3);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }
}

#[tokio::test(start_paused = true)]
async fn triggered_tick_does_not_shift_the_timeline() {
    let sources = recording_sources();
    let collector = Arc::new(StatCollector::new(as_sources(&sources)));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let origin = Instant::now();
    tokio::spawn(Scheduler::new(collector.clone(), INTERVAL).run(shutdown_rx));

    sleep(Duration::from_millis(2000)).await;
    let report = collector.collect(TickOrigin::Triggered).await;
    assert_eq!(report.collected, 4);
    assert_eq!(collector.len(), 8);

    sleep(Duration::from_millis(8001)).await;

    let cpu = &sources[0];
    assert_eq!(cpu.offsets_from(origin), ms(&[0, 2000, 5000, 10_000]));
    let intervals: Vec<Duration> = cpu.calls().iter().map(|c| c.time_interval).collect();
    // The triggered tick resets the baseline used by the next scheduled one.
    assert_eq!(intervals, ms(&[0, 2000, 3000, 5000]));
}

#[tokio::test(start_paused = true)]
async fn slow_tick_delays_only_itself() {
    let slow = RecordingSource::slow_first_call(Domain::Cpu, Duration::from_millis(7000));
    let fast = RecordingSource::new(Domain::Memory);
    let collector = Arc::new(StatCollector::new(as_sources(&[slow.clone(), fast.clone()])));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let origin = Instant::now();
    tokio::spawn(Scheduler::new(collector.clone(), INTERVAL).run(shutdown_rx));
    sleep(Duration::from_millis(10_001)).await;

    // Tick 1 was due at 5000 while tick 0 was still running; it fires late
    // and tick 2 is back on its target.
    assert_eq!(fast.offsets_from(origin), ms(&[0, 7000, 10_000]));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_ticking() {
    let sources = recording_sources();
    let collector = Arc::new(StatCollector::new(as_sources(&sources)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(Scheduler::new(collector.clone(), INTERVAL).run(shutdown_rx));
    sleep(Duration::from_millis(1000)).await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    sleep(Duration::from_millis(20_000)).await;
    assert_eq!(collector.len(), 4);
}
