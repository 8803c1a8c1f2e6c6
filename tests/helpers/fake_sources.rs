#![allow(dead_code)]
//! Metric sources that record when and how they were sampled.

use async_trait::async_trait;
use ciwatch::collector::SampleError;
use ciwatch::core::{Domain, MetricSource, Point};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// One recorded `sample` call.
#[derive(Debug, Clone, Copy)]
pub struct SampleCall {
    pub at: Instant,
    pub time_interval: Duration,
}

pub struct RecordingSource {
    domain: Domain,
    calls: Mutex<Vec<SampleCall>>,
    /// Extra latency applied to the first call only.
    first_call_delay: Option<Duration>,
}

impl RecordingSource {
    pub fn new(domain: Domain) -> Arc<Self> {
        Arc::new(Self {
            domain,
            calls: Mutex::new(Vec::new()),
            first_call_delay: None,
        })
    }

    pub fn slow_first_call(domain: Domain, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            domain,
            calls: Mutex::new(Vec::new()),
            first_call_delay: Some(delay),
        })
    }

    pub fn calls(&self) -> Vec<SampleCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Offsets of every call from `origin`.
    pub fn offsets_from(&self, origin: Instant) -> Vec<Duration> {
        self.calls().iter().map(|c| c.at - origin).collect()
    }
}

#[async_trait]
impl MetricSource for RecordingSource {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn sample(&self, time_interval: Duration) -> Result<Vec<Point>, SampleError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(SampleCall {
                at: Instant::now(),
                time_interval,
            });
            calls.len()
        };
        if call_index == 1 {
            if let Some(delay) = self.first_call_delay {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(vec![Point::new(
            &format!("{}.calls", self.domain.group()),
            "",
            "Number of samples taken",
            call_index as f64,
        )])
    }
}

/// A source whose every query fails.
pub struct FailingSource(pub Domain);

#[async_trait]
impl MetricSource for FailingSource {
    fn domain(&self) -> Domain {
        self.0
    }

    async fn sample(&self, _: Duration) -> Result<Vec<Point>, SampleError> {
        Err(SampleError::Query {
            domain: self.0,
            reason: "simulated failure".to_string(),
        })
    }
}

/// A source that samples once, then panics on every later call.
pub struct PanickingSource {
    domain: Domain,
    calls: AtomicUsize,
}

impl PanickingSource {
    pub fn new(domain: Domain) -> Arc<Self> {
        Arc::new(Self {
            domain,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MetricSource for PanickingSource {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn sample(&self, _: Duration) -> Result<Vec<Point>, SampleError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            panic!("sampler for {} blew up", self.domain);
        }
        Ok(vec![Point::new("ok", "", "First sample", 1.0)])
    }
}

/// One recording source per domain.
pub fn recording_sources() -> Vec<Arc<RecordingSource>> {
    Domain::ALL.iter().map(|d| RecordingSource::new(*d)).collect()
}

pub fn as_sources(sources: &[Arc<RecordingSource>]) -> Vec<Arc<dyn MetricSource>> {
    sources
        .iter()
        .map(|s| s.clone() as Arc<dyn MetricSource>)
        .collect()
}
