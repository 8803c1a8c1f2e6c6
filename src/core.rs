//! Core domain types and service traits for ciwatch
//!
//! This module defines the wire data structures exchanged between the
//! daemon, the orchestrator and the remote collector, plus the trait
//! contracts for the collaborators each component talks to (system sampling,
//! job listing, trace decoding, key issuance and delivery).

use crate::{collector::SampleError, identity::ListJobsError, reporter::ReportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, io::BufRead, time::Duration};

/// Version tag of the metric payload wire format.
pub const METRIC_PAYLOAD_VERSION: &str = "v1";
/// Version tag of the process payload wire format.
pub const PROCESS_PAYLOAD_VERSION: &str = "v1";

/// A resource domain sampled by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Cpu,
    Memory,
    Network,
    Disk,
}

impl Domain {
    /// Every domain, in the order a tick samples them.
    pub const ALL: [Domain; 4] = [Domain::Cpu, Domain::Memory, Domain::Network, Domain::Disk];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Cpu => "cpu",
            Domain::Memory => "memory",
            Domain::Network => "network",
            Domain::Disk => "disk",
        }
    }

    /// The single snapshot group emitted for this domain.
    pub fn group(&self) -> &'static str {
        match self {
            Domain::Cpu => "cpu.load",
            Domain::Memory => "memory.usage",
            Domain::Network => "network.io",
            Domain::Disk => "disk.io",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named measurement inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub name: String,
    pub unit: String,
    pub description: String,
    pub value: f64,
}

impl Point {
    pub fn new(name: &str, unit: &str, description: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            unit: unit.to_string(),
            description: description.to_string(),
            value,
        }
    }
}

/// One timestamped measurement of a resource domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub domain: Domain,
    pub group: String,
    /// Collection time in epoch milliseconds.
    pub time: i64,
    /// Points in emission order. Never empty for a collected snapshot.
    pub points: Vec<Point>,
}

/// A command observed by the process tracer, from exec to exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedCommand {
    pub ts: String,
    pub event: String,
    pub name: String,
    pub uid: u32,
    pub pid: u32,
    pub ppid: String,
    pub start_time: i64,
    pub file_name: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run time in milliseconds.
    pub duration: i64,
    pub exit_code: i32,
}

/// The telemetry carried by an envelope, tagged for forward compatibility.
///
/// Serializes as `{"type": "Metric"|"Process", "version": .., "data": [..]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryData {
    Metric {
        version: String,
        data: Vec<MetricSnapshot>,
    },
    Process {
        version: String,
        data: Vec<CompletedCommand>,
    },
}

impl TelemetryData {
    /// Builds a `Metric` payload at the current wire version.
    pub fn metric(data: Vec<MetricSnapshot>) -> Self {
        TelemetryData::Metric {
            version: METRIC_PAYLOAD_VERSION.to_string(),
            data,
        }
    }

    /// Builds a `Process` payload at the current wire version.
    pub fn process(data: Vec<CompletedCommand>) -> Self {
        TelemetryData::Process {
            version: PROCESS_PAYLOAD_VERSION.to_string(),
            data,
        }
    }

    /// Number of records carried.
    pub fn len(&self) -> usize {
        match self {
            TelemetryData::Metric { data, .. } => data.len(),
            TelemetryData::Process { data, .. } => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The collector endpoint this payload is submitted to.
    pub fn endpoint(&self) -> TelemetryEndpoint {
        match self {
            TelemetryData::Metric { .. } => TelemetryEndpoint::Metrics,
            TelemetryData::Process { .. } => TelemetryEndpoint::Processes,
        }
    }
}

/// Versioned submission endpoints of the remote collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEndpoint {
    Metrics,
    Processes,
}

impl TelemetryEndpoint {
    /// Path relative to the collector base URL.
    pub fn path(&self) -> String {
        match self {
            TelemetryEndpoint::Metrics => format!("api/{}/telemetry/metrics", METRIC_PAYLOAD_VERSION),
            TelemetryEndpoint::Processes => {
                format!("api/{}/telemetry/processes", PROCESS_PAYLOAD_VERSION)
            }
        }
    }
}

/// Identity of the upstream job record for this execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// The listing API refused access. Distinct from "not found".
    #[serde(default)]
    pub not_accessible: bool,
}

/// A job entry as returned by the upstream job-listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub runner_name: Option<String>,
}

/// Run metadata attached to every outgoing envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub ci_provider: String,
    pub run_id: u64,
    pub repo_name: String,
    pub repo_owner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_attempt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

/// The wire unit sent to the remote collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEnvelope {
    pub meta_data: RunMetadata,
    pub telemetry_data: TelemetryData,
}

// =============================================================================
// Service traits
// =============================================================================

/// A query against the operating system for one resource domain.
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// The domain this source samples.
    fn domain(&self) -> Domain;

    /// Takes one sample. `time_interval` is the time since the previous tick,
    /// zero on the first tick.
    async fn sample(&self, time_interval: Duration) -> Result<Vec<Point>, SampleError>;
}

/// One page of the upstream job listing for the current run.
#[async_trait]
pub trait JobListing: Send + Sync {
    async fn list_jobs(&self, page: u32, per_page: u32) -> Result<Vec<WorkflowJob>, ListJobsError>;
}

/// Turns raw tracer output into completed-command records, in emission order.
pub trait TraceDecoder: Send + Sync {
    fn decode(&self, reader: &mut dyn BufRead) -> std::io::Result<Vec<CompletedCommand>>;
}

/// Obtains the collector API key, possibly over the network.
#[async_trait]
pub trait ApiKeyProvider: Send + Sync {
    async fn api_key(&self) -> Option<String>;
}

/// Delivers a serialized envelope to the remote collector.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, envelope: &TelemetryEnvelope, api_key: &str) -> Result<(), ReportError>;
}
