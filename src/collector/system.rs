//! # System Sample Sources
//!
//! The production [`MetricSource`] implementations. CPU load, memory and
//! network come from the `sysinfo` crate; the user/system CPU split and disk
//! throughput are read from `/proc/stat` and `/proc/diskstats` on Linux.
//!
//! Every query runs on the blocking pool so one slow source cannot stall
//! the others in the same tick. Throughput sources keep the previous
//! counters and report the delta since the last tick.

use super::SampleError;
use crate::core::{Domain, MetricSource, Point};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use sysinfo::{Networks, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const SECTOR_SIZE: u64 = 512;

/// The four sources a daemon samples on every tick.
pub fn default_sources() -> Vec<Arc<dyn MetricSource>> {
    vec![
        Arc::new(CpuSource::new()),
        Arc::new(MemorySource::new()),
        Arc::new(NetworkSource::new()),
        Arc::new(DiskSource::new()),
    ]
}

fn whole_megabytes(bytes: u64) -> f64 {
    (bytes as f64 / BYTES_PER_MB).floor()
}

async fn run_blocking<T, F>(domain: Domain, query: F) -> Result<T, SampleError>
where
    F: FnOnce() -> Result<T, SampleError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(query)
        .await
        .map_err(|e| SampleError::Task {
            domain,
            reason: e.to_string(),
        })?
}

// =============================================================================
// CPU
// =============================================================================

/// Aggregate CPU tick counters from the `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    /// Parses the aggregate `cpu` line out of `/proc/stat` contents.
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let mut fields = line.split_whitespace().skip(1);
        let mut next = || fields.next().and_then(|v| v.parse::<u64>().ok());
        Some(Self {
            user: next()?,
            nice: next()?,
            system: next()?,
            idle: next()?,
            iowait: next().unwrap_or(0),
            irq: next().unwrap_or(0),
            softirq: next().unwrap_or(0),
            steal: next().unwrap_or(0),
        })
    }

    fn read() -> Option<Self> {
        std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| Self::parse(&s))
    }

    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// User and system load percentages since `prev` (since boot when `None`).
    pub fn load_since(&self, prev: Option<&CpuTimes>) -> (f64, f64) {
        let prev = prev.copied().unwrap_or_default();
        let total = self.total().saturating_sub(prev.total());
        if total == 0 {
            return (0.0, 0.0);
        }
        let user = (self.user + self.nice).saturating_sub(prev.user + prev.nice);
        let system = (self.system + self.irq + self.softirq)
            .saturating_sub(prev.system + prev.irq + prev.softirq);
        (
            user as f64 / total as f64 * 100.0,
            system as f64 / total as f64 * 100.0,
        )
    }
}

struct CpuState {
    system: System,
    prev_times: Option<CpuTimes>,
}

/// CPU load, total plus the user/system split where the kernel exposes it.
pub struct CpuSource {
    state: Arc<Mutex<CpuState>>,
}

impl CpuSource {
    pub fn new() -> Self {
        let mut system = System::new();
        // Usage is computed between refreshes; prime the first one.
        system.refresh_cpu();
        Self {
            state: Arc::new(Mutex::new(CpuState {
                system,
                prev_times: CpuTimes::read(),
            })),
        }
    }
}

impl Default for CpuSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for CpuSource {
    fn domain(&self) -> Domain {
        Domain::Cpu
    }

    async fn sample(&self, _time_interval: Duration) -> Result<Vec<Point>, SampleError> {
        let state = self.state.clone();
        run_blocking(Domain::Cpu, move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.system.refresh_cpu();
            let total = state.system.global_cpu_info().cpu_usage() as f64;

            let mut points = vec![Point::new("cpu.load.total", "%", "Total CPU load", total)];
            if let Some(current) = CpuTimes::read() {
                let prev = state.prev_times.replace(current);
                let (user, system) = current.load_since(prev.as_ref());
                points.push(Point::new("cpu.load.user", "%", "User CPU load", user));
                points.push(Point::new("cpu.load.system", "%", "System CPU load", system));
            }
            Ok(points)
        })
        .await
    }
}

// =============================================================================
// Memory
// =============================================================================

/// Total, active and available memory in megabytes.
pub struct MemorySource {
    system: Arc<Mutex<System>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for MemorySource {
    fn domain(&self) -> Domain {
        Domain::Memory
    }

    async fn sample(&self, _time_interval: Duration) -> Result<Vec<Point>, SampleError> {
        let system = self.system.clone();
        run_blocking(Domain::Memory, move || {
            let mut system = system.lock().unwrap_or_else(PoisonError::into_inner);
            system.refresh_memory();
            let total = system.total_memory();
            if total == 0 {
                return Err(SampleError::Query {
                    domain: Domain::Memory,
                    reason: "total memory reported as zero".to_string(),
                });
            }
            Ok(vec![
                Point::new(
                    "memory.usage.total",
                    "MB",
                    "Total memory",
                    total as f64 / BYTES_PER_MB,
                ),
                Point::new(
                    "memory.usage.active",
                    "MB",
                    "Memory in use",
                    system.used_memory() as f64 / BYTES_PER_MB,
                ),
                Point::new(
                    "memory.usage.available",
                    "MB",
                    "Memory available for new allocations",
                    system.available_memory() as f64 / BYTES_PER_MB,
                ),
            ])
        })
        .await
    }
}

// =============================================================================
// Network
// =============================================================================

/// Bytes received and transmitted across all interfaces since the last tick.
pub struct NetworkSource {
    networks: Arc<Mutex<Networks>>,
}

impl NetworkSource {
    pub fn new() -> Self {
        Self {
            networks: Arc::new(Mutex::new(Networks::new_with_refreshed_list())),
        }
    }
}

impl Default for NetworkSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for NetworkSource {
    fn domain(&self) -> Domain {
        Domain::Network
    }

    async fn sample(&self, time_interval: Duration) -> Result<Vec<Point>, SampleError> {
        let networks = self.networks.clone();
        run_blocking(Domain::Network, move || {
            let mut networks = networks.lock().unwrap_or_else(PoisonError::into_inner);
            networks.refresh();
            let (rx, tx) = networks
                .iter()
                .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                    (rx + data.received(), tx + data.transmitted())
                });
            // No baseline on the first tick.
            let (rx, tx) = if time_interval.is_zero() { (0, 0) } else { (rx, tx) };
            Ok(vec![
                Point::new("network.io.rxMb", "MB", "Data received", whole_megabytes(rx)),
                Point::new("network.io.txMb", "MB", "Data transmitted", whole_megabytes(tx)),
            ])
        })
        .await
    }
}

// =============================================================================
// Disk
// =============================================================================

/// Sector counters summed over whole block devices from `/proc/diskstats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskCounters {
    pub sectors_read: u64,
    pub sectors_written: u64,
}

impl DiskCounters {
    /// Sums the counters of every device accepted by `is_whole_disk`.
    /// Loop, ram and device-mapper devices are always skipped.
    pub fn parse(diskstats: &str, is_whole_disk: impl Fn(&str) -> bool) -> Self {
        diskstats
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 10 {
                    return None;
                }
                let device = fields[2];
                if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
                    return None;
                }
                if !is_whole_disk(device) {
                    return None;
                }
                Some(DiskCounters {
                    sectors_read: fields[5].parse().unwrap_or(0),
                    sectors_written: fields[9].parse().unwrap_or(0),
                })
            })
            .fold(DiskCounters::default(), |acc, c| DiskCounters {
                sectors_read: acc.sectors_read + c.sectors_read,
                sectors_written: acc.sectors_written + c.sectors_written,
            })
    }

    fn read() -> Result<Self, SampleError> {
        if !cfg!(target_os = "linux") {
            return Err(SampleError::Unsupported(Domain::Disk));
        }
        let content = std::fs::read_to_string("/proc/diskstats").map_err(|e| SampleError::Query {
            domain: Domain::Disk,
            reason: e.to_string(),
        })?;
        // Partitions have no entry of their own under /sys/block.
        Ok(Self::parse(&content, |device| {
            Path::new("/sys/block").join(device).exists()
        }))
    }

    /// Bytes read and written since `prev`.
    pub fn bytes_since(&self, prev: &DiskCounters) -> (u64, u64) {
        (
            self.sectors_read.saturating_sub(prev.sectors_read) * SECTOR_SIZE,
            self.sectors_written.saturating_sub(prev.sectors_written) * SECTOR_SIZE,
        )
    }
}

/// Bytes read from and written to block devices since the last tick.
pub struct DiskSource {
    prev: Arc<Mutex<Option<DiskCounters>>>,
}

impl DiskSource {
    pub fn new() -> Self {
        Self {
            prev: Arc::new(Mutex::new(DiskCounters::read().ok())),
        }
    }
}

impl Default for DiskSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricSource for DiskSource {
    fn domain(&self) -> Domain {
        Domain::Disk
    }

    async fn sample(&self, time_interval: Duration) -> Result<Vec<Point>, SampleError> {
        let prev = self.prev.clone();
        run_blocking(Domain::Disk, move || {
            let current = DiskCounters::read()?;
            let mut prev = prev.lock().unwrap_or_else(PoisonError::into_inner);
            let (read, written) = match prev.replace(current) {
                Some(p) if !time_interval.is_zero() => current.bytes_since(&p),
                _ => (0, 0),
            };
            Ok(vec![
                Point::new("disk.io.rxMb", "MB", "Data read from disk", whole_megabytes(read)),
                Point::new("disk.io.wxMb", "MB", "Data written to disk", whole_megabytes(written)),
            ])
        })
        .await
    }
}
