//! Host observability and the system status report.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;

use crate::container::ContainerRuntimeApi;
use crate::session::SessionService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTimes {
    total: u64,
    idle: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostMetrics {
    pub cpu_percent: f64,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
    pub mem_available_bytes: u64,
}

#[derive(Debug, Clone)]
struct MemInfo {
    total_bytes: u64,
    available_bytes: u64,
}

pub async fn read_cpu_times() -> Result<CpuTimes> {
    let stat_contents = fs::read_to_string("/proc/stat")
        .await
        .context("reading /proc/stat")?;
    parse_cpu_times(&stat_contents)
}

pub async fn read_host_metrics(prev_cpu: Option<CpuTimes>) -> Result<(HostMetrics, CpuTimes)> {
    let mem_contents = fs::read_to_string("/proc/meminfo")
        .await
        .context("reading /proc/meminfo")?;

    let current_cpu = read_cpu_times().await?;
    let mem_info = parse_meminfo(&mem_contents)?;
    let cpu_percent = compute_cpu_percent(prev_cpu.as_ref(), &current_cpu);

    let used_bytes = mem_info
        .total_bytes
        .saturating_sub(mem_info.available_bytes);

    Ok((
        HostMetrics {
            cpu_percent,
            mem_total_bytes: mem_info.total_bytes,
            mem_used_bytes: used_bytes,
            mem_available_bytes: mem_info.available_bytes,
        },
        current_cpu,
    ))
}

pub async fn read_load_average() -> Result<[f64; 3]> {
    let contents = fs::read_to_string("/proc/loadavg")
        .await
        .context("reading /proc/loadavg")?;
    parse_loadavg(&contents)
}

fn parse_cpu_times(contents: &str) -> Result<CpuTimes> {
    let line = contents
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("missing cpu line in /proc/stat")?;

    let mut parts = line.split_whitespace();
    let _ = parts.next();
    let values: Vec<u64> = parts
        .map(|value| value.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("parsing cpu times")?;

    if values.len() < 4 {
        return Err(anyhow::anyhow!("cpu stats line missing expected fields"));
    }

    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    let total = values.iter().sum();

    Ok(CpuTimes { total, idle })
}

fn parse_meminfo(contents: &str) -> Result<MemInfo> {
    let mut total_kb = None;
    let mut available_kb = None;

    for line in contents.lines() {
        if line.starts_with("MemTotal:") {
            total_kb = parse_meminfo_kb(line);
        } else if line.starts_with("MemAvailable:") {
            available_kb = parse_meminfo_kb(line);
        }
    }

    let total_kb = total_kb.context("missing MemTotal in /proc/meminfo")?;
    let available_kb = available_kb.context("missing MemAvailable in /proc/meminfo")?;

    Ok(MemInfo {
        total_bytes: total_kb.saturating_mul(1024),
        available_bytes: available_kb.saturating_mul(1024),
    })
}

fn parse_meminfo_kb(line: &str) -> Option<u64> {
    line.split_whitespace().nth(1)?.parse::<u64>().ok()
}

fn parse_loadavg(contents: &str) -> Result<[f64; 3]> {
    let mut values = contents.split_whitespace().map(|v| v.parse::<f64>());
    let mut next = || -> Result<f64> {
        values
            .next()
            .context("missing field in /proc/loadavg")?
            .context("parsing /proc/loadavg")
    };
    Ok([next()?, next()?, next()?])
}

fn compute_cpu_percent(prev: Option<&CpuTimes>, current: &CpuTimes) -> f64 {
    let Some(prev) = prev else {
        return 0.0;
    };

    let total_delta = current.total.saturating_sub(prev.total);
    let idle_delta = current.idle.saturating_sub(prev.idle);
    if total_delta == 0 {
        return 0.0;
    }

    let busy_delta = total_delta.saturating_sub(idle_delta);
    (busy_delta as f64 / total_delta as f64) * 100.0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerCounts {
    pub running: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub timestamp: DateTime<Utc>,
    pub host: Option<HostMetrics>,
    pub load_average: Option<[f64; 3]>,
    pub containers: ContainerCounts,
    pub active_sessions: usize,
    pub max_sessions: usize,
    /// One entry per part that could not be collected.
    pub errors: Vec<String>,
}

/// Collects [`SystemStatus`]. Every part degrades on its own; the report
/// itself never fails.
pub struct SystemStatusReporter {
    runtime: Arc<dyn ContainerRuntimeApi>,
    name_prefix: String,
    prev_cpu: Mutex<Option<CpuTimes>>,
}

impl SystemStatusReporter {
    pub fn new(runtime: Arc<dyn ContainerRuntimeApi>, name_prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            name_prefix: name_prefix.into(),
            prev_cpu: Mutex::new(None),
        }
    }

    fn take_prev_cpu(&self) -> Option<CpuTimes> {
        self.prev_cpu
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_prev_cpu(&self, cpu: CpuTimes) {
        *self.prev_cpu.lock().unwrap_or_else(|e| e.into_inner()) = Some(cpu);
    }

    async fn host_metrics(&self) -> Result<HostMetrics> {
        let prev = match self.take_prev_cpu() {
            Some(prev) => prev,
            None => {
                // No earlier sample: take a short baseline so the first
                // report carries a real utilisation figure.
                let baseline = read_cpu_times().await?;
                tokio::time::sleep(Duration::from_millis(200)).await;
                baseline
            }
        };
        let (metrics, current) = read_host_metrics(Some(prev)).await?;
        self.store_prev_cpu(current);
        Ok(metrics)
    }

    pub async fn system_status(&self, sessions: &SessionService) -> SystemStatus {
        let mut errors = Vec::new();

        let host = match self.host_metrics().await {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                log::debug!("Host metrics unavailable: {:#}", e);
                errors.push(format!("host metrics unavailable: {}", e));
                None
            }
        };

        let load_average = match read_load_average().await {
            Ok(load) => Some(load),
            Err(e) => {
                errors.push(format!("load average unavailable: {}", e));
                None
            }
        };

        let prefix = format!("{}-", self.name_prefix);
        let containers = match self.runtime.list_containers(true, Some(&prefix)).await {
            Ok(list) => ContainerCounts {
                running: list.iter().filter(|c| c.is_running()).count(),
                total: list.len(),
            },
            Err(e) => {
                log::warn!("Failed to list containers for status: {}", e);
                errors.push(format!("container engine unavailable: {}", e));
                ContainerCounts::default()
            }
        };

        SystemStatus {
            timestamp: Utc::now(),
            host,
            load_average,
            containers,
            active_sessions: sessions.session_count(),
            max_sessions: sessions.config().max_sessions,
            errors,
        }
    }
}
