//! Host gauges attached to heartbeats. Read from `/proc` on Linux; every
//! other platform reports zeros.

use std::time::Duration;

/// Window over which CPU usage is measured.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HostGauges {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub uptime_secs: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

pub async fn sample() -> HostGauges {
    #[cfg(target_os = "linux")]
    {
        let cpu_usage = match read_cpu_times() {
            Some(before) => {
                tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
                read_cpu_times()
                    .map(|after| cpu_percent(before, after))
                    .unwrap_or(0.0)
            }
            None => 0.0,
        };
        let memory_usage = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|contents| parse_memory_percent(&contents))
            .unwrap_or(0.0);
        let uptime_secs = std::fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|contents| parse_uptime(&contents))
            .unwrap_or(0);
        HostGauges {
            cpu_usage,
            memory_usage,
            uptime_secs,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = CPU_SAMPLE_WINDOW;
        HostGauges::default()
    }
}

#[cfg(target_os = "linux")]
fn read_cpu_times() -> Option<CpuTimes> {
    let contents = std::fs::read_to_string("/proc/stat").ok()?;
    parse_cpu_times(&contents)
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|line| line.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|value| value.parse().ok())
        .collect();
    if values.len() < 4 {
        return None;
    }
    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        idle,
        total: values.iter().sum(),
    })
}

fn cpu_percent(before: CpuTimes, after: CpuTimes) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let idle = after.idle.saturating_sub(before.idle).min(total);
    (total - idle) as f64 * 100.0 / total as f64
}

fn parse_memory_percent(meminfo: &str) -> Option<f64> {
    let field = |name: &str| -> Option<u64> {
        meminfo
            .lines()
            .find(|line| line.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    if total == 0 {
        return None;
    }
    let available = field("MemAvailable:")?;
    Some(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

fn parse_uptime(contents: &str) -> Option<u64> {
    let first = contents.split_whitespace().next()?;
    let secs = first.split_once('.').map_or(first, |(secs, _)| secs);
    secs.parse().ok()
}
