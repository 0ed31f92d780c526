//! Resource monitor (§4.B): samples CPU/RAM/VRAM/disk at a configurable
//! cadence, caches the snapshot behind a mutex, and flags VRAM pressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::System;
use tracing::debug;

use crate::gpu_telemetry::{detect_provider, GpuTelemetryProvider};

/// VRAM usage above this percentage sets [`ResourceMonitor::vram_critical`].
pub const VRAM_CRITICAL_PCT: f64 = 90.0;
/// VRAM usage above this percentage sets [`ResourceMonitor::vram_dangerous`].
pub const VRAM_DANGEROUS_PCT: f64 = 95.0;

/// A point-in-time snapshot of system resource usage (§3 `SystemMetrics`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMetrics {
    pub cpu_usage_pct: f64,
    pub cpu_core_count: u32,
    pub available_cores: u32,
    pub total_ram: u64,
    pub used_ram: u64,
    pub available_ram: u64,
    pub ram_usage_pct: f64,
    pub gpu_usage_pct: f64,
    pub total_vram: u64,
    pub used_vram: u64,
    pub available_vram: u64,
    pub vram_usage_pct: f64,
    pub disk_read_bps: u64,
    pub disk_write_bps: u64,
    pub disk_read_ops: u64,
    pub disk_write_ops: u64,
    pub timestamp_secs: u64,
    pub valid: bool,
}

/// Fraction of total VRAM held back as a baseline the monitor never
/// reports as available (driver overhead, display framebuffers).
const VRAM_BASELINE_FRACTION: f64 = 0.20;
/// Additional safety margin subtracted from the remaining headroom.
const VRAM_SAFETY_MARGIN_FRACTION: f64 = 0.10;

struct DiskSample {
    read_bytes: u64,
    write_bytes: u64,
    read_ops: u64,
    write_ops: u64,
    at: std::time::Instant,
}

pub struct ResourceMonitor {
    system: Mutex<System>,
    gpu_provider: Option<Box<dyn GpuTelemetryProvider>>,
    current: Mutex<SystemMetrics>,
    last_disk_sample: Mutex<Option<DiskSample>>,
    vram_critical: AtomicBool,
    vram_dangerous: AtomicBool,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new_all();
        system.refresh_all();
        ResourceMonitor {
            system: Mutex::new(system),
            gpu_provider: detect_provider(),
            current: Mutex::new(SystemMetrics::default()),
            last_disk_sample: Mutex::new(None),
            vram_critical: AtomicBool::new(false),
            vram_dangerous: AtomicBool::new(false),
        }
    }

    /// Re-sample everything and update the cached snapshot.
    pub fn refresh(&self) -> SystemMetrics {
        let mut system = self.system.lock().expect("resource monitor mutex poisoned");
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_core_count = system.cpus().len().max(1) as u32;
        let cpu_usage_pct = (system.global_cpu_info().cpu_usage() as f64).clamp(0.0, 100.0);
        let available_cores = (((100.0 - cpu_usage_pct) / 100.0) * cpu_core_count as f64).floor() as u32;

        let total_ram = system.total_memory();
        let mut used_ram = system.used_memory();
        if used_ram > total_ram {
            used_ram = total_ram;
        }
        let available_ram = total_ram.saturating_sub(used_ram);
        let ram_usage_pct = percent(used_ram, total_ram);

        let (gpu_usage_pct, total_vram, used_vram) = self
            .gpu_provider
            .as_ref()
            .and_then(|p| p.query())
            .unwrap_or((0.0, 0, 0));
        let available_vram = available_vram_for(total_vram, used_vram);
        let vram_usage_pct = percent(used_vram, total_vram);

        let (disk_read_bps, disk_write_bps, disk_read_ops, disk_write_ops) = self.sample_disk();

        let timestamp_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let metrics = SystemMetrics {
            cpu_usage_pct,
            cpu_core_count,
            available_cores,
            total_ram,
            used_ram,
            available_ram,
            ram_usage_pct,
            gpu_usage_pct,
            total_vram,
            used_vram,
            available_vram,
            vram_usage_pct,
            disk_read_bps,
            disk_write_bps,
            disk_read_ops,
            disk_write_ops,
            timestamp_secs,
            valid: true,
        };

        self.vram_critical.store(vram_usage_pct > VRAM_CRITICAL_PCT, Ordering::Relaxed);
        self.vram_dangerous.store(vram_usage_pct > VRAM_DANGEROUS_PCT, Ordering::Relaxed);

        *self.current.lock().expect("resource monitor mutex poisoned") = metrics;
        debug!(cpu = cpu_usage_pct, ram = ram_usage_pct, vram = vram_usage_pct, "metrics refreshed");
        metrics
    }

    /// Return the cached snapshot without sampling again.
    pub fn current(&self) -> SystemMetrics {
        *self.current.lock().expect("resource monitor mutex poisoned")
    }

    pub fn vram_critical(&self) -> bool {
        self.vram_critical.load(Ordering::Relaxed)
    }

    pub fn vram_dangerous(&self) -> bool {
        self.vram_dangerous.load(Ordering::Relaxed)
    }

    #[cfg(target_os = "linux")]
    fn sample_disk(&self) -> (u64, u64, u64, u64) {
        let Some((read_bytes, write_bytes, read_ops, write_ops)) = read_proc_diskstats() else {
            return (0, 0, 0, 0);
        };
        let now = std::time::Instant::now();
        let mut guard = self.last_disk_sample.lock().expect("disk sample mutex poisoned");
        let result = match guard.as_ref() {
            Some(prev) => {
                let elapsed = now.duration_since(prev.at).as_secs_f64().max(0.001);
                (
                    ((read_bytes.saturating_sub(prev.read_bytes)) as f64 / elapsed) as u64,
                    ((write_bytes.saturating_sub(prev.write_bytes)) as f64 / elapsed) as u64,
                    read_ops.saturating_sub(prev.read_ops),
                    write_ops.saturating_sub(prev.write_ops),
                )
            }
            None => (0, 0, 0, 0),
        };
        *guard = Some(DiskSample { read_bytes, write_bytes, read_ops, write_ops, at: now });
        result
    }

    #[cfg(not(target_os = "linux"))]
    fn sample_disk(&self) -> (u64, u64, u64, u64) {
        (0, 0, 0, 0)
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (100.0 * used as f64 / total as f64).clamp(0.0, 100.0)
}

fn available_vram_for(total_vram: u64, used_vram: u64) -> u64 {
    if total_vram == 0 {
        return 0;
    }
    let baseline = (total_vram as f64 * VRAM_BASELINE_FRACTION) as u64;
    let raw_available = total_vram.saturating_sub(used_vram);
    let after_baseline = raw_available.saturating_sub(baseline);
    let margin = (total_vram as f64 * VRAM_SAFETY_MARGIN_FRACTION) as u64;
    after_baseline.saturating_sub(margin)
}

/// Read `/proc/diskstats` and sum reads/writes (sectors × 512) and op
/// counts across all block devices (§4.B).
#[cfg(target_os = "linux")]
fn read_proc_diskstats() -> Option<(u64, u64, u64, u64)> {
    const SECTOR_BYTES: u64 = 512;
    let text = std::fs::read_to_string("/proc/diskstats").ok()?;
    let mut read_sectors = 0u64;
    let mut write_sectors = 0u64;
    let mut read_ops = 0u64;
    let mut write_ops = 0u64;
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // fields[3]=reads completed, [5]=sectors read, [7]=writes completed, [9]=sectors written
        if fields.len() < 10 {
            continue;
        }
        read_ops += fields[3].parse::<u64>().unwrap_or(0);
        read_sectors += fields[5].parse::<u64>().unwrap_or(0);
        write_ops += fields[7].parse::<u64>().unwrap_or(0);
        write_sectors += fields[9].parse::<u64>().unwrap_or(0);
    }
    Some((read_sectors * SECTOR_BYTES, write_sectors * SECTOR_BYTES, read_ops, write_ops))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn available_vram_clamps_to_zero_when_baseline_overflows() {
        assert_eq!(available_vram_for(1000, 950), 0);
    }

    #[test]
    fn available_vram_subtracts_baseline_and_margin() {
        // total=1000: baseline=200, margin=100, raw_available=1000-100=900
        let avail = available_vram_for(1000, 100);
        assert_eq!(avail, 900 - 200 - 100);
    }

    #[test]
    fn percent_clamps_used_greater_than_total() {
        assert_eq!(percent(150, 100), 100.0);
    }

    #[test]
    fn refresh_produces_valid_metrics() {
        let monitor = ResourceMonitor::new();
        let metrics = monitor.refresh();
        assert!(metrics.valid);
        assert!(metrics.used_ram <= metrics.total_ram);
    }
}
