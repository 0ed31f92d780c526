//! Performance profiler (§4.C): learns a per-operation-type resource
//! profile from an exponential moving average and persists it to a
//! simple CSV-like text file.

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;
use pie4k_shared::error::{Pie4kError, Result};
use tracing::{debug, warn};

/// An operation type must reach this many recorded samples before its
/// profile is considered learned.
pub const MIN_SAMPLES_FOR_LEARNING: u32 = 1;
/// EMA smoothing factor applied to every sample after the first.
pub const LEARNING_RATE: f64 = 0.1;
/// Ring buffer depth kept per operation type for diagnostics.
pub const MAX_RECENT_SAMPLES: usize = 100;
/// Profiles untouched for this long are purged during housekeeping.
pub const PROFILE_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Sample {
    ram_bytes: u64,
    vram_bytes: u64,
    cpu_pct: f64,
    success: bool,
}

/// Learned resource profile for one `operation_type` (§3 `ResourceProfile`).
#[derive(Debug, Clone)]
pub struct ResourceProfile {
    pub operation_type: String,
    pub avg_ram_bytes: u64,
    pub avg_vram_bytes: u64,
    pub avg_cpu_pct: f64,
    pub sample_count: u32,
    pub total_execution_time: Duration,
    pub optimal_concurrency: u32,
    pub learned: bool,
    pub last_updated: u64,
    recent: VecDeque<Sample>,
}

impl ResourceProfile {
    fn new(operation_type: String) -> Self {
        ResourceProfile {
            operation_type,
            avg_ram_bytes: 0,
            avg_vram_bytes: 0,
            avg_cpu_pct: 0.0,
            sample_count: 0,
            total_execution_time: Duration::ZERO,
            optimal_concurrency: 1,
            learned: false,
            last_updated: now_secs(),
            recent: VecDeque::with_capacity(MAX_RECENT_SAMPLES),
        }
    }

    fn record(&mut self, execution_time: Duration, ram_bytes: u64, vram_bytes: u64, cpu_pct: f64, success: bool) {
        if self.recent.len() >= MAX_RECENT_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back(Sample { ram_bytes, vram_bytes, cpu_pct, success });

        if self.sample_count == 0 {
            self.avg_ram_bytes = ram_bytes;
            self.avg_vram_bytes = vram_bytes;
            self.avg_cpu_pct = cpu_pct;
        } else {
            self.avg_ram_bytes = ema(self.avg_ram_bytes as f64, ram_bytes as f64) as u64;
            self.avg_vram_bytes = ema(self.avg_vram_bytes as f64, vram_bytes as f64) as u64;
            self.avg_cpu_pct = ema(self.avg_cpu_pct, cpu_pct);
        }
        self.sample_count += 1;
        self.total_execution_time += execution_time;
        self.last_updated = now_secs();
        let _ = success;
    }

    /// Compute `optimal_concurrency` once, from the learned VRAM cost
    /// and the configured VRAM budget. Never recalculated afterward.
    fn learn_if_ready(&mut self, max_vram_budget_bytes: u64) {
        if self.learned || self.sample_count < MIN_SAMPLES_FOR_LEARNING {
            return;
        }
        self.learned = true;
        if self.avg_vram_bytes > 0 {
            self.optimal_concurrency = (max_vram_budget_bytes / self.avg_vram_bytes).max(1) as u32;
        } else {
            self.optimal_concurrency = 1;
        }
    }
}

fn ema(current: f64, sample: f64) -> f64 {
    current + LEARNING_RATE * (sample - current)
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// Owns every operation type's [`ResourceProfile`]; thread-safe via an
/// internal mutex.
pub struct PerformanceProfiler {
    profiles: Mutex<HashMap<String, ResourceProfile>>,
    max_vram_budget_bytes: u64,
}

impl PerformanceProfiler {
    pub fn new(max_vram_budget_bytes: u64) -> Self {
        PerformanceProfiler {
            profiles: Mutex::new(HashMap::new()),
            max_vram_budget_bytes,
        }
    }

    pub fn record(
        &self,
        operation_type: &str,
        execution_time: Duration,
        delta_ram_bytes: u64,
        delta_vram_bytes: u64,
        cpu_pct: f64,
        success: bool,
        save_profile: bool,
    ) {
        if !save_profile {
            return;
        }
        let mut profiles = self.profiles.lock().expect("profiler mutex poisoned");
        let profile = profiles
            .entry(operation_type.to_string())
            .or_insert_with(|| ResourceProfile::new(operation_type.to_string()));
        profile.record(execution_time, delta_ram_bytes, delta_vram_bytes, cpu_pct, success);
        profile.learn_if_ready(self.max_vram_budget_bytes);
        debug!(operation_type, samples = profile.sample_count, learned = profile.learned, "profile updated");
    }

    pub fn profile_for(&self, operation_type: &str) -> Option<ResourceProfile> {
        self.profiles.lock().expect("profiler mutex poisoned").get(operation_type).cloned()
    }

    /// Purge profiles that haven't been touched in `PROFILE_EXPIRY`.
    pub fn housekeeping(&self) {
        let cutoff = now_secs().saturating_sub(PROFILE_EXPIRY.as_secs());
        let mut profiles = self.profiles.lock().expect("profiler mutex poisoned");
        profiles.retain(|op, profile| {
            let keep = profile.last_updated >= cutoff;
            if !keep {
                debug!(operation_type = op, "expiring stale profile");
            }
            keep
        });
    }

    /// Serialize learned profiles as
    /// `operation_type,ram_bytes,vram_bytes,cpu_percent,optimal_concurrency,sample_count`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let profiles = self.profiles.lock().expect("profiler mutex poisoned");
        let mut out = String::new();
        for profile in profiles.values().filter(|p| p.learned) {
            out.push_str(&format!(
                "{},{},{},{},{},{}\n",
                profile.operation_type,
                profile.avg_ram_bytes,
                profile.avg_vram_bytes,
                profile.avg_cpu_pct,
                profile.optimal_concurrency,
                profile.sample_count
            ));
        }
        let mut file = std::fs::File::create(path).map_err(|e| Pie4kError::io(path.to_path_buf(), e))?;
        file.write_all(out.as_bytes()).map_err(|e| Pie4kError::io(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Load a previously persisted profile store, skipping malformed
    /// lines with a warning rather than failing the whole load.
    pub fn load(&self, path: &Path) -> Result<()> {
        if !path.is_file() {
            return Ok(());
        }
        let text = std::fs::read_to_string(path).map_err(|e| Pie4kError::io(path.to_path_buf(), e))?;
        let mut profiles = self.profiles.lock().expect("profiler mutex poisoned");
        for line in text.lines() {
            let fields: Vec<&str> = line.splitn(6, ',').collect();
            if fields.len() != 6 {
                warn!(line, "malformed profile record, skipping");
                continue;
            }
            let Ok(avg_ram_bytes) = fields[1].parse() else { continue };
            let Ok(avg_vram_bytes) = fields[2].parse() else { continue };
            let Ok(avg_cpu_pct) = fields[3].parse() else { continue };
            let Ok(optimal_concurrency) = fields[4].parse() else { continue };
            let Ok(sample_count) = fields[5].parse() else { continue };

            let mut profile = ResourceProfile::new(fields[0].to_string());
            profile.avg_ram_bytes = avg_ram_bytes;
            profile.avg_vram_bytes = avg_vram_bytes;
            profile.avg_cpu_pct = avg_cpu_pct;
            profile.optimal_concurrency = optimal_concurrency;
            profile.sample_count = sample_count;
            profile.learned = true;
            profiles.insert(fields[0].to_string(), profile);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learns_after_min_samples_and_freezes_concurrency() {
        let profiler = PerformanceProfiler::new(1024 * 1024 * 1024);
        profiler.record("upscale", Duration::from_millis(10), 1024, 256 * 1024 * 1024, 50.0, true, true);
        let profile = profiler.profile_for("upscale").unwrap();
        assert!(profile.learned);
        assert_eq!(profile.optimal_concurrency, 4);

        profiler.record("upscale", Duration::from_millis(10), 1024, 512 * 1024 * 1024, 50.0, true, true);
        let profile2 = profiler.profile_for("upscale").unwrap();
        // concurrency is computed once and never recalculated
        assert_eq!(profile2.optimal_concurrency, 4);
        assert_eq!(profile2.sample_count, 2);
    }

    #[test]
    fn save_and_load_round_trips_learned_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.csv");
        let profiler = PerformanceProfiler::new(1024 * 1024 * 1024);
        profiler.record("index", Duration::from_millis(5), 2048, 0, 10.0, true, true);
        profiler.save(&path).unwrap();

        let reloaded = PerformanceProfiler::new(1024 * 1024 * 1024);
        reloaded.load(&path).unwrap();
        let profile = reloaded.profile_for("index").unwrap();
        assert_eq!(profile.avg_ram_bytes, 2048);
        assert!(profile.learned);
    }

    #[test]
    fn unsaved_profile_is_not_recorded() {
        let profiler = PerformanceProfiler::new(1024);
        profiler.record("skipped", Duration::from_millis(1), 1, 1, 1.0, true, false);
        assert!(profiler.profile_for("skipped").is_none());
    }
}
