//! Operations monitor (§4.F): the facade binding the resource monitor,
//! profiler, reservation manager, and dual-pool scheduler behind one
//! `submit_task` contract.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::profiler::PerformanceProfiler;
use crate::reservation::ResourceReservationManager;
use crate::resource_monitor::ResourceMonitor;
use crate::task::{AccessMode, TaskRequirements};
use crate::task_scheduler::TaskScheduler;

/// Sleep between `try_reserve` attempts for `RESERVED` submissions
/// (§4.F, §5 suspension points).
const RESERVE_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct OperationsMonitor {
    pub monitor: Arc<ResourceMonitor>,
    pub profiler: Arc<PerformanceProfiler>,
    pub scheduler: TaskScheduler,
    reservations: Arc<ResourceReservationManager>,
}

impl OperationsMonitor {
    pub fn new(max_cpu_pct: f64, max_ram_pct: f64, max_vram_pct: f64) -> Self {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let profiler = Arc::new(PerformanceProfiler::new(u64::MAX));
        let scheduler = TaskScheduler::new(Arc::clone(&monitor), Arc::clone(&profiler), max_cpu_pct);
        let reservations = Arc::new(ResourceReservationManager::new(
            Arc::clone(&monitor),
            max_ram_pct,
            max_vram_pct,
            max_cpu_pct,
        ));

        OperationsMonitor {
            monitor,
            profiler,
            scheduler,
            reservations,
        }
    }

    /// `submit_task` (§4.F): for `RESERVED` access, blocks on a retry
    /// loop until the reservation succeeds, then guarantees
    /// `release_by_task` on the thunk's exit path.
    pub fn submit_task(
        &self,
        requirements: TaskRequirements,
        thunk: impl FnOnce() -> Result<(), String> + Send + 'static,
    ) -> u64 {
        let task_id = self.scheduler.next_task_id();

        match requirements.access {
            AccessMode::Reserved => {
                loop {
                    if self.reservations.try_reserve(&requirements, task_id).is_some() {
                        break;
                    }
                    debug!(task_id, "reservation retry backoff");
                    thread::sleep(RESERVE_RETRY_DELAY);
                }
                let reservations = Arc::clone(&self.reservations);
                self.scheduler.submit(task_id, requirements, move || {
                    let result = thunk();
                    reservations.release_by_task(task_id);
                    result
                });
            }
            AccessMode::Shared | AccessMode::Exclusive => {
                self.scheduler.submit(task_id, requirements, thunk);
            }
        }

        task_id
    }

    pub fn vram_critical(&self) -> bool {
        self.monitor.vram_critical()
    }

    pub fn vram_dangerous(&self) -> bool {
        self.monitor.vram_dangerous()
    }

    /// Drop the oldest reservations and force a metrics refresh under
    /// sustained VRAM pressure.
    pub fn emergency_resource_cleanup(&self) {
        self.reservations.emergency_cleanup();
        self.monitor.refresh();
    }

    pub fn estimate_memory_for_file_size(&self, file_size_bytes: u64) -> u64 {
        // Decoding plus working copies typically run ~3x the on-disk size
        // for uncompressed image buffers.
        file_size_bytes.saturating_mul(3)
    }

    pub fn estimate_vram_for_operation(&self, width: u32, height: u32, scale: u32) -> u64 {
        let pixels = width as u64 * height as u64 * (scale as u64).pow(2);
        pixels * 4 * 2 // two float32 BGR-ish buffers per pixel, rough forecast
    }

    pub fn estimate_cpu_cores_for_operation(&self, _operation_type: &str) -> u32 {
        1
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Domain;
    use std::sync::mpsc;

    #[test]
    fn reserved_submission_completes_and_releases() {
        let monitor = OperationsMonitor::new(95.0, 95.0, 95.0);
        let (tx, rx) = mpsc::channel();
        let requirements = TaskRequirements {
            est_ram_bytes: 1,
            est_vram_bytes: 0,
            est_disk_io_bytes: 0,
            est_cpu_cores: 1,
            starting_thread_count: 1,
            priority: crate::task::Priority::Normal,
            access: AccessMode::Reserved,
            domain: Domain::Cpu,
            operation_type: "estimate_test".to_string(),
            resource_name: None,
            blocking: true,
            save_profile: false,
            has_children: false,
        };
        monitor.submit_task(requirements, move || {
            tx.send(()).unwrap();
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("reserved task should complete");
        monitor.shutdown();
    }

    #[test]
    fn estimators_are_monotonic_in_size() {
        let monitor = OperationsMonitor::new(80.0, 80.0, 90.0);
        assert!(monitor.estimate_memory_for_file_size(2048) > monitor.estimate_memory_for_file_size(1024));
        assert!(monitor.estimate_vram_for_operation(512, 512, 4) > monitor.estimate_vram_for_operation(512, 512, 2));
    }
}
