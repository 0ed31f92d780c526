//! Resource reservation manager (§4.D): atomic admission against
//! measured headroom, with exclusive/shared/reserved semantics and
//! expiry-based cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::resource_monitor::ResourceMonitor;
use crate::task::TaskRequirements;

/// Reservations older than this are eligible for expiry cleanup (§3).
pub const RESERVATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Hard cap on the number of live reservations before emergency cleanup
/// forcibly drops the oldest half.
const HARD_RESERVATION_LIMIT: usize = 4096;

#[derive(Debug, Clone)]
pub struct ResourceReservation {
    pub reservation_id: u64,
    pub task_id: u64,
    pub requirements_ram: u64,
    pub requirements_vram: u64,
    pub requirements_cores: u32,
    pub exclusive: bool,
    pub reserved_at: Instant,
}

pub struct ResourceReservationManager {
    monitor: Arc<ResourceMonitor>,
    max_ram_fraction: f64,
    max_vram_fraction: f64,
    max_cpu_fraction: f64,

    baseline_available_ram: AtomicU64,
    baseline_available_vram: AtomicU64,
    baseline_captured: AtomicBool,

    reserved_ram: AtomicU64,
    reserved_vram: AtomicU64,
    reserved_cores: AtomicU64,
    has_exclusive: AtomicBool,

    next_id: AtomicU64,
    active: Mutex<HashMap<u64, ResourceReservation>>,
    by_task: Mutex<HashMap<u64, Vec<u64>>>,
}

impl ResourceReservationManager {
    pub fn new(monitor: Arc<ResourceMonitor>, max_ram_pct: f64, max_vram_pct: f64, max_cpu_pct: f64) -> Self {
        ResourceReservationManager {
            monitor,
            max_ram_fraction: max_ram_pct / 100.0,
            max_vram_fraction: max_vram_pct / 100.0,
            max_cpu_fraction: max_cpu_pct / 100.0,
            baseline_available_ram: AtomicU64::new(0),
            baseline_available_vram: AtomicU64::new(0),
            baseline_captured: AtomicBool::new(false),
            reserved_ram: AtomicU64::new(0),
            reserved_vram: AtomicU64::new(0),
            reserved_cores: AtomicU64::new(0),
            has_exclusive: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            by_task: Mutex::new(HashMap::new()),
        }
    }

    fn capture_baseline_if_needed(&self) {
        if self.baseline_captured.swap(true, Ordering::SeqCst) {
            return;
        }
        let metrics = self.monitor.current();
        self.baseline_available_ram.store(metrics.available_ram, Ordering::SeqCst);
        self.baseline_available_vram.store(metrics.available_vram, Ordering::SeqCst);
    }

    /// `try_reserve` (§4.D): the hot admission path.
    pub fn try_reserve(&self, req: &TaskRequirements, task_id: u64) -> Option<u64> {
        self.monitor.refresh();
        self.capture_baseline_if_needed();

        let usable_ram = (self.baseline_available_ram.load(Ordering::SeqCst) as i64
            - self.reserved_ram.load(Ordering::SeqCst) as i64)
            .max(0) as u64;
        let usable_vram = (self.baseline_available_vram.load(Ordering::SeqCst) as i64
            - self.reserved_vram.load(Ordering::SeqCst) as i64)
            .max(0) as u64;

        let ram_budget = (usable_ram as f64 * self.max_ram_fraction) as u64;
        let vram_budget = (usable_vram as f64 * self.max_vram_fraction) as u64;

        if req.est_ram_bytes > ram_budget {
            debug!(task_id, need = req.est_ram_bytes, budget = ram_budget, "reservation refused: RAM");
            return None;
        }
        if req.est_vram_bytes > vram_budget {
            debug!(task_id, need = req.est_vram_bytes, budget = vram_budget, "reservation refused: VRAM");
            return None;
        }
        // CPU shortfall is advisory only: the source comments this check
        // out, and `estimated_cpu_cores` only feeds `estimate_max_concurrent`.
        let _ = self.max_cpu_fraction;

        let exclusive = matches!(req.access, crate::task::AccessMode::Exclusive);
        {
            let active = self.active.lock().expect("reservation mutex poisoned");
            if exclusive && !active.is_empty() {
                debug!(task_id, "reservation refused: exclusive access requires an empty table");
                return None;
            }
            if !exclusive && self.has_exclusive.load(Ordering::SeqCst) {
                debug!(task_id, "reservation refused: an exclusive reservation is active");
                return None;
            }
        }

        let reservation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let reservation = ResourceReservation {
            reservation_id,
            task_id,
            requirements_ram: req.est_ram_bytes,
            requirements_vram: req.est_vram_bytes,
            requirements_cores: req.est_cpu_cores,
            exclusive,
            reserved_at: Instant::now(),
        };

        self.reserved_ram.fetch_add(req.est_ram_bytes, Ordering::SeqCst);
        self.reserved_vram.fetch_add(req.est_vram_bytes, Ordering::SeqCst);
        self.reserved_cores.fetch_add(req.est_cpu_cores as u64, Ordering::SeqCst);
        if exclusive {
            self.has_exclusive.store(true, Ordering::SeqCst);
        }

        self.active.lock().expect("reservation mutex poisoned").insert(reservation_id, reservation);
        self.by_task
            .lock()
            .expect("reservation mutex poisoned")
            .entry(task_id)
            .or_default()
            .push(reservation_id);

        debug!(task_id, reservation_id, "reservation granted");
        Some(reservation_id)
    }

    pub fn release(&self, reservation_id: u64) {
        let removed = self.active.lock().expect("reservation mutex poisoned").remove(&reservation_id);
        if let Some(reservation) = removed {
            self.unaccount(&reservation);
            let mut by_task = self.by_task.lock().expect("reservation mutex poisoned");
            if let Some(ids) = by_task.get_mut(&reservation.task_id) {
                ids.retain(|id| *id != reservation_id);
                if ids.is_empty() {
                    by_task.remove(&reservation.task_id);
                }
            }
        }
    }

    pub fn release_by_task(&self, task_id: u64) {
        let ids = self.by_task.lock().expect("reservation mutex poisoned").remove(&task_id);
        if let Some(ids) = ids {
            let mut active = self.active.lock().expect("reservation mutex poisoned");
            for id in ids {
                if let Some(reservation) = active.remove(&id) {
                    self.unaccount(&reservation);
                }
            }
        }
    }

    fn unaccount(&self, reservation: &ResourceReservation) {
        self.reserved_ram.fetch_sub(reservation.requirements_ram, Ordering::SeqCst);
        self.reserved_vram.fetch_sub(reservation.requirements_vram, Ordering::SeqCst);
        self.reserved_cores.fetch_sub(reservation.requirements_cores as u64, Ordering::SeqCst);
        if reservation.exclusive {
            self.has_exclusive.store(false, Ordering::SeqCst);
        }
    }

    /// Expire stale reservations; if the table is still over the hard
    /// limit afterward, forcibly drop the oldest half (§4.D).
    pub fn emergency_cleanup(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .active
            .lock()
            .expect("reservation mutex poisoned")
            .values()
            .filter(|r| now.duration_since(r.reserved_at) >= RESERVATION_TIMEOUT)
            .map(|r| r.reservation_id)
            .collect();
        for id in expired {
            self.release(id);
        }

        let over_limit = self.active.lock().expect("reservation mutex poisoned").len() > HARD_RESERVATION_LIMIT;
        if !over_limit {
            return;
        }
        let mut ordered: Vec<(u64, Instant)> = self
            .active
            .lock()
            .expect("reservation mutex poisoned")
            .values()
            .map(|r| (r.reservation_id, r.reserved_at))
            .collect();
        ordered.sort_by_key(|(_, at)| *at);
        let drop_count = ordered.len() / 2;
        for (id, _) in ordered.into_iter().take(drop_count) {
            self.release(id);
        }
    }

    /// Floor of the per-dimension budget divided by per-dimension need.
    pub fn estimate_max_concurrent(&self, req: &TaskRequirements) -> u32 {
        let usable_ram = (self.baseline_available_ram.load(Ordering::SeqCst) as i64
            - self.reserved_ram.load(Ordering::SeqCst) as i64)
            .max(0) as u64;
        let usable_vram = (self.baseline_available_vram.load(Ordering::SeqCst) as i64
            - self.reserved_vram.load(Ordering::SeqCst) as i64)
            .max(0) as u64;
        let ram_budget = (usable_ram as f64 * self.max_ram_fraction) as u64;
        let vram_budget = (usable_vram as f64 * self.max_vram_fraction) as u64;

        let by_ram = if req.est_ram_bytes > 0 { ram_budget / req.est_ram_bytes } else { u64::MAX };
        let by_vram = if req.est_vram_bytes > 0 { vram_budget / req.est_vram_bytes } else { u64::MAX };
        by_ram.min(by_vram).max(0) as u32
    }

    pub fn reserved_totals(&self) -> (u64, u64, u64) {
        (
            self.reserved_ram.load(Ordering::SeqCst),
            self.reserved_vram.load(Ordering::SeqCst),
            self.reserved_cores.load(Ordering::SeqCst),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{AccessMode, Domain, Priority};

    fn req(ram: u64, vram: u64, access: AccessMode) -> TaskRequirements {
        TaskRequirements {
            est_ram_bytes: ram,
            est_vram_bytes: vram,
            est_disk_io_bytes: 0,
            est_cpu_cores: 1,
            starting_thread_count: 1,
            priority: Priority::Normal,
            access,
            domain: Domain::Cpu,
            operation_type: "test".to_string(),
            resource_name: None,
            blocking: true,
            save_profile: false,
            has_children: false,
        }
    }

    #[test]
    fn exclusive_reservation_refused_when_table_nonempty() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let manager = ResourceReservationManager::new(Arc::clone(&monitor), 80.0, 90.0, 80.0);
        let first = manager.try_reserve(&req(1, 1, AccessMode::Shared), 1);
        assert!(first.is_some());
        let second = manager.try_reserve(&req(1, 1, AccessMode::Exclusive), 2);
        assert!(second.is_none());
    }

    #[test]
    fn release_reverses_accounting() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let manager = ResourceReservationManager::new(Arc::clone(&monitor), 80.0, 90.0, 80.0);
        let id = manager.try_reserve(&req(100, 0, AccessMode::Shared), 1).unwrap();
        let (ram_before, _, _) = manager.reserved_totals();
        assert_eq!(ram_before, 100);
        manager.release(id);
        let (ram_after, _, _) = manager.reserved_totals();
        assert_eq!(ram_after, 0);
    }

    #[test]
    fn oversized_request_is_refused() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let manager = ResourceReservationManager::new(Arc::clone(&monitor), 80.0, 90.0, 80.0);
        let huge = u64::MAX / 2;
        assert!(manager.try_reserve(&req(huge, 0, AccessMode::Shared), 1).is_none());
    }
}
