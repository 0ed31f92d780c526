//! Dual-pool task scheduler (§4.E). Each pool owns a priority queue and
//! a fixed worker set; workers block on a condition variable and
//! re-evaluate admission against fresh metrics on every wake-up.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::profiler::PerformanceProfiler;
use crate::resource_monitor::ResourceMonitor;
use crate::task::{AccessMode, ScheduledTask, TaskRequirements};

/// Workers refusing admission re-check at this cadence (§5 suspension
/// points, ≤100ms).
const ADMISSION_RETRY: Duration = Duration::from_millis(100);

struct PoolState {
    queue: BinaryHeap<ScheduledTask>,
    active_workers: u32,
    shutting_down: bool,
}

/// One CPU- or GPU-domain worker pool.
pub struct Pool {
    state: Mutex<PoolState>,
    condvar: Condvar,
    max_workers: AtomicU32,
    handles: Mutex<Vec<JoinHandle<()>>>,
    monitor: Arc<ResourceMonitor>,
    profiler: Arc<PerformanceProfiler>,
    max_cpu_pct: f64,
}

impl Pool {
    fn new(monitor: Arc<ResourceMonitor>, profiler: Arc<PerformanceProfiler>, initial_workers: u32, max_cpu_pct: f64) -> Arc<Self> {
        Arc::new(Pool {
            state: Mutex::new(PoolState { queue: BinaryHeap::new(), active_workers: 0, shutting_down: false }),
            condvar: Condvar::new(),
            max_workers: AtomicU32::new(initial_workers),
            handles: Mutex::new(Vec::new()),
            monitor,
            profiler,
            max_cpu_pct,
        })
    }

    fn ensure_workers(self: &Arc<Self>, count: u32) {
        let hardware_cap = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4) * 4;
        let target = count.min(hardware_cap).max(1);
        if target > self.max_workers.load(Ordering::SeqCst) {
            self.max_workers.store(target, Ordering::SeqCst);
        }
        let mut handles = self.handles.lock().expect("pool handles mutex poisoned");
        while (handles.len() as u32) < self.max_workers.load(Ordering::SeqCst) {
            let pool = Arc::clone(self);
            let worker_id = handles.len();
            handles.push(std::thread::spawn(move || pool.worker_loop(worker_id)));
        }
    }

    fn submit(self: &Arc<Self>, task: ScheduledTask) {
        self.ensure_workers(task.requirements.starting_thread_count.max(1));
        let mut state = self.state.lock().expect("pool state mutex poisoned");
        state.queue.push(task);
        self.condvar.notify_all();
    }

    fn can_execute(&self, req: &TaskRequirements, active_workers: u32) -> bool {
        if active_workers >= self.max_workers.load(Ordering::SeqCst) {
            return false;
        }
        match req.access {
            AccessMode::Exclusive => active_workers == 0,
            AccessMode::Reserved => true,
            AccessMode::Shared => {
                let metrics = self.monitor.current();
                metrics.cpu_usage_pct < self.max_cpu_pct
                    && metrics.available_ram >= req.est_ram_bytes
                    && metrics.available_vram >= req.est_vram_bytes
            }
        }
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "worker started");
        loop {
            let task = {
                let mut state = self.state.lock().expect("pool state mutex poisoned");
                loop {
                    if state.shutting_down {
                        debug!(worker_id, "worker shutting down");
                        return;
                    }
                    let Some(top) = state.queue.peek() else {
                        state = self.condvar.wait(state).expect("pool state mutex poisoned");
                        continue;
                    };
                    if self.can_execute(&top.requirements, state.active_workers) {
                        break state.queue.pop().expect("peeked element must exist");
                    }
                    let (guard, _timeout) = self
                        .condvar
                        .wait_timeout(state, ADMISSION_RETRY)
                        .expect("pool state mutex poisoned");
                    state = guard;
                }
            };

            {
                let mut state = self.state.lock().expect("pool state mutex poisoned");
                state.active_workers += 1;
            }

            self.execute(task);

            {
                let mut state = self.state.lock().expect("pool state mutex poisoned");
                state.active_workers -= 1;
            }
            self.condvar.notify_all();
        }
    }

    fn execute(&self, task: ScheduledTask) {
        let before = self.monitor.refresh();
        let started = Instant::now();

        let result = (task.thunk)();

        let after = self.monitor.refresh();
        let elapsed = started.elapsed();
        let delta_ram = after.used_ram.saturating_sub(before.used_ram);
        let delta_vram = after.used_vram.saturating_sub(before.used_vram);

        if let Err(ref reason) = result {
            warn!(task_id = task.task_id, operation_type = %task.requirements.operation_type, reason, "task failed");
        }

        self.profiler.record(
            &task.requirements.operation_type,
            elapsed,
            delta_ram,
            delta_vram,
            after.cpu_usage_pct,
            result.is_ok(),
            task.requirements.save_profile,
        );
    }

    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock().expect("pool state mutex poisoned");
            state.shutting_down = true;
        }
        self.condvar.notify_all();
        let mut handles = self.handles.lock().expect("pool handles mutex poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().expect("pool state mutex poisoned").queue.len()
    }

    pub fn active_workers(&self) -> u32 {
        self.state.lock().expect("pool state mutex poisoned").active_workers
    }
}

/// The two independent pools named in §4.E.
pub struct TaskScheduler {
    pub cpu_pool: Arc<Pool>,
    pub gpu_pool: Arc<Pool>,
    next_task_id: AtomicU64,
}

impl TaskScheduler {
    pub fn new(monitor: Arc<ResourceMonitor>, profiler: Arc<PerformanceProfiler>, max_cpu_pct: f64) -> Self {
        let hardware_threads = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(4);
        TaskScheduler {
            cpu_pool: Pool::new(Arc::clone(&monitor), Arc::clone(&profiler), hardware_threads, max_cpu_pct),
            gpu_pool: Pool::new(monitor, profiler, 1, max_cpu_pct),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn submit(
        &self,
        task_id: u64,
        requirements: TaskRequirements,
        thunk: impl FnOnce() -> Result<(), String> + Send + 'static,
    ) {
        let pool = match requirements.domain {
            crate::task::Domain::Cpu => &self.cpu_pool,
            crate::task::Domain::Gpu => &self.gpu_pool,
        };
        let task = ScheduledTask {
            task_id,
            requirements,
            submitted_at: Instant::now(),
            thunk: Box::new(thunk),
        };
        pool.submit(task);
    }

    pub fn shutdown(&self) {
        self.cpu_pool.shutdown();
        self.gpu_pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Domain, Priority};
    use std::sync::mpsc;

    fn req(operation_type: &str, priority: Priority) -> TaskRequirements {
        TaskRequirements {
            est_ram_bytes: 0,
            est_vram_bytes: 0,
            est_disk_io_bytes: 0,
            est_cpu_cores: 1,
            starting_thread_count: 2,
            priority,
            access: AccessMode::Reserved,
            domain: Domain::Cpu,
            operation_type: operation_type.to_string(),
            resource_name: None,
            blocking: true,
            save_profile: false,
            has_children: false,
        }
    }

    #[test]
    fn runs_a_submitted_task_to_completion() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let profiler = Arc::new(PerformanceProfiler::new(1024 * 1024 * 1024));
        let scheduler = TaskScheduler::new(monitor, profiler, 95.0);

        let (tx, rx) = mpsc::channel();
        let id = scheduler.next_task_id();
        scheduler.submit(id, req("test_op", Priority::Normal), move || {
            tx.send(()).unwrap();
            Ok(())
        });

        rx.recv_timeout(Duration::from_secs(5)).expect("task should complete");
        scheduler.shutdown();
    }

    #[test]
    fn mixed_priority_tasks_all_complete() {
        let monitor = Arc::new(ResourceMonitor::new());
        monitor.refresh();
        let profiler = Arc::new(PerformanceProfiler::new(1024 * 1024 * 1024));
        let scheduler = TaskScheduler::new(monitor, profiler, 95.0);

        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();

        for (label, priority) in [("low", Priority::Low), ("critical", Priority::Critical)] {
            let order = Arc::clone(&order);
            let tx = tx.clone();
            let id = scheduler.next_task_id();
            scheduler.submit(id, req(label, priority), move || {
                order.lock().unwrap().push(label);
                let _ = tx.send(());
                Ok(())
            });
        }
        drop(tx);
        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        scheduler.shutdown();
        assert_eq!(order.lock().unwrap().len(), 2);
    }
}
