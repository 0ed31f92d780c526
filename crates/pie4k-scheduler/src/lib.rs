//! Dual-pool (CPU/GPU) priority task scheduler with atomic resource
//! reservation, performance profiling, and emergency protection (§4.A-F).
//!
//! Every heavy job in the pipeline — archive indexing, tile upscaling —
//! runs through [`OperationsMonitor::submit_task`]; nothing touches a
//! worker thread directly.

pub mod gpu_telemetry;
pub mod operations_monitor;
pub mod profiler;
pub mod reservation;
pub mod resource_monitor;
pub mod task;
pub mod task_scheduler;

pub use operations_monitor::OperationsMonitor;
pub use profiler::PerformanceProfiler;
pub use reservation::ResourceReservationManager;
pub use resource_monitor::{ResourceMonitor, SystemMetrics};
pub use task::{AccessMode, Domain, Priority, TaskRequirements};
pub use task_scheduler::TaskScheduler;
