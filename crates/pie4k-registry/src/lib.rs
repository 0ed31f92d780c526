//! Service registry + lifecycle bus (§4.J): a process-scoped registry
//! keyed by service name, broadcasting pipeline lifecycle events to
//! registered services synchronously and in registration order.

pub mod lifecycle;
pub mod service;

pub use lifecycle::{Lifecycle, ServiceRegistry};
pub use service::{Service, ServiceScope};
