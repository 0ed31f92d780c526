//! Lifecycle events and the registry that delivers them (§4.J).

use std::sync::Mutex;

use tracing::debug;

use crate::service::Service;

/// Pipeline-wide events a batch upscale run passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    BatchUpscaleStart,
    BatchUpscaleEnd,
    ResourceTypeStart,
    ResourceTypeEnd,
}

/// A process-scoped registry of [`Service`] implementations, keyed by
/// name, that delivers lifecycle events synchronously in registration
/// order.
pub struct ServiceRegistry {
    services: Mutex<Vec<Box<dyn Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry {
            services: Mutex::new(Vec::new()),
        }
    }

    /// Register `service`, invoking its lifecycle hook immediately if it
    /// asks to auto-initialize.
    pub fn register(&self, service: Box<dyn Service>) {
        debug!(service = service.name(), scope = ?service.scope(), "service registered");
        if service.should_auto_initialize() {
            service.on_lifecycle_event(Lifecycle::BatchUpscaleStart, "");
        }
        self.services
            .lock()
            .expect("registry mutex poisoned")
            .push(service);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.services
            .lock()
            .expect("registry mutex poisoned")
            .iter()
            .map(|s| s.name())
            .collect()
    }

    /// Broadcast `event` to every registered service, in registration
    /// order, passing `context` through unchanged.
    pub fn broadcast(&self, event: Lifecycle, context: &str) {
        let services = self.services.lock().expect("registry mutex poisoned");
        for service in services.iter() {
            service.on_lifecycle_event(event, context);
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
