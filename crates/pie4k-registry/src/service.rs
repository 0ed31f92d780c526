//! The `Service` contract and its three lifetimes (§4.J).

use crate::lifecycle::Lifecycle;

/// How long a service's internal state is expected to live before it is
/// torn down or reinitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceScope {
    /// Lives for one batch upscale run; torn down at `BatchUpscaleEnd`.
    BatchScoped,
    /// Reinitialized whenever the active resource type changes.
    ResourceTypeScoped,
    /// Constructed once at process startup and never torn down.
    ProcessScoped,
}

/// A process-scoped component that reacts to pipeline lifecycle events
/// broadcast by a [`crate::ServiceRegistry`].
pub trait Service: Send + Sync {
    fn name(&self) -> &'static str;

    fn scope(&self) -> ServiceScope;

    /// Whether the registry should call `on_lifecycle_event` for this
    /// service before any explicit registration-time event, i.e. as soon
    /// as it's registered.
    fn should_auto_initialize(&self) -> bool {
        false
    }

    /// `context` carries the resource type code as a string when the
    /// event is resource-type-scoped; empty otherwise.
    fn on_lifecycle_event(&self, event: Lifecycle, context: &str);
}
