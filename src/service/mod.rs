//! Service supervision: desired-count instance management, aggregate state,
//! failure-triggered restart, and reconfiguration rebalancing.

mod instance;
mod service;

pub use instance::{
    instance_graph, ServiceInstance, STATE_DOWN, STATE_FAILED, STATE_MONITORING, STATE_STARTING,
    STATE_STOPPING, STATE_UNKNOWN, STATE_UP,
};
pub use service::{
    service_graph, Service, SVC_DEGRADED, SVC_DOWN, SVC_FAILED, SVC_STARTING, SVC_STOPPING,
    SVC_UP,
};

use thiserror::Error;

/// An operation was attempted in a state where it is not legal. This is a
/// caller contract violation, always surfaced, never silently swallowed.
#[derive(Debug, Error)]
#[error("{entity}: cannot {operation} in state {actual} (requires {expected})")]
pub struct InvalidStateError {
    pub entity: String,
    pub operation: &'static str,
    pub expected: String,
    pub actual: String,
}
