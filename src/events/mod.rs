//! Lifecycle events and event handling.
//!
//! This module provides event emission for job and service lifecycle events,
//! enabling observability into the daemon without coupling supervision logic
//! to any particular sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::types::{JobName, RunId, ServiceName};

/// Lifecycle events emitted by the daemon.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job run was placed on the timeline.
    JobScheduled {
        job: JobName,
        run: RunId,
        run_time: DateTime<Utc>,
    },

    /// A job run began executing.
    RunStarted { job: JobName, run: RunId },

    /// A job run finished.
    RunCompleted {
        job: JobName,
        run: RunId,
        success: bool,
    },

    /// A service's aggregate state changed.
    ServiceStateChanged { service: ServiceName, state: String },

    /// A single service instance's state changed.
    InstanceStateChanged {
        service: ServiceName,
        instance: u32,
        state: String,
    },
}

impl Event {
    /// Create a JobScheduled event.
    pub fn job_scheduled(job: JobName, run: RunId, run_time: DateTime<Utc>) -> Self {
        Event::JobScheduled { job, run, run_time }
    }

    /// Create a RunStarted event.
    pub fn run_started(job: JobName, run: RunId) -> Self {
        Event::RunStarted { job, run }
    }

    /// Create a RunCompleted event.
    pub fn run_completed(job: JobName, run: RunId, success: bool) -> Self {
        Event::RunCompleted { job, run, success }
    }

    /// Create a ServiceStateChanged event.
    pub fn service_state_changed(service: ServiceName, state: impl Into<String>) -> Self {
        Event::ServiceStateChanged {
            service,
            state: state.into(),
        }
    }

    /// Create an InstanceStateChanged event.
    pub fn instance_state_changed(
        service: ServiceName,
        instance: u32,
        state: impl Into<String>,
    ) -> Self {
        Event::InstanceStateChanged {
            service,
            instance,
            state: state.into(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
