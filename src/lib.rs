pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod service;
pub mod storage;
pub mod testing;

pub use config::{Config, ConfigError};
pub use crate::core::context::{CommandContext, RenderError};
pub use crate::core::schedule::{Schedule, ScheduleError};
pub use crate::core::state::{StateGraph, StateGraphBuilder, StateMachine, Transition};
pub use crate::core::types::{JobName, RunId, ServiceName};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    ActionCommand, ActionDone, ActionId, ActionKind, ActionStatus, CommandRunner, LocalRunner,
    Node, NodePool,
};
pub use scheduler::{
    Job, JobRun, MasterControlProgram, McpError, McpHandle, RunState, StatusReport,
};
pub use service::{Service, ServiceInstance};
pub use storage::{Snapshot, SnapshotError, StateHandler};
