//! The scheduling control loop: job registry, timer-driven run dispatch,
//! and crash-safe state snapshotting.

pub mod dispatch;
pub mod job;
pub mod mcp;

pub use dispatch::{Dispatcher, TimerMsg};
pub use job::{sleep_time, Job, JobRun, RunState};
pub use mcp::{
    InstanceStatus, JobStatus, MasterControlProgram, McpError, McpHandle, ServiceStatus,
    StatusReport,
};
