//! Core domain primitives: identifiers, state machines, command contexts,
//! and schedules.

pub mod context;
pub mod schedule;
pub mod state;
pub mod types;

pub use context::{CommandContext, RenderError};
pub use schedule::{Schedule, ScheduleError};
pub use state::{StateGraph, StateGraphBuilder, StateGraphError, StateMachine, Transition};
pub use types::{JobName, RunId, ServiceName};
