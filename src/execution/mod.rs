//! Action execution infrastructure: nodes, node pools, and command runners.

mod action;
mod node;

pub use action::{
    ActionCommand, ActionDone, ActionId, ActionKind, ActionStatus, CommandRunner, LocalRunner,
};
pub use node::{Node, NodePool};
