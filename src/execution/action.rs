//! Action dispatch: the boundary between supervision logic and real
//! processes.
//!
//! Everything the daemon does to the outside world is an [`ActionCommand`]
//! handed to a [`CommandRunner`]. The runner executes the shell command on a
//! node and reports a single [`ActionDone`] on a channel. Tests substitute a
//! recording runner; production uses [`LocalRunner`].

use std::fmt;
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::core::types::{JobName, RunId, ServiceName};
use crate::execution::node::Node;

/// The kind of action dispatched for a service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Start,
    Monitor,
    Stop,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Start => "start",
            ActionKind::Monitor => "monitor",
            ActionKind::Stop => "stop",
        };
        write!(f, "{}", s)
    }
}

/// Identifies which entity an action completion belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionId {
    /// An action of a service instance.
    Instance {
        service: ServiceName,
        number: u32,
        kind: ActionKind,
    },
    /// The command of a job run.
    Run { job: JobName, run: RunId },
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionId::Instance {
                service,
                number,
                kind,
            } => write!(f, "{}.{}.{}", service, number, kind),
            ActionId::Run { job, run } => write!(f, "{}.{}", job, run),
        }
    }
}

/// A rendered shell command ready to execute.
#[derive(Debug, Clone)]
pub struct ActionCommand {
    pub id: ActionId,
    pub command: String,
}

/// Outcome of a dispatched action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionStatus {
    /// The process ran to completion with the given exit status.
    Completed { exit_status: i32 },
    /// The process could not be spawned at all.
    FailStart,
}

impl ActionStatus {
    pub fn success(&self) -> bool {
        matches!(self, ActionStatus::Completed { exit_status: 0 })
    }
}

/// Completion report sent back to the daemon loop.
#[derive(Debug, Clone)]
pub struct ActionDone {
    pub id: ActionId,
    pub status: ActionStatus,
}

/// Executes action commands on nodes.
///
/// `run` must not block: implementations spawn the work and deliver exactly
/// one [`ActionDone`] on `done` when it finishes.
pub trait CommandRunner: Send + Sync {
    fn run(&self, node: &Node, action: ActionCommand, done: UnboundedSender<ActionDone>);
}

/// Runs commands as local subprocesses via `sh -c`.
///
/// The node is recorded for logging only; a single-host deployment treats
/// every node as the local machine.
#[derive(Debug, Default)]
pub struct LocalRunner;

impl LocalRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for LocalRunner {
    fn run(&self, node: &Node, action: ActionCommand, done: UnboundedSender<ActionDone>) {
        let hostname = node.hostname().to_string();
        tokio::spawn(async move {
            debug!(action = %action.id, node = %hostname, command = %action.command, "dispatching");
            let spawned = Command::new("sh")
                .arg("-c")
                .arg(&action.command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();

            let status = match spawned {
                Ok(mut child) => match child.wait().await {
                    Ok(exit) => ActionStatus::Completed {
                        exit_status: exit.code().unwrap_or(-1),
                    },
                    Err(e) => {
                        warn!(action = %action.id, error = %e, "failed waiting for process");
                        ActionStatus::FailStart
                    }
                },
                Err(e) => {
                    warn!(action = %action.id, error = %e, "failed to spawn process");
                    ActionStatus::FailStart
                }
            };

            // The receiver going away means the daemon is shutting down.
            let _ = done.send(ActionDone {
                id: action.id,
                status,
            });
        });
    }
}
