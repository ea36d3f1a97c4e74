//! Side-effect dispatch for the daemon loop.
//!
//! Jobs and services never spawn processes, sleep, or publish events
//! directly. They describe effects through a [`Dispatcher`], which forwards
//! action commands to the configured [`CommandRunner`], arms one-shot timers,
//! and queues lifecycle events. All results flow back to the daemon loop as
//! messages, so the entities themselves stay synchronous and testable.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::types::{JobName, RunId, ServiceName};
use crate::events::Event;
use crate::execution::{ActionCommand, ActionDone, CommandRunner, Node};

/// A timer expiry delivered to the daemon loop.
///
/// Timers carry no entity references, only names. The loop re-resolves the
/// target when the message arrives; a stale timer for an entity that has
/// since changed state or disappeared is simply ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerMsg {
    /// A scheduled job run's start time arrived.
    RunDue { job: JobName, run: RunId },
    /// A service instance's next health check is due.
    MonitorDue { service: ServiceName, instance: u32 },
    /// A degraded or failed service should attempt a restart.
    RestartDue { service: ServiceName },
    /// Time to persist a state snapshot.
    SnapshotDue,
}

/// Hands effects off to the runner, the timer queue, and the event queue.
#[derive(Clone)]
pub struct Dispatcher {
    runner: Arc<dyn CommandRunner>,
    done_tx: UnboundedSender<ActionDone>,
    timer_tx: UnboundedSender<TimerMsg>,
    event_tx: UnboundedSender<Event>,
}

impl Dispatcher {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        done_tx: UnboundedSender<ActionDone>,
        timer_tx: UnboundedSender<TimerMsg>,
        event_tx: UnboundedSender<Event>,
    ) -> Self {
        Self {
            runner,
            done_tx,
            timer_tx,
            event_tx,
        }
    }

    /// Dispatch an action command to a node. Completion arrives later as an
    /// [`ActionDone`] message.
    pub fn run_action(&self, node: &Node, action: ActionCommand) {
        self.runner.run(node, action, self.done_tx.clone());
    }

    /// Arm a one-shot timer that delivers `msg` after `delay`.
    pub fn arm(&self, delay: Duration, msg: TimerMsg) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // A closed channel means the daemon loop is gone.
            let _ = timer_tx.send(msg);
        });
    }

    /// Queue a lifecycle event for the event bus.
    pub fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
