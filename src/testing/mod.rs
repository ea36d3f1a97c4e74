//! Test doubles for exercising supervision and scheduling logic without
//! real processes or timers.
//!
//! [`FakeRunner`] records every dispatched action instead of executing it;
//! tests then complete actions with chosen exit statuses to drive state
//! machines through exact scenarios.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::mpsc::UnboundedSender;

use crate::events::Event;
use crate::execution::{ActionCommand, ActionDone, ActionId, ActionStatus, CommandRunner, Node};
use crate::scheduler::dispatch::{Dispatcher, TimerMsg};

/// One recorded dispatch.
#[derive(Clone)]
pub struct FakeDispatch {
    pub node: String,
    pub action: ActionCommand,
    pub done: UnboundedSender<ActionDone>,
}

/// A [`CommandRunner`] that records dispatches and completes them on demand.
#[derive(Default)]
pub struct FakeRunner {
    dispatched: Mutex<Vec<FakeDispatch>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dispatch recorded so far, oldest first.
    pub fn dispatched(&self) -> Vec<FakeDispatch> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    pub fn dispatched_ids(&self) -> Vec<ActionId> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.action.id.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.dispatched.lock().unwrap().clear();
    }

    /// Complete the `index`-th recorded dispatch with an exit status.
    pub fn complete(&self, index: usize, exit_status: i32) {
        let dispatch = self.dispatched.lock().unwrap()[index].clone();
        let _ = dispatch.done.send(ActionDone {
            id: dispatch.action.id,
            status: ActionStatus::Completed { exit_status },
        });
    }

    /// Report the `index`-th recorded dispatch as never having started.
    pub fn fail_start(&self, index: usize) {
        let dispatch = self.dispatched.lock().unwrap()[index].clone();
        let _ = dispatch.done.send(ActionDone {
            id: dispatch.action.id,
            status: ActionStatus::FailStart,
        });
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, node: &Node, action: ActionCommand, done: UnboundedSender<ActionDone>) {
        self.dispatched.lock().unwrap().push(FakeDispatch {
            node: node.hostname().to_string(),
            action,
            done,
        });
    }
}

/// A dispatcher wired to a [`FakeRunner`] plus the receiving ends of all
/// three message channels.
pub struct Harness {
    pub fx: Dispatcher,
    pub runner: Arc<FakeRunner>,
    pub done_rx: UnboundedReceiver<ActionDone>,
    pub timer_rx: UnboundedReceiver<TimerMsg>,
    pub event_rx: UnboundedReceiver<Event>,
}

impl Harness {
    /// Drain whatever events are immediately available.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drain whatever timer messages are immediately available.
    pub fn drain_timers(&mut self) -> Vec<TimerMsg> {
        let mut timers = Vec::new();
        while let Ok(msg) = self.timer_rx.try_recv() {
            timers.push(msg);
        }
        timers
    }
}

/// Build a harness with fresh channels and a recording runner.
pub fn harness() -> Harness {
    let runner = Arc::new(FakeRunner::new());
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let fx = Dispatcher::new(runner.clone(), done_tx, timer_tx, event_tx);
    Harness {
        fx,
        runner,
        done_rx,
        timer_rx,
        event_rx,
    }
}
