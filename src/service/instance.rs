//! A single supervised copy of a service on one node.
//!
//! Each instance owns a state machine over the lifecycle
//! down → starting → monitoring/up → stopping → down, with `failed` and
//! `unknown` as failure parking states. At most one action (start, monitor,
//! or stop) is ever in flight per instance; completions for anything else
//! are stale and ignored.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::context::CommandContext;
use crate::core::state::{StateGraph, StateMachine, StateGraphError};
use crate::core::types::ServiceName;
use crate::events::Event;
use crate::execution::{ActionCommand, ActionId, ActionKind, ActionStatus, Node};
use crate::scheduler::dispatch::{Dispatcher, TimerMsg};
use crate::service::InvalidStateError;

pub const STATE_DOWN: &str = "down";
pub const STATE_STARTING: &str = "starting";
pub const STATE_MONITORING: &str = "monitoring";
pub const STATE_UP: &str = "up";
pub const STATE_FAILED: &str = "failed";
pub const STATE_STOPPING: &str = "stopping";
pub const STATE_UNKNOWN: &str = "unknown";

const MONITOR_COMMAND: &str = "cat {pid_file} | xargs kill -0";
const KILL_COMMAND: &str = "cat {pid_file} | xargs kill";

/// The canonical instance transition graph, built once.
pub fn instance_graph() -> Arc<StateGraph> {
    static GRAPH: OnceLock<Arc<StateGraph>> = OnceLock::new();
    GRAPH
        .get_or_init(|| {
            StateGraph::builder()
                .state(STATE_DOWN)
                .state(STATE_STARTING)
                .state(STATE_MONITORING)
                .state(STATE_UP)
                .state(STATE_FAILED)
                .state(STATE_STOPPING)
                .state(STATE_UNKNOWN)
                .transition(STATE_DOWN, "start", STATE_STARTING)
                .transition(STATE_STARTING, "monitor", STATE_MONITORING)
                .transition(STATE_STARTING, "down", STATE_FAILED)
                .transition(STATE_STARTING, "stop", STATE_STOPPING)
                .transition(STATE_MONITORING, "up", STATE_UP)
                .transition(STATE_MONITORING, "down", STATE_FAILED)
                .transition(STATE_MONITORING, "stop", STATE_STOPPING)
                .transition(STATE_MONITORING, "monitor_fail", STATE_UNKNOWN)
                .transition(STATE_UP, "monitor", STATE_MONITORING)
                .transition(STATE_UP, "stop", STATE_STOPPING)
                .transition(STATE_FAILED, "up", STATE_UP)
                .transition(STATE_FAILED, "stop", STATE_STOPPING)
                .transition(STATE_STOPPING, "down", STATE_DOWN)
                .transition(STATE_UNKNOWN, "monitor", STATE_MONITORING)
                .build()
                .expect("instance transition table is well formed")
        })
        .clone()
}

/// One running (or transitioning) copy of a service.
pub struct ServiceInstance {
    service: ServiceName,
    number: u32,
    node: Arc<Node>,
    machine: StateMachine,
    /// The single in-flight action, if any.
    pending: Option<ActionKind>,
    command_template: String,
    pid_file_template: Option<String>,
    monitor_interval: Option<Duration>,
}

impl ServiceInstance {
    pub fn new(
        service: ServiceName,
        number: u32,
        node: Arc<Node>,
        command_template: impl Into<String>,
        pid_file_template: Option<String>,
        monitor_interval: Option<Duration>,
    ) -> Self {
        let machine = StateMachine::new(instance_graph(), STATE_DOWN)
            .expect("initial instance state is in the graph");
        Self {
            service,
            number,
            node,
            machine,
            pending: None,
            command_template: command_template.into(),
            pid_file_template,
            monitor_interval,
        }
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn state(&self) -> &str {
        self.machine.state()
    }

    pub fn is(&self, state: &str) -> bool {
        self.machine.is(state)
    }

    /// Base variables available to this instance's templates.
    fn context(&self) -> CommandContext {
        CommandContext::new()
            .with("name", self.service.as_str())
            .with("instance_number", self.number.to_string())
            .with("node", self.node.hostname())
    }

    /// Rendered pid file path, or `None` if no template is configured or a
    /// variable cannot be resolved.
    pub fn pid_file(&self) -> Option<String> {
        let template = self.pid_file_template.as_deref()?;
        match self.context().render(template) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(service = %self.service, instance = self.number, error = %e,
                    "pid file template unavailable");
                None
            }
        }
    }

    /// Rendered start command, or `None` on an unresolved variable.
    pub fn command(&self) -> Option<String> {
        match self.context().render(&self.command_template) {
            Ok(command) => Some(command),
            Err(e) => {
                warn!(service = %self.service, instance = self.number, error = %e,
                    "command template unavailable");
                None
            }
        }
    }

    fn action_id(&self, kind: ActionKind) -> ActionId {
        ActionId::Instance {
            service: self.service.clone(),
            number: self.number,
            kind,
        }
    }

    /// Route lifecycle transitions to the event queue. Clears any wiring
    /// from a previous owner first.
    pub fn wire_listener(&mut self, fx: &Dispatcher) {
        let fx = fx.clone();
        let service = self.service.clone();
        let number = self.number;
        self.machine.clear_listeners();
        self.machine.listen(
            None,
            Box::new(move |t| {
                fx.emit(Event::instance_state_changed(
                    service.clone(),
                    number,
                    t.to.clone(),
                ));
            }),
        );
    }

    /// Begin the start sequence. Only legal from `down`.
    pub fn start(&mut self, fx: &Dispatcher) -> Result<(), InvalidStateError> {
        if !self.machine.is(STATE_DOWN) {
            return Err(InvalidStateError {
                entity: format!("{}.{}", self.service, self.number),
                operation: "start",
                expected: STATE_DOWN.to_string(),
                actual: self.machine.state().to_string(),
            });
        }
        self.machine.transition("start");

        match self.command() {
            Some(command) => {
                self.pending = Some(ActionKind::Start);
                fx.run_action(
                    &self.node,
                    ActionCommand {
                        id: self.action_id(ActionKind::Start),
                        command,
                    },
                );
            }
            None => {
                // An unrenderable command is a failed start, not a crash.
                self.machine.transition("down");
            }
        }
        Ok(())
    }

    /// Run one health check cycle.
    pub fn run_monitor(&mut self, fx: &Dispatcher) {
        if self.pending == Some(ActionKind::Monitor) {
            warn!(service = %self.service, instance = self.number,
                "monitor already in flight, skipping");
            return;
        }
        self.machine.transition("monitor");

        let Some(pid_file) = self.pid_file() else {
            self.machine.transition("monitor_fail");
            self.queue_monitor(fx);
            return;
        };

        let context = self.context().with("pid_file", pid_file);
        match context.render(MONITOR_COMMAND) {
            Ok(command) => {
                self.pending = Some(ActionKind::Monitor);
                fx.run_action(
                    &self.node,
                    ActionCommand {
                        id: self.action_id(ActionKind::Monitor),
                        command,
                    },
                );
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.number, error = %e,
                    "monitor command unavailable");
                self.machine.transition("monitor_fail");
                self.queue_monitor(fx);
            }
        }
    }

    /// Request a stop. A no-op in states where stop is not a legal verb.
    pub fn stop(&mut self, fx: &Dispatcher) {
        self.machine.transition("stop");
        // An instance stopped mid-start is not killed until its start
        // callback observes the stop in progress.
        if self.machine.is(STATE_STOPPING) && self.pending != Some(ActionKind::Start) {
            self.kill_instance(fx);
        }
    }

    fn kill_instance(&mut self, fx: &Dispatcher) {
        // A failed instance may reach stopping without ever having had a
        // process; with no pid file there is nothing to kill, so leave the
        // stop to the monitor cycle.
        let Some(pid_file) = self.pid_file() else {
            warn!(service = %self.service, instance = self.number,
                "no pid file to stop with");
            self.queue_monitor(fx);
            return;
        };
        let context = self.context().with("pid_file", pid_file);
        match context.render(KILL_COMMAND) {
            Ok(command) => {
                self.pending = Some(ActionKind::Stop);
                fx.run_action(
                    &self.node,
                    ActionCommand {
                        id: self.action_id(ActionKind::Stop),
                        command,
                    },
                );
            }
            Err(e) => {
                warn!(service = %self.service, instance = self.number, error = %e,
                    "kill command unavailable");
                self.queue_monitor(fx);
            }
        }
    }

    /// Handle completion of a previously dispatched action.
    pub fn handle_action(&mut self, kind: ActionKind, status: ActionStatus, fx: &Dispatcher) {
        if self.pending != Some(kind) {
            debug!(service = %self.service, instance = self.number, action = %kind,
                "stale action completion, ignoring");
            return;
        }
        self.pending = None;

        match kind {
            ActionKind::Start => self.start_complete(status, fx),
            ActionKind::Monitor => self.monitor_complete(status, fx),
            ActionKind::Stop => self.stop_complete(status, fx),
        }
    }

    fn start_complete(&mut self, status: ActionStatus, fx: &Dispatcher) {
        match status {
            ActionStatus::Completed { exit_status: 0 } => {
                if self.machine.is(STATE_STOPPING) {
                    // Told to stop while starting; kill now that we know the
                    // process exists.
                    self.kill_instance(fx);
                } else {
                    self.machine.transition("monitor");
                    self.queue_monitor(fx);
                }
            }
            ActionStatus::Completed { exit_status } => {
                info!(service = %self.service, instance = self.number, exit_status,
                    "start command failed");
                self.machine.transition("down");
            }
            ActionStatus::FailStart => {
                warn!(service = %self.service, instance = self.number,
                    "start command could not be dispatched");
                self.machine.transition("down");
            }
        }
    }

    fn monitor_complete(&mut self, status: ActionStatus, fx: &Dispatcher) {
        match status {
            ActionStatus::Completed { exit_status: 0 } => {
                self.machine.transition("up");
                self.queue_monitor(fx);
            }
            ActionStatus::Completed { exit_status } => {
                info!(service = %self.service, instance = self.number, exit_status,
                    "health check failed");
                self.machine.transition("down");
            }
            ActionStatus::FailStart => {
                // Monitoring never permanently stops itself on a transient
                // dispatch failure.
                self.machine.transition("monitor_fail");
                self.queue_monitor(fx);
            }
        }
    }

    fn stop_complete(&mut self, status: ActionStatus, fx: &Dispatcher) {
        match status {
            ActionStatus::Completed { exit_status: 0 } => {
                info!(service = %self.service, instance = self.number, "kill dispatched");
            }
            ActionStatus::Completed { exit_status } => {
                warn!(service = %self.service, instance = self.number, exit_status,
                    "kill command failed");
            }
            ActionStatus::FailStart => {
                warn!(service = %self.service, instance = self.number,
                    "kill command could not be dispatched");
            }
        }
        // Observe the result of the kill on the next monitor cycle.
        self.queue_monitor(fx);
    }

    /// Arm the next monitor cycle, if monitoring is enabled for the service.
    pub fn queue_monitor(&self, fx: &Dispatcher) {
        if let Some(interval) = self.monitor_interval {
            fx.arm(
                interval,
                TimerMsg::MonitorDue {
                    service: self.service.clone(),
                    instance: self.number,
                },
            );
        }
    }

    /// Adopt a successor configuration's templates in place.
    pub fn rebind(
        &mut self,
        command_template: impl Into<String>,
        pid_file_template: Option<String>,
        monitor_interval: Option<Duration>,
    ) {
        self.command_template = command_template.into();
        self.pid_file_template = pid_file_template;
        self.monitor_interval = monitor_interval;
    }

    /// Reassign this instance to a different node.
    pub fn set_node(&mut self, node: Arc<Node>) {
        self.node = node;
    }

    /// Map a persisted state name onto the canonical graph without firing
    /// listeners.
    pub fn force_state(&mut self, state: &str) -> Result<(), StateGraphError> {
        self.machine.force_state(state)
    }
}

impl std::fmt::Debug for ServiceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceInstance")
            .field("service", &self.service)
            .field("number", &self.number)
            .field("node", &self.node.hostname())
            .field("state", &self.machine.state())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ActionId;
    use crate::testing::harness;

    fn instance(monitor_interval: Option<Duration>) -> ServiceInstance {
        ServiceInstance::new(
            ServiceName::new("web"),
            0,
            Arc::new(Node::new("host-a")),
            "run-web --id {instance_number}",
            Some("/var/run/web-{instance_number}.pid".to_string()),
            monitor_interval,
        )
    }

    #[tokio::test]
    async fn test_start_dispatches_rendered_command() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();

        assert_eq!(inst.state(), STATE_STARTING);
        let dispatched = h.runner.dispatched();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].action.command, "run-web --id 0");
    }

    #[tokio::test]
    async fn test_start_only_legal_from_down() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        assert!(inst.start(&h.fx).is_err());
    }

    #[tokio::test]
    async fn test_unrenderable_command_is_a_failed_start() {
        let h = harness();
        let mut inst = ServiceInstance::new(
            ServiceName::new("web"),
            0,
            Arc::new(Node::new("host-a")),
            "run {no_such_var}",
            None,
            None,
        );
        inst.start(&h.fx).unwrap();

        assert_eq!(inst.state(), STATE_FAILED);
        assert_eq!(h.runner.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_successful_start_lands_in_monitoring() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_MONITORING);
    }

    #[tokio::test]
    async fn test_failed_start_lands_in_failed() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 2 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_FAILED);

        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(ActionKind::Start, ActionStatus::FailStart, &h.fx);
        assert_eq!(inst.state(), STATE_FAILED);
    }

    #[tokio::test]
    async fn test_monitor_cycle_success_and_failure() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );

        // The monitor command checks liveness against the pid file.
        inst.run_monitor(&h.fx);
        let last = h.runner.dispatched().pop().unwrap();
        assert_eq!(last.action.command, "cat /var/run/web-0.pid | xargs kill -0");

        inst.handle_action(
            ActionKind::Monitor,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_UP);

        inst.run_monitor(&h.fx);
        inst.handle_action(
            ActionKind::Monitor,
            ActionStatus::Completed { exit_status: 1 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_FAILED);
    }

    #[tokio::test]
    async fn test_monitor_failstart_goes_unknown_and_rearms() {
        let h = harness();
        let mut inst = instance(Some(Duration::from_secs(30)));
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        inst.run_monitor(&h.fx);
        inst.handle_action(ActionKind::Monitor, ActionStatus::FailStart, &h.fx);
        assert_eq!(inst.state(), STATE_UNKNOWN);
    }

    #[tokio::test]
    async fn test_monitor_reentrancy_guard() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        inst.run_monitor(&h.fx);
        assert_eq!(h.runner.dispatch_count(), 2);

        // A second cycle with the first still outstanding is skipped.
        inst.run_monitor(&h.fx);
        assert_eq!(h.runner.dispatch_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_completion_is_ignored() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Monitor,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        // Still awaiting the start result.
        assert_eq!(inst.state(), STATE_STARTING);
    }

    #[tokio::test]
    async fn test_stop_while_up_dispatches_kill() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        inst.run_monitor(&h.fx);
        inst.handle_action(
            ActionKind::Monitor,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_UP);

        inst.stop(&h.fx);
        assert_eq!(inst.state(), STATE_STOPPING);
        let last = h.runner.dispatched().pop().unwrap();
        assert_eq!(last.action.command, "cat /var/run/web-0.pid | xargs kill");
    }

    #[tokio::test]
    async fn test_stop_while_starting_defers_kill_to_start_callback() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();

        inst.stop(&h.fx);
        assert_eq!(inst.state(), STATE_STOPPING);
        // No kill yet; the process may not exist.
        assert_eq!(h.runner.dispatch_count(), 1);

        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        let last = h.runner.dispatched().pop().unwrap();
        assert!(matches!(
            last.action.id,
            ActionId::Instance {
                kind: ActionKind::Stop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stop_without_pid_file_dispatches_no_kill() {
        let h = harness();
        let mut inst = ServiceInstance::new(
            ServiceName::new("web"),
            0,
            Arc::new(Node::new("host-a")),
            "run-web --id {instance_number}",
            None,
            None,
        );
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 1 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_FAILED);

        inst.stop(&h.fx);
        assert_eq!(inst.state(), STATE_STOPPING);
        // Only the original start was dispatched; there is no pid to kill.
        assert_eq!(h.runner.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_kill_completion_settles_to_down_via_monitor() {
        let h = harness();
        let mut inst = instance(None);
        inst.start(&h.fx).unwrap();
        inst.handle_action(
            ActionKind::Start,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        inst.stop(&h.fx);
        inst.handle_action(
            ActionKind::Stop,
            ActionStatus::Completed { exit_status: 0 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_STOPPING);

        // The next monitor cycle observes the dead process.
        inst.run_monitor(&h.fx);
        inst.handle_action(
            ActionKind::Monitor,
            ActionStatus::Completed { exit_status: 1 },
            &h.fx,
        );
        assert_eq!(inst.state(), STATE_DOWN);
    }
}
