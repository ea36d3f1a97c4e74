//! The desired-count abstraction over a set of service instances.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::state::{StateGraph, StateGraphError, StateMachine};
use crate::core::types::ServiceName;
use crate::events::Event;
use crate::execution::{ActionKind, ActionStatus, NodePool};
use crate::scheduler::dispatch::{Dispatcher, TimerMsg};
use crate::service::instance::{
    ServiceInstance, STATE_DOWN, STATE_FAILED, STATE_MONITORING, STATE_STOPPING, STATE_UP,
};
use crate::storage::InstanceData;

pub const SVC_DOWN: &str = "down";
pub const SVC_STARTING: &str = "starting";
pub const SVC_UP: &str = "up";
pub const SVC_DEGRADED: &str = "degraded";
pub const SVC_FAILED: &str = "failed";
pub const SVC_STOPPING: &str = "stopping";

/// The canonical service transition graph, built once.
pub fn service_graph() -> Arc<StateGraph> {
    static GRAPH: OnceLock<Arc<StateGraph>> = OnceLock::new();
    GRAPH
        .get_or_init(|| {
            StateGraph::builder()
                .state(SVC_DOWN)
                .state(SVC_STARTING)
                .state(SVC_UP)
                .state(SVC_DEGRADED)
                .state(SVC_FAILED)
                .state(SVC_STOPPING)
                .transition(SVC_DOWN, "start", SVC_STARTING)
                .transition(SVC_STARTING, "all_up", SVC_UP)
                .transition(SVC_STARTING, "failed", SVC_DEGRADED)
                .transition(SVC_STARTING, "stop", SVC_STOPPING)
                .transition(SVC_UP, "failed", SVC_DEGRADED)
                .transition(SVC_UP, "down", SVC_DEGRADED)
                .transition(SVC_UP, "stop", SVC_STOPPING)
                .transition(SVC_DEGRADED, "all_up", SVC_UP)
                .transition(SVC_DEGRADED, "all_failed", SVC_FAILED)
                .transition(SVC_DEGRADED, "stop", SVC_STOPPING)
                .transition(SVC_FAILED, "start", SVC_STARTING)
                .transition(SVC_FAILED, "up", SVC_DEGRADED)
                .transition(SVC_FAILED, "stop", SVC_STOPPING)
                .transition(SVC_STOPPING, "all_down", SVC_DOWN)
                .build()
                .expect("service transition table is well formed")
        })
        .clone()
}

/// A supervised workload with a target instance count.
pub struct Service {
    name: ServiceName,
    command_template: String,
    pid_file_template: Option<String>,
    node_pool: NodePool,
    count: u32,
    monitor_interval: Option<Duration>,
    restart_interval: Option<Duration>,
    /// A restart timer is armed and has not yet fired.
    restart_pending: bool,
    machine: StateMachine,
    /// Kept sorted by instance number.
    instances: Vec<ServiceInstance>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: ServiceName,
        command_template: impl Into<String>,
        pid_file_template: Option<String>,
        node_pool: NodePool,
        count: u32,
        monitor_interval: Option<Duration>,
        restart_interval: Option<Duration>,
    ) -> Self {
        let machine = StateMachine::new(service_graph(), SVC_DOWN)
            .expect("initial service state is in the graph");
        Self {
            name,
            command_template: command_template.into(),
            pid_file_template,
            node_pool,
            count,
            monitor_interval,
            restart_interval,
            restart_pending: false,
            machine,
            instances: Vec::new(),
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn state(&self) -> &str {
        self.machine.state()
    }

    pub fn instances(&self) -> &[ServiceInstance] {
        &self.instances
    }

    pub fn node_pool(&self) -> &NodePool {
        &self.node_pool
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Route aggregate transitions to the event queue. Clears wiring from a
    /// previous owner first.
    pub fn wire_events(&mut self, fx: &Dispatcher) {
        let fx = fx.clone();
        let name = self.name.clone();
        self.machine.clear_listeners();
        self.machine.listen(
            None,
            Box::new(move |t| {
                fx.emit(Event::service_state_changed(name.clone(), t.to.clone()));
            }),
        );
    }

    /// Bring the service up to its target count.
    pub fn start(&mut self, fx: &Dispatcher) {
        self.restart_pending = false;
        // Failed instances are gone as far as recovery is concerned; they
        // are rebuilt, not resurrected.
        self.instances.retain(|i| !i.is(STATE_FAILED));
        while (self.instances.len() as u32) < self.count {
            if self.build_instance(fx).is_none() {
                break;
            }
        }
        self.machine.transition("start");
    }

    /// Stop every instance and begin winding down.
    pub fn stop(&mut self, fx: &Dispatcher) {
        self.machine.transition("stop");
        for instance in &mut self.instances {
            instance.stop(fx);
        }
        self.instance_change(fx);
    }

    /// Create, register, and start one new instance. Returns its number, or
    /// `None` if no node or instance number is available.
    fn build_instance(&mut self, fx: &Dispatcher) -> Option<u32> {
        let node = match self.node_pool.next_round_robin() {
            Some(node) => node,
            None => {
                error!(service = %self.name, "no nodes available");
                return None;
            }
        };
        let number = match self.free_instance_number() {
            Some(number) => number,
            None => {
                error!(service = %self.name, count = self.count,
                    "all instance numbers in use");
                return None;
            }
        };

        let mut instance = ServiceInstance::new(
            self.name.clone(),
            number,
            node,
            self.command_template.clone(),
            self.pid_file_template.clone(),
            self.monitor_interval,
        );
        instance.wire_listener(fx);
        if let Err(e) = instance.start(fx) {
            warn!(service = %self.name, instance = number, error = %e,
                "new instance refused to start");
        }
        self.instances.push(instance);
        self.instances.sort_by_key(|i| i.number());
        Some(number)
    }

    /// Lowest unused instance number in `[0, count)`.
    fn free_instance_number(&self) -> Option<u32> {
        (0..self.count).find(|n| !self.instances.iter().any(|i| i.number() == *n))
    }

    /// Re-derive aggregate state after any instance transition.
    ///
    /// The checks are mutually exclusive, in priority order: a roster below
    /// `count` must never report `all_up` just because the survivors are
    /// healthy.
    fn instance_change(&mut self, fx: &Dispatcher) {
        // Instances settled in down are gone and must be rebuilt.
        self.instances.retain(|i| !i.is(STATE_DOWN));

        if self.instances.is_empty() {
            self.machine.transition("all_down");
        } else {
            let failed = self.instances.iter().filter(|i| i.is(STATE_FAILED)).count();
            if failed > 0 {
                self.machine.transition("failed");
                if failed == self.instances.len() {
                    self.machine.transition("all_failed");
                }
            } else if (self.instances.len() as u32) < self.count {
                self.machine.transition("down");
            } else if self.instances.iter().all(|i| i.is(STATE_UP)) {
                self.machine.transition("all_up");
            }
        }

        if matches!(self.machine.state(), SVC_DEGRADED | SVC_FAILED) {
            if let Some(interval) = self.restart_interval {
                if !self.restart_pending {
                    self.restart_pending = true;
                    fx.arm(
                        interval,
                        TimerMsg::RestartDue {
                            service: self.name.clone(),
                        },
                    );
                }
            }
        }
    }

    /// A previously armed restart timer fired.
    pub fn handle_restart_due(&mut self, fx: &Dispatcher) {
        if !self.restart_pending {
            return;
        }
        if matches!(self.machine.state(), SVC_DEGRADED | SVC_FAILED) {
            info!(service = %self.name, state = %self.machine.state(),
                "restarting after failure");
            self.start(fx);
        } else {
            self.restart_pending = false;
        }
    }

    /// An action dispatched by one of this service's instances completed.
    pub fn handle_action_done(
        &mut self,
        number: u32,
        kind: ActionKind,
        status: ActionStatus,
        fx: &Dispatcher,
    ) {
        match self.instances.iter_mut().find(|i| i.number() == number) {
            Some(instance) => instance.handle_action(kind, status, fx),
            None => {
                debug!(service = %self.name, instance = number, action = %kind,
                    "completion for departed instance, ignoring");
                return;
            }
        }
        self.instance_change(fx);
    }

    /// A monitor timer for one of this service's instances fired.
    pub fn handle_monitor_due(&mut self, number: u32, fx: &Dispatcher) {
        match self.instances.iter_mut().find(|i| i.number() == number) {
            Some(instance) => instance.run_monitor(fx),
            None => return,
        }
        self.instance_change(fx);
    }

    /// Take over state and instances from the previous definition of this
    /// service, then reconcile live instances against the new topology.
    ///
    /// A changed command template invalidates in-place reuse and stops every
    /// inherited instance. Otherwise reconciliation runs three passes over
    /// live instances: node-pool membership and per-node concentration,
    /// count overflow trimmed from the highest numbers, then shortfall fill.
    /// Stopped instances stay in the roster until their own machines settle
    /// to down, so the service never reports all_up over a mid-stop
    /// old-generation instance.
    pub fn absorb_previous(&mut self, prev: Service, fx: &Dispatcher) {
        let rebuild_all = self.command_template != prev.command_template;
        let pool_changed = self.node_pool != prev.node_pool;

        self.machine = prev.machine;
        self.wire_events(fx);
        self.restart_pending = prev.restart_pending;

        for mut instance in prev.instances {
            instance.rebind(
                self.command_template.clone(),
                self.pid_file_template.clone(),
                self.monitor_interval,
            );
            instance.wire_listener(fx);
            self.instances.push(instance);
        }
        self.instances.sort_by_key(|i| i.number());

        if rebuild_all {
            info!(service = %self.name, "command changed, replacing all instances");
            for instance in &mut self.instances {
                instance.stop(fx);
            }
        } else {
            let mut removed = 0usize;

            if pool_changed {
                let optimal = if self.node_pool.is_empty() {
                    0
                } else {
                    (self.count as usize) / self.node_pool.len()
                };
                let mut tally: Vec<(String, usize)> = Vec::new();
                for instance in &mut self.instances {
                    if !Self::is_live(instance) {
                        continue;
                    }
                    if !self.node_pool.contains(instance.node()) {
                        instance.stop(fx);
                        removed += 1;
                        continue;
                    }
                    let hostname = instance.node().hostname().to_string();
                    let entry = match tally.iter_mut().find(|(h, _)| *h == hostname) {
                        Some(entry) => entry,
                        None => {
                            tally.push((hostname, 0));
                            tally.last_mut().expect("just pushed")
                        }
                    };
                    if entry.1 >= optimal {
                        instance.stop(fx);
                        removed += 1;
                    } else {
                        entry.1 += 1;
                    }
                }
            }

            let mut excess = (self.instances.len() - removed)
                .saturating_sub(self.count as usize);
            // Trim from the tail so low-numbered instances survive.
            for instance in self.instances.iter_mut().rev() {
                if excess == 0 {
                    break;
                }
                if Self::is_live(instance) {
                    instance.stop(fx);
                    excess -= 1;
                }
            }

            while (self.instances.len() as u32) < self.count {
                if self.build_instance(fx).is_none() {
                    break;
                }
            }
        }

        self.instance_change(fx);
    }

    fn is_live(instance: &ServiceInstance) -> bool {
        !(instance.is(STATE_DOWN) || instance.is(STATE_STOPPING) || instance.is(STATE_FAILED))
    }

    /// Rebuild supervision from a persisted snapshot.
    ///
    /// A down service has no outstanding work. Otherwise each recorded
    /// instance is recreated on its node, forced straight to `monitoring`,
    /// and given one monitor cycle; restore assumes the process is already
    /// running and just needs health re-verification.
    pub fn restore(
        &mut self,
        state: &str,
        instances: &[InstanceData],
        fx: &Dispatcher,
    ) -> Result<(), StateGraphError> {
        self.machine.force_state(state)?;
        if state == SVC_DOWN {
            return Ok(());
        }

        for record in instances {
            let node = match self.node_pool.get(&record.node) {
                Some(node) => node,
                None => {
                    error!(service = %self.name, instance = record.instance_number,
                        node = %record.node, "node no longer in pool, dropping instance");
                    continue;
                }
            };
            let mut instance = ServiceInstance::new(
                self.name.clone(),
                record.instance_number,
                node,
                self.command_template.clone(),
                self.pid_file_template.clone(),
                self.monitor_interval,
            );
            if let Err(e) = instance.force_state(STATE_MONITORING) {
                error!(service = %self.name, instance = record.instance_number,
                    error = %e, "could not restore instance");
                continue;
            }
            instance.wire_listener(fx);
            instance.run_monitor(fx);
            self.instances.push(instance);
        }
        self.instances.sort_by_key(|i| i.number());
        Ok(())
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &self.machine.state())
            .field("count", &self.count)
            .field("instances", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Node;
    use crate::testing::harness;

    fn pool(hosts: &[&str]) -> NodePool {
        NodePool::new(hosts.iter().map(|h| Arc::new(Node::new(*h))).collect())
    }

    fn service(count: u32, hosts: &[&str], restart: Option<Duration>) -> Service {
        Service::new(
            ServiceName::new("web"),
            "run-web --id {instance_number}",
            Some("/var/run/web-{instance_number}.pid".to_string()),
            pool(hosts),
            count,
            None,
            restart,
        )
    }

    fn complete(svc: &mut Service, number: u32, kind: ActionKind, exit: i32, fx: &Dispatcher) {
        svc.handle_action_done(
            number,
            kind,
            ActionStatus::Completed { exit_status: exit },
            fx,
        );
    }

    #[tokio::test]
    async fn test_start_builds_count_instances_to_all_up() {
        // Scenario: count=2, empty roster, both starts succeed.
        let h = harness();
        let mut svc = service(2, &["a", "b"], None);
        svc.start(&h.fx);

        assert_eq!(svc.state(), SVC_STARTING);
        assert_eq!(svc.instances().len(), 2);
        assert_eq!(h.runner.dispatch_count(), 2);

        complete(&mut svc, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut svc, 1, ActionKind::Start, 0, &h.fx);
        // With monitoring disabled the machines sit in monitoring; drive
        // one verification each.
        svc.handle_monitor_due(0, &h.fx);
        svc.handle_monitor_due(1, &h.fx);
        complete(&mut svc, 0, ActionKind::Monitor, 0, &h.fx);
        complete(&mut svc, 1, ActionKind::Monitor, 0, &h.fx);

        assert_eq!(svc.state(), SVC_UP);
    }

    #[tokio::test]
    async fn test_instances_spread_round_robin() {
        let h = harness();
        let mut svc = service(4, &["a", "b"], None);
        svc.start(&h.fx);

        let hosts: Vec<String> = svc
            .instances()
            .iter()
            .map(|i| i.node().hostname().to_string())
            .collect();
        assert_eq!(hosts, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn test_single_failure_degrades_total_failure_escalates() {
        // Scenario: count=1, monitor reports the process dead.
        let h = harness();
        let mut svc = service(1, &["a"], Some(Duration::from_secs(10)));
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 0, &h.fx);
        svc.handle_monitor_due(0, &h.fx);
        complete(&mut svc, 0, ActionKind::Monitor, 0, &h.fx);
        assert_eq!(svc.state(), SVC_UP);

        svc.handle_monitor_due(0, &h.fx);
        complete(&mut svc, 0, ActionKind::Monitor, 1, &h.fx);
        assert_eq!(svc.state(), SVC_FAILED);
        assert!(svc.restart_pending);
    }

    #[tokio::test]
    async fn test_restart_due_rebuilds_failed_instances() {
        let h = harness();
        let mut svc = service(1, &["a"], Some(Duration::from_secs(10)));
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 1, &h.fx);
        assert_eq!(svc.state(), SVC_FAILED);

        svc.handle_restart_due(&h.fx);
        assert_eq!(svc.state(), SVC_STARTING);
        assert_eq!(svc.instances().len(), 1);
        assert!(!svc.restart_pending);
    }

    #[tokio::test]
    async fn test_restart_due_after_recovery_is_noop() {
        let h = harness();
        let mut svc = service(1, &["a"], Some(Duration::from_secs(10)));
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 1, &h.fx);
        assert!(svc.restart_pending);

        // Recovered before the timer fired.
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 0, &h.fx);
        svc.handle_monitor_due(0, &h.fx);
        complete(&mut svc, 0, ActionKind::Monitor, 0, &h.fx);
        assert_eq!(svc.state(), SVC_UP);

        svc.restart_pending = true;
        let dispatched_before = h.runner.dispatch_count();
        svc.handle_restart_due(&h.fx);
        assert_eq!(h.runner.dispatch_count(), dispatched_before);
        assert!(!svc.restart_pending);
    }

    #[tokio::test]
    async fn test_stop_with_no_instances_completes_immediately() {
        let h = harness();
        let mut svc = service(1, &["a"], None);
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 1, &h.fx);
        // Failed roster member; drop it and stop.
        svc.instances.clear();
        svc.stop(&h.fx);
        assert_eq!(svc.state(), SVC_DOWN);
    }

    #[tokio::test]
    async fn test_absorb_unchanged_config_stops_nothing() {
        let h = harness();
        let mut old = service(2, &["a", "b"], None);
        old.start(&h.fx);
        complete(&mut old, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut old, 1, ActionKind::Start, 0, &h.fx);
        h.runner.clear();

        let mut new = service(2, &["a", "b"], None);
        new.absorb_previous(old, &h.fx);

        assert_eq!(new.instances().len(), 2);
        assert_eq!(h.runner.dispatch_count(), 0);
        assert!(new
            .instances()
            .iter()
            .all(|i| i.is(STATE_MONITORING)));
    }

    #[tokio::test]
    async fn test_absorb_command_change_stops_everything() {
        let h = harness();
        let mut old = service(2, &["a", "b"], None);
        old.start(&h.fx);
        complete(&mut old, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut old, 1, ActionKind::Start, 0, &h.fx);

        let mut new = Service::new(
            ServiceName::new("web"),
            "run-web-v2 --id {instance_number}",
            Some("/var/run/web-{instance_number}.pid".to_string()),
            pool(&["a", "b"]),
            2,
            None,
            None,
        );
        new.absorb_previous(old, &h.fx);

        assert!(new.instances().iter().all(|i| i.is(STATE_STOPPING)));
    }

    #[tokio::test]
    async fn test_absorb_pool_shrink_leaves_no_off_pool_instance() {
        let h = harness();
        let mut old = service(2, &["a", "b"], None);
        old.start(&h.fx);
        complete(&mut old, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut old, 1, ActionKind::Start, 0, &h.fx);

        let mut new = service(2, &["a"], None);
        new.absorb_previous(old, &h.fx);

        for instance in new.instances() {
            if !instance.is(STATE_STOPPING) {
                assert!(new.node_pool().contains(instance.node()));
            }
        }
    }

    #[tokio::test]
    async fn test_absorb_count_shrink_trims_highest_numbers() {
        let h = harness();
        let mut old = service(3, &["a", "b", "c"], None);
        old.start(&h.fx);
        for n in 0..3 {
            complete(&mut old, n, ActionKind::Start, 0, &h.fx);
        }

        let mut new = Service::new(
            ServiceName::new("web"),
            "run-web --id {instance_number}",
            Some("/var/run/web-{instance_number}.pid".to_string()),
            pool(&["a", "b", "c"]),
            2,
            None,
            None,
        );
        new.absorb_previous(old, &h.fx);

        let stopping: Vec<u32> = new
            .instances()
            .iter()
            .filter(|i| i.is(STATE_STOPPING))
            .map(|i| i.number())
            .collect();
        assert_eq!(stopping, vec![2]);
    }

    #[tokio::test]
    async fn test_not_all_up_while_old_generation_still_stopping() {
        let h = harness();
        // Both instances are mid-startup (monitoring) when the pool shrinks.
        let mut old = service(2, &["a", "b"], None);
        old.start(&h.fx);
        complete(&mut old, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut old, 1, ActionKind::Start, 0, &h.fx);
        assert_eq!(old.state(), SVC_STARTING);

        let mut new = service(2, &["a"], None);
        new.absorb_previous(old, &h.fx);
        assert!(new.instances().iter().any(|i| i.is(STATE_STOPPING)));

        // The surviving instance comes up, but the aggregate must not fire
        // all_up while the old-generation instance is still mid-stop.
        new.handle_monitor_due(0, &h.fx);
        complete(&mut new, 0, ActionKind::Monitor, 0, &h.fx);
        assert!(new.instances()[0].is(STATE_UP));
        assert_ne!(new.state(), SVC_UP);
    }

    #[tokio::test]
    async fn test_under_count_with_healthy_survivors_is_not_up() {
        let h = harness();
        let mut old = service(2, &["a", "b"], None);
        old.start(&h.fx);
        complete(&mut old, 0, ActionKind::Start, 0, &h.fx);
        complete(&mut old, 1, ActionKind::Start, 0, &h.fx);

        // Pool shrink stops the off-pool instance.
        let mut new = service(2, &["a"], None);
        new.absorb_previous(old, &h.fx);

        // It settles to down and leaves the roster.
        complete(&mut new, 1, ActionKind::Stop, 0, &h.fx);
        new.handle_monitor_due(1, &h.fx);
        complete(&mut new, 1, ActionKind::Monitor, 1, &h.fx);
        assert_eq!(new.instances().len(), 1);

        // The survivor is healthy, but the service is at half capacity and
        // must not report full health.
        new.handle_monitor_due(0, &h.fx);
        complete(&mut new, 0, ActionKind::Monitor, 0, &h.fx);
        assert!(new.instances()[0].is(STATE_UP));
        assert_ne!(new.state(), SVC_UP);
    }

    #[tokio::test]
    async fn test_stop_without_pid_files_survives_failed_instance() {
        let h = harness();
        let mut svc = Service::new(
            ServiceName::new("web"),
            "run-web --id {instance_number}",
            None,
            pool(&["a"]),
            1,
            None,
            None,
        );
        svc.start(&h.fx);
        complete(&mut svc, 0, ActionKind::Start, 1, &h.fx);
        assert_eq!(svc.state(), SVC_FAILED);

        // No pid file means nothing to kill; the stop must not crash.
        svc.stop(&h.fx);
        assert_eq!(svc.state(), SVC_STOPPING);
        assert!(svc.instances()[0].is(STATE_STOPPING));
    }

    #[tokio::test]
    async fn test_build_instance_never_reuses_live_number() {
        let h = harness();
        let mut svc = service(2, &["a", "b"], None);
        svc.start(&h.fx);
        // Instance 0 fails and is cleared on the next start; instance 1
        // stays live and keeps its number.
        complete(&mut svc, 0, ActionKind::Start, 1, &h.fx);
        svc.start(&h.fx);

        let numbers: Vec<u32> = svc.instances().iter().map(|i| i.number()).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(svc.instances().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_reverifies_each_instance() {
        let h = harness();
        let mut svc = service(2, &["a", "b"], None);
        let records = vec![
            InstanceData {
                node: "a".to_string(),
                instance_number: 0,
                state: STATE_MONITORING.to_string(),
            },
            InstanceData {
                node: "b".to_string(),
                instance_number: 1,
                state: STATE_MONITORING.to_string(),
            },
        ];
        svc.restore(SVC_UP, &records, &h.fx).unwrap();

        assert_eq!(svc.state(), SVC_UP);
        assert_eq!(svc.instances().len(), 2);
        assert!(svc.instances().iter().all(|i| i.is(STATE_MONITORING)));
        // Exactly one monitor dispatch per restored instance.
        assert_eq!(h.runner.dispatch_count(), 2);
    }

    #[tokio::test]
    async fn test_restore_down_service_restores_nothing() {
        let h = harness();
        let mut svc = service(2, &["a", "b"], None);
        let records = vec![InstanceData {
            node: "a".to_string(),
            instance_number: 0,
            state: STATE_MONITORING.to_string(),
        }];
        svc.restore(SVC_DOWN, &records, &h.fx).unwrap();
        assert!(svc.instances().is_empty());
        assert_eq!(h.runner.dispatch_count(), 0);
    }

    #[tokio::test]
    async fn test_restore_unknown_state_is_an_error() {
        let h = harness();
        let mut svc = service(1, &["a"], None);
        assert!(svc.restore("sideways", &[], &h.fx).is_err());
    }

    #[tokio::test]
    async fn test_restore_skips_departed_nodes() {
        let h = harness();
        let mut svc = service(2, &["a"], None);
        let records = vec![
            InstanceData {
                node: "a".to_string(),
                instance_number: 0,
                state: STATE_MONITORING.to_string(),
            },
            InstanceData {
                node: "gone".to_string(),
                instance_number: 1,
                state: STATE_MONITORING.to_string(),
            },
        ];
        svc.restore(SVC_UP, &records, &h.fx).unwrap();
        assert_eq!(svc.instances().len(), 1);
        assert_eq!(svc.instances()[0].number(), 0);
    }
}
