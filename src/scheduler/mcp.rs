//! The master control program: owns every job, service, and node, drives
//! the event loop, and coordinates scheduling, supervision, and persistence.
//!
//! All mutation happens on one task. Action completions, timer expiries,
//! lifecycle events, and administrative commands arrive as messages over
//! channels and are handled strictly sequentially, so none of the state
//! machines need locking.

use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::types::{JobName, RunId, ServiceName};
use crate::events::{Event, EventBus};
use crate::execution::{ActionCommand, ActionDone, ActionId, CommandRunner, Node};
use crate::scheduler::dispatch::{Dispatcher, TimerMsg};
use crate::scheduler::job::{sleep_time, Job, RunState};
use crate::service::Service;
use crate::storage::{InstanceData, JobData, RunData, ServiceData, Snapshot, StateHandler};

const COMMAND_CHANNEL_BUFFER: usize = 64;

/// How often state snapshots are taken by default.
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(3);

/// Errors surfaced to administrative callers.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("channel error: {0}")]
    Channel(String),

    #[error("unknown job: {0}")]
    UnknownJob(JobName),

    #[error("unknown service: {0}")]
    UnknownService(ServiceName),
}

/// Administrative commands handled by the daemon loop.
enum McpCommand {
    EnableJob {
        name: JobName,
        response: oneshot::Sender<Result<(), McpError>>,
    },
    DisableJob {
        name: JobName,
        response: oneshot::Sender<Result<(), McpError>>,
    },
    EnableAll {
        response: oneshot::Sender<()>,
    },
    DisableAll {
        response: oneshot::Sender<()>,
    },
    StartService {
        name: ServiceName,
        response: oneshot::Sender<Result<(), McpError>>,
    },
    StopService {
        name: ServiceName,
        response: oneshot::Sender<Result<(), McpError>>,
    },
    Status {
        response: oneshot::Sender<StatusReport>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Point-in-time status of everything the daemon manages.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub jobs: Vec<JobStatus>,
    pub services: Vec<ServiceStatus>,
}

#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: JobName,
    pub enabled: bool,
    pub next_run: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub state: String,
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub number: u32,
    pub node: String,
    pub state: String,
}

/// Handle for controlling a running daemon.
#[derive(Clone)]
pub struct McpHandle {
    command_tx: mpsc::Sender<McpCommand>,
}

impl McpHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<(), McpError>>) -> McpCommand,
        operation: &str,
    ) -> Result<(), McpError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| McpError::Channel(format!("failed to send {} command", operation)))?;

        response_rx
            .await
            .map_err(|_| McpError::Channel(format!("failed to receive {} response", operation)))?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> McpCommand,
        operation: &str,
    ) -> Result<(), McpError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| McpError::Channel(format!("failed to send {} command", operation)))?;

        response_rx
            .await
            .map_err(|_| McpError::Channel(format!("failed to receive {} response", operation)))?;

        Ok(())
    }

    pub async fn enable_job(&self, name: impl Into<JobName>) -> Result<(), McpError> {
        let name = name.into();
        self.send_result_command(
            |response| McpCommand::EnableJob { name, response },
            "enable_job",
        )
        .await
    }

    pub async fn disable_job(&self, name: impl Into<JobName>) -> Result<(), McpError> {
        let name = name.into();
        self.send_result_command(
            |response| McpCommand::DisableJob { name, response },
            "disable_job",
        )
        .await
    }

    pub async fn enable_all(&self) -> Result<(), McpError> {
        self.send_unit_command(|response| McpCommand::EnableAll { response }, "enable_all")
            .await
    }

    pub async fn disable_all(&self) -> Result<(), McpError> {
        self.send_unit_command(
            |response| McpCommand::DisableAll { response },
            "disable_all",
        )
        .await
    }

    pub async fn start_service(&self, name: impl Into<ServiceName>) -> Result<(), McpError> {
        let name = name.into();
        self.send_result_command(
            |response| McpCommand::StartService { name, response },
            "start_service",
        )
        .await
    }

    pub async fn stop_service(&self, name: impl Into<ServiceName>) -> Result<(), McpError> {
        let name = name.into();
        self.send_result_command(
            |response| McpCommand::StopService { name, response },
            "stop_service",
        )
        .await
    }

    pub async fn status(&self) -> Result<StatusReport, McpError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(McpCommand::Status {
                response: response_tx,
            })
            .await
            .map_err(|_| McpError::Channel("failed to send status command".to_string()))?;
        response_rx
            .await
            .map_err(|_| McpError::Channel("failed to receive status response".to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.send_unit_command(|response| McpCommand::Shutdown { response }, "shutdown")
            .await
    }
}

/// The daemon's single authoritative copy of all state.
pub struct MasterControlProgram {
    jobs: HashMap<JobName, Job>,
    services: HashMap<ServiceName, Service>,
    /// Global node registry, append-only, deduplicated by hostname.
    nodes: Vec<Arc<Node>>,
    state_handler: StateHandler,
    snapshot_interval: Duration,
    fx: Dispatcher,
    events: Arc<EventBus>,
    done_rx: UnboundedReceiver<ActionDone>,
    timer_rx: UnboundedReceiver<TimerMsg>,
    event_rx: UnboundedReceiver<Event>,
}

impl MasterControlProgram {
    pub fn new(working_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let fx = Dispatcher::new(runner, done_tx, timer_tx, event_tx);
        Self {
            jobs: HashMap::new(),
            services: HashMap::new(),
            nodes: Vec::new(),
            state_handler: StateHandler::new(working_dir),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            fx,
            events: Arc::new(EventBus::new()),
            done_rx,
            timer_rx,
            event_rx,
        }
    }

    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    /// Register a node into the global set, deduplicated by hostname.
    pub fn register_node(&mut self, node: Arc<Node>) {
        if !self.nodes.iter().any(|n| n.hostname() == node.hostname()) {
            self.nodes.push(node);
        }
    }

    pub fn node_by_hostname(&self, hostname: &str) -> Option<Arc<Node>> {
        self.nodes
            .iter()
            .find(|n| n.hostname() == hostname)
            .cloned()
    }

    /// Register or replace a job.
    ///
    /// An unchanged definition is a no-op. A changed one absorbs the old
    /// job's run history, and if the old job was enabled, is disabled and
    /// re-enabled so the new schedule takes effect cleanly.
    pub fn add_job(&mut self, mut job: Job) {
        let name = job.name().clone();
        if let Some(existing) = self.jobs.get(&name) {
            if *existing == job {
                debug!(job = %name, "job unchanged");
                return;
            }
        }

        let prev = self.jobs.remove(&name);
        let was_enabled = prev.as_ref().map(|j| j.enabled()).unwrap_or(false);
        let changed = prev.is_some();
        if let Some(prev) = prev {
            info!(job = %name, "job definition changed, absorbing history");
            job.absorb_old_job(prev);
        }

        if let Some(dir) = job.output_dir() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(job = %name, path = %dir.display(), error = %e,
                    "could not create output directory");
            }
        }
        for node in job.node_pool().nodes() {
            self.register_node(node.clone());
        }
        self.jobs.insert(name.clone(), job);

        if changed && was_enabled {
            self.disable_job(&name);
            self.enable_job(&name);
        }
    }

    /// Register or replace a service. A replacement absorbs the previous
    /// definition's machine and instances and rebalances them.
    pub fn add_service(&mut self, mut service: Service) {
        let name = service.name().clone();
        for node in service.node_pool().nodes() {
            self.register_node(node.clone());
        }
        match self.services.remove(&name) {
            Some(prev) => service.absorb_previous(prev, &self.fx),
            None => service.wire_events(&self.fx),
        }
        self.services.insert(name, service);
    }

    /// Arm a timer for the job's next occurrence. A no-op if a scheduled
    /// run is already pending, so calling this twice arms only one timer.
    pub fn schedule_next_run(&mut self, name: &JobName) {
        let Some(job) = self.jobs.get_mut(name) else {
            return;
        };
        if job.latest_run().map(|r| r.is_scheduled()).unwrap_or(false) {
            return;
        }
        let now = Utc::now();
        let Some((run, mut run_time)) = job.next_run(now) else {
            warn!(job = %name, "schedule has no further occurrences");
            return;
        };

        let delay = sleep_time(run_time, now);
        if delay.is_zero() {
            // Already due; never fire with a stale timestamp.
            run_time = now;
            if let Some(r) = job.run_mut(run) {
                r.run_time = now;
            }
        }
        self.fx.arm(
            delay,
            TimerMsg::RunDue {
                job: name.clone(),
                run,
            },
        );
        self.fx
            .emit(Event::job_scheduled(name.clone(), run, run_time));
        debug!(job = %name, run = %run, run_time = %run_time, "scheduled");
    }

    /// A run's timer fired.
    pub fn run_job(&mut self, name: &JobName, run: RunId) {
        let Some(job) = self.jobs.get_mut(name) else {
            return;
        };
        if !job.enabled() {
            // Remember that the run was due so re-enabling can pick it up.
            if let Some(r) = job.run_mut(run) {
                if r.is_scheduled() {
                    r.state = RunState::Queued;
                }
            }
            debug!(job = %name, "job disabled, not running");
            return;
        }
        match job.run(run).map(|r| r.state) {
            Some(RunState::Scheduled) | Some(RunState::Queued) => self.start_run(name, run),
            Some(_) => debug!(job = %name, run = %run, "run already settled, ignoring fire"),
            None => debug!(job = %name, run = %run, "stale run timer"),
        }
        self.schedule_next_run(name);
    }

    /// Dispatch a run's command, or queue it behind a running predecessor.
    fn start_run(&mut self, name: &JobName, run: RunId) {
        let Some(job) = self.jobs.get_mut(name) else {
            return;
        };
        if job.has_running() {
            if let Some(r) = job.run_mut(run) {
                r.state = RunState::Queued;
            }
            debug!(job = %name, run = %run, "previous run still executing, queued");
            return;
        }
        let Some(node) = job.pick_node() else {
            error!(job = %name, "no nodes available, failing run");
            if let Some(r) = job.run_mut(run) {
                r.state = RunState::Failed;
            }
            return;
        };
        let command = job.command().to_string();
        if let Some(r) = job.run_mut(run) {
            r.state = RunState::Running;
        }
        self.fx.run_action(
            &node,
            ActionCommand {
                id: ActionId::Run {
                    job: name.clone(),
                    run,
                },
                command,
            },
        );
        self.fx.emit(Event::run_started(name.clone(), run));
    }

    /// Route an action completion to its owner.
    pub fn handle_action_done(&mut self, done: ActionDone) {
        match done.id {
            ActionId::Run { job: name, run } => {
                let Some(job) = self.jobs.get_mut(&name) else {
                    return;
                };
                let success = done.status.success();
                match job.run_mut(run) {
                    Some(r) if r.is_running() => {
                        r.state = if success {
                            RunState::Succeeded
                        } else {
                            RunState::Failed
                        };
                    }
                    _ => {
                        debug!(job = %name, run = %run, "stale run completion");
                        return;
                    }
                }
                self.fx.emit(Event::run_completed(name.clone(), run, success));

                // A queued successor was waiting on this run.
                if job.enabled() {
                    let queued = job
                        .next_to_finish()
                        .filter(|r| r.is_queued())
                        .map(|r| r.id);
                    if let Some(next) = queued {
                        self.start_run(&name, next);
                    }
                }
            }
            ActionId::Instance {
                service: name,
                number,
                kind,
            } => {
                let Some(service) = self.services.get_mut(&name) else {
                    return;
                };
                service.handle_action_done(number, kind, done.status, &self.fx);
            }
        }
    }

    /// Route a timer expiry to its owner.
    pub fn handle_timer(&mut self, msg: TimerMsg) {
        match msg {
            TimerMsg::RunDue { job, run } => self.run_job(&job, run),
            TimerMsg::MonitorDue { service, instance } => {
                if let Some(svc) = self.services.get_mut(&service) {
                    svc.handle_monitor_due(instance, &self.fx);
                }
            }
            TimerMsg::RestartDue { service } => {
                if let Some(svc) = self.services.get_mut(&service) {
                    svc.handle_restart_due(&self.fx);
                }
            }
            TimerMsg::SnapshotDue => self.store_state(),
        }
    }

    pub fn enable_job(&mut self, name: &JobName) -> bool {
        let Some(job) = self.jobs.get_mut(name) else {
            return false;
        };
        job.set_enabled(true);
        // Start a run that came due while the job was disabled.
        let queued = job
            .next_to_finish()
            .filter(|r| r.is_queued())
            .map(|r| r.id);
        if let Some(run) = queued {
            self.start_run(name, run);
        }
        self.schedule_next_run(name);
        true
    }

    pub fn disable_job(&mut self, name: &JobName) -> bool {
        match self.jobs.get_mut(name) {
            Some(job) => {
                job.set_enabled(false);
                true
            }
            None => false,
        }
    }

    pub fn enable_all(&mut self) {
        let names: Vec<JobName> = self.jobs.keys().cloned().collect();
        for name in names {
            self.enable_job(&name);
        }
    }

    pub fn disable_all(&mut self) {
        let names: Vec<JobName> = self.jobs.keys().cloned().collect();
        for name in names {
            self.disable_job(&name);
        }
    }

    pub fn start_service(&mut self, name: &ServiceName) -> bool {
        match self.services.get_mut(name) {
            Some(service) => {
                service.start(&self.fx);
                true
            }
            None => false,
        }
    }

    /// Start every service that is fully down. Services restored into a
    /// live state are left running as they are.
    pub fn start_services(&mut self) {
        let names: Vec<ServiceName> = self
            .services
            .iter()
            .filter(|(_, s)| s.state() == crate::service::SVC_DOWN)
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            self.start_service(&name);
        }
    }

    pub fn stop_service(&mut self, name: &ServiceName) -> bool {
        match self.services.get_mut(name) {
            Some(service) => {
                service.stop(&self.fx);
                true
            }
            None => false,
        }
    }

    /// Restore persisted state, if a snapshot exists.
    ///
    /// Only entities present in both the snapshot and the live registry are
    /// restored. A job whose stored runs contain an unrecognized state, or
    /// a service with an unrecognized state name, is skipped with an error;
    /// the rest of the restore proceeds.
    pub fn try_restore(&mut self) -> Result<(), crate::storage::SnapshotError> {
        if !self.state_handler.snapshot_exists() {
            debug!("no state snapshot, starting cold");
            return Ok(());
        }
        let snapshot = self.state_handler.load()?;
        let now = Utc::now();
        let mut to_start: Vec<(JobName, RunId)> = Vec::new();

        for (name, data) in snapshot.jobs {
            let name = JobName::from(name);
            let Some(job) = self.jobs.get_mut(&name) else {
                warn!(job = %name, "snapshot references unknown job, skipping");
                continue;
            };

            // Parse every run state up front so a bad record abandons the
            // whole entity rather than half-restoring it.
            let mut parsed = Vec::with_capacity(data.runs.len());
            let mut bad_state = None;
            for run in &data.runs {
                match run.state.parse::<RunState>() {
                    Ok(state) => parsed.push((run.id, run.run_time, state)),
                    Err(s) => {
                        bad_state = Some(s);
                        break;
                    }
                }
            }
            if let Some(state) = bad_state {
                error!(job = %name, state = %state, "unknown run state in snapshot, skipping job");
                continue;
            }

            job.set_enabled(data.enabled);
            // Stored newest-first; replay oldest-first.
            for (id, run_time, state) in parsed.into_iter().rev() {
                job.restore_run(id, run_time, state);
                if state == RunState::Scheduled {
                    // Recompute the delay; never trust a stored duration.
                    self.fx.arm(
                        sleep_time(run_time, now),
                        TimerMsg::RunDue {
                            job: name.clone(),
                            run: id,
                        },
                    );
                }
            }
            if job.enabled() {
                // A queued earliest run means it came due while we were down.
                let queued = job
                    .next_to_finish()
                    .filter(|r| r.is_queued())
                    .map(|r| r.id);
                if let Some(run) = queued {
                    to_start.push((name.clone(), run));
                }
            }
            info!(job = %name, "restored job state");
        }

        for (name, run) in to_start {
            self.start_run(&name, run);
        }

        for (name, data) in snapshot.services {
            let name = ServiceName::from(name);
            let Some(service) = self.services.get_mut(&name) else {
                warn!(service = %name, "snapshot references unknown service, skipping");
                continue;
            };
            match service.restore(&data.state, &data.instances, &self.fx) {
                Ok(()) => info!(service = %name, state = %data.state, "restored service state"),
                Err(e) => error!(service = %name, error = %e, "could not restore service"),
            }
        }

        Ok(())
    }

    /// Initial scheduling pass: arm a timer for every enabled job, then
    /// turn persistence on and take the first snapshot.
    pub fn run_jobs(&mut self) {
        let names: Vec<JobName> = self
            .jobs
            .iter()
            .filter(|(_, j)| j.enabled())
            .map(|(n, _)| n.clone())
            .collect();
        for name in names {
            self.schedule_next_run(&name);
        }
        self.state_handler.enable_writing();
        self.store_state();
    }

    /// Take a snapshot and re-arm the periodic timer.
    pub fn store_state(&mut self) {
        // Re-arm first, unconditionally: a skipped or failed write must
        // never stop the periodic cycle.
        self.fx.arm(self.snapshot_interval, TimerMsg::SnapshotDue);
        let snapshot = self.snapshot();
        self.state_handler.store(snapshot);
    }

    /// Serialize the whole world.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (name, job) in &self.jobs {
            snapshot.jobs.insert(
                name.as_str().to_string(),
                JobData {
                    enabled: job.enabled(),
                    runs: job
                        .runs()
                        .map(|r| RunData {
                            id: r.id,
                            run_time: r.run_time,
                            state: r.state.to_string(),
                        })
                        .collect(),
                },
            );
        }
        for (name, service) in &self.services {
            snapshot.services.insert(
                name.as_str().to_string(),
                ServiceData {
                    state: service.state().to_string(),
                    instances: service
                        .instances()
                        .iter()
                        .map(|i| InstanceData {
                            node: i.node().hostname().to_string(),
                            instance_number: i.number(),
                            state: i.state().to_string(),
                        })
                        .collect(),
                },
            );
        }
        snapshot
    }

    pub fn status(&self) -> StatusReport {
        let mut jobs: Vec<JobStatus> = self
            .jobs
            .values()
            .map(|job| JobStatus {
                name: job.name().clone(),
                enabled: job.enabled(),
                next_run: job
                    .runs()
                    .find(|r| r.is_scheduled())
                    .map(|r| r.run_time),
            })
            .collect();
        jobs.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

        let mut services: Vec<ServiceStatus> = self
            .services
            .values()
            .map(|service| ServiceStatus {
                name: service.name().clone(),
                state: service.state().to_string(),
                instances: service
                    .instances()
                    .iter()
                    .map(|i| InstanceStatus {
                        number: i.number(),
                        node: i.node().hostname().to_string(),
                        state: i.state().to_string(),
                    })
                    .collect(),
            })
            .collect();
        services.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));

        StatusReport { jobs, services }
    }

    /// Start the daemon loop and return a handle for controlling it.
    pub fn start(self) -> (McpHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = McpHandle { command_tx };
        let task = tokio::spawn(async move {
            self.run(command_rx).await;
        });
        (handle, task)
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<McpCommand>) {
        info!("daemon loop running");
        loop {
            tokio::select! {
                Some(done) = self.done_rx.recv() => {
                    self.handle_action_done(done);
                }
                Some(msg) = self.timer_rx.recv() => {
                    self.handle_timer(msg);
                }
                Some(event) = self.event_rx.recv() => {
                    self.events.emit(event).await;
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(McpCommand::Shutdown { response }) => {
                            info!("shutting down");
                            // Drain any periodic write first so the final
                            // snapshot is never skipped as outstanding.
                            self.state_handler.flush().await;
                            self.state_handler.store(self.snapshot());
                            self.state_handler.flush().await;
                            let _ = response.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: McpCommand) {
        match cmd {
            McpCommand::EnableJob { name, response } => {
                let result = if self.enable_job(&name) {
                    Ok(())
                } else {
                    Err(McpError::UnknownJob(name))
                };
                let _ = response.send(result);
            }
            McpCommand::DisableJob { name, response } => {
                let result = if self.disable_job(&name) {
                    Ok(())
                } else {
                    Err(McpError::UnknownJob(name))
                };
                let _ = response.send(result);
            }
            McpCommand::EnableAll { response } => {
                self.enable_all();
                let _ = response.send(());
            }
            McpCommand::DisableAll { response } => {
                self.disable_all();
                let _ = response.send(());
            }
            McpCommand::StartService { name, response } => {
                let result = if self.start_service(&name) {
                    Ok(())
                } else {
                    Err(McpError::UnknownService(name))
                };
                let _ = response.send(result);
            }
            McpCommand::StopService { name, response } => {
                let result = if self.stop_service(&name) {
                    Ok(())
                } else {
                    Err(McpError::UnknownService(name))
                };
                let _ = response.send(result);
            }
            McpCommand::Status { response } => {
                let _ = response.send(self.status());
            }
            McpCommand::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::Schedule;
    use crate::execution::{ActionStatus, NodePool};
    use crate::testing::FakeRunner;
    use tempfile::tempdir;

    fn mcp_with_runner(dir: &std::path::Path) -> (MasterControlProgram, Arc<FakeRunner>) {
        let runner = Arc::new(FakeRunner::new());
        let mcp = MasterControlProgram::new(dir, runner.clone());
        (mcp, runner)
    }

    fn hourly_job(name: &str, hosts: &[&str]) -> Job {
        let pool = NodePool::new(hosts.iter().map(|h| Arc::new(Node::new(*h))).collect());
        Job::new(
            JobName::new(name),
            "echo hi",
            Schedule::new("@hourly").unwrap(),
            pool,
        )
    }

    fn complete_run(mcp: &mut MasterControlProgram, name: &str, run: RunId, exit: i32) {
        mcp.handle_action_done(ActionDone {
            id: ActionId::Run {
                job: JobName::new(name),
                run,
            },
            status: ActionStatus::Completed { exit_status: exit },
        });
    }

    #[tokio::test]
    async fn test_schedule_next_run_is_idempotent() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));

        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        mcp.schedule_next_run(&name);

        let job = mcp.jobs().next().unwrap();
        assert_eq!(job.runs().count(), 1);
    }

    #[tokio::test]
    async fn test_run_job_dispatches_and_reschedules() {
        let dir = tempdir().unwrap();
        let (mut mcp, runner) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        let run = mcp.jobs().next().unwrap().latest_run().unwrap().id;

        mcp.run_job(&name, run);

        assert_eq!(runner.dispatch_count(), 1);
        let job = mcp.jobs().next().unwrap();
        assert!(job.run(run).unwrap().is_running());
        // The following occurrence was scheduled immediately.
        assert!(job.latest_run().unwrap().is_scheduled());
    }

    #[tokio::test]
    async fn test_run_job_skipped_when_disabled() {
        let dir = tempdir().unwrap();
        let (mut mcp, runner) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        let run = mcp.jobs().next().unwrap().latest_run().unwrap().id;

        mcp.disable_job(&name);
        mcp.run_job(&name, run);
        assert_eq!(runner.dispatch_count(), 0);

        // Re-enabling picks the due run back up.
        mcp.enable_job(&name);
        assert_eq!(runner.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_run_queues_then_starts() {
        let dir = tempdir().unwrap();
        let (mut mcp, runner) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        let first = mcp.jobs().next().unwrap().latest_run().unwrap().id;
        mcp.run_job(&name, first);

        let second = mcp.jobs().next().unwrap().latest_run().unwrap().id;
        mcp.run_job(&name, second);
        assert!(mcp.jobs().next().unwrap().run(second).unwrap().is_queued());
        assert_eq!(runner.dispatch_count(), 1);

        complete_run(&mut mcp, "nightly", first, 0);
        assert_eq!(runner.dispatch_count(), 2);
        assert!(mcp.jobs().next().unwrap().run(second).unwrap().is_running());
    }

    #[tokio::test]
    async fn test_run_completion_marks_state() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        let run = mcp.jobs().next().unwrap().latest_run().unwrap().id;
        mcp.run_job(&name, run);

        complete_run(&mut mcp, "nightly", run, 1);
        assert_eq!(
            mcp.jobs().next().unwrap().run(run).unwrap().state,
            RunState::Failed
        );
    }

    #[tokio::test]
    async fn test_unchanged_job_is_noop_changed_job_absorbs() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        assert_eq!(mcp.jobs().next().unwrap().runs().count(), 1);

        // Identical definition: history untouched.
        mcp.add_job(hourly_job("nightly", &["a"]));
        assert_eq!(mcp.jobs().next().unwrap().runs().count(), 1);

        // Changed command: history absorbed, schedule re-applied.
        let pool = NodePool::new(vec![Arc::new(Node::new("a"))]);
        mcp.add_job(Job::new(
            JobName::new("nightly"),
            "echo bye",
            Schedule::new("@hourly").unwrap(),
            pool,
        ));
        let job = mcp.jobs().next().unwrap();
        assert_eq!(job.command(), "echo bye");
        assert!(job.runs().count() >= 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));
        let name = JobName::new("nightly");
        mcp.schedule_next_run(&name);
        let snapshot = mcp.snapshot();

        // A fresh daemon with the same config.
        let (mut fresh, _runner) = mcp_with_runner(dir.path());
        fresh.add_job(hourly_job("nightly", &["a"]));
        std::fs::write(
            fresh.state_handler.snapshot_path(),
            serde_yaml::to_string(&snapshot).unwrap(),
        )
        .unwrap();
        fresh.try_restore().unwrap();

        let job = fresh.jobs().next().unwrap();
        assert_eq!(job.runs().count(), 1);
        assert!(job.latest_run().unwrap().is_scheduled());
    }

    #[tokio::test]
    async fn test_restore_starts_runs_that_came_due_while_down() {
        let dir = tempdir().unwrap();
        let (mut mcp, runner) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));

        let mut snapshot = Snapshot::default();
        snapshot.jobs.insert(
            "nightly".to_string(),
            JobData {
                enabled: true,
                runs: vec![RunData {
                    id: RunId::new(),
                    run_time: Utc::now() - chrono::Duration::minutes(10),
                    state: "queued".to_string(),
                }],
            },
        );
        std::fs::write(
            mcp.state_handler.snapshot_path(),
            serde_yaml::to_string(&snapshot).unwrap(),
        )
        .unwrap();

        mcp.try_restore().unwrap();
        assert_eq!(runner.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_skips_job_with_unknown_run_state() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("nightly", &["a"]));

        let mut snapshot = Snapshot::default();
        snapshot.jobs.insert(
            "nightly".to_string(),
            JobData {
                enabled: false,
                runs: vec![RunData {
                    id: RunId::new(),
                    run_time: Utc::now(),
                    state: "sideways".to_string(),
                }],
            },
        );
        std::fs::write(
            mcp.state_handler.snapshot_path(),
            serde_yaml::to_string(&snapshot).unwrap(),
        )
        .unwrap();

        mcp.try_restore().unwrap();
        let job = mcp.jobs().next().unwrap();
        // Entity skipped wholesale: no runs replayed, flag untouched.
        assert_eq!(job.runs().count(), 0);
        assert!(job.enabled());
    }

    #[tokio::test]
    async fn test_node_registry_deduplicates() {
        let dir = tempdir().unwrap();
        let (mut mcp, _) = mcp_with_runner(dir.path());
        mcp.add_job(hourly_job("one", &["a", "b"]));
        mcp.add_job(hourly_job("two", &["b", "c"]));
        assert!(mcp.node_by_hostname("a").is_some());
        assert!(mcp.node_by_hostname("c").is_some());
        assert_eq!(mcp.nodes.len(), 3);
    }
}
