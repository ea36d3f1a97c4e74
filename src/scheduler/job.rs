//! Scheduled jobs and their run history.
//!
//! A [`Job`] owns a recurrence [`Schedule`], a node pool, and a bounded
//! history of [`JobRun`]s ordered newest first. Runs move through a small
//! linear lifecycle rather than a full state machine: scheduled, queued,
//! running, then succeeded or failed.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::schedule::Schedule;
use crate::core::types::{JobName, RunId};
use crate::execution::{Node, NodePool};

/// How many finished runs a job keeps for status reporting.
const RUN_HISTORY_LIMIT: usize = 16;

/// Lifecycle state of a single job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Waiting for its run time, with a timer armed.
    Scheduled,
    /// Run time arrived while a previous run was still executing.
    Queued,
    /// Command dispatched, awaiting completion.
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Scheduled => "scheduled",
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunState::Scheduled),
            "queued" => Ok(RunState::Queued),
            "running" => Ok(RunState::Running),
            "succeeded" => Ok(RunState::Succeeded),
            "failed" => Ok(RunState::Failed),
            other => Err(other.to_string()),
        }
    }
}

/// One occurrence of a job.
#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: RunId,
    pub run_time: DateTime<Utc>,
    pub state: RunState,
}

impl JobRun {
    pub fn is_scheduled(&self) -> bool {
        self.state == RunState::Scheduled
    }

    pub fn is_queued(&self) -> bool {
        self.state == RunState::Queued
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    /// A run that has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(self.state, RunState::Succeeded | RunState::Failed)
    }
}

/// A recurring job.
pub struct Job {
    name: JobName,
    command: String,
    schedule: Schedule,
    node_pool: NodePool,
    enabled: bool,
    /// Run history, newest first.
    runs: VecDeque<JobRun>,
    output_dir: Option<PathBuf>,
}

/// Two jobs are the same configuration if name, command, schedule rule, and
/// pool membership all match. Run history and enablement are runtime state
/// and do not participate.
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.command == other.command
            && self.schedule == other.schedule
            && self.node_pool == other.node_pool
    }
}
impl Eq for Job {}

impl Job {
    pub fn new(
        name: JobName,
        command: impl Into<String>,
        schedule: Schedule,
        node_pool: NodePool,
    ) -> Self {
        Self {
            name,
            command: command.into(),
            schedule,
            node_pool,
            enabled: true,
            runs: VecDeque::new(),
            output_dir: None,
        }
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn node_pool(&self) -> &NodePool {
        &self.node_pool
    }

    pub fn output_dir(&self) -> Option<&PathBuf> {
        self.output_dir.as_ref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Run history, newest first.
    pub fn runs(&self) -> impl Iterator<Item = &JobRun> {
        self.runs.iter()
    }

    /// The most recently created run.
    pub fn latest_run(&self) -> Option<&JobRun> {
        self.runs.front()
    }

    pub fn run(&self, id: RunId) -> Option<&JobRun> {
        self.runs.iter().find(|r| r.id == id)
    }

    pub fn run_mut(&mut self, id: RunId) -> Option<&mut JobRun> {
        self.runs.iter_mut().find(|r| r.id == id)
    }

    /// Compute and record the next scheduled run after `now`.
    ///
    /// Returns `None` if the schedule has no further occurrences.
    pub fn next_run(&mut self, now: DateTime<Utc>) -> Option<(RunId, DateTime<Utc>)> {
        let run_time = self.schedule.next_after(now).ok()?;
        let id = RunId::new();
        self.runs.push_front(JobRun {
            id,
            run_time,
            state: RunState::Scheduled,
        });
        self.prune_history();
        Some((id, run_time))
    }

    /// Re-create a run from persisted state, newest first on replay.
    pub fn restore_run(&mut self, id: RunId, run_time: DateTime<Utc>, state: RunState) {
        self.runs.push_front(JobRun {
            id,
            run_time,
            state,
        });
        self.prune_history();
    }

    /// The oldest run that has not finished. This is the run that should
    /// execute next when the job becomes free.
    pub fn next_to_finish(&self) -> Option<&JobRun> {
        self.runs.iter().rev().find(|r| !r.is_finished())
    }

    pub fn has_running(&self) -> bool {
        self.runs.iter().any(|r| r.is_running())
    }

    /// Pick a node for the next execution, rotating through the pool.
    pub fn pick_node(&mut self) -> Option<Arc<Node>> {
        self.node_pool.next_round_robin()
    }

    /// Take over runtime state from a previous configuration of this job.
    pub fn absorb_old_job(&mut self, old: Job) {
        self.runs = old.runs;
        self.enabled = old.enabled;
    }

    fn prune_history(&mut self) {
        while self.runs.len() > RUN_HISTORY_LIMIT {
            match self.runs.back() {
                Some(run) if run.is_finished() => {
                    self.runs.pop_back();
                }
                _ => break,
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("runs", &self.runs.len())
            .finish()
    }
}

/// How long to wait before a run at `run_time` should start. A run time in
/// the past means run immediately.
pub fn sleep_time(run_time: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (run_time - now).to_std().unwrap_or(Duration::ZERO)
}
