//! YAML configuration loading, validation, and application.
//!
//! A configuration document declares the node registry plus every job and
//! service the daemon manages. Loading and validation failures are fatal at
//! startup; nothing here runs during steady state.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::core::schedule::Schedule;
use crate::core::types::{JobName, ServiceName};
use crate::execution::{Node, NodePool};
use crate::scheduler::{Job, MasterControlProgram};
use crate::service::Service;

/// Errors that can occur when loading or applying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("failed to parse config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration is structurally valid YAML but semantically wrong.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A job or service referenced a node not in the registry.
    #[error("unknown node: {0}")]
    UnknownNode(String),
}

/// Root configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory for the state snapshot and job output.
    pub working_dir: Option<PathBuf>,

    /// Seconds between state snapshots.
    pub snapshot_interval_secs: Option<u64>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub command: String,
    pub schedule: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Hostnames this job may run on; empty means every registered node.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub command: String,
    pub pid_file: Option<String>,
    #[serde(default = "default_count")]
    pub count: u32,
    /// Zero or absent disables health monitoring.
    #[serde(default)]
    pub monitor_interval_secs: u64,
    /// Zero or absent disables automatic restart.
    #[serde(default)]
    pub restart_interval_secs: u64,
    /// Hostnames this service may run on; empty means every registered node.
    #[serde(default)]
    pub nodes: Vec<String>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn default_count() -> u32 {
    1
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        info!(path = %path.as_ref().display(), jobs = config.jobs.len(),
            services = config.services.len(), "loaded configuration");
        Ok(config)
    }

    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that do not need the live registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() && (!self.jobs.is_empty() || !self.services.is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "jobs or services declared but no nodes".to_string(),
            ));
        }

        let mut job_names: Vec<&str> = self.jobs.iter().map(|j| j.name.as_str()).collect();
        job_names.sort_unstable();
        if job_names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::InvalidConfig("duplicate job name".to_string()));
        }

        let mut service_names: Vec<&str> =
            self.services.iter().map(|s| s.name.as_str()).collect();
        service_names.sort_unstable();
        if service_names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::InvalidConfig(
                "duplicate service name".to_string(),
            ));
        }

        for job in &self.jobs {
            if job.name.is_empty() || job.command.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "job name and command must be non-empty".to_string(),
                ));
            }
            // Surface a bad expression at load time, not at first schedule.
            Schedule::with_timezone(&job.schedule, &job.timezone)
                .map_err(|e| ConfigError::InvalidConfig(format!("job {}: {}", job.name, e)))?;
        }

        for service in &self.services {
            if service.name.is_empty() || service.command.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "service name and command must be non-empty".to_string(),
                ));
            }
            if service.count == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "service {}: count must be at least 1",
                    service.name
                )));
            }
        }

        Ok(())
    }

    /// Populate the daemon's registries from this document.
    pub fn apply(self, mcp: &mut MasterControlProgram) -> Result<(), ConfigError> {
        for node in &self.nodes {
            mcp.register_node(Arc::new(Node::new(node.hostname.clone())));
        }
        let all_hostnames: Vec<String> =
            self.nodes.iter().map(|n| n.hostname.clone()).collect();

        for job_config in self.jobs {
            let pool = resolve_pool(mcp, &job_config.nodes, &all_hostnames)?;
            let schedule = Schedule::with_timezone(&job_config.schedule, &job_config.timezone)
                .map_err(|e| {
                    ConfigError::InvalidConfig(format!("job {}: {}", job_config.name, e))
                })?;
            let mut job = Job::new(
                JobName::new(job_config.name),
                job_config.command,
                schedule,
                pool,
            );
            if let Some(dir) = job_config.output_dir {
                job = job.with_output_dir(dir);
            }
            job.set_enabled(job_config.enabled);
            mcp.add_job(job);
        }

        for service_config in self.services {
            let pool = resolve_pool(mcp, &service_config.nodes, &all_hostnames)?;
            let service = Service::new(
                ServiceName::new(service_config.name),
                service_config.command,
                service_config.pid_file,
                pool,
                service_config.count,
                interval(service_config.monitor_interval_secs),
                interval(service_config.restart_interval_secs),
            );
            mcp.add_service(service);
        }

        Ok(())
    }
}

/// Zero means disabled.
fn interval(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Resolve hostnames against the registry; an empty list means every node.
fn resolve_pool(
    mcp: &MasterControlProgram,
    hostnames: &[String],
    all: &[String],
) -> Result<NodePool, ConfigError> {
    let wanted = if hostnames.is_empty() { all } else { hostnames };
    let mut nodes = Vec::with_capacity(wanted.len());
    for hostname in wanted {
        let node = mcp
            .node_by_hostname(hostname)
            .ok_or_else(|| ConfigError::UnknownNode(hostname.clone()))?;
        nodes.push(node);
    }
    Ok(NodePool::new(nodes))
}
