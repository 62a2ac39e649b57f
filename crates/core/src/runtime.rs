//! Container runtime client boundary
//!
//! The lifecycle controller, the reaper coordinator and the log demultiplexer talk
//! to the container engine only through [`RuntimeClient`]. The engine-facing
//! implementation is [`crate::docker::CliRuntime`]; tests use
//! [`crate::docker::mock::MockRuntime`].

use crate::container_spec::ContainerSpec;
use crate::errors::Result;
use crate::labels::LabelFilter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Snapshot of one container as reported by the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container ID
    pub id: String,
    /// Container names (without the leading `/`)
    pub names: Vec<String>,
    /// Image reference the container was created from
    pub image: String,
    /// Engine state (`created`, `running`, `exited`, `dead`, ...)
    pub state: String,
    /// Human readable status line
    pub status: String,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Container environment
    pub env: HashMap<String, String>,
    /// Published ports
    pub ports: Vec<PortMapping>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    /// Whether the engine will never run this container again without a restart
    pub fn is_dead(&self) -> bool {
        matches!(self.state.to_ascii_lowercase().as_str(), "exited" | "dead")
    }

    /// Host port bound to `container_port/protocol`
    pub fn host_port(&self, container_port: u16, protocol: &str) -> Option<u16> {
        self.ports
            .iter()
            .find(|p| p.container_port == container_port && p.protocol == protocol)
            .map(|p| p.host_port)
    }
}

/// One published port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host port
    pub host_port: u16,
    /// Container port
    pub container_port: u16,
    /// Protocol (tcp/udp)
    pub protocol: String,
    /// Host IP
    pub host_ip: String,
}

/// Result of executing a command in a container
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Exit code of the command
    pub exit_code: i32,
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill the container if it is still running
    pub force: bool,
    /// Remove anonymous volumes attached to the container
    pub volumes: bool,
}

/// Parameters for opening a container's log stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStreamOptions {
    /// Only records produced at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Keep the stream open for new records
    pub follow: bool,
}

/// Framed, multiplexed stdout/stderr stream (8-byte header per frame)
pub type LogStream = Box<dyn AsyncRead + Send + Unpin>;

/// Operations the library needs from a container engine
#[async_trait::async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Short name of the engine, for logs
    fn name(&self) -> &'static str;

    /// Create (but do not start) a container; returns its id.
    ///
    /// A fixed `spec.name` that is already taken fails with `RuntimeError::Conflict`.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container, letting the engine kill it once `timeout` elapses
    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()>;

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()>;

    /// Inspect a container; `None` if it does not exist
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>>;

    /// All containers (running or not) whose labels match `filter`
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerInfo>>;

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecResult>;

    /// Open the framed log stream of a container
    async fn open_log_stream(&self, id: &str, options: LogStreamOptions) -> Result<LogStream>;

    async fn remove_image(&self, reference: &str) -> Result<()>;

    /// Host on which published ports are reachable
    fn daemon_host(&self) -> String;
}

/// Host part of a `DOCKER_HOST` style URL; local sockets resolve to `localhost`
pub fn host_from_docker_host(docker_host: Option<&str>) -> String {
    let Some(raw) = docker_host.map(str::trim).filter(|s| !s.is_empty()) else {
        return "localhost".to_string();
    };
    for scheme in ["tcp://", "http://", "https://", "ssh://"] {
        if let Some(rest) = raw.strip_prefix(scheme) {
            let authority = rest.split('/').next().unwrap_or(rest);
            let authority = authority.rsplit('@').next().unwrap_or(authority);
            let host = match authority.rsplit_once(':') {
                Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
                _ => authority,
            };
            if !host.is_empty() {
                return host.to_string();
            }
        }
    }
    "localhost".to_string()
}
