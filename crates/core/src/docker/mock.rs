//! In-memory container runtime for tests
//!
//! [`MockRuntime`] keeps containers in a shared table and follows the engine's
//! observable rules closely enough for the lifecycle, reaper and log code to be
//! exercised without a daemon: fixed names conflict, created containers start in
//! `created`, published ports appear while running, `auto_remove` containers
//! disappear when stopped. Failures, delays and log streams can be scripted, and
//! every call is recorded.

use crate::container_spec::ContainerSpec;
use crate::errors::{Result, RuntimeError};
use crate::labels::LabelFilter;
use crate::runtime::{
    ContainerInfo, ExecResult, LogStream, LogStreamOptions, PortMapping, RemoveOptions,
    RuntimeClient,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

/// First host port handed out for published ports that were not bound explicitly
const EPHEMERAL_PORT_BASE: u16 = 49152;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A container in the mock's table
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub labels: HashMap<String, String>,
    pub env: HashMap<String, String>,
    pub auto_remove: bool,
    /// Published ports, shown while the container runs
    pub ports: Vec<PortMapping>,
}

impl MockContainer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            state: "running".to_string(),
            labels: HashMap::new(),
            env: HashMap::new(),
            auto_remove: false,
            ports: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: HashMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(PortMapping {
            host_port,
            container_port,
            protocol: "tcp".to_string(),
            host_ip: "0.0.0.0".to_string(),
        });
        self
    }

    fn to_info(&self) -> ContainerInfo {
        let running = self.state == "running";
        ContainerInfo {
            id: self.id.clone(),
            names: vec![self.name.clone()],
            image: self.image.clone(),
            state: self.state.clone(),
            status: self.state.clone(),
            labels: self.labels.clone(),
            env: self.env.clone(),
            ports: if running { self.ports.clone() } else { Vec::new() },
        }
    }
}

/// Runtime operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOperation {
    Create,
    Start,
    Stop,
    Remove,
    Inspect,
    List,
    Exec,
    OpenLogs,
    RemoveImage,
}

/// A recorded runtime call
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Create { id: String, name: Option<String>, image: String },
    Start { id: String },
    Stop { id: String, timeout: Option<Duration> },
    Remove { id: String, options: RemoveOptions },
    Inspect { id: String },
    List { filter: String },
    Exec { id: String, cmd: Vec<String> },
    OpenLogs { id: String, since: Option<DateTime<Utc>> },
    RemoveImage { reference: String },
}

/// One step of a scripted log stream
#[derive(Debug, Clone)]
pub enum LogStep {
    /// Bytes handed to the reader, possibly across several reads
    Data(Bytes),
    /// A read that fails with this kind
    Error(io::ErrorKind),
    /// Every further read stays pending
    Pending,
}

/// Behavior knobs
#[derive(Debug, Clone)]
pub struct MockRuntimeConfig {
    /// Returned by `daemon_host`
    pub daemon_host: String,
    /// Sleep before each create, to widen race windows
    pub create_delay: Option<Duration>,
    /// Returned by `exec` for commands without a scripted response
    pub default_exec: ExecResult,
}

impl Default for MockRuntimeConfig {
    fn default() -> Self {
        Self {
            daemon_host: "127.0.0.1".to_string(),
            create_delay: None,
            default_exec: ExecResult::default(),
        }
    }
}

/// Mock container runtime
#[derive(Debug, Default)]
pub struct MockRuntime {
    config: Mutex<MockRuntimeConfig>,
    containers: Mutex<Vec<MockContainer>>,
    port_bindings: Mutex<HashMap<u16, u16>>,
    failures: Mutex<HashMap<MockOperation, String>>,
    exec_responses: Mutex<HashMap<String, ExecResult>>,
    log_scripts: Mutex<HashMap<String, VecDeque<Vec<LogStep>>>>,
    calls: Mutex<Vec<MockCall>>,
    next_id: AtomicU64,
    next_port: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_config(MockRuntimeConfig::default())
    }

    pub fn with_config(config: MockRuntimeConfig) -> Self {
        Self {
            config: Mutex::new(config),
            ..Self::default()
        }
    }

    /// Update the behavior knobs
    pub fn update_config<F>(&self, f: F)
    where
        F: FnOnce(&mut MockRuntimeConfig),
    {
        f(&mut lock(&self.config));
    }

    pub fn set_create_delay(&self, delay: Duration) {
        lock(&self.config).create_delay = Some(delay);
    }

    /// Put a container into the table as if another process had created it
    pub fn add_container(&self, container: MockContainer) {
        lock(&self.containers).push(container);
    }

    /// Force the engine state of a container; `false` if it does not exist
    pub fn set_state(&self, id: &str, state: impl Into<String>) -> bool {
        match lock(&self.containers).iter_mut().find(|c| c.id == id) {
            Some(container) => {
                container.state = state.into();
                true
            }
            None => false,
        }
    }

    /// Remove a container behind the library's back
    pub fn forget_container(&self, id: &str) {
        lock(&self.containers).retain(|c| c.id != id);
    }

    pub fn containers(&self) -> Vec<MockContainer> {
        lock(&self.containers).clone()
    }

    pub fn container(&self, id: &str) -> Option<MockContainer> {
        lock(&self.containers).iter().find(|c| c.id == id).cloned()
    }

    /// Publish `container_port/tcp` on `host_port` for containers created afterwards
    pub fn bind_port(&self, container_port: u16, host_port: u16) {
        lock(&self.port_bindings).insert(container_port, host_port);
    }

    /// Fail every call of `operation` with a CLI error until cleared
    pub fn fail_on(&self, operation: MockOperation, message: impl Into<String>) {
        lock(&self.failures).insert(operation, message.into());
    }

    pub fn clear_failure(&self, operation: MockOperation) {
        lock(&self.failures).remove(&operation);
    }

    /// Response for `exec` of exactly `cmd` (joined by spaces)
    pub fn set_exec_response(&self, cmd: impl Into<String>, response: ExecResult) {
        lock(&self.exec_responses).insert(cmd.into(), response);
    }

    /// Queue a log stream for `id`; each open consumes the next script and an
    /// open with none left yields an empty stream
    pub fn script_logs(&self, id: &str, steps: Vec<LogStep>) {
        lock(&self.log_scripts)
            .entry(id.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Number of recorded calls of `operation`
    pub fn call_count(&self, operation: MockOperation) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| call.operation() == operation)
            .count()
    }

    fn record(&self, call: MockCall) -> Result<()> {
        let operation = call.operation();
        lock(&self.calls).push(call);
        match lock(&self.failures).get(&operation) {
            Some(message) => Err(RuntimeError::CLIError(message.clone()).into()),
            None => Ok(()),
        }
    }

    fn not_found(id: &str) -> crate::errors::ScuttleError {
        RuntimeError::ContainerNotFound { id: id.to_string() }.into()
    }

    fn allocate_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{:064x}", n)
    }

    fn allocate_port(&self, container_port: u16) -> u16 {
        if let Some(host_port) = lock(&self.port_bindings).get(&container_port) {
            return *host_port;
        }
        let offset = self.next_port.fetch_add(1, Ordering::SeqCst) % 16_000;
        EPHEMERAL_PORT_BASE + offset as u16
    }
}

impl MockCall {
    pub fn operation(&self) -> MockOperation {
        match self {
            Self::Create { .. } => MockOperation::Create,
            Self::Start { .. } => MockOperation::Start,
            Self::Stop { .. } => MockOperation::Stop,
            Self::Remove { .. } => MockOperation::Remove,
            Self::Inspect { .. } => MockOperation::Inspect,
            Self::List { .. } => MockOperation::List,
            Self::Exec { .. } => MockOperation::Exec,
            Self::OpenLogs { .. } => MockOperation::OpenLogs,
            Self::RemoveImage { .. } => MockOperation::RemoveImage,
        }
    }
}

#[async_trait::async_trait]
impl RuntimeClient for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let delay = lock(&self.config).create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = self.allocate_id();
        self.record(MockCall::Create {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
        })?;

        let ports = spec
            .normalized_ports()
            .into_iter()
            .map(|(port, protocol)| PortMapping {
                host_port: self.allocate_port(port),
                container_port: port,
                protocol,
                host_ip: "0.0.0.0".to_string(),
            })
            .collect();

        // Name check and insert under one lock, like the engine
        let mut containers = lock(&self.containers);
        let name = match &spec.name {
            Some(name) => {
                if containers.iter().any(|c| &c.name == name) {
                    return Err(RuntimeError::Conflict { name: name.clone() }.into());
                }
                name.clone()
            }
            None => format!("mock_{}", &id[id.len() - 8..]),
        };
        containers.push(MockContainer {
            id: id.clone(),
            name,
            image: spec.image.clone(),
            state: "created".to_string(),
            labels: spec.labels.clone(),
            env: spec.env.clone(),
            auto_remove: spec.auto_remove,
            ports,
        });
        debug!(container_id = %id, image = %spec.image, "Mock container created");
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(MockCall::Start { id: id.to_string() })?;
        let mut containers = lock(&self.containers);
        let container = containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        container.state = "running".to_string();
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        self.record(MockCall::Stop {
            id: id.to_string(),
            timeout,
        })?;
        let mut containers = lock(&self.containers);
        let index = containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        if containers[index].auto_remove {
            containers.remove(index);
        } else {
            containers[index].state = "exited".to_string();
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        self.record(MockCall::Remove {
            id: id.to_string(),
            options,
        })?;
        let mut containers = lock(&self.containers);
        let index = containers
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| Self::not_found(id))?;
        if containers[index].state == "running" && !options.force {
            return Err(RuntimeError::CLIError(format!(
                "cannot remove running container {}",
                id
            ))
            .into());
        }
        containers.remove(index);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        self.record(MockCall::Inspect { id: id.to_string() })?;
        Ok(lock(&self.containers)
            .iter()
            .find(|c| c.id == id)
            .map(MockContainer::to_info))
    }

    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerInfo>> {
        self.record(MockCall::List {
            filter: filter.to_string(),
        })?;
        Ok(lock(&self.containers)
            .iter()
            .filter(|c| filter.matches(&c.labels))
            .map(MockContainer::to_info)
            .collect())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecResult> {
        self.record(MockCall::Exec {
            id: id.to_string(),
            cmd: cmd.to_vec(),
        })?;
        if self.container(id).is_none() {
            return Err(Self::not_found(id));
        }
        let key = cmd.join(" ");
        let scripted = lock(&self.exec_responses).get(&key).cloned();
        Ok(scripted.unwrap_or_else(|| lock(&self.config).default_exec.clone()))
    }

    async fn open_log_stream(&self, id: &str, options: LogStreamOptions) -> Result<LogStream> {
        self.record(MockCall::OpenLogs {
            id: id.to_string(),
            since: options.since,
        })?;
        if self.container(id).is_none() {
            return Err(Self::not_found(id));
        }
        let steps = lock(&self.log_scripts)
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();
        Ok(Box::new(ScriptedStream {
            steps: steps.into(),
        }))
    }

    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.record(MockCall::RemoveImage {
            reference: reference.to_string(),
        })
    }

    fn daemon_host(&self) -> String {
        lock(&self.config).daemon_host.clone()
    }
}

/// Replays [`LogStep`]s; ends with EOF once they run out
struct ScriptedStream {
    steps: VecDeque<LogStep>,
}

impl AsyncRead for ScriptedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.steps.front_mut() {
            None => Poll::Ready(Ok(())),
            Some(LogStep::Pending) => Poll::Pending,
            Some(LogStep::Error(kind)) => {
                let kind = *kind;
                self.steps.pop_front();
                Poll::Ready(Err(io::Error::new(kind, "scripted log stream failure")))
            }
            Some(LogStep::Data(data)) => {
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data.split_to(n));
                if data.is_empty() {
                    self.steps.pop_front();
                }
                Poll::Ready(Ok(()))
            }
        }
    }
}
