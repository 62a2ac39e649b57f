//! Docker CLI runtime
//!
//! [`CliRuntime`] implements [`RuntimeClient`] by shelling out to the `docker`
//! binary (or any CLI-compatible runtime such as `podman`) and parsing its JSON
//! output. Blocking commands run on the blocking thread pool; the log stream is
//! a child process whose output is re-framed into the engine's multiplexed
//! format, see [`logs`].

pub mod logs;
pub mod mock;

use crate::container_spec::ContainerSpec;
use crate::errors::{Result, RuntimeError};
use crate::labels::LabelFilter;
use crate::runtime::{
    host_from_docker_host, ContainerInfo, ExecResult, LogStream, LogStreamOptions, PortMapping,
    RemoveOptions, RuntimeClient,
};
use std::collections::HashMap;
use std::process::{Command, Output};
use std::time::Duration;
use tracing::{debug, instrument};

/// CLI-based container runtime
#[derive(Debug, Clone)]
pub struct CliRuntime {
    /// Container runtime CLI binary path (e.g., "docker" or "podman")
    runtime_path: String,
}

impl CliRuntime {
    /// Runtime using `docker` from `PATH`
    pub fn docker() -> Self {
        Self::with_path("docker")
    }

    /// Runtime using the given binary
    pub fn with_path(runtime_path: impl Into<String>) -> Self {
        Self {
            runtime_path: runtime_path.into(),
        }
    }

    pub fn runtime_path(&self) -> &str {
        &self.runtime_path
    }

    /// Check that the runtime binary can be executed
    #[instrument(skip(self))]
    pub fn check_installed(&self) -> Result<()> {
        match Command::new(&self.runtime_path).arg("--version").output() {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(RuntimeError::CLIError(format!(
                "Runtime version check failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into()),
            Err(_) => Err(RuntimeError::NotInstalled.into()),
        }
    }

    /// Run the CLI with `args` on the blocking pool
    async fn run(&self, args: Vec<String>) -> Result<Output> {
        let runtime_path = self.runtime_path.clone();
        debug!(command = %args.join(" "), "Running {}", runtime_path);

        tokio::task::spawn_blocking(move || {
            Command::new(&runtime_path)
                .args(&args)
                .output()
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        RuntimeError::NotInstalled
                    } else {
                        RuntimeError::CLIError(format!("Failed to run {}: {}", runtime_path, e))
                    }
                })
        })
        .await
        .map_err(|e| RuntimeError::CLIError(format!("Task join error: {}", e)))?
        .map_err(Into::into)
    }

    /// Run and require a zero exit status; `what` names the operation in errors
    async fn run_checked(&self, args: Vec<String>, what: &str, id: &str) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            return Err(failure(what, id, &output).into());
        }
        String::from_utf8(output.stdout).map_err(|e| {
            RuntimeError::CLIError(format!("Invalid UTF-8 in runtime output: {}", e)).into()
        })
    }

    /// Arguments for `docker create`
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string()];

        if let Some(name) = &spec.name {
            args.push("--name".to_string());
            args.push(name.clone());
        }

        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (port, protocol) in spec.normalized_ports() {
            args.push("--publish".to_string());
            args.push(format!("{}/{}", port, protocol));
        }

        for mount in &spec.mounts {
            args.push("--mount".to_string());
            args.push(mount.to_mount_arg());
        }

        if spec.privileged {
            args.push("--privileged".to_string());
        }
        if spec.auto_remove {
            args.push("--rm".to_string());
        }

        args.push(spec.image.clone());
        args.extend(spec.cmd.iter().cloned());
        args
    }

    /// Parse port mappings from container NetworkSettings.Ports
    fn parse_port_mappings(container: &serde_json::Value) -> Vec<PortMapping> {
        let mut port_mappings: Vec<PortMapping> = Vec::new();

        let Some(ports) = container
            .get("NetworkSettings")
            .and_then(|ns| ns.get("Ports"))
            .and_then(|p| p.as_object())
        else {
            return port_mappings;
        };

        for (port_spec, bindings) in ports {
            let Some((port_str, protocol)) = port_spec.split_once('/') else {
                continue;
            };
            let Ok(container_port) = port_str.parse::<u16>() else {
                continue;
            };
            for binding in bindings.as_array().into_iter().flatten() {
                let host_port = binding
                    .get("HostPort")
                    .and_then(|hp| hp.as_str())
                    .and_then(|hp| hp.parse::<u16>().ok());
                let host_ip = binding
                    .get("HostIp")
                    .and_then(|hi| hi.as_str())
                    .unwrap_or_default();
                let Some(host_port) = host_port else {
                    continue;
                };
                // IPv4 and IPv6 bindings usually share the host port
                if port_mappings
                    .iter()
                    .any(|m| m.container_port == container_port && m.protocol == protocol)
                {
                    continue;
                }
                port_mappings.push(PortMapping {
                    host_port,
                    container_port,
                    protocol: protocol.to_string(),
                    host_ip: host_ip.to_string(),
                });
            }
        }

        port_mappings.sort_by_key(|m| m.container_port);
        port_mappings
    }

    /// Parse one element of `docker inspect` output
    fn parse_inspect(container: &serde_json::Value) -> ContainerInfo {
        let str_at = |path: &[&str]| -> String {
            let mut value = container;
            for key in path {
                match value.get(key) {
                    Some(next) => value = next,
                    None => return String::new(),
                }
            }
            value.as_str().unwrap_or_default().to_string()
        };

        let labels = container
            .get("Config")
            .and_then(|c| c.get("Labels"))
            .and_then(|l| l.as_object())
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let env = container
            .get("Config")
            .and_then(|c| c.get("Env"))
            .and_then(|e| e.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.as_str())
                    .filter_map(|e| e.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let state = str_at(&["State", "Status"]);
        let exit_code = container
            .get("State")
            .and_then(|s| s.get("ExitCode"))
            .and_then(|c| c.as_i64())
            .unwrap_or_default();
        let status = if state == "exited" {
            format!("Exited ({})", exit_code)
        } else {
            state.clone()
        };

        ContainerInfo {
            id: str_at(&["Id"]),
            names: vec![str_at(&["Name"]).trim_start_matches('/').to_string()],
            image: str_at(&["Config", "Image"]),
            state,
            status,
            labels,
            env,
            ports: Self::parse_port_mappings(container),
        }
    }

    /// Parse one line of `docker ps --format '{{json .}}'`
    fn parse_ps_line(line: &str) -> Result<ContainerInfo> {
        let container: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            RuntimeError::CLIError(format!("Failed to parse container JSON: {}", e))
        })?;
        let field = |name: &str| {
            container
                .get(name)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let labels: HashMap<String, String> = field("Labels")
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        Ok(ContainerInfo {
            id: field("ID"),
            names: field("Names")
                .split(',')
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            image: field("Image"),
            state: field("State"),
            status: field("Status"),
            labels,
            env: HashMap::new(), // Not available in list format
            ports: Vec::new(),   // Not available in list format
        })
    }
}

impl Default for CliRuntime {
    fn default() -> Self {
        Self::docker()
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Map a failed command to the most specific runtime error
fn failure(what: &str, id: &str, output: &Output) -> RuntimeError {
    let stderr = stderr_of(output);
    if stderr.contains("No such container") || stderr.contains("No such object") {
        RuntimeError::ContainerNotFound { id: id.to_string() }
    } else {
        RuntimeError::CLIError(format!("{} failed: {}", what, stderr))
    }
}

fn is_name_conflict(stderr: &str) -> bool {
    stderr.contains("Conflict") || stderr.contains("is already in use")
}

#[async_trait::async_trait]
impl RuntimeClient for CliRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, spec), fields(image = %spec.image))]
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let output = self.run(Self::create_args(spec)).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if let (true, Some(name)) = (is_name_conflict(&stderr), spec.name.as_ref()) {
                return Err(RuntimeError::Conflict { name: name.clone() }.into());
            }
            return Err(RuntimeError::CLIError(format!("Create failed: {}", stderr)).into());
        }
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container_id = %id, "Container created");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn start_container(&self, id: &str) -> Result<()> {
        self.run_checked(vec!["start".into(), id.into()], "Start", id)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<()> {
        let mut args = vec!["stop".to_string()];
        if let Some(timeout) = timeout {
            args.push("--time".to_string());
            args.push(timeout.as_secs().to_string());
        }
        args.push(id.to_string());
        self.run_checked(args, "Stop", id).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove_container(&self, id: &str, options: RemoveOptions) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if options.force {
            args.push("--force".to_string());
        }
        if options.volumes {
            args.push("--volumes".to_string());
        }
        args.push(id.to_string());
        self.run_checked(args, "Remove", id).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn inspect_container(&self, id: &str) -> Result<Option<ContainerInfo>> {
        let output = self
            .run(vec!["inspect".into(), "--type".into(), "container".into(), id.into()])
            .await?;
        if !output.status.success() {
            return match failure("Inspect", id, &output) {
                RuntimeError::ContainerNotFound { .. } => Ok(None),
                other => Err(other.into()),
            };
        }

        let containers: Vec<serde_json::Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| RuntimeError::CLIError(format!("Failed to parse inspect JSON: {}", e)))?;
        Ok(containers.first().map(Self::parse_inspect))
    }

    #[instrument(skip(self), fields(filter = %filter))]
    async fn list_containers(&self, filter: &LabelFilter) -> Result<Vec<ContainerInfo>> {
        let mut args: Vec<String> = ["ps", "--all", "--no-trunc", "--format", "{{json .}}"]
            .into_iter()
            .map(str::to_string)
            .collect();
        // Docker expects one --filter per label
        for (key, value) in filter.pairs() {
            args.push("--filter".to_string());
            args.push(format!("label={}={}", key, value));
        }

        let stdout = self.run_checked(args, "List", "").await?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(Self::parse_ps_line)
            .collect()
    }

    #[instrument(skip(self))]
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecResult> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(cmd.iter().cloned());
        let output = self.run(args).await?;

        let stderr = stderr_of(&output);
        if stderr.contains("No such container") {
            return Err(RuntimeError::ContainerNotFound { id: id.to_string() }.into());
        }
        Ok(ExecResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }

    async fn open_log_stream(&self, id: &str, options: LogStreamOptions) -> Result<LogStream> {
        logs::spawn_reframed(&self.runtime_path, id, options)
    }

    #[instrument(skip(self))]
    async fn remove_image(&self, reference: &str) -> Result<()> {
        self.run_checked(
            vec!["image".into(), "rm".into(), "--force".into(), reference.into()],
            "Image remove",
            reference,
        )
        .await
        .map(|_| ())
    }

    fn daemon_host(&self) -> String {
        host_from_docker_host(std::env::var("DOCKER_HOST").ok().as_deref())
    }
}
