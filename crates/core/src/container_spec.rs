//! Container specification
//!
//! A [`ContainerSpec`] describes the container a caller wants: image, environment,
//! ports, how to tell it is ready, and the hook bundles to run around each
//! lifecycle transition. Pre-create hooks may still mutate it; after creation the
//! controller only reads from it.

use crate::hooks::LifecycleHookBundle;
use crate::logs::LogConfig;
use crate::wait::ReadinessStrategy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on the readiness wait
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// A host path bound into the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: false,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// `type=bind,source=..,target=..[,readonly]` as accepted by `--mount`
    pub fn to_mount_arg(&self) -> String {
        let mut arg = format!("type=bind,source={},target={}", self.source, self.target);
        if self.read_only {
            arg.push_str(",readonly");
        }
        arg
    }
}

/// Marks the image as built for this container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuiltImage {
    /// Keep the image when the container is terminated
    pub keep: bool,
}

/// What to create
#[derive(Clone)]
pub struct ContainerSpec {
    /// Image reference
    pub image: String,
    /// Fixed container name; the engine picks one when `None`
    pub name: Option<String>,
    pub env: HashMap<String, String>,
    /// Ports to publish on random host ports, as `8080/tcp` or `8080`
    pub exposed_ports: Vec<String>,
    /// Caller labels; keys under `org.testcontainers` are reserved
    pub labels: HashMap<String, String>,
    pub cmd: Vec<String>,
    pub mounts: Vec<BindMount>,
    pub privileged: bool,
    pub auto_remove: bool,
    pub wait_for: Option<Arc<dyn ReadinessStrategy>>,
    pub startup_timeout: Duration,
    pub log_config: LogConfig,
    pub built_image: Option<BuiltImage>,
    /// Do not register this container with the reaper
    pub skip_reaper: bool,
    /// Caller hook bundles, in registration order
    pub hooks: Vec<LifecycleHookBundle>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: None,
            env: HashMap::new(),
            exposed_ports: Vec::new(),
            labels: HashMap::new(),
            cmd: Vec::new(),
            mounts: Vec::new(),
            privileged: false,
            auto_remove: false,
            wait_for: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            log_config: LogConfig::default(),
            built_image: None,
            skip_reaper: false,
            hooks: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_exposed_port(mut self, port: impl Into<String>) -> Self {
        self.exposed_ports.push(port.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mount(mut self, mount: BindMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_privileged(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn with_auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    pub fn with_wait_for(mut self, strategy: impl ReadinessStrategy + 'static) -> Self {
        self.wait_for = Some(Arc::new(strategy));
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_log_config(mut self, log_config: LogConfig) -> Self {
        self.log_config = log_config;
        self
    }

    pub fn with_built_image(mut self, built: BuiltImage) -> Self {
        self.built_image = Some(built);
        self
    }

    pub fn with_skip_reaper(mut self, skip: bool) -> Self {
        self.skip_reaper = skip;
        self
    }

    /// Append a caller hook bundle; bundles run in the order they are added
    pub fn with_hooks(mut self, bundle: LifecycleHookBundle) -> Self {
        self.hooks.push(bundle);
        self
    }

    /// Exposed ports normalised to `port/protocol`
    pub fn normalized_ports(&self) -> Vec<(u16, String)> {
        self.exposed_ports
            .iter()
            .filter_map(|raw| parse_port(raw))
            .collect()
    }
}

impl fmt::Debug for ContainerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerSpec")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("exposed_ports", &self.exposed_ports)
            .field("labels", &self.labels)
            .field("cmd", &self.cmd)
            .field("privileged", &self.privileged)
            .field("auto_remove", &self.auto_remove)
            .field("startup_timeout", &self.startup_timeout)
            .field("skip_reaper", &self.skip_reaper)
            .field("hooks", &self.hooks.len())
            .finish_non_exhaustive()
    }
}

/// Parse `8080`, `8080/tcp` or `53/udp`
pub fn parse_port(raw: &str) -> Option<(u16, String)> {
    let (port, protocol) = raw.split_once('/').unwrap_or((raw, "tcp"));
    let port = port.trim().parse::<u16>().ok()?;
    let protocol = protocol.trim().to_ascii_lowercase();
    if protocol.is_empty() {
        return None;
    }
    Some((port, protocol))
}
