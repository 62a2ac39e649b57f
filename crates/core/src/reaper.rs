//! Reaper coordination
//!
//! The reaper is a sidecar container that watches a label filter and removes
//! every matching resource once its clients have disconnected. One sidecar
//! serves a whole session:
//!
//! - within a process, [`ReaperCoordinator`] caches it behind a lock;
//! - across processes, the deterministic name `reaper_{session}` makes
//!   concurrent creators collide, and the loser falls back to lookup.
//!
//! Lookups retry with randomized exponential backoff within a bounded budget,
//! since container listings are eventually consistent.

use crate::config::Config;
use crate::container::{Container, LifecycleController, TerminationObserver};
use crate::container_spec::{BindMount, ContainerSpec};
use crate::errors::{ReaperError, Result, RuntimeError, ScuttleError};
use crate::hooks::{logging_hooks, LifecycleHookBundle, SpecHook};
use crate::labels::{default_labels, reaper_labels, LabelFilter};
use crate::observability::{reaper_obtain_span, short_id, SpanTimer};
use crate::retry::{retry_async, RetryConfig, RetryDecision};
use crate::runtime::{ContainerInfo, RemoveOptions};
use crate::session::SessionId;
use crate::wait::{ForListeningPort, ReadinessStrategy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn, Instrument};

/// Port the sidecar listens on
pub const REAPER_PORT: u16 = 8080;

/// Reply the sidecar sends once it accepted a filter
const ACK: &str = "ACK";

/// How the coordinator finds, creates and talks to the sidecar
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperOptions {
    /// Sidecar image, hub prefix already applied
    pub image: String,
    pub privileged: bool,
    pub verbose: bool,
    /// Dial and handshake timeout; also bounds the sidecar's readiness wait
    pub connection_timeout: Duration,
    /// How long the sidecar waits for clients to reconnect before reaping
    pub reconnection_timeout: Duration,
    /// Total time spent looking up or creating the sidecar
    pub lookup_budget: Duration,
    /// Handshake attempts per connection
    pub ack_attempts: u32,
    /// Engine socket bind-mounted into the sidecar
    pub docker_socket: String,
}

impl Default for ReaperOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ReaperOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.prefixed_image(&config.reaper_image),
            privileged: config.ryuk_privileged,
            verbose: config.ryuk_verbose,
            connection_timeout: config.ryuk_connection_timeout,
            reconnection_timeout: config.ryuk_reconnection_timeout,
            lookup_budget: Duration::from_secs(60),
            ack_attempts: 3,
            docker_socket: "/var/run/docker.sock".to_string(),
        }
    }

    pub fn with_lookup_budget(mut self, budget: Duration) -> Self {
        self.lookup_budget = budget;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    fn lookup_backoff(&self) -> RetryConfig {
        RetryConfig::randomized(
            Duration::from_millis(50),
            Duration::from_millis(250),
            Duration::from_millis(250),
            self.lookup_budget,
        )
    }
}

/// The session's sidecar
#[derive(Debug)]
pub struct Reaper {
    session_id: SessionId,
    endpoint: String,
    container: Container,
}

impl Reaper {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// `host:port` of the sidecar's listener
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn container_id(&self) -> &str {
        self.container.id()
    }

    /// Fresh check against the engine; an unknown container counts as not running
    pub async fn is_running(&self) -> bool {
        match self.container.state().await {
            Ok(info) => info.is_running(),
            Err(error) => {
                debug!(%error, "Reaper state unavailable");
                false
            }
        }
    }

    /// Send this session's filter to the sidecar and keep the connection open.
    ///
    /// The sidecar reaps once every connection for the filter has gone away, so
    /// the returned watch must live as long as the resources it protects.
    pub async fn connect(&self, options: &ReaperOptions) -> Result<ReaperWatch> {
        let connect_error = |message: String| -> ScuttleError {
            ReaperError::Connect {
                endpoint: self.endpoint.clone(),
                message,
            }
            .into()
        };

        let stream = tokio::time::timeout(
            options.connection_timeout,
            TcpStream::connect(&self.endpoint),
        )
        .await
        .map_err(|_| ScuttleError::Timeout {
            operation: format!("dial reaper at {}", self.endpoint),
            timeout_ms: options.connection_timeout.as_millis() as u64,
        })?
        .map_err(|e| connect_error(e.to_string()))?;

        let filter =
            LabelFilter::from_labels(&default_labels(&self.session_id, true)).to_reaper_filter();
        let mut stream = BufReader::new(stream);
        let mut last_error = String::from("no handshake attempted");
        let mut acknowledged = false;

        for attempt in 1..=options.ack_attempts.max(1) {
            match tokio::time::timeout(
                options.connection_timeout,
                handshake(&mut stream, &filter),
            )
            .await
            {
                Ok(Ok(())) => {
                    acknowledged = true;
                    break;
                }
                Ok(Err(message)) => last_error = message,
                Err(_) => last_error = "timed out waiting for ACK".to_string(),
            }
            debug!(attempt, error = %last_error, "Reaper handshake failed");
        }

        if !acknowledged {
            return Err(connect_error(last_error));
        }

        debug!(endpoint = %self.endpoint, "Reaper acknowledged session filter");
        Ok(ReaperWatch::spawn(stream))
    }
}

async fn handshake(
    stream: &mut BufReader<TcpStream>,
    filter: &str,
) -> std::result::Result<(), String> {
    let line = format!("{}\n", filter);
    stream
        .get_mut()
        .write_all(line.as_bytes())
        .await
        .map_err(|e| e.to_string())?;
    stream.get_mut().flush().await.map_err(|e| e.to_string())?;

    let mut reply = String::new();
    let read = stream
        .read_line(&mut reply)
        .await
        .map_err(|e| e.to_string())?;
    if read == 0 {
        return Err("connection closed by reaper".to_string());
    }
    if reply.trim_end() == ACK {
        Ok(())
    } else {
        Err(format!("unexpected reply {:?}", reply.trim_end()))
    }
}

/// Holds one connection to the sidecar until signalled or dropped
#[derive(Debug)]
pub struct ReaperWatch {
    done: Arc<Notify>,
}

impl ReaperWatch {
    fn spawn(stream: BufReader<TcpStream>) -> Self {
        let done = Arc::new(Notify::new());
        let waiter = Arc::clone(&done);
        tokio::spawn(async move {
            waiter.notified().await;
            drop(stream);
            debug!("Reaper connection released");
        });
        Self { done }
    }
}

impl TerminationObserver for ReaperWatch {
    fn signal(&self) {
        // Stores a permit when the task is not waiting yet, so the signal is never lost
        self.done.notify_one();
    }
}

impl Drop for ReaperWatch {
    fn drop(&mut self) {
        self.done.notify_one();
    }
}

/// Process-wide owner of the session's [`Reaper`]
pub struct ReaperCoordinator {
    controller: LifecycleController,
    options: ReaperOptions,
    current: Mutex<Option<Arc<Reaper>>>,
}

impl ReaperCoordinator {
    pub fn new(controller: LifecycleController, options: ReaperOptions) -> Self {
        Self {
            controller,
            options,
            current: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        self.controller.session_id()
    }

    pub fn options(&self) -> &ReaperOptions {
        &self.options
    }

    /// The cached instance, without checking it is still alive
    pub async fn current(&self) -> Option<Arc<Reaper>> {
        self.current.lock().await.clone()
    }

    /// Forget the cached instance; the next [`obtain`](Self::obtain) looks up again
    pub async fn reset(&self) {
        self.current.lock().await.take();
    }

    /// Return the session's running sidecar, reusing, adopting or creating it.
    ///
    /// Concurrent callers in this process wait for each other and share one result.
    pub async fn obtain(&self) -> Result<Arc<Reaper>> {
        let span = reaper_obtain_span(self.session_id().as_str());
        let _timer = SpanTimer::new(span.clone());

        async {
            let mut current = self.current.lock().await;

            if let Some(reaper) = current.as_ref() {
                if reaper.is_running().await {
                    return Ok(Arc::clone(reaper));
                }
                info!(
                    container_id = %short_id(reaper.container_id()),
                    "Cached reaper is no longer running"
                );
                *current = None;
            }

            let reaper = Arc::new(self.lookup_or_create().await?);
            info!(
                container_id = %short_id(reaper.container_id()),
                endpoint = %reaper.endpoint(),
                "Reaper ready"
            );
            *current = Some(Arc::clone(&reaper));
            Ok::<_, ScuttleError>(reaper)
        }
        .instrument(span)
        .await
    }

    async fn lookup_or_create(&self) -> Result<Reaper> {
        let attempts = AtomicU32::new(0);
        let backoff = self.options.lookup_backoff();

        retry_async(
            &backoff,
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.attempt()
            },
            classify,
        )
        .await
        .map_err(|last_error| {
            ReaperError::LookupFailed {
                session_id: self.session_id().to_string(),
                attempts: attempts.load(Ordering::Relaxed),
                last_error: last_error.to_string(),
            }
            .into()
        })
    }

    async fn attempt(&self) -> Result<Reaper> {
        let runtime = self.controller.runtime();
        let found = runtime
            .list_containers(&LabelFilter::reaper(self.session_id()))
            .await?;

        if let Some(info) = found.iter().find(|c| c.is_running()) {
            return self.adopt(info).await;
        }

        if let Some(info) = found.first() {
            if !info.is_dead() {
                return Err(ReaperError::Unhealthy {
                    id: info.id.clone(),
                    state: info.state.clone(),
                }
                .into());
            }
            warn!(
                container_id = %short_id(&info.id),
                state = %info.state,
                "Removing dead reaper"
            );
            match runtime
                .remove_container(
                    &info.id,
                    RemoveOptions {
                        force: true,
                        volumes: true,
                    },
                )
                .await
            {
                Ok(()) | Err(ScuttleError::Runtime(RuntimeError::ContainerNotFound { .. })) => {}
                Err(error) => return Err(error),
            }
        }

        self.create().await
    }

    async fn adopt(&self, info: &ContainerInfo) -> Result<Reaper> {
        debug!(container_id = %short_id(&info.id), "Adopting existing reaper");
        let container = self.controller.adopt(info);

        tokio::time::timeout(
            self.options.connection_timeout,
            ForListeningPort::new(REAPER_PORT).wait_until_ready(&container),
        )
        .await
        .map_err(|_| ReaperError::Unhealthy {
            id: info.id.clone(),
            state: "port 8080 not reachable".to_string(),
        })??;

        self.finish(container).await
    }

    async fn create(&self) -> Result<Reaper> {
        let spec = self.sidecar_spec();
        let name = spec.name.clone().unwrap_or_default();
        let defaults = [logging_hooks(), sidecar_labels(self.session_id().clone())];

        let container = match self.controller.create(spec, &defaults).await {
            Ok(container) => container,
            Err(error) if error.is_conflict() => {
                debug!(%name, "Reaper created concurrently elsewhere");
                return Err(ReaperError::CreationConflict { name }.into());
            }
            Err(error) => return Err(error),
        };
        container.start().await?;
        self.finish(container).await
    }

    async fn finish(&self, container: Container) -> Result<Reaper> {
        let endpoint = container.endpoint(REAPER_PORT).await?;
        Ok(Reaper {
            session_id: self.session_id().clone(),
            endpoint,
            container,
        })
    }

    /// The sidecar's own container spec
    pub fn sidecar_spec(&self) -> ContainerSpec {
        let options = &self.options;
        ContainerSpec::new(options.image.clone())
            .with_name(format!("reaper_{}", self.session_id()))
            .with_exposed_port(format!("{}/tcp", REAPER_PORT))
            .with_mount(BindMount::new(
                options.docker_socket.clone(),
                "/var/run/docker.sock",
            ))
            .with_privileged(options.privileged)
            .with_auto_remove(true)
            .with_env(
                "RYUK_CONNECTION_TIMEOUT",
                format!("{}s", options.connection_timeout.as_secs()),
            )
            .with_env(
                "RYUK_RECONNECTION_TIMEOUT",
                format!("{}s", options.reconnection_timeout.as_secs()),
            )
            .with_env("RYUK_VERBOSE", options.verbose.to_string())
            .with_wait_for(ForListeningPort::new(REAPER_PORT))
            .with_startup_timeout(options.connection_timeout)
            .with_skip_reaper(true)
    }
}

/// Labels are reserved for library hooks, so the sidecar gets its own through one
fn sidecar_labels(session: SessionId) -> LifecycleHookBundle {
    LifecycleHookBundle::new().pre_create(SpecHook::from_fn(move |spec| {
        spec.labels.extend(reaper_labels(&session));
        Ok(())
    }))
}

fn classify(error: &ScuttleError) -> RetryDecision {
    match error {
        ScuttleError::Runtime(RuntimeError::NotInstalled) | ScuttleError::Config(_) => {
            RetryDecision::Stop
        }
        _ => RetryDecision::Retry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockRuntime;
    use crate::labels::{LABEL_REAPER, LABEL_SESSION_ID};

    fn coordinator() -> ReaperCoordinator {
        let runtime = Arc::new(MockRuntime::new());
        let controller = LifecycleController::new(runtime, SessionId::new("s1"));
        ReaperCoordinator::new(controller, ReaperOptions::default())
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.hub_image_name_prefix = Some("mirror.local".to_string());
        config.ryuk_privileged = true;
        let options = ReaperOptions::from_config(&config);
        assert_eq!(options.image, "mirror.local/testcontainers/ryuk:0.11.0");
        assert!(options.privileged);
        assert_eq!(options.ack_attempts, 3);
        assert_eq!(options.lookup_budget, Duration::from_secs(60));
    }

    #[test]
    fn test_sidecar_spec() {
        let spec = coordinator().sidecar_spec();
        assert_eq!(spec.name.as_deref(), Some("reaper_s1"));
        assert_eq!(spec.exposed_ports, vec!["8080/tcp".to_string()]);
        assert!(spec.auto_remove);
        assert!(spec.skip_reaper);
        assert_eq!(spec.mounts[0].target, "/var/run/docker.sock");
        assert_eq!(spec.env.get("RYUK_RECONNECTION_TIMEOUT").map(String::as_str), Some("10s"));
    }

    #[tokio::test]
    async fn test_sidecar_label_hook() {
        let bundle = sidecar_labels(SessionId::new("s1"));
        let mut spec = ContainerSpec::new("ryuk");
        bundle.pre_creates[0].call(&mut spec).await.unwrap();
        assert_eq!(spec.labels.get(LABEL_REAPER).map(String::as_str), Some("true"));
        assert_eq!(spec.labels.get(LABEL_SESSION_ID).map(String::as_str), Some("s1"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&RuntimeError::NotInstalled.into()),
            RetryDecision::Stop
        );
        assert_eq!(
            classify(&ReaperError::CreationConflict { name: "r".into() }.into()),
            RetryDecision::Retry
        );
    }

    #[tokio::test]
    async fn test_reset_clears_cache() {
        let coordinator = coordinator();
        assert!(coordinator.current().await.is_none());
        coordinator.reset().await;
        assert!(coordinator.current().await.is_none());
    }
}
