//! Container handle and lifecycle controller
//!
//! [`LifecycleController::create`] turns a [`ContainerSpec`] into a [`Container`]
//! handle. The handle drives its own transitions:
//!
//! ```text
//! Created -> start -> Running (-> Ready) -> stop -> Stopped -> start ...
//!                         \_____________________________/
//!                                      terminate -> Terminated
//! ```
//!
//! Transitions on one handle are serialized by a lock. Every one of them drops
//! the cached inspection snapshot. Hooks run while that lock is held, so a hook
//! must not call `start`, `stop` or `terminate` on the same handle.

use crate::container_spec::{BuiltImage, ContainerSpec, DEFAULT_STARTUP_TIMEOUT};
use crate::errors::{aggregate, Result, RuntimeError, ScuttleError};
use crate::hooks::{run_handle_hooks, run_spec_hooks, HookPhase, LifecycleHookBundle};
use crate::labels::{default_labels, merge_custom_labels};
use crate::logs::{LogConsumer, LogProduction, LogProductionOptions};
use crate::observability::{container_create_span, container_transition_span, short_id, spans, SpanTimer};
use crate::runtime::{ContainerInfo, ExecResult, RemoveOptions, RuntimeClient};
use crate::session::SessionId;
use crate::wait::ReadinessStrategy;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn, Instrument};

/// Told, without blocking, that a container was removed on purpose
pub trait TerminationObserver: Send + Sync {
    fn signal(&self);
}

/// Extra behavior for [`Container::terminate_with`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminateOptions {
    /// Stop gracefully (with this timeout) before removal
    pub stop_timeout: Option<Duration>,
    /// Remove the container's anonymous volumes too
    pub remove_volumes: bool,
}

impl TerminateOptions {
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = Some(timeout);
        self
    }

    pub fn with_volumes(mut self) -> Self {
        self.remove_volumes = true;
        self
    }
}

#[derive(Debug, Default)]
struct HandleState {
    running: bool,
    terminated: bool,
    inspected: Option<ContainerInfo>,
}

/// Creates containers for one runtime and session
#[derive(Clone)]
pub struct LifecycleController {
    runtime: Arc<dyn RuntimeClient>,
    session_id: SessionId,
    host_override: Option<String>,
}

impl LifecycleController {
    pub fn new(runtime: Arc<dyn RuntimeClient>, session_id: SessionId) -> Self {
        Self {
            runtime,
            session_id,
            host_override: None,
        }
    }

    pub fn with_host_override(mut self, host: Option<String>) -> Self {
        self.host_override = host;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        &self.runtime
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Run the pre-create chain, create the container, run the post-create chain.
    ///
    /// `defaults` are the library's bundles; the spec's own bundles follow them.
    /// If the post-create chain fails the container is removed again.
    pub async fn create(
        &self,
        mut spec: ContainerSpec,
        defaults: &[LifecycleHookBundle],
    ) -> Result<Container> {
        let span = container_create_span(&spec.image);
        let timer = SpanTimer::new(span.clone());

        let container = async {
            let custom = std::mem::take(&mut spec.labels);
            spec.labels = default_labels(&self.session_id, false);
            merge_custom_labels(&mut spec.labels, &custom)?;

            let hooks = LifecycleHookBundle::combine(defaults, &spec.hooks);
            run_spec_hooks(&hooks.pre_creates, &mut spec).await?;

            let id = self.runtime.create_container(&spec).await?;
            tracing::Span::current().record("container_id", short_id(&id));

            let container = Container {
                id,
                image: spec.image.clone(),
                session_id: self.session_id.clone(),
                runtime: Arc::clone(&self.runtime),
                hooks,
                wait_for: spec.wait_for.clone(),
                startup_timeout: spec.startup_timeout,
                built_image: spec.built_image,
                skip_reaper: spec.skip_reaper,
                host_override: self.host_override.clone(),
                transition: tokio::sync::Mutex::new(()),
                state: Mutex::new(HandleState::default()),
                logs: LogProduction::default(),
                observer: Mutex::new(None),
            };

            if let Err(error) = run_handle_hooks(
                HookPhase::PostCreate,
                &container.hooks.post_creates,
                &container,
            )
            .await
            {
                let remove = container
                    .runtime
                    .remove_container(
                        &container.id,
                        RemoveOptions {
                            force: true,
                            volumes: true,
                        },
                    )
                    .await;
                if let Err(remove_error) = remove {
                    warn!(
                        container_id = %short_id(&container.id),
                        error = %remove_error,
                        "Could not remove container after post-create failure"
                    );
                }
                return Err(error);
            }

            Ok::<_, ScuttleError>(container)
        }
        .instrument(span)
        .await;

        timer.finish();
        container
    }

    /// Handle for a container some other process created: no hooks, no readiness
    /// strategy, never registered with the reaper
    pub fn adopt(&self, info: &ContainerInfo) -> Container {
        Container {
            id: info.id.clone(),
            image: info.image.clone(),
            session_id: self.session_id.clone(),
            runtime: Arc::clone(&self.runtime),
            hooks: LifecycleHookBundle::default(),
            wait_for: None,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            built_image: None,
            skip_reaper: true,
            host_override: self.host_override.clone(),
            transition: tokio::sync::Mutex::new(()),
            state: Mutex::new(HandleState {
                running: info.is_running(),
                ..HandleState::default()
            }),
            logs: LogProduction::default(),
            observer: Mutex::new(None),
        }
    }
}

/// Handle to one created container
pub struct Container {
    id: String,
    image: String,
    session_id: SessionId,
    runtime: Arc<dyn RuntimeClient>,
    hooks: LifecycleHookBundle,
    wait_for: Option<Arc<dyn ReadinessStrategy>>,
    startup_timeout: Duration,
    built_image: Option<BuiltImage>,
    skip_reaper: bool,
    host_override: Option<String>,
    transition: tokio::sync::Mutex<()>,
    state: Mutex<HandleState>,
    logs: LogProduction,
    observer: Mutex<Option<Arc<dyn TerminationObserver>>>,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl Container {
    /// Engine id; kept after termination for diagnostics
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    pub fn is_terminated(&self) -> bool {
        self.lock_state().terminated
    }

    /// Whether this container opted out of reaper registration
    pub fn skips_reaper(&self) -> bool {
        self.skip_reaper
    }

    fn lock_state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(ScuttleError::InvalidState(format!(
                "container {} has been terminated",
                short_id(&self.id)
            )));
        }
        Ok(())
    }

    /// Drop the cached inspection snapshot
    pub fn invalidate_cache(&self) {
        self.lock_state().inspected = None;
    }

    fn set_running(&self, running: bool) {
        let mut state = self.lock_state();
        state.running = running;
        state.inspected = None;
    }

    /// Inspection snapshot, cached until the next transition
    pub async fn inspect(&self) -> Result<ContainerInfo> {
        self.ensure_alive()?;
        if let Some(info) = self.lock_state().inspected.clone() {
            return Ok(info);
        }
        let info = self
            .runtime
            .inspect_container(&self.id)
            .await?
            .ok_or_else(|| RuntimeError::ContainerNotFound {
                id: self.id.clone(),
            })?;
        self.lock_state().inspected = Some(info.clone());
        Ok(info)
    }

    /// Fresh inspection snapshot, bypassing the cache
    pub async fn state(&self) -> Result<ContainerInfo> {
        self.invalidate_cache();
        self.inspect().await
    }

    /// Host on which published ports are reachable
    pub fn host(&self) -> String {
        self.host_override
            .clone()
            .unwrap_or_else(|| self.runtime.daemon_host())
    }

    /// Host port published for container port `port/tcp`
    pub async fn mapped_port(&self, port: u16) -> Result<u16> {
        let info = self.inspect().await?;
        info.host_port(port, "tcp").ok_or_else(|| {
            ScuttleError::InvalidState(format!(
                "port {}/tcp of container {} is not published",
                port,
                short_id(&self.id)
            ))
        })
    }

    /// `host:port` for container port `port/tcp`
    pub async fn endpoint(&self, port: u16) -> Result<String> {
        let mapped = self.mapped_port(port).await?;
        Ok(format!("{}:{}", self.host(), mapped))
    }

    pub async fn exec<S: AsRef<str>>(&self, cmd: &[S]) -> Result<ExecResult> {
        self.ensure_alive()?;
        let cmd: Vec<String> = cmd.iter().map(|s| s.as_ref().to_string()).collect();
        self.runtime.exec(&self.id, &cmd).await
    }

    /// Register the observer told about explicit termination, replacing any previous one
    pub fn set_termination_observer(&self, observer: Arc<dyn TerminationObserver>) {
        *self
            .observer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(observer);
    }

    /// Pre-start, start, post-start, readiness, then post-ready.
    ///
    /// Readiness is bounded by the spec's startup timeout; the post-ready chain
    /// only runs once the strategy succeeded.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.transition.lock().await;
        self.ensure_alive()?;

        let span = container_transition_span(spans::CONTAINER_START, &self.id);
        let _timer = SpanTimer::new(span.clone());
        async {
            run_handle_hooks(HookPhase::PreStart, &self.hooks.pre_starts, self).await?;
            self.runtime.start_container(&self.id).await?;
            self.set_running(true);
            run_handle_hooks(HookPhase::PostStart, &self.hooks.post_starts, self).await?;

            if let Some(strategy) = &self.wait_for {
                match tokio::time::timeout(self.startup_timeout, strategy.wait_until_ready(self))
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => return Err(error),
                    Err(_) => {
                        return Err(ScuttleError::Readiness {
                            container_id: self.id.clone(),
                            message: format!(
                                "not ready within {}ms",
                                self.startup_timeout.as_millis()
                            ),
                        })
                    }
                }
            }

            run_handle_hooks(HookPhase::PostReady, &self.hooks.post_readies, self).await
        }
        .instrument(span)
        .await
    }

    /// Pre-stop, stop, post-stop
    pub async fn stop(&self, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.transition.lock().await;
        self.ensure_alive()?;
        self.stop_locked(timeout).await
    }

    async fn stop_locked(&self, timeout: Option<Duration>) -> Result<()> {
        let span = container_transition_span(spans::CONTAINER_STOP, &self.id);
        let _timer = SpanTimer::new(span.clone());
        async {
            run_handle_hooks(HookPhase::PreStop, &self.hooks.pre_stops, self).await?;
            self.runtime.stop_container(&self.id, timeout).await?;
            self.set_running(false);
            run_handle_hooks(HookPhase::PostStop, &self.hooks.post_stops, self).await
        }
        .instrument(span)
        .await
    }

    /// Stop then start
    pub async fn restart(&self, timeout: Option<Duration>) -> Result<()> {
        self.stop(timeout).await?;
        self.start().await
    }

    pub async fn terminate(&self) -> Result<()> {
        self.terminate_with(TerminateOptions::default()).await
    }

    /// Remove the container, attempting every step even when earlier ones fail.
    ///
    /// The handle is marked terminated (not running, no cache) whatever the
    /// outcome. Terminating twice is a no-op.
    pub async fn terminate_with(&self, options: TerminateOptions) -> Result<()> {
        let _guard = self.transition.lock().await;
        if self.is_terminated() {
            return Ok(());
        }

        let span = container_transition_span(spans::CONTAINER_TERMINATE, &self.id);
        let _timer = SpanTimer::new(span.clone());
        async {
            let mut failures = Vec::new();

            if let Some(timeout) = options.stop_timeout {
                if let Err(error) = self.stop_locked(Some(timeout)).await {
                    failures.push(error);
                }
            }

            if let Err(error) =
                run_handle_hooks(HookPhase::PreTerminate, &self.hooks.pre_terminates, self).await
            {
                failures.push(error);
            }

            let observer = self
                .observer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(observer) = observer {
                observer.signal();
            }

            // Production started outside the log consumer hooks
            if let Err(error) = self.logs.stop().await {
                failures.push(error);
            }

            if let Err(error) = self
                .runtime
                .remove_container(
                    &self.id,
                    RemoveOptions {
                        force: true,
                        volumes: options.remove_volumes,
                    },
                )
                .await
            {
                failures.push(error);
            }

            if let Some(built) = self.built_image {
                if !built.keep {
                    debug!(image = %self.image, "Removing image built for container");
                    if let Err(error) = self.runtime.remove_image(&self.image).await {
                        failures.push(error);
                    }
                }
            }

            if let Err(error) =
                run_handle_hooks(HookPhase::PostTerminate, &self.hooks.post_terminates, self).await
            {
                failures.push(error);
            }

            {
                let mut state = self.lock_state();
                state.running = false;
                state.terminated = true;
                state.inspected = None;
            }

            aggregate(failures, |failures| ScuttleError::TerminationPartialFailure {
                container_id: self.id.clone(),
                failures,
            })
        }
        .instrument(span)
        .await
    }

    /// Start streaming this container's logs to `consumers`
    pub async fn start_log_production(
        &self,
        consumers: Vec<Arc<dyn LogConsumer>>,
        options: LogProductionOptions,
    ) -> Result<()> {
        self.ensure_alive()?;
        self.logs
            .start(Arc::clone(&self.runtime), self.id.clone(), consumers, options)
            .await
    }

    /// Stop log production and return the loop's terminal error, if any
    pub async fn stop_log_production(&self) -> Result<()> {
        self.logs.stop().await
    }

    /// Wait until log production ends without a stop request (stream closed or
    /// failed) and return its terminal error. `Ok` right away when idle.
    pub async fn wait_log_production(&self) -> Result<()> {
        self.logs.finished().await
    }

    /// `false` once the loop has ended, even before its result is collected
    pub async fn is_producing_logs(&self) -> bool {
        self.logs.is_active().await
    }
}

/// Terminate `container` if there is one
pub async fn terminate_container(container: Option<&Container>) -> Result<()> {
    match container {
        Some(container) => container.terminate().await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminate_options_builder() {
        let options = TerminateOptions::default()
            .with_stop_timeout(Duration::from_secs(3))
            .with_volumes();
        assert_eq!(options.stop_timeout, Some(Duration::from_secs(3)));
        assert!(options.remove_volumes);
    }

    #[tokio::test]
    async fn test_terminate_container_none_is_noop() {
        assert!(terminate_container(None).await.is_ok());
    }
}
