//! Lifecycle hook pipeline
//!
//! A [`LifecycleHookBundle`] holds one ordered list of callbacks per phase edge.
//! The controller flattens the library's default bundles and the caller's bundles
//! into a single combined bundle with [`LifecycleHookBundle::combine`]:
//!
//! - pre edges run the defaults first, then the caller's bundles;
//! - post edges run the caller's bundles first, then the defaults.
//!
//! Within an edge every hook runs even if an earlier one failed. The failures are
//! returned together as one [`HookExecutionError`].
//!
//! The bundles the library itself ships (logging, log consumers, reaper) live at
//! the bottom of this module.

use crate::container::Container;
use crate::container_spec::ContainerSpec;
use crate::errors::{aggregate, HookExecutionError, Result};
use crate::logs::LogConfig;
use crate::observability::short_id;
use crate::reaper::ReaperCoordinator;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// A named point in the lifecycle at which a combined chain runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    PreCreate,
    PostCreate,
    PreStart,
    PostStart,
    PostReady,
    PreStop,
    PostStop,
    PreTerminate,
    PostTerminate,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCreate => "pre-create",
            Self::PostCreate => "post-create",
            Self::PreStart => "pre-start",
            Self::PostStart => "post-start",
            Self::PostReady => "post-ready",
            Self::PreStop => "pre-stop",
            Self::PostStop => "post-stop",
            Self::PreTerminate => "pre-terminate",
            Self::PostTerminate => "post-terminate",
        }
    }
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type SpecHookFn = dyn for<'a> Fn(&'a mut ContainerSpec) -> BoxFuture<'a, Result<()>> + Send + Sync;
type HandleHookFn = dyn for<'a> Fn(&'a Container) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// Callback run before creation; may mutate the spec
#[derive(Clone)]
pub struct SpecHook(Arc<SpecHookFn>);

impl SpecHook {
    /// Wrap an async callback
    ///
    /// ```rust
    /// use futures::FutureExt;
    /// use scuttle_core::hooks::SpecHook;
    ///
    /// let hook = SpecHook::new(|spec| {
    ///     async move {
    ///         spec.env.insert("MODE".to_string(), "test".to_string());
    ///         Ok(())
    ///     }
    ///     .boxed()
    /// });
    /// # let _ = hook;
    /// ```
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut ContainerSpec) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Wrap a synchronous callback
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&mut ContainerSpec) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(move |spec| futures::future::ready(f(spec)).boxed())
    }

    pub async fn call(&self, spec: &mut ContainerSpec) -> Result<()> {
        (self.0)(spec).await
    }
}

impl fmt::Debug for SpecHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SpecHook")
    }
}

/// Callback run against a live container handle
#[derive(Clone)]
pub struct HandleHook(Arc<HandleHookFn>);

impl HandleHook {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Container) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&Container) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(move |container| futures::future::ready(f(container)).boxed())
    }

    pub async fn call(&self, container: &Container) -> Result<()> {
        (self.0)(container).await
    }
}

impl fmt::Debug for HandleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandleHook")
    }
}

/// Nine ordered callback lists, one per phase edge.
///
/// Readiness has no pre edge: nothing happens between post-start and the wait.
#[derive(Clone, Debug, Default)]
pub struct LifecycleHookBundle {
    pub pre_creates: Vec<SpecHook>,
    pub post_creates: Vec<HandleHook>,
    pub pre_starts: Vec<HandleHook>,
    pub post_starts: Vec<HandleHook>,
    pub post_readies: Vec<HandleHook>,
    pub pre_stops: Vec<HandleHook>,
    pub post_stops: Vec<HandleHook>,
    pub pre_terminates: Vec<HandleHook>,
    pub post_terminates: Vec<HandleHook>,
}

impl LifecycleHookBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_create(mut self, hook: SpecHook) -> Self {
        self.pre_creates.push(hook);
        self
    }

    pub fn post_create(mut self, hook: HandleHook) -> Self {
        self.post_creates.push(hook);
        self
    }

    pub fn pre_start(mut self, hook: HandleHook) -> Self {
        self.pre_starts.push(hook);
        self
    }

    pub fn post_start(mut self, hook: HandleHook) -> Self {
        self.post_starts.push(hook);
        self
    }

    pub fn post_ready(mut self, hook: HandleHook) -> Self {
        self.post_readies.push(hook);
        self
    }

    pub fn pre_stop(mut self, hook: HandleHook) -> Self {
        self.pre_stops.push(hook);
        self
    }

    pub fn post_stop(mut self, hook: HandleHook) -> Self {
        self.post_stops.push(hook);
        self
    }

    pub fn pre_terminate(mut self, hook: HandleHook) -> Self {
        self.pre_terminates.push(hook);
        self
    }

    pub fn post_terminate(mut self, hook: HandleHook) -> Self {
        self.post_terminates.push(hook);
        self
    }

    /// The handle hooks registered for `phase`; empty for [`HookPhase::PreCreate`]
    pub fn handle_hooks(&self, phase: HookPhase) -> &[HandleHook] {
        match phase {
            HookPhase::PreCreate => &[],
            HookPhase::PostCreate => &self.post_creates,
            HookPhase::PreStart => &self.pre_starts,
            HookPhase::PostStart => &self.post_starts,
            HookPhase::PostReady => &self.post_readies,
            HookPhase::PreStop => &self.pre_stops,
            HookPhase::PostStop => &self.post_stops,
            HookPhase::PreTerminate => &self.pre_terminates,
            HookPhase::PostTerminate => &self.post_terminates,
        }
    }

    /// Total number of callbacks across all edges
    pub fn len(&self) -> usize {
        self.pre_creates.len()
            + [
                HookPhase::PostCreate,
                HookPhase::PreStart,
                HookPhase::PostStart,
                HookPhase::PostReady,
                HookPhase::PreStop,
                HookPhase::PostStop,
                HookPhase::PreTerminate,
                HookPhase::PostTerminate,
            ]
            .iter()
            .map(|phase| self.handle_hooks(*phase).len())
            .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten default and caller bundles into one bundle of combined chains
    pub fn combine(defaults: &[LifecycleHookBundle], user: &[LifecycleHookBundle]) -> Self {
        Self {
            pre_creates: pre_chain(defaults, user, |b| &b.pre_creates),
            post_creates: post_chain(defaults, user, |b| &b.post_creates),
            pre_starts: pre_chain(defaults, user, |b| &b.pre_starts),
            post_starts: post_chain(defaults, user, |b| &b.post_starts),
            post_readies: post_chain(defaults, user, |b| &b.post_readies),
            pre_stops: pre_chain(defaults, user, |b| &b.pre_stops),
            post_stops: post_chain(defaults, user, |b| &b.post_stops),
            pre_terminates: pre_chain(defaults, user, |b| &b.pre_terminates),
            post_terminates: post_chain(defaults, user, |b| &b.post_terminates),
        }
    }
}

fn pre_chain<T, F>(defaults: &[LifecycleHookBundle], user: &[LifecycleHookBundle], select: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&LifecycleHookBundle) -> &Vec<T>,
{
    defaults
        .iter()
        .chain(user)
        .flat_map(|bundle| select(bundle).iter().cloned())
        .collect()
}

fn post_chain<T, F>(defaults: &[LifecycleHookBundle], user: &[LifecycleHookBundle], select: F) -> Vec<T>
where
    T: Clone,
    F: Fn(&LifecycleHookBundle) -> &Vec<T>,
{
    user.iter()
        .chain(defaults)
        .flat_map(|bundle| select(bundle).iter().cloned())
        .collect()
}

/// Run every pre-create hook against `spec`, collecting failures
pub async fn run_spec_hooks(hooks: &[SpecHook], spec: &mut ContainerSpec) -> Result<()> {
    let mut failures = Vec::new();
    for hook in hooks {
        if let Err(error) = hook.call(spec).await {
            warn!(phase = %HookPhase::PreCreate, %error, "Hook failed");
            failures.push(error);
        }
    }
    aggregate(failures, |failures| {
        HookExecutionError {
            phase: HookPhase::PreCreate,
            failures,
        }
        .into()
    })
}

/// Run every hook of one handle edge, collecting failures
pub async fn run_handle_hooks(
    phase: HookPhase,
    hooks: &[HandleHook],
    container: &Container,
) -> Result<()> {
    let mut failures = Vec::new();
    for hook in hooks {
        if let Err(error) = hook.call(container).await {
            warn!(
                phase = %phase,
                container_id = %short_id(container.id()),
                %error,
                "Hook failed"
            );
            failures.push(error);
        }
    }
    aggregate(failures, |failures| HookExecutionError { phase, failures }.into())
}

/// Traces every lifecycle transition at `info` level
pub fn logging_hooks() -> LifecycleHookBundle {
    fn transition(message: &'static str) -> HandleHook {
        HandleHook::from_fn(move |container| {
            info!(container_id = %short_id(container.id()), "{}", message);
            Ok(())
        })
    }

    LifecycleHookBundle::new()
        .pre_create(SpecHook::from_fn(|spec| {
            info!(image = %spec.image, "Creating container");
            Ok(())
        }))
        .post_create(transition("Container created"))
        .pre_start(transition("Starting container"))
        .post_start(transition("Container started"))
        .post_ready(transition("Container is ready"))
        .pre_stop(transition("Stopping container"))
        .post_stop(transition("Container stopped"))
        .pre_terminate(transition("Terminating container"))
        .post_terminate(transition("Container terminated"))
}

/// Starts log production after start and stops it before terminate.
///
/// Empty when `config` has no consumers.
pub fn log_consumer_hooks(config: LogConfig) -> LifecycleHookBundle {
    if config.consumers.is_empty() {
        return LifecycleHookBundle::new();
    }

    let config = Arc::new(config);
    LifecycleHookBundle::new()
        .post_start(HandleHook::new(move |container| {
            let config = Arc::clone(&config);
            async move {
                container
                    .start_log_production(config.consumers.clone(), config.options)
                    .await
            }
            .boxed()
        }))
        .pre_terminate(HandleHook::new(|container| {
            async move { container.stop_log_production().await }.boxed()
        }))
}

/// Registers every container with the session's reaper.
///
/// A failed lookup is logged and the container is created unprotected: losing
/// automatic reclamation must not fail the test that asked for the container.
pub fn reaper_hooks(coordinator: Arc<ReaperCoordinator>) -> LifecycleHookBundle {
    let pre = Arc::clone(&coordinator);
    LifecycleHookBundle::new()
        .pre_create(SpecHook::new(move |spec| {
            let coordinator = Arc::clone(&pre);
            async move {
                if spec.skip_reaper {
                    return Ok(());
                }
                match coordinator.obtain().await {
                    Ok(reaper) => {
                        spec.labels.insert(
                            crate::labels::LABEL_REAP.to_string(),
                            "true".to_string(),
                        );
                        tracing::debug!(
                            endpoint = %reaper.endpoint(),
                            "Container will be watched by reaper"
                        );
                    }
                    Err(error) => {
                        warn!(
                            session_id = %coordinator.session_id().short(),
                            %error,
                            "Reaper unavailable; container will not be reclaimed automatically"
                        );
                    }
                }
                Ok(())
            }
            .boxed()
        }))
        .post_create(HandleHook::new(move |container| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                if container.skips_reaper() {
                    return Ok(());
                }
                let Some(reaper) = coordinator.current().await else {
                    return Ok(());
                };
                match reaper.connect(coordinator.options()).await {
                    Ok(watch) => {
                        container.set_termination_observer(Arc::new(watch));
                        Ok(())
                    }
                    Err(error) => {
                        warn!(
                            container_id = %short_id(container.id()),
                            %error,
                            "Could not register container with reaper"
                        );
                        Ok(())
                    }
                }
            }
            .boxed()
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(HookPhase::PreCreate.to_string(), "pre-create");
        assert_eq!(HookPhase::PostReady.to_string(), "post-ready");
        assert_eq!(HookPhase::PostTerminate.to_string(), "post-terminate");
    }

    #[test]
    fn test_combine_counts() {
        let bundle = logging_hooks();
        assert_eq!(bundle.len(), 9);
        let combined = LifecycleHookBundle::combine(&[bundle.clone()], &[bundle]);
        assert_eq!(combined.len(), 18);
        assert_eq!(combined.handle_hooks(HookPhase::PreCreate).len(), 0);
        assert_eq!(combined.pre_creates.len(), 2);
    }

    #[test]
    fn test_log_consumer_hooks_empty_without_consumers() {
        assert!(log_consumer_hooks(LogConfig::default()).is_empty());
    }

    #[tokio::test]
    async fn test_spec_hooks_run_all_and_aggregate() {
        let hooks = vec![
            SpecHook::from_fn(|spec| {
                spec.env.insert("A".to_string(), "1".to_string());
                Ok(())
            }),
            SpecHook::from_fn(|_| Err(crate::errors::ScuttleError::hook("boom"))),
            SpecHook::from_fn(|spec| {
                spec.env.insert("B".to_string(), "2".to_string());
                Ok(())
            }),
        ];
        let mut spec = ContainerSpec::new("alpine");
        let err = run_spec_hooks(&hooks, &mut spec).await.unwrap_err();

        assert_eq!(spec.env.len(), 2);
        assert!(err.to_string().starts_with("pre-create hooks failed"));
        assert!(err.to_string().contains("boom"));
    }
}
