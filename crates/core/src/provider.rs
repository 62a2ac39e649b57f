//! Container provider
//!
//! The entry point most callers use. A [`Provider`] ties a runtime client, the
//! configuration, the session and the reaper coordinator together, and prepends
//! the library's default hook bundles to every container it creates.

use crate::config::{self, Config};
use crate::container::{Container, LifecycleController};
use crate::container_spec::ContainerSpec;
use crate::docker::CliRuntime;
use crate::errors::{InternalError, Result, ScuttleError};
use crate::hooks::{log_consumer_hooks, logging_hooks, reaper_hooks, LifecycleHookBundle};
use crate::observability::short_id;
use crate::reaper::{ReaperCoordinator, ReaperOptions};
use crate::runtime::RuntimeClient;
use crate::session::{self, SessionId};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Default size of the [`Provider::run_parallel`] worker pool
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
    /// Containers created and started at once; 0 means the default
    pub workers: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
        }
    }
}

/// One request of a parallel run that failed
#[derive(Debug)]
pub struct ParallelFailure {
    /// Position of the request in the input
    pub index: usize,
    pub image: String,
    pub error: ScuttleError,
}

impl fmt::Display for ParallelFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({}): {}", self.index, self.image, self.error)
    }
}

/// Some requests of a parallel run failed; the others are running
#[derive(Error, Debug)]
#[error("{} containers failed to start: {}", .failures.len(), render_failures(.failures))]
pub struct ParallelError {
    pub started: Vec<Container>,
    pub failures: Vec<ParallelFailure>,
}

fn render_failures(failures: &[ParallelFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Creates containers with the library defaults applied
#[derive(Clone)]
pub struct Provider {
    controller: LifecycleController,
    config: Config,
    reaper: Arc<ReaperCoordinator>,
}

impl Provider {
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: Config, session_id: SessionId) -> Self {
        let controller = LifecycleController::new(runtime, session_id)
            .with_host_override(config.host_override.clone());
        let reaper = Arc::new(ReaperCoordinator::new(
            controller.clone(),
            ReaperOptions::from_config(&config),
        ));
        Self {
            controller,
            config,
            reaper,
        }
    }

    /// Docker CLI runtime, process-wide config and the current session
    pub fn from_env() -> Result<Self> {
        let config = config::read()?.clone();
        let runtime = Arc::new(CliRuntime::with_path(config.docker_path.clone()));
        Ok(Self::new(runtime, config, session::current().clone()))
    }

    /// Replace the reaper options derived from the config
    pub fn with_reaper_options(mut self, options: ReaperOptions) -> Self {
        self.reaper = Arc::new(ReaperCoordinator::new(self.controller.clone(), options));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_id(&self) -> &SessionId {
        self.controller.session_id()
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeClient> {
        self.controller.runtime()
    }

    pub fn reaper(&self) -> &Arc<ReaperCoordinator> {
        &self.reaper
    }

    /// Library bundles for `spec`: logging, reaper (if enabled), log consumers
    pub fn default_bundles(&self, spec: &ContainerSpec) -> Vec<LifecycleHookBundle> {
        let mut bundles = vec![logging_hooks()];
        if !self.config.ryuk_disabled && !spec.skip_reaper {
            bundles.push(reaper_hooks(Arc::clone(&self.reaper)));
        }
        bundles.push(log_consumer_hooks(spec.log_config.clone()));
        bundles
    }

    #[instrument(skip_all, fields(image = %spec.image))]
    pub async fn create_container(&self, spec: ContainerSpec) -> Result<Container> {
        let defaults = self.default_bundles(&spec);
        self.controller.create(spec, &defaults).await
    }

    /// Create and start; a container that fails to start is terminated again
    pub async fn run_container(&self, spec: ContainerSpec) -> Result<Container> {
        let container = self.create_container(spec).await?;
        if let Err(error) = container.start().await {
            if let Err(cleanup) = container.terminate().await {
                warn!(
                    container_id = %short_id(container.id()),
                    error = %cleanup,
                    "Cleanup after failed start did not complete"
                );
            }
            return Err(error);
        }
        Ok(container)
    }

    /// Run every spec on a bounded worker pool and wait for all of them
    pub async fn run_parallel(
        &self,
        specs: Vec<ContainerSpec>,
        options: ParallelOptions,
    ) -> std::result::Result<Vec<Container>, ParallelError> {
        let workers = match options.workers {
            0 => DEFAULT_WORKERS,
            n => n,
        }
        .min(specs.len().max(1));
        info!(requests = specs.len(), workers, "Running containers in parallel");

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(specs.len());

        for (index, spec) in specs.into_iter().enumerate() {
            let provider = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let image = spec.image.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    ScuttleError::from(InternalError::Generic {
                        message: format!("Semaphore closed: {}", e),
                    })
                })?;
                debug!(index, "Worker picked up request");
                provider.run_container(spec).await
            });
            handles.push((index, image, handle));
        }

        let mut started = Vec::new();
        let mut failures = Vec::new();
        for (index, image, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|e| {
                Err(InternalError::Join {
                    message: e.to_string(),
                }
                .into())
            });
            match outcome {
                Ok(container) => started.push(container),
                Err(error) => {
                    warn!(index, %image, %error, "Parallel request failed");
                    failures.push(ParallelFailure {
                        index,
                        image,
                        error,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(started)
        } else {
            Err(ParallelError { started, failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::mock::MockRuntime;

    fn provider(ryuk_disabled: bool) -> Provider {
        let config = Config {
            ryuk_disabled,
            ..Config::default()
        };
        Provider::new(Arc::new(MockRuntime::new()), config, SessionId::new("p1"))
    }

    #[test]
    fn test_default_bundles_without_reaper() {
        let provider = provider(true);
        let bundles = provider.default_bundles(&ContainerSpec::new("alpine"));
        // logging + empty log-consumer bundle
        assert_eq!(bundles.len(), 2);
        assert!(bundles[1].is_empty());
    }

    #[test]
    fn test_default_bundles_with_reaper() {
        let provider = provider(false);
        assert_eq!(provider.default_bundles(&ContainerSpec::new("alpine")).len(), 3);
        let skipped = ContainerSpec::new("alpine").with_skip_reaper(true);
        assert_eq!(provider.default_bundles(&skipped).len(), 2);
    }

    #[test]
    fn test_parallel_options_default() {
        assert_eq!(ParallelOptions::default().workers, 8);
    }
}
