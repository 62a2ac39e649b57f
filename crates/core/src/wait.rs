//! Readiness strategies
//!
//! A strategy decides when a started container is usable. The controller runs it
//! once per Start, after the post-start hooks, bounded by the spec's startup
//! timeout.

use crate::container::Container;
use crate::errors::{Result, ScuttleError};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

#[async_trait::async_trait]
pub trait ReadinessStrategy: Send + Sync {
    /// Resolve once `container` is ready; an error aborts the Start transition
    async fn wait_until_ready(&self, container: &Container) -> Result<()>;
}

/// Ready as soon as the container runs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWait;

#[async_trait::async_trait]
impl ReadinessStrategy for NoWait {
    async fn wait_until_ready(&self, _container: &Container) -> Result<()> {
        Ok(())
    }
}

/// Ready once a TCP connect to the published `port` succeeds
#[derive(Debug, Clone, Copy)]
pub struct ForListeningPort {
    pub port: u16,
    pub poll_interval: Duration,
}

impl ForListeningPort {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[async_trait::async_trait]
impl ReadinessStrategy for ForListeningPort {
    #[instrument(level = "debug", skip(self, container), fields(port = self.port))]
    async fn wait_until_ready(&self, container: &Container) -> Result<()> {
        loop {
            // The mapping may only appear once the engine has finished starting the container
            match container.endpoint(self.port).await {
                Ok(endpoint) => match TcpStream::connect(&endpoint).await {
                    Ok(_) => {
                        debug!(%endpoint, "Port is accepting connections");
                        return Ok(());
                    }
                    Err(e) => debug!(%endpoint, error = %e, "Port not ready yet"),
                },
                Err(ScuttleError::InvalidState(message)) => {
                    debug!(%message, "Port not published yet");
                    container.invalidate_cache();
                }
                Err(other) => return Err(other),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

type ReadinessFn = dyn for<'a> Fn(&'a Container) -> BoxFuture<'a, Result<()>> + Send + Sync;

/// Closure adapter, see [`from_fn`]
#[derive(Clone)]
pub struct FnStrategy(Arc<ReadinessFn>);

#[async_trait::async_trait]
impl ReadinessStrategy for FnStrategy {
    async fn wait_until_ready(&self, container: &Container) -> Result<()> {
        (self.0)(container).await
    }
}

/// Build a strategy from an async closure
pub fn from_fn<F>(f: F) -> FnStrategy
where
    F: for<'a> Fn(&'a Container) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
{
    FnStrategy(Arc::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_listening_port_defaults() {
        let strategy = ForListeningPort::new(8080);
        assert_eq!(strategy.port, 8080);
        assert_eq!(strategy.poll_interval, Duration::from_millis(100));
        let strategy = strategy.with_poll_interval(Duration::from_millis(10));
        assert_eq!(strategy.poll_interval, Duration::from_millis(10));
    }
}
