//! Core library for disposable test containers
//!
//! This crate contains the container lifecycle controller and its hook pipeline,
//! the session-scoped reaper coordinator, the log stream demultiplexer, the
//! Docker CLI runtime, configuration, logging, and error handling.

pub mod config;
pub mod container;
pub mod container_spec;
pub mod docker;
pub mod errors;
pub mod hooks;
pub mod labels;
pub mod logging;
pub mod logs;
pub mod observability;
pub mod provider;
pub mod reaper;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod wait;

pub use container::{terminate_container, Container, LifecycleController, TerminateOptions};
pub use container_spec::ContainerSpec;
pub use errors::{Result, ScuttleError};
pub use provider::Provider;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
