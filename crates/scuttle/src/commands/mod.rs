//! Command implementations
//!
//! This module contains implementations for all CLI subcommands.

pub mod config;
pub mod logs;
pub mod ps;
pub mod reap;
pub mod session;

use anyhow::Result;
use scuttle_core::docker::CliRuntime;
use scuttle_core::runtime::RuntimeClient;
use scuttle_core::session::SessionId;
use std::sync::Arc;

/// Runtime client for the configured docker binary
pub(crate) fn runtime_from_config() -> Result<Arc<dyn RuntimeClient>> {
    let config = scuttle_core::config::read()?;
    let runtime = CliRuntime::with_path(config.docker_path.clone());
    runtime.check_installed()?;
    Ok(Arc::new(runtime))
}

/// The explicit session if one was given, otherwise the current one
pub(crate) fn resolve_session(explicit: Option<String>) -> SessionId {
    explicit
        .map(SessionId::new)
        .unwrap_or_else(|| scuttle_core::session::current().clone())
}
