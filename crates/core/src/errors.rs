//! Error types and handling
//!
//! This module provides domain-specific error types for the container lifecycle
//! library. Each domain (runtime client, reaper, log production, configuration)
//! has its own enum; they are all wrapped in the main [`ScuttleError`] enum for
//! unified error handling. Operations that attempt several independent steps
//! (hook chains, termination) report every failure through an aggregate rather
//! than stopping at the first one.

use crate::hooks::HookPhase;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file parsing error
    #[error("Failed to parse configuration file: {message}")]
    Parsing { message: String },

    /// Configuration value validation error
    #[error("Invalid configuration value for {key}: {message}")]
    Validation { key: String, message: String },

    /// Configuration file I/O error
    #[error("Failed to read configuration file")]
    Io(#[from] std::io::Error),
}

/// Container runtime client errors
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Runtime binary is not installed or the daemon is not reachable
    #[error("Container runtime is not installed or not accessible")]
    NotInstalled,

    /// Runtime CLI command error
    #[error("Container runtime CLI error: {0}")]
    CLIError(String),

    /// Container not found
    #[error("Container not found: {id}")]
    ContainerNotFound { id: String },

    /// A container with the requested name already exists
    #[error("Container name already in use: {name}")]
    Conflict { name: String },

    /// Command execution failed
    #[error("Command execution failed with exit code {code}")]
    ExecFailed { code: i32 },
}

/// Reaper (resource reclamation sidecar) errors
#[derive(Error, Debug)]
pub enum ReaperError {
    /// Another process created the sidecar first. Always retried through lookup.
    #[error("Reaper container '{name}' was created concurrently by another process")]
    CreationConflict { name: String },

    /// The retry budget ran out before a sidecar was found or created
    #[error("Reaper lookup for session {session_id} failed after {attempts} attempts: {last_error}")]
    LookupFailed {
        session_id: String,
        attempts: u32,
        last_error: String,
    },

    /// A discovered sidecar is not in a usable state
    #[error("Reaper container {id} is not healthy (state: {state})")]
    Unhealthy { id: String, state: String },

    /// The sidecar endpoint could not be reached or did not acknowledge the filter
    #[error("Connecting to reaper on {endpoint} failed: {message}")]
    Connect { endpoint: String, message: String },
}

/// Log production errors
#[derive(Error, Debug)]
pub enum LogError {
    /// A production loop is already running for this container
    #[error("Log production is already active for container {container_id}")]
    AlreadyActive { container_id: String },

    /// The framed stream could not be decoded; the loop stopped
    #[error("Log stream out of sync for container {container_id}: {message}")]
    Desync {
        container_id: String,
        message: String,
    },
}

/// One or more hooks of a single phase edge failed.
///
/// Every hook in the edge still ran; `failures` holds each error in invocation order.
#[derive(Error, Debug)]
#[error("{phase} hooks failed: {}", join_errors(.failures))]
pub struct HookExecutionError {
    pub phase: HookPhase,
    pub failures: Vec<ScuttleError>,
}

/// Internal/generic fallback errors
#[derive(Error, Debug)]
pub enum InternalError {
    /// Generic internal error
    #[error("Internal error: {message}")]
    Generic { message: String },

    /// Spawned task failed to join
    #[error("Task join error: {message}")]
    Join { message: String },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum ScuttleError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Container runtime client errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Reaper coordination errors
    #[error("Reaper error: {0}")]
    Reaper(#[from] ReaperError),

    /// Log production errors
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Aggregate of hook failures in one phase edge
    #[error(transparent)]
    Hooks(#[from] HookExecutionError),

    /// Readiness strategy failure; aborts the Start transition
    #[error("Container {container_id} did not become ready: {message}")]
    Readiness {
        container_id: String,
        message: String,
    },

    /// Aggregate of every failed step during Terminate
    #[error("Terminating container {container_id} partially failed: {}", join_errors(.failures))]
    TerminationPartialFailure {
        container_id: String,
        failures: Vec<ScuttleError>,
    },

    /// A bounded wait elapsed
    #[error("Timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation not valid for the handle's current state
    #[error("Invalid container state: {0}")]
    InvalidState(String),

    /// Failure reported by a user-supplied hook
    #[error("Hook error: {0}")]
    Hook(String),

    /// Internal/generic errors
    #[error("Internal error: {0}")]
    Internal(#[from] InternalError),
}

impl ScuttleError {
    /// Convenience constructor for hook implementations
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook(message.into())
    }

    /// Whether this error reports a container name collision
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::Runtime(RuntimeError::Conflict { .. })
                | Self::Reaper(ReaperError::CreationConflict { .. })
        )
    }
}

/// Convenience type alias for Results with ScuttleError
pub type Result<T> = std::result::Result<T, ScuttleError>;

/// Render a list of errors on one line, separated by `; `
pub fn join_errors(errors: &[ScuttleError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Collapse collected step errors into `Ok(())` or one aggregate built by `wrap`
pub(crate) fn aggregate<F>(failures: Vec<ScuttleError>, wrap: F) -> Result<()>
where
    F: FnOnce(Vec<ScuttleError>) -> ScuttleError,
{
    if failures.is_empty() {
        Ok(())
    } else {
        Err(wrap(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_display() {
        let error = RuntimeError::NotInstalled;
        assert_eq!(
            format!("{}", error),
            "Container runtime is not installed or not accessible"
        );

        let error = RuntimeError::Conflict {
            name: "reaper_abc".to_string(),
        };
        assert_eq!(format!("{}", error), "Container name already in use: reaper_abc");
    }

    #[test]
    fn test_hook_execution_error_lists_every_failure() {
        let error = HookExecutionError {
            phase: HookPhase::PreStart,
            failures: vec![ScuttleError::hook("first"), ScuttleError::hook("second")],
        };
        let rendered = error.to_string();
        assert!(rendered.starts_with("pre-start hooks failed"));
        assert!(rendered.contains("Hook error: first; Hook error: second"));
    }

    #[test]
    fn test_termination_partial_failure_display() {
        let error = ScuttleError::TerminationPartialFailure {
            container_id: "abc".to_string(),
            failures: vec![
                RuntimeError::ContainerNotFound {
                    id: "abc".to_string(),
                }
                .into(),
                ScuttleError::hook("cleanup"),
            ],
        };
        assert_eq!(
            error.to_string(),
            "Terminating container abc partially failed: Runtime error: Container not found: abc; Hook error: cleanup"
        );
    }

    #[test]
    fn test_is_conflict() {
        let conflict: ScuttleError = RuntimeError::Conflict {
            name: "x".to_string(),
        }
        .into();
        assert!(conflict.is_conflict());
        assert!(!ScuttleError::hook("nope").is_conflict());
    }

    #[test]
    fn test_aggregate_empty_is_ok() {
        assert!(aggregate(Vec::new(), |f| ScuttleError::TerminationPartialFailure {
            container_id: "a".to_string(),
            failures: f,
        })
        .is_ok());
    }
}
