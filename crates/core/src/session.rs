//! Session identity
//!
//! Every resource created during one test run carries the same session id so the
//! reaper can reclaim exactly that run's resources. The id is derived from the
//! parent process (pid and start time): sibling test binaries spawned by one
//! `cargo test` share a session, while separate runs never collide.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Opaque session identifier (lowercase hex SHA-256)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an explicit id; used by tests and by the CLI's `--session` flag
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

static SESSION: Lazy<SessionId> = Lazy::new(compute);

/// The id of the current process's session, computed on first use
pub fn current() -> &'static SessionId {
    &SESSION
}

/// Hash a process identity into a session id
pub fn derive(pid: u32, start_time: u64) -> SessionId {
    let mut hasher = Sha256::new();
    hasher.update(format!("PID:{}-START:{}", pid, start_time).as_bytes());
    let digest = hasher.finalize();
    SessionId(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

fn compute() -> SessionId {
    let (pid, start_time) = parent_identity().unwrap_or_else(own_identity);
    let id = derive(pid, start_time);
    debug!(session_id = %id.short(), pid, "Computed session id");
    id
}

fn parent_identity() -> Option<(u32, u64)> {
    let own = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[own]),
        true,
        ProcessRefreshKind::nothing(),
    );
    let parent = system.process(own)?.parent()?;
    process_identity(&mut system, parent)
}

fn own_identity() -> (u32, u64) {
    let Ok(own) = sysinfo::get_current_pid() else {
        return (std::process::id(), 0);
    };
    let mut system = System::new();
    process_identity(&mut system, own).unwrap_or((own.as_u32(), 0))
}

fn process_identity(system: &mut System, pid: Pid) -> Option<(u32, u64)> {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing(),
    );
    let process = system.process(pid)?;
    Some((pid.as_u32(), process.start_time()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic_hex() {
        let a = derive(42, 1_700_000_000);
        let b = derive(42, 1_700_000_000);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_derive_differs_per_process() {
        assert_ne!(derive(42, 1), derive(43, 1));
        assert_ne!(derive(42, 1), derive(42, 2));
    }

    #[test]
    fn test_current_is_cached() {
        let first = current();
        let second = current();
        assert!(std::ptr::eq(first, second));
        assert_eq!(first.as_str().len(), 64);
    }

    #[test]
    fn test_short_and_display() {
        let id = SessionId::new("0123456789abcdef");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(id.to_string(), "0123456789abcdef");
        assert_eq!(SessionId::new("abc").short(), "abc");
    }
}
