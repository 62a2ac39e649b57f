//! Resource labels
//!
//! Every session-scoped resource carries the same label set; the reaper sidecar
//! watches a filter built from it. Keys under [`LABEL_BASE`] are reserved for the
//! library.

use crate::errors::{ConfigError, Result};
use crate::session::SessionId;
use std::collections::HashMap;
use std::fmt;

pub const LABEL_BASE: &str = "org.testcontainers";
pub const LABEL_LANG: &str = "org.testcontainers.lang";
pub const LABEL_REAPER: &str = "org.testcontainers.reaper";
pub const LABEL_RYUK: &str = "org.testcontainers.ryuk";
pub const LABEL_SESSION_ID: &str = "org.testcontainers.sessionId";
pub const LABEL_VERSION: &str = "org.testcontainers.version";
pub const LABEL_REAP: &str = "org.testcontainers.reap";

/// Labels attached to every resource of `session`
pub fn default_labels(session: &SessionId, reaper_enabled: bool) -> HashMap<String, String> {
    let mut labels = HashMap::from([
        (LABEL_BASE.to_string(), "true".to_string()),
        (LABEL_LANG.to_string(), "rust".to_string()),
        (LABEL_VERSION.to_string(), crate::version().to_string()),
        (LABEL_SESSION_ID.to_string(), session.to_string()),
    ]);
    if reaper_enabled {
        labels.insert(LABEL_REAP.to_string(), "true".to_string());
    }
    labels
}

/// Labels of the reaper sidecar itself
pub fn reaper_labels(session: &SessionId) -> HashMap<String, String> {
    let mut labels = default_labels(session, true);
    labels.insert(LABEL_REAPER.to_string(), "true".to_string());
    labels.insert(LABEL_RYUK.to_string(), "true".to_string());
    labels
}

/// Copy user labels into `dst`, rejecting any key under the reserved prefix.
///
/// Nothing is copied if any key is rejected.
pub fn merge_custom_labels(
    dst: &mut HashMap<String, String>,
    src: &HashMap<String, String>,
) -> Result<()> {
    if let Some(key) = src.keys().find(|k| k.starts_with(LABEL_BASE)) {
        return Err(ConfigError::Validation {
            key: key.clone(),
            message: format!("label keys with the '{}' prefix are reserved", LABEL_BASE),
        }
        .into());
    }
    dst.extend(src.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(())
}

/// Ordered `key=value` conjunction used to list resources
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pairs: Vec<(String, String)>,
}

impl LabelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Everything belonging to `session`
    pub fn session(session: &SessionId) -> Self {
        Self::new().with(LABEL_SESSION_ID, session.as_str())
    }

    /// The session's reaper sidecar
    pub fn reaper(session: &SessionId) -> Self {
        Self::session(session)
            .with(LABEL_REAPER, "true")
            .with(LABEL_RYUK, "true")
    }

    /// Filter built from a label map, sorted by key for a stable wire form
    pub fn from_labels(labels: &HashMap<String, String>) -> Self {
        let mut pairs: Vec<_> = labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        pairs.sort();
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Whether every pair is present in `labels`
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.pairs
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// The line the reaper sidecar expects: `label=k=v&label=k2=v2`
    pub fn to_reaper_filter(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("label={}={}", k, v))
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl fmt::Display for LabelFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        f.write_str(&rendered.join(","))
    }
}
