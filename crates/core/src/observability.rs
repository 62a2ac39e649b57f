//! Observability utilities for standardized tracing spans and structured fields
//!
//! Every lifecycle transition, reaper lookup and log production run opens one of
//! the canonical spans below so that a JSON log of a test run can be filtered by
//! container or session.

use std::time::Instant;
use tracing::{span, Span};

/// Canonical span names
pub mod spans {
    pub const CONTAINER_CREATE: &str = "container.create";
    pub const CONTAINER_START: &str = "container.start";
    pub const CONTAINER_STOP: &str = "container.stop";
    pub const CONTAINER_TERMINATE: &str = "container.terminate";
    pub const REAPER_OBTAIN: &str = "reaper.obtain";
    pub const LOGS_PRODUCE: &str = "logs.produce";
}

/// Common field names for structured logging
pub mod fields {
    pub const CONTAINER_ID: &str = "container_id";
    pub const SESSION_ID: &str = "session_id";
    pub const PHASE: &str = "phase";
    pub const IMAGE: &str = "image";
    pub const DURATION_MS: &str = "duration_ms";
}

/// First 12 characters of a container id, the form shown in log lines
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Span for a container creation
pub fn container_create_span(image: &str) -> Span {
    span!(
        target: "scuttle_core::observability",
        tracing::Level::INFO,
        spans::CONTAINER_CREATE,
        duration_ms = tracing::field::Empty,
        image = %image,
        container_id = tracing::field::Empty
    )
}

/// Span for a state transition (`container.start`, `container.stop`, `container.terminate`)
pub fn container_transition_span(name: &'static str, container_id: &str) -> Span {
    let container_id = short_id(container_id);
    match name {
        spans::CONTAINER_START => span!(
            target: "scuttle_core::observability",
            tracing::Level::INFO,
            spans::CONTAINER_START,
            duration_ms = tracing::field::Empty,
            container_id = %container_id
        ),
        spans::CONTAINER_STOP => span!(
            target: "scuttle_core::observability",
            tracing::Level::INFO,
            spans::CONTAINER_STOP,
            duration_ms = tracing::field::Empty,
            container_id = %container_id
        ),
        _ => span!(
            target: "scuttle_core::observability",
            tracing::Level::INFO,
            spans::CONTAINER_TERMINATE,
            duration_ms = tracing::field::Empty,
            container_id = %container_id
        ),
    }
}

/// Span for a reaper obtain call
pub fn reaper_obtain_span(session_id: &str) -> Span {
    span!(
        target: "scuttle_core::observability",
        tracing::Level::INFO,
        spans::REAPER_OBTAIN,
        duration_ms = tracing::field::Empty,
        session_id = %session_id
    )
}

/// Span covering one log production run
pub fn logs_produce_span(container_id: &str) -> Span {
    span!(
        target: "scuttle_core::observability",
        tracing::Level::DEBUG,
        spans::LOGS_PRODUCE,
        container_id = %short_id(container_id)
    )
}

/// Records `duration_ms` on a span when dropped
pub struct SpanTimer {
    span: Span,
    start: Instant,
}

impl SpanTimer {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            start: Instant::now(),
        }
    }

    /// Record the elapsed time now
    pub fn finish(self) {
        drop(self);
    }
}

impl Drop for SpanTimer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.span.record(fields::DURATION_MS, elapsed);
    }
}
