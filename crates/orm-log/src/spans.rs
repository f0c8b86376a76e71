//! Span helpers for database work.
//!
//! Field names follow the OpenTelemetry database semantic conventions so an
//! OTLP exporter layered on the subscriber picks them up unchanged.

use std::time::{Duration, Instant};
use tracing::{field, info_span, Span};

/// Open a span for a single statement.
///
/// `db.statement`, `db.rows_affected`, `otel.status_code` and
/// `error.message` are declared empty and filled in by the caller.
pub fn query_span(system: &str, db_name: &str, operation: &str) -> Span {
    info_span!(
        "db.query",
        otel.kind = "client",
        db.system = %system,
        db.name = %db_name,
        db.operation = %operation,
        db.statement = field::Empty,
        db.rows_affected = field::Empty,
        otel.status_code = field::Empty,
        error.message = field::Empty,
    )
}

/// Open a span for one migration step.
pub fn migration_span(id: &str, direction: &str) -> Span {
    info_span!(
        "db.migration",
        migration.id = %id,
        migration.direction = %direction,
        otel.status_code = field::Empty,
        error.message = field::Empty,
    )
}

/// Record an error on a span declared with an `error.message` field.
pub fn record_error(span: &Span, error: &dyn std::error::Error) {
    span.record("otel.status_code", "ERROR");
    span.record("error.message", field::display(error));
}

/// Mark a span as successful.
pub fn record_ok(span: &Span) {
    span.record("otel.status_code", "OK");
}

/// Timing utility for operations.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start a new timer.
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Complete the timer, log the duration and return it.
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        tracing::debug!(
            operation = %self.operation,
            duration_ms = %duration.as_millis(),
            "operation completed"
        );
        duration
    }
}
