use super::{Plugin, QueryInfo, QueryOutcome};
use orm_log::spans;
use tracing::Span;

/// Opens an OpenTelemetry-shaped `db.query` span for every statement.
///
/// Installed on every handle at construction. The span is created under
/// whatever span is current for the caller, so request context flows into
/// the database spans without extra plumbing.
#[derive(Debug, Clone)]
pub struct TracingPlugin {
    record_statements: bool,
}

impl TracingPlugin {
    pub const NAME: &'static str = "otel-tracing";

    pub fn new() -> Self {
        Self {
            record_statements: true,
        }
    }

    /// Whether the SQL text goes into `db.statement`. Turn it off when
    /// statements may carry literal values that must not leave the process.
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.record_statements = enabled;
        self
    }
}

impl Default for TracingPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for TracingPlugin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn query_span(&self, query: &QueryInfo<'_>) -> Option<Span> {
        let span = spans::query_span(query.db.system.as_str(), &query.db.name, query.operation);
        if self.record_statements {
            span.record("db.statement", query.sql);
        }
        Some(span)
    }

    fn record_outcome(&self, span: &Span, outcome: &QueryOutcome<'_>) {
        match outcome {
            QueryOutcome::Success { rows_affected } => {
                if let Some(rows) = rows_affected {
                    span.record("db.rows_affected", *rows);
                }
                spans::record_ok(span);
            }
            QueryOutcome::Failure { error } => spans::record_error(span, *error),
        }
    }
}
