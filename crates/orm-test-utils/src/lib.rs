//! Test utilities for the orm crates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tempfile::TempDir;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Serialises tests that touch process environment variables.
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Creates a temporary directory that is cleaned up on drop.
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Writes `content` to `name` inside a fresh temporary directory.
pub fn temp_file(name: &str, content: &str) -> (TempDir, PathBuf) {
    let dir = temp_dir();
    let path = dir.path().join(name);
    std::fs::write(&path, content).expect("Failed to write temp file");
    (dir, path)
}

/// A store name no other test in the process will pick.
///
/// In-memory SQLite stores are shared by name for the whole process, so
/// tests that must not see each other's tables use one of these.
pub fn unique_store_name(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Installs a test-writer subscriber once; later calls are no-ops.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .try_init();
}

/// A span seen by [`SpanCapture`], with every field recorded on it so far.
#[derive(Debug, Clone, Default)]
pub struct CapturedSpan {
    pub name: String,
    pub parent: Option<String>,
    pub fields: HashMap<String, String>,
}

impl CapturedSpan {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// An event seen by [`SpanCapture`].
#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub span: Option<String>,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.field("message")
    }
}

#[derive(Default)]
struct Captured {
    spans: Vec<CapturedSpan>,
    events: Vec<CapturedEvent>,
}

/// Layer that records spans and events so tests can assert on their fields.
///
/// ```
/// let capture = orm_test_utils::SpanCapture::default();
/// let _guard = capture.install();
/// tracing::info_span!("db.query", db.statement = "SELECT 1").in_scope(|| {});
/// assert_eq!(capture.spans_named("db.query")[0].field("db.statement"), Some("SELECT 1"));
/// ```
#[derive(Clone, Default)]
pub struct SpanCapture {
    captured: Arc<Mutex<Captured>>,
}

/// Index of a span in [`Captured::spans`], kept in the span's extensions.
struct CaptureIndex(usize);

impl SpanCapture {
    /// Make a registry with this layer the current thread's subscriber.
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn spans(&self) -> Vec<CapturedSpan> {
        self.lock().spans.clone()
    }

    pub fn spans_named(&self, name: &str) -> Vec<CapturedSpan> {
        self.lock()
            .spans
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<CapturedEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.captured.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> Layer<S> for SpanCapture
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut captured = CapturedSpan {
            name: span.name().to_string(),
            parent: span.parent().map(|p| p.name().to_string()),
            fields: HashMap::new(),
        };
        attrs.record(&mut FieldVisitor(&mut captured.fields));

        let mut all = self.lock();
        span.extensions_mut().insert(CaptureIndex(all.spans.len()));
        all.spans.push(captured);
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let extensions = span.extensions();
        let Some(CaptureIndex(index)) = extensions.get::<CaptureIndex>() else {
            return;
        };
        if let Some(captured) = self.lock().spans.get_mut(*index) {
            values.record(&mut FieldVisitor(&mut captured.fields));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));
        let span = ctx.event_span(event).map(|s| s.name().to_string());
        self.lock().events.push(CapturedEvent {
            level: *event.metadata().level(),
            span,
            fields,
        });
    }
}

struct FieldVisitor<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().to_string(), format!("{:?}", value));
    }
}

/// Holds the environment lock and restores every touched variable, and the
/// working directory, on drop.
pub struct EnvGuard {
    saved: HashMap<String, Option<String>>,
    cwd: Option<PathBuf>,
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Take the environment lock.
    pub fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self {
            saved: HashMap::new(),
            cwd: None,
            _lock: lock,
        }
    }

    /// Change the working directory for the lifetime of the guard.
    pub fn chdir(&mut self, dir: &Path) -> &mut Self {
        if self.cwd.is_none() {
            self.cwd = Some(std::env::current_dir().expect("Failed to read working directory"));
        }
        std::env::set_current_dir(dir).expect("Failed to change working directory");
        self
    }

    /// Set a variable for the lifetime of the guard.
    pub fn set(&mut self, var: &str, value: &str) -> &mut Self {
        self.remember(var);
        std::env::set_var(var, value);
        self
    }

    /// Remove a variable for the lifetime of the guard.
    pub fn unset(&mut self, var: &str) -> &mut Self {
        self.remember(var);
        std::env::remove_var(var);
        self
    }

    fn remember(&mut self, var: &str) {
        self.saved
            .entry(var.to_string())
            .or_insert_with(|| std::env::var(var).ok());
    }
}

impl Default for EnvGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(dir) = self.cwd.take() {
            let _ = std::env::set_current_dir(dir);
        }
        for (var, value) in self.saved.drain() {
            match value {
                Some(v) => std::env::set_var(&var, v),
                None => std::env::remove_var(&var),
            }
        }
    }
}

/// Assert that a Result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
}

/// Assert that a Result is Err and return the error.
#[macro_export]
macro_rules! assert_err {
    ($expr:expr) => {
        match $expr {
            Ok(v) => panic!("Expected Err, got Ok: {:?}", v),
            Err(e) => e,
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_temp_file_creation() {
        let (_dir, path) = temp_file("orm.yaml", "name: clinic");
        assert!(path.is_file());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: clinic");
    }

    #[test]
    fn test_unique_store_names_differ() {
        let a = unique_store_name("orm");
        let b = unique_store_name("orm");
        assert!(a.starts_with("orm-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_env_guard_restores_previous_value() {
        let var = "ORM_TEST_UTILS_GUARD_VAR";
        {
            let mut guard = EnvGuard::new();
            guard.set(var, "inside");
            assert_eq!(std::env::var(var).unwrap(), "inside");
        }
        assert!(std::env::var(var).is_err());
    }

    #[test]
    fn test_env_guard_restores_working_directory() {
        let before = std::env::current_dir().unwrap();
        let dir = temp_dir();
        {
            let mut guard = EnvGuard::new();
            guard.chdir(dir.path());
            assert_eq!(
                std::env::current_dir().unwrap().canonicalize().unwrap(),
                dir.path().canonicalize().unwrap()
            );
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    fn test_capture_records_late_fields_parents_and_events() {
        let capture = SpanCapture::default();
        let _guard = capture.install();

        let outer = tracing::info_span!("request", path = "/patients");
        outer.in_scope(|| {
            let inner = tracing::info_span!("db.query", rows = tracing::field::Empty);
            inner.record("rows", 3_u64);
            inner.in_scope(|| tracing::warn!(attempt = 2, "slow statement"));
        });

        let query = &capture.spans_named("db.query")[0];
        assert_eq!(query.parent.as_deref(), Some("request"));
        assert_eq!(query.field("rows"), Some("3"));
        assert_eq!(capture.spans_named("request")[0].field("path"), Some("/patients"));

        let event = &capture.events()[0];
        assert_eq!(event.level, Level::WARN);
        assert_eq!(event.span.as_deref(), Some("db.query"));
        assert_eq!(event.message(), Some("slow statement"));
        assert_eq!(event.field("attempt"), Some("2"));
    }

    #[test]
    fn test_assert_macros() {
        let ok: Result<u8, String> = Ok(3);
        assert_eq!(assert_ok!(ok), 3);

        let err: Result<u8, String> = Err("boom".into());
        assert_eq!(assert_err!(err), "boom");
    }

    proptest! {
        #[test]
        fn test_store_name_keeps_prefix(prefix in "[a-z]{1,12}") {
            let name = unique_store_name(&prefix);
            let expected = format!("{}-", prefix);
            prop_assert!(name.starts_with(&expected));
        }
    }
}
