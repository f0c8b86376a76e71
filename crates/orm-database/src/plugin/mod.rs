//! Instrumentation plugins installed on a handle.
//!
//! Every statement issued through the handle's query helpers asks the
//! registered plugins for a span, runs inside it, and reports the outcome
//! back. Plugins are installed once, at construction or through
//! [`Orm::use_plugin`](crate::Orm::use_plugin).

mod tracer;

pub use tracer::TracingPlugin;

use orm_config::Engine;
use std::sync::Arc;
use thiserror::Error;
use tracing::Span;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("plugin '{plugin}' failed to initialize: {message}")]
    Initialization { plugin: String, message: String },
}

/// What a plugin learns about the database it is installed on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub system: Engine,
    pub name: String,
}

/// A statement about to run.
#[derive(Debug, Clone, Copy)]
pub struct QueryInfo<'a> {
    pub db: &'a DatabaseInfo,
    pub sql: &'a str,
    /// Leading SQL keyword, upper-cased (`SELECT`, `INSERT`, ...).
    pub operation: &'a str,
}

impl<'a> QueryInfo<'a> {
    pub fn new(db: &'a DatabaseInfo, sql: &'a str) -> Self {
        Self {
            db,
            sql,
            operation: operation_of(sql),
        }
    }
}

fn operation_of(sql: &str) -> &'static str {
    const KNOWN: &[&str] = &[
        "SELECT", "INSERT", "UPDATE", "DELETE", "REPLACE", "CREATE", "ALTER", "DROP", "BEGIN",
        "COMMIT", "ROLLBACK", "WITH", "PRAGMA", "SHOW",
    ];
    let keyword = sql.split_whitespace().next().unwrap_or_default();
    KNOWN
        .iter()
        .find(|known| known.eq_ignore_ascii_case(keyword))
        .copied()
        .unwrap_or("OTHER")
}

/// How a statement ended.
#[derive(Debug)]
pub enum QueryOutcome<'a> {
    Success { rows_affected: Option<u64> },
    Failure { error: &'a sqlx::Error },
}

pub trait Plugin: Send + Sync + 'static {
    /// Unique name; a handle refuses a second plugin with the same name.
    fn name(&self) -> &'static str;

    fn initialize(&self, _db: &DatabaseInfo) -> Result<(), PluginError> {
        Ok(())
    }

    /// Span to run the statement in. The first plugin that returns one wins.
    fn query_span(&self, _query: &QueryInfo<'_>) -> Option<Span> {
        None
    }

    fn record_outcome(&self, _span: &Span, _outcome: &QueryOutcome<'_>) {}
}

/// Plugins installed on one handle, in installation order.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn register(
        &mut self,
        plugin: Arc<dyn Plugin>,
        db: &DatabaseInfo,
    ) -> Result<(), PluginError> {
        let name = plugin.name();
        if self.contains(name) {
            return Err(PluginError::AlreadyRegistered(name.to_string()));
        }
        plugin.initialize(db)?;
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn query_span(&self, query: &QueryInfo<'_>) -> Option<Span> {
        self.plugins.iter().find_map(|p| p.query_span(query))
    }

    pub fn record_outcome(&self, span: &Span, outcome: &QueryOutcome<'_>) {
        for plugin in &self.plugins {
            plugin.record_outcome(span, outcome);
        }
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: &'static str,
        outcomes: AtomicUsize,
    }

    impl Plugin for Counting {
        fn name(&self) -> &'static str {
            self.name
        }

        fn record_outcome(&self, _span: &Span, _outcome: &QueryOutcome<'_>) {
            self.outcomes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Refusing;

    impl Plugin for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn initialize(&self, db: &DatabaseInfo) -> Result<(), PluginError> {
            Err(PluginError::Initialization {
                plugin: self.name().to_string(),
                message: format!("{} not supported", db.system),
            })
        }
    }

    fn info() -> DatabaseInfo {
        DatabaseInfo {
            system: Engine::Sqlite,
            name: "clinic".to_string(),
        }
    }

    #[test]
    fn test_operation_detection() {
        let db = info();
        assert_eq!(QueryInfo::new(&db, "select * from patients").operation, "SELECT");
        assert_eq!(QueryInfo::new(&db, "  INSERT INTO t VALUES (1)").operation, "INSERT");
        assert_eq!(QueryInfo::new(&db, "VACUUM").operation, "OTHER");
        assert_eq!(QueryInfo::new(&db, "").operation, "OTHER");
    }

    #[test]
    fn test_duplicate_name_is_rejected() {
        let mut registry = PluginRegistry::default();
        let plugin = Arc::new(Counting {
            name: "counting",
            outcomes: AtomicUsize::new(0),
        });

        registry.register(plugin.clone(), &info()).unwrap();
        let err = registry.register(plugin, &info()).unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(name) if name == "counting"));
        assert_eq!(registry.names(), vec!["counting"]);
    }

    #[test]
    fn test_failed_initialization_is_not_registered() {
        let mut registry = PluginRegistry::default();
        let err = registry.register(Arc::new(Refusing), &info()).unwrap_err();
        assert!(err.to_string().contains("sqlite not supported"));
        assert!(!registry.contains("refusing"));
    }

    #[test]
    fn test_every_plugin_sees_the_outcome() {
        let mut registry = PluginRegistry::default();
        let a = Arc::new(Counting {
            name: "a",
            outcomes: AtomicUsize::new(0),
        });
        let b = Arc::new(Counting {
            name: "b",
            outcomes: AtomicUsize::new(0),
        });
        registry.register(a.clone(), &info()).unwrap();
        registry.register(b.clone(), &info()).unwrap();

        registry.record_outcome(&Span::none(), &QueryOutcome::Success { rows_affected: Some(1) });
        assert_eq!(a.outcomes.load(Ordering::SeqCst), 1);
        assert_eq!(b.outcomes.load(Ordering::SeqCst), 1);
        assert!(registry.query_span(&QueryInfo::new(&info(), "SELECT 1")).is_none());
    }
}
