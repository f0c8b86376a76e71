use crate::handle::Orm;
use futures_util::future::BoxFuture;
use orm_config::ResolvedConfig;
use sqlx::{AnyConnection, Executor};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type a migration closure may return.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Migration written as Rust code against the open connection.
pub type MigrateFn = Arc<
    dyn for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, Result<(), BoxDynError>>
        + Send
        + Sync,
>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration has an empty id")]
    MissingId,

    #[error("duplicated migration id: {0}")]
    DuplicatedId(String),

    #[error("migration id not found: {0}")]
    IdNotFound(String),

    #[error("no migration has been applied")]
    NoRunMigration,

    #[error("migration {0} has no rollback action")]
    RollbackImpossible(String),

    #[error("applied migration {0} is not in the migration list")]
    UnknownPastMigration(String),

    #[error("migration {id} failed: {source}")]
    ExecutionFailed {
        id: String,
        #[source]
        source: BoxDynError,
    },

    #[error("rollback of migration {id} failed: {source}")]
    RollbackFailed {
        id: String,
        #[source]
        source: BoxDynError,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction of a migration.
#[derive(Clone)]
pub enum Action {
    /// SQL text; may hold several statements.
    Sql(String),
    Func(MigrateFn),
}

impl Action {
    /// SQL actions run through the handle's plugins. A closure's own
    /// statements run inside the step's migration span.
    pub(crate) async fn run(&self, orm: &Orm, conn: &mut AnyConnection) -> Result<(), BoxDynError> {
        match self {
            Self::Sql(sql) => {
                orm.observe(sql, conn.execute(sql.as_str()), |done| {
                    Some(done.rows_affected())
                })
                .await?;
                Ok(())
            }
            Self::Func(f) => f(conn).await,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            Self::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// A named schema change, applied at most once.
///
/// Ids are compared as strings; timestamp-like ids (`202401151030`) keep
/// lexical and chronological order the same.
#[derive(Debug, Clone)]
pub struct Migration {
    pub id: String,
    pub migrate: Action,
    pub rollback: Option<Action>,
}

impl Migration {
    pub fn sql(id: impl Into<String>, up: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            migrate: Action::Sql(up.into()),
            rollback: None,
        }
    }

    pub fn new<F>(id: impl Into<String>, migrate: F) -> Self
    where
        F: for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, Result<(), BoxDynError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: id.into(),
            migrate: Action::Func(Arc::new(migrate)),
            rollback: None,
        }
    }

    pub fn with_rollback_sql(mut self, down: impl Into<String>) -> Self {
        self.rollback = Some(Action::Sql(down.into()));
        self
    }

    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: for<'c> Fn(&'c mut AnyConnection) -> BoxFuture<'c, Result<(), BoxDynError>>
            + Send
            + Sync
            + 'static,
    {
        self.rollback = Some(Action::Func(Arc::new(rollback)));
        self
    }

    pub fn is_reversible(&self) -> bool {
        self.rollback.is_some()
    }
}

/// Bookkeeping table layout and run behaviour.
///
/// The defaults match the table existing deployments already carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub table_name: String,
    pub id_column_name: String,
    pub id_column_size: u32,
    /// Run each batch in a single transaction.
    pub use_transaction: bool,
    /// Refuse to run when the table records ids missing from the list.
    pub validate_unknown_migrations: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            table_name: "migrations".to_string(),
            id_column_name: "id".to_string(),
            id_column_size: 255,
            use_transaction: false,
            validate_unknown_migrations: false,
        }
    }
}

impl MigrationOptions {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            use_transaction: config.migrate_use_transaction,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirection {
    Up,
    Down,
}

impl MigrationDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct MigrationResult {
    pub id: String,
    pub direction: MigrationDirection,
    pub elapsed: Duration,
}

/// Where one migration of the list stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub id: String,
    pub applied: bool,
    pub reversible: bool,
}
