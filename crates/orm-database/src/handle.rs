use crate::engine::{self, install_drivers};
use crate::migration::{Migration, MigrationError, MigrationOptions, MigrationResult, Migrator};
use crate::plugin::{
    DatabaseInfo, Plugin, PluginError, PluginRegistry, QueryInfo, QueryOutcome, TracingPlugin,
};
use crate::pool::{IdleLimiter, PoolLimits, PoolStats};
use futures_util::TryStreamExt;
use orm_config::{
    ConnectionDescriptor, DescriptorError, Engine, LogMode, OrmConfig, ResolvedConfig,
};
use sqlx::any::{AnyArguments, AnyConnectOptions, AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Execute};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, instrument, Instrument, Span};

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("invalid connection descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error("failed to open {engine} database: {source}")]
    Open {
        engine: Engine,
        #[source]
        source: sqlx::Error,
    },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("connection pool unavailable: {0}")]
    PoolUnavailable(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// A tuned, instrumented database handle.
///
/// Construction never panics: every setup failure comes back as an
/// [`OrmError`] and the caller decides whether to abort.
pub struct Orm {
    pool: AnyPool,
    config: ResolvedConfig,
    limits: PoolLimits,
    info: DatabaseInfo,
    plugins: PluginRegistry,
    idle: IdleLimiter,
}

impl Orm {
    /// Open a handle on the production MySQL engine.
    ///
    /// Socket mode picks its directory up from `DB_SOCKET_DIR`.
    #[instrument(skip(config), fields(db.system = "mysql"))]
    pub async fn mysql(config: OrmConfig) -> Result<Self, OrmError> {
        let resolved = config.resolve(Engine::MySql);
        let descriptor = ConnectionDescriptor::from_env(&resolved);
        info!(dsn = %descriptor.redacted(), "opening database handle");

        let options = engine::mysql_options(&descriptor, resolved.log_mode)?;
        Self::open(resolved, options).await
    }

    /// Open a handle on the process-shared in-memory SQLite store.
    ///
    /// Every handle opened with the same store name sees the same tables,
    /// for as long as the process lives.
    #[instrument(skip(config), fields(db.system = "sqlite"))]
    pub async fn sqlite(config: OrmConfig) -> Result<Self, OrmError> {
        install_drivers();
        let resolved = config.resolve(Engine::Sqlite);
        let open_error = |source| OrmError::Open {
            engine: Engine::Sqlite,
            source,
        };

        let options =
            engine::sqlite_options(&resolved.sqlite_store, resolved.log_mode).map_err(open_error)?;
        engine::retain_memory_store(&resolved.sqlite_store, &options)
            .await
            .map_err(open_error)?;
        info!(store = %resolved.sqlite_store, "opening database handle");

        Self::open(resolved, options).await
    }

    /// Open a handle on `engine`.
    pub async fn connect(config: OrmConfig, engine: Engine) -> Result<Self, OrmError> {
        match engine {
            Engine::MySql => Self::mysql(config).await,
            Engine::Sqlite => Self::sqlite(config).await,
        }
    }

    async fn open(config: ResolvedConfig, options: AnyConnectOptions) -> Result<Self, OrmError> {
        install_drivers();

        let limits = PoolLimits::from_config(&config);
        let idle = IdleLimiter::new(limits.effective_max_idle());
        let pool = limits
            .apply(AnyPoolOptions::new(), &idle)
            .connect_with(options)
            .await
            .map_err(|source| OrmError::Open {
                engine: config.engine,
                source,
            })?;
        idle.attach(&pool);

        let name = if config.name.is_empty() && config.engine == Engine::Sqlite {
            config.sqlite_store.clone()
        } else {
            config.name.clone()
        };
        let info = DatabaseInfo {
            system: config.engine,
            name,
        };

        let mut orm = Self {
            pool,
            config,
            limits,
            info,
            plugins: PluginRegistry::default(),
            idle,
        };
        orm.use_plugin(Arc::new(TracingPlugin::new()))?;
        orm.health_check().await?;

        info!(
            engine = %orm.config.engine,
            max_open = orm.limits.effective_max_open(),
            max_idle = orm.limits.effective_max_idle(),
            log_mode = orm.config.log_mode.as_str(),
            "database handle ready"
        );
        Ok(orm)
    }

    /// Install an instrumentation plugin.
    pub fn use_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.plugins.register(plugin, &self.info)
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.names()
    }

    /// Run a statement that returns no rows.
    pub async fn execute<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<AnyQueryResult, OrmError> {
        let sql = query.sql();
        Ok(self
            .observe(sql, query.execute(&self.pool), |done| Some(done.rows_affected()))
            .await?)
    }

    /// Fetch at most one row. No row is `Ok(None)`, not an error.
    pub async fn fetch_optional<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Option<AnyRow>, OrmError> {
        let sql = query.sql();
        Ok(self
            .observe(sql, query.fetch_optional(&self.pool), |row| {
                Some(u64::from(row.is_some()))
            })
            .await?)
    }

    pub async fn fetch_all<'q>(
        &self,
        query: Query<'q, Any, AnyArguments<'q>>,
    ) -> Result<Vec<AnyRow>, OrmError> {
        let sql = query.sql();
        let rows = query.fetch(&self.pool).try_collect::<Vec<_>>();
        Ok(self
            .observe(sql, rows, |rows| Some(rows.len() as u64))
            .await?)
    }

    /// Run any sqlx future under the handle's instrumentation.
    ///
    /// For typed queries (`query_as`, `query_scalar`) the helpers above do
    /// not cover; `sql` is what gets reported.
    pub async fn traced<T, F>(&self, sql: &str, fut: F) -> Result<T, OrmError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        Ok(self.observe(sql, fut, |_| None).await?)
    }

    /// Run `fut` inside the plugins' span for `sql` and report how it ended.
    ///
    /// Everything the handle sends to the database goes through here,
    /// including migration actions and their bookkeeping.
    pub(crate) async fn observe<T, F>(
        &self,
        sql: &str,
        fut: F,
        rows: impl FnOnce(&T) -> Option<u64>,
    ) -> Result<T, sqlx::Error>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let span = self
            .plugins
            .query_span(&QueryInfo::new(&self.info, sql))
            .unwrap_or_else(Span::none);
        let result = fut.instrument(span.clone()).await;

        let outcome = match &result {
            Ok(value) => QueryOutcome::Success {
                rows_affected: rows(value),
            },
            Err(error) => {
                if self.config.log_mode >= LogMode::Error {
                    error!(parent: &span, sql, error = %error, "statement failed");
                }
                QueryOutcome::Failure { error }
            }
        };
        self.plugins.record_outcome(&span, &outcome);
        result
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn engine(&self) -> Engine {
        self.config.engine
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_open: self.limits.effective_max_open(),
            max_idle: self.limits.effective_max_idle(),
        }
    }

    #[instrument(skip(self), fields(db.system = %self.info.system))]
    pub async fn health_check(&self) -> Result<(), OrmError> {
        if self.pool.is_closed() {
            return Err(OrmError::PoolUnavailable("pool is closed".to_string()));
        }

        let sql = "SELECT 1";
        self.observe(sql, sqlx::query(sql).fetch_one(&self.pool), |_| Some(1))
            .await
            .map_err(|e| OrmError::HealthCheck(e.to_string()))?;

        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool gracefully. The in-memory store itself survives.
    #[instrument(skip(self), fields(db.system = %self.info.system))]
    pub async fn close(&self) {
        info!("closing database handle");
        self.pool.close().await;
        self.idle.detach();
    }

    /// Apply every pending migration, with the transaction setting from
    /// the handle's configuration.
    pub async fn run_migrations(
        &self,
        migrations: &[Migration],
    ) -> Result<Vec<MigrationResult>, MigrationError> {
        Migrator::new(self, MigrationOptions::from_config(&self.config), migrations)
            .migrate()
            .await
    }

    pub async fn rollback_last_migration(
        &self,
        migrations: &[Migration],
    ) -> Result<MigrationResult, MigrationError> {
        Migrator::new(self, MigrationOptions::from_config(&self.config), migrations)
            .rollback_last()
            .await
    }
}

impl Drop for Orm {
    fn drop(&mut self) {
        self.idle.detach();
    }
}

impl std::fmt::Debug for Orm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orm")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("plugins", &self.plugins)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orm_config::LogMode;
    use orm_test_utils::unique_store_name;

    async fn open(prefix: &str) -> Orm {
        Orm::sqlite(
            OrmConfig::builder()
                .sqlite_store(unique_store_name(prefix))
                .build(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_handle_defaults() {
        let orm = open("handle-defaults").await;

        assert_eq!(orm.engine(), Engine::Sqlite);
        assert_eq!(orm.config().log_mode, LogMode::Info);
        assert_eq!(orm.limits().effective_max_open(), 100);
        assert_eq!(orm.plugin_names(), vec![TracingPlugin::NAME]);
        orm.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_tracing_plugin_cannot_be_installed_twice() {
        let mut orm = open("handle-plugin").await;
        let err = orm.use_plugin(Arc::new(TracingPlugin::new())).unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_failed_statement_is_a_query_error() {
        let orm = open("handle-error").await;
        let err = orm
            .execute(sqlx::query("INSERT INTO missing_table VALUES (1)"))
            .await
            .err()
            .expect("insert into a missing table fails");
        assert!(matches!(err, OrmError::Query(_)));
    }

    #[tokio::test]
    async fn test_closed_handle_fails_health_check() {
        let orm = open("handle-close").await;
        orm.close().await;
        assert!(orm.is_closed());
        assert!(matches!(
            orm.health_check().await,
            Err(OrmError::PoolUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_mysql_descriptor_is_an_error() {
        let result = Orm::mysql(OrmConfig::builder().host("bad host").build()).await;
        assert!(matches!(result, Err(OrmError::Descriptor(_))));
    }
}
