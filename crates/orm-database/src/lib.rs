//! Database handle for services: a tuned, traced sqlx pool on MySQL or on
//! a process-shared in-memory SQLite store, plus an ordered migration
//! runner.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use orm_config::OrmConfig;
//! use orm_database::{Migration, Orm};
//!
//! let orm = Orm::mysql(OrmConfig::from_env()?).await?;
//! orm.run_migrations(&[
//!     Migration::sql("202401151030", "CREATE TABLE patients (id BIGINT PRIMARY KEY)")
//!         .with_rollback_sql("DROP TABLE patients"),
//! ])
//! .await?;
//! # Ok(())
//! # }
//! ```

mod engine;
pub mod handle;
pub mod migration;
pub mod plugin;
pub mod pool;

pub use engine::sqlite_url;
pub use handle::{Orm, OrmError};
pub use migration::*;
pub use plugin::{
    DatabaseInfo, Plugin, PluginError, PluginRegistry, QueryInfo, QueryOutcome, TracingPlugin,
};
pub use pool::{PoolLimits, PoolStats, OPEN_CONNS_CEILING};
