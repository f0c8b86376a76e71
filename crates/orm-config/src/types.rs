//! Configuration types and default resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 3306;
/// Idle connections kept by the pool when none is configured.
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 100;
/// Open connections allowed by the pool when none is configured.
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 100;
/// Connection lifetime in minutes when none is configured.
pub const DEFAULT_CONN_MAX_LIFETIME_MINS: u64 = 15;
/// Name of the process-wide in-memory SQLite store.
pub const DEFAULT_SQLITE_STORE: &str = "orm";
/// Statements slower than this are reported in [`LogMode::Warn`] and above.
pub const SLOW_STATEMENT_THRESHOLD: Duration = Duration::from_millis(200);

/// Backing engine of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Engine {
    /// Network-attached MySQL, the production engine.
    #[serde(rename = "mysql")]
    MySql,
    /// Shared in-memory SQLite, used by tests.
    #[serde(rename = "sqlite")]
    Sqlite,
}

impl Engine {
    /// Statement logging used when the configuration leaves it unset.
    ///
    /// MySQL stays silent because spans already cover every statement;
    /// the test engine logs everything.
    pub fn default_log_mode(self) -> LogMode {
        match self {
            Self::MySql => LogMode::Silent,
            Self::Sqlite => LogMode::Info,
        }
    }

    /// Value used for the `db.system` span field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statement logging policy of a handle, from quietest to loudest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Nothing is logged by the driver.
    Silent,
    /// Failed statements only; they surface as errors anyway.
    Error,
    /// Adds statements slower than [`SLOW_STATEMENT_THRESHOLD`].
    Warn,
    /// Every statement.
    Info,
}

impl LogMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Silent => "silent",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
        }
    }
}

impl FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "silent" | "off" => Ok(Self::Silent),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            other => Err(format!("unknown log mode '{}'", other)),
        }
    }
}

/// Connection configuration as supplied by the caller.
///
/// Optional fields distinguish "unset" from an explicit value, so an
/// explicit zero survives [`OrmConfig::resolve`].
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrmConfig {
    /// Database (schema) name.
    pub name: String,
    pub user: String,
    pub password: String,
    /// TCP host, or the socket sub-path in socket mode.
    pub host: String,
    pub port: Option<u16>,
    pub max_idle_conns: Option<u32>,
    pub max_open_conns: Option<u32>,
    pub conn_max_lifetime_mins: Option<u64>,
    /// Connect through a Unix domain socket instead of TCP.
    pub socket_mode: bool,
    pub log_mode: Option<LogMode>,
    /// Run each migration batch inside one transaction.
    pub migrate_use_transaction: bool,
    /// Name of the shared in-memory store (SQLite engine only).
    pub sqlite_store: Option<String>,
}

impl fmt::Debug for OrmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrmConfig")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"****")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_open_conns", &self.max_open_conns)
            .field("conn_max_lifetime_mins", &self.conn_max_lifetime_mins)
            .field("socket_mode", &self.socket_mode)
            .field("log_mode", &self.log_mode)
            .field("migrate_use_transaction", &self.migrate_use_transaction)
            .field("sqlite_store", &self.sqlite_store)
            .finish()
    }
}

impl OrmConfig {
    pub fn builder() -> OrmConfigBuilder {
        OrmConfigBuilder::default()
    }

    /// Fill every unset field with its default for `engine`.
    ///
    /// Values are passed through unchecked; the driver rejects bad ones.
    pub fn resolve(&self, engine: Engine) -> ResolvedConfig {
        ResolvedConfig {
            engine,
            name: self.name.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            host: self.host.clone(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            max_idle_conns: self.max_idle_conns.unwrap_or(DEFAULT_MAX_IDLE_CONNS),
            max_open_conns: self.max_open_conns.unwrap_or(DEFAULT_MAX_OPEN_CONNS),
            conn_max_lifetime_mins: self
                .conn_max_lifetime_mins
                .unwrap_or(DEFAULT_CONN_MAX_LIFETIME_MINS),
            socket_mode: self.socket_mode,
            log_mode: self.log_mode.unwrap_or_else(|| engine.default_log_mode()),
            migrate_use_transaction: self.migrate_use_transaction,
            sqlite_store: self
                .sqlite_store
                .clone()
                .unwrap_or_else(|| DEFAULT_SQLITE_STORE.to_string()),
        }
    }
}

/// Builder that only marks the fields it is given as set.
#[derive(Default)]
pub struct OrmConfigBuilder {
    config: OrmConfig,
}

impl OrmConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.config.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = password.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    pub fn max_idle_conns(mut self, max: u32) -> Self {
        self.config.max_idle_conns = Some(max);
        self
    }

    pub fn max_open_conns(mut self, max: u32) -> Self {
        self.config.max_open_conns = Some(max);
        self
    }

    pub fn conn_max_lifetime_mins(mut self, mins: u64) -> Self {
        self.config.conn_max_lifetime_mins = Some(mins);
        self
    }

    pub fn socket_mode(mut self, enabled: bool) -> Self {
        self.config.socket_mode = enabled;
        self
    }

    pub fn log_mode(mut self, mode: LogMode) -> Self {
        self.config.log_mode = Some(mode);
        self
    }

    pub fn migrate_use_transaction(mut self, enabled: bool) -> Self {
        self.config.migrate_use_transaction = enabled;
        self
    }

    pub fn sqlite_store(mut self, store: impl Into<String>) -> Self {
        self.config.sqlite_store = Some(store.into());
        self
    }

    pub fn build(self) -> OrmConfig {
        self.config
    }
}

/// Configuration with every field concrete.
#[derive(Clone, PartialEq)]
pub struct ResolvedConfig {
    pub engine: Engine,
    pub name: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub max_idle_conns: u32,
    pub max_open_conns: u32,
    pub conn_max_lifetime_mins: u64,
    pub socket_mode: bool,
    pub log_mode: LogMode,
    pub migrate_use_transaction: bool,
    pub sqlite_store: String,
}

impl ResolvedConfig {
    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime_mins.saturating_mul(60))
    }
}

impl fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConfig")
            .field("engine", &self.engine)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"****")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_open_conns", &self.max_open_conns)
            .field("conn_max_lifetime_mins", &self.conn_max_lifetime_mins)
            .field("socket_mode", &self.socket_mode)
            .field("log_mode", &self.log_mode)
            .field("migrate_use_transaction", &self.migrate_use_transaction)
            .field("sqlite_store", &self.sqlite_store)
            .finish()
    }
}
