//! Environment variable handling.

use crate::types::{LogMode, OrmConfig};
use std::env;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable errors.
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("required environment variable not set: {var}")]
    NotSet { var: String },

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Environment variable names.
pub mod vars {
    // Connection
    pub const DB_NAME: &str = "DB_NAME";
    pub const DB_USER: &str = "DB_USER";
    pub const DB_PASSWORD: &str = "DB_PASSWORD";
    pub const DB_HOST: &str = "DB_HOST";
    pub const DB_PORT: &str = "DB_PORT";
    pub const DB_SOCKET_MODE: &str = "DB_SOCKET_MODE";
    pub const DB_SOCKET_DIR: &str = "DB_SOCKET_DIR";

    // Pool
    pub const DB_MAX_IDLE_CONNS: &str = "DB_MAX_IDLE_CONNS";
    pub const DB_MAX_OPEN_CONNS: &str = "DB_MAX_OPEN_CONNS";
    pub const DB_CONN_MAX_LIFETIME_MINS: &str = "DB_CONN_MAX_LIFETIME_MINS";

    // Behaviour
    pub const DB_LOG_MODE: &str = "DB_LOG_MODE";
    pub const DB_MIGRATE_USE_TRANSACTION: &str = "DB_MIGRATE_USE_TRANSACTION";
    pub const DB_SQLITE_STORE: &str = "DB_SQLITE_STORE";

    pub const APP_ENV: &str = "APP_ENV";
}

/// Environment access helpers.
pub struct Environment {
    _guard: (),
}

impl Environment {
    /// Load `.env.local`, `.env.$APP_ENV` and `.env`, in that order.
    ///
    /// Missing files are fine. A variable already set, by the process or by
    /// an earlier file, is never overwritten.
    pub fn init() -> Self {
        Self::init_in(Path::new("."))
    }

    /// [`Environment::init`] against the files in `dir`.
    pub fn init_in(dir: &Path) -> Self {
        let _ = dotenvy::from_path(dir.join(".env.local"));
        if let Ok(app_env) = env::var(vars::APP_ENV) {
            let _ = dotenvy::from_path(dir.join(format!(".env.{}", app_env)));
        }
        let _ = dotenvy::from_path(dir.join(".env"));

        Self { _guard: () }
    }

    /// Get a required string variable.
    pub fn require(var: &str) -> Result<String, EnvError> {
        env::var(var).map_err(|_| EnvError::NotSet {
            var: var.to_string(),
        })
    }

    /// Get an optional string variable.
    pub fn get(var: &str) -> Option<String> {
        env::var(var).ok()
    }

    /// Get a boolean variable.
    pub fn get_bool(var: &str) -> Option<bool> {
        env::var(var)
            .ok()
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
    }

    /// Get and parse a variable; unset is `Ok(None)`.
    pub fn get_parsed<T>(var: &str) -> Result<Option<T>, EnvError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(var) {
            Ok(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| EnvError::InvalidValue {
                    var: var.to_string(),
                    message: e.to_string(),
                }),
            Err(_) => Ok(None),
        }
    }
}

impl OrmConfig {
    /// Build a configuration from `DB_*` variables.
    ///
    /// Unset variables leave the matching field unset.
    pub fn from_env() -> Result<Self, EnvError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay `DB_*` variables onto this configuration.
    pub fn apply_env(&mut self) -> Result<(), EnvError> {
        if let Some(v) = Environment::get(vars::DB_NAME) {
            self.name = v;
        }
        if let Some(v) = Environment::get(vars::DB_USER) {
            self.user = v;
        }
        if let Some(v) = Environment::get(vars::DB_PASSWORD) {
            self.password = v;
        }
        if let Some(v) = Environment::get(vars::DB_HOST) {
            self.host = v;
        }
        if let Some(v) = Environment::get_parsed(vars::DB_PORT)? {
            self.port = Some(v);
        }
        if let Some(v) = Environment::get_bool(vars::DB_SOCKET_MODE) {
            self.socket_mode = v;
        }
        if let Some(v) = Environment::get_parsed(vars::DB_MAX_IDLE_CONNS)? {
            self.max_idle_conns = Some(v);
        }
        if let Some(v) = Environment::get_parsed(vars::DB_MAX_OPEN_CONNS)? {
            self.max_open_conns = Some(v);
        }
        if let Some(v) = Environment::get_parsed(vars::DB_CONN_MAX_LIFETIME_MINS)? {
            self.conn_max_lifetime_mins = Some(v);
        }
        if let Some(v) = Environment::get_parsed::<LogMode>(vars::DB_LOG_MODE)? {
            self.log_mode = Some(v);
        }
        if let Some(v) = Environment::get_bool(vars::DB_MIGRATE_USE_TRANSACTION) {
            self.migrate_use_transaction = v;
        }
        if let Some(v) = Environment::get(vars::DB_SQLITE_STORE) {
            self.sqlite_store = Some(v);
        }
        Ok(())
    }
}
