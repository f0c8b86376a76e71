//! Connect options for the two backing engines.

use lazy_static::lazy_static;
use log::LevelFilter;
use orm_config::{ConnectionDescriptor, DescriptorError, LogMode, SLOW_STATEMENT_THRESHOLD};
use sqlx::any::AnyConnectOptions;
use sqlx::{AnyConnection, ConnectOptions, Connection};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

lazy_static! {
    /// One idle connection per in-memory store keeps the store alive for
    /// the rest of the process, whatever happens to the pools using it.
    static ref MEMORY_STORES: Mutex<HashMap<String, AnyConnection>> = Mutex::new(HashMap::new());
}

/// Make the sqlx `Any` driver aware of MySQL and SQLite. Idempotent.
pub(crate) fn install_drivers() {
    sqlx::any::install_default_drivers();
}

/// Options for the production engine.
pub(crate) fn mysql_options(
    descriptor: &ConnectionDescriptor,
    mode: LogMode,
) -> Result<AnyConnectOptions, DescriptorError> {
    let url = descriptor.to_url()?;
    let options = AnyConnectOptions::from_str(url.as_str()).map_err(|e| {
        DescriptorError::InvalidComponent {
            component: "url",
            value: e.to_string(),
        }
    })?;
    Ok(with_log_mode(options, mode))
}

/// URL of the named, process-shared in-memory store.
///
/// The name is percent-encoded, so `?`, `&` or `#` in it stay part of the
/// name instead of turning into connect options.
pub fn sqlite_url(store: &str) -> String {
    let name: String = url::form_urlencoded::byte_serialize(store.as_bytes())
        .collect::<String>()
        .replace('+', "%20");
    format!("sqlite:file:{}?mode=memory&cache=shared", name)
}

/// Options for the in-memory test engine.
pub(crate) fn sqlite_options(store: &str, mode: LogMode) -> Result<AnyConnectOptions, sqlx::Error> {
    let options = AnyConnectOptions::from_str(&sqlite_url(store))?;
    Ok(with_log_mode(options, mode))
}

/// Map the handle's log mode onto driver statement logging.
///
/// The driver has no failed-statement log, so `Error` keeps it off here and
/// the handle logs failures itself.
fn with_log_mode(options: AnyConnectOptions, mode: LogMode) -> AnyConnectOptions {
    match mode {
        LogMode::Silent | LogMode::Error => options.disable_statement_logging(),
        LogMode::Warn => options
            .log_statements(LevelFilter::Off)
            .log_slow_statements(LevelFilter::Warn, SLOW_STATEMENT_THRESHOLD),
        LogMode::Info => options
            .log_statements(LevelFilter::Info)
            .log_slow_statements(LevelFilter::Warn, SLOW_STATEMENT_THRESHOLD),
    }
}

/// Pin the named in-memory store for the lifetime of the process.
pub(crate) async fn retain_memory_store(
    store: &str,
    options: &AnyConnectOptions,
) -> Result<(), sqlx::Error> {
    if is_retained(store) {
        return Ok(());
    }

    let anchor = AnyConnection::connect_with(options).await?;
    let mut stores = MEMORY_STORES.lock().unwrap_or_else(PoisonError::into_inner);
    // A concurrent caller may have won the race; its anchor is as good as ours.
    stores.entry(store.to_string()).or_insert(anchor);
    debug!(store, "in-memory store retained");
    Ok(())
}

pub(crate) fn is_retained(store: &str) -> bool {
    MEMORY_STORES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(store)
}
