use super::runner::Migrator;
use super::types::*;
use crate::handle::Orm;
use chrono::Utc;
use clap::{Parser, Subcommand};
use orm_log::{LogConfig, LogError, LogLevel};
use std::io::Write;

/// Migration commands a service can embed next to its own migration list.
///
/// ```no_run
/// # async fn run(orm: orm_database::Orm, migrations: Vec<orm_database::Migration>) {
/// use clap::Parser;
/// use orm_database::MigrateCli;
///
/// let cli = MigrateCli::parse();
/// cli.init_logging().ok();
/// cli.run(&orm, &migrations).await.unwrap();
/// # }
/// ```
#[derive(Debug, Parser)]
#[command(name = "migrate")]
#[command(about = "Database migration management")]
pub struct MigrateCli {
    #[command(subcommand)]
    pub command: MigrateCommand,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Run each batch in one transaction
    #[arg(long, global = true)]
    pub use_transaction: bool,

    /// Bookkeeping table name
    #[arg(long, global = true, default_value = "migrations")]
    pub table: String,

    /// Fail when the table records migrations this binary does not know
    #[arg(long, global = true)]
    pub validate_unknown: bool,
}

#[derive(Debug, Subcommand)]
pub enum MigrateCommand {
    /// Apply pending migrations
    Up {
        /// Stop after this migration id
        #[arg(long)]
        to: Option<String>,
    },

    /// Roll back the last migration, or everything after `--to`
    Rollback {
        #[arg(long)]
        to: Option<String>,
    },

    /// Show migration status
    Status,

    /// Print a fresh timestamp id for a new migration
    NewId {
        /// Optional suffix
        name: Option<String>,
    },
}

impl MigrateCli {
    /// Install the global subscriber, honouring `--log-level`.
    pub fn init_logging(&self) -> Result<(), LogError> {
        let mut config = LogConfig::from_env();
        if let Some(level) = self.log_level.as_deref().and_then(LogLevel::parse) {
            config.level = level;
        }
        orm_log::init(config)
    }

    /// Options for the migrator, on top of the handle's configuration.
    pub fn options(&self, orm: &Orm) -> MigrationOptions {
        MigrationOptions {
            table_name: self.table.clone(),
            use_transaction: self.use_transaction || orm.config().migrate_use_transaction,
            validate_unknown_migrations: self.validate_unknown,
            ..MigrationOptions::default()
        }
    }

    pub async fn run(&self, orm: &Orm, migrations: &[Migration]) -> Result<(), MigrationError> {
        self.run_with_output(orm, migrations, &mut std::io::stdout())
            .await
    }

    pub async fn run_with_output<W: Write>(
        &self,
        orm: &Orm,
        migrations: &[Migration],
        out: &mut W,
    ) -> Result<(), MigrationError> {
        let migrator = Migrator::new(orm, self.options(orm), migrations);

        match &self.command {
            MigrateCommand::Up { to } => {
                let results = match to {
                    Some(id) => migrator.migrate_to(id).await?,
                    None => migrator.migrate().await?,
                };
                if results.is_empty() {
                    writeln!(out, "No pending migrations.")?;
                }
                for result in &results {
                    writeln!(out, "  [OK] {} ({}ms)", result.id, result.elapsed.as_millis())?;
                }
            }
            MigrateCommand::Rollback { to } => {
                let results = match to {
                    Some(id) => migrator.rollback_to(id).await?,
                    None => vec![migrator.rollback_last().await?],
                };
                if results.is_empty() {
                    writeln!(out, "No migrations to roll back.")?;
                }
                for result in &results {
                    writeln!(
                        out,
                        "  [ROLLED BACK] {} ({}ms)",
                        result.id,
                        result.elapsed.as_millis()
                    )?;
                }
            }
            MigrateCommand::Status => {
                let status = migrator.status().await?;
                write_status(out, &status)?;
            }
            MigrateCommand::NewId { name } => {
                writeln!(out, "{}", new_migration_id(name.as_deref()))?;
            }
        }

        Ok(())
    }
}

fn write_status<W: Write>(out: &mut W, status: &[MigrationStatus]) -> std::io::Result<()> {
    writeln!(out, "Migration Status")?;
    writeln!(out, "================")?;

    if status.is_empty() {
        writeln!(out, "No migrations defined.")?;
        return Ok(());
    }

    for m in status {
        let mark = if m.applied { "x" } else { " " };
        let note = if m.reversible { "" } else { " (irreversible)" };
        writeln!(out, "  [{}] {}{}", mark, m.id, note)?;
    }

    let applied = status.iter().filter(|m| m.applied).count();
    writeln!(
        out,
        "Summary: {} applied, {} pending",
        applied,
        status.len() - applied
    )
}

/// A timestamp id (`YYYYMMDDHHMMSS`), optionally suffixed with a
/// sanitised name.
pub fn new_migration_id(name: Option<&str>) -> String {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();
    match name.map(sanitize_name).filter(|n| !n.is_empty()) {
        Some(name) => format!("{}_{}", timestamp, name),
        None => timestamp,
    }
}

fn sanitize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
