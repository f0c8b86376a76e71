use super::types::*;
use crate::handle::Orm;
use orm_log::spans::{self, Timer};
use sqlx::{AnyConnection, Connection, Executor};
use std::collections::HashSet;
use tracing::{debug, info, warn, Instrument};

/// Applies and rolls back an ordered list of migrations on one handle.
///
/// Applied ids are kept in a bookkeeping table inside the same database.
/// Every call works on a single pooled connection, so on the in-memory
/// engine the bookkeeping never contends with itself for table locks.
pub struct Migrator<'a> {
    orm: &'a Orm,
    options: MigrationOptions,
    migrations: &'a [Migration],
}

#[derive(Debug, Clone, Copy)]
enum Step<'m> {
    Up(&'m Migration),
    Down(&'m Migration),
}

impl<'a> Migrator<'a> {
    pub fn new(orm: &'a Orm, options: MigrationOptions, migrations: &'a [Migration]) -> Self {
        Self {
            orm,
            options,
            migrations,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Apply every pending migration, in list order.
    pub async fn migrate(&self) -> Result<Vec<MigrationResult>, MigrationError> {
        if self.migrations.is_empty() {
            debug!("no migrations defined");
            return Ok(Vec::new());
        }

        self.run_batch(|applied| {
            Ok(self
                .migrations
                .iter()
                .filter(|m| !applied.contains(&m.id))
                .map(Step::Up)
                .collect())
        })
        .await
    }

    /// Apply pending migrations up to and including `id`.
    pub async fn migrate_to(&self, id: &str) -> Result<Vec<MigrationResult>, MigrationError> {
        let target = self.position(id)?;

        self.run_batch(|applied| {
            Ok(self.migrations[..=target]
                .iter()
                .filter(|m| !applied.contains(&m.id))
                .map(Step::Up)
                .collect())
        })
        .await
    }

    /// Undo the last applied migration of the list.
    pub async fn rollback_last(&self) -> Result<MigrationResult, MigrationError> {
        let mut results = self
            .run_batch(|applied| {
                let last = self
                    .migrations
                    .iter()
                    .rev()
                    .find(|m| applied.contains(&m.id))
                    .ok_or(MigrationError::NoRunMigration)?;
                ensure_reversible(last)?;
                Ok(vec![Step::Down(last)])
            })
            .await?;

        results.pop().ok_or(MigrationError::NoRunMigration)
    }

    /// Undo every applied migration listed after `id`, newest first.
    /// `id` itself stays applied.
    pub async fn rollback_to(&self, id: &str) -> Result<Vec<MigrationResult>, MigrationError> {
        let target = self.position(id)?;

        self.run_batch(|applied| {
            self.migrations[target + 1..]
                .iter()
                .rev()
                .filter(|m| applied.contains(&m.id))
                .map(|m| ensure_reversible(m).map(|_| Step::Down(m)))
                .collect()
        })
        .await
    }

    /// Ids recorded in the bookkeeping table, sorted.
    pub async fn applied(&self) -> Result<Vec<String>, MigrationError> {
        let mut conn = self.orm.pool().acquire().await?;
        self.ensure_table(&mut conn).await?;
        let mut ids: Vec<String> = self.applied_ids(&mut conn).await?.into_iter().collect();
        ids.sort();
        Ok(ids)
    }

    /// Applied state of every migration in the list.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>, MigrationError> {
        let mut conn = self.orm.pool().acquire().await?;
        self.ensure_table(&mut conn).await?;
        let applied = self.applied_ids(&mut conn).await?;

        Ok(self
            .migrations
            .iter()
            .map(|m| MigrationStatus {
                id: m.id.clone(),
                applied: applied.contains(&m.id),
                reversible: m.is_reversible(),
            })
            .collect())
    }

    async fn run_batch<P>(&self, plan: P) -> Result<Vec<MigrationResult>, MigrationError>
    where
        P: FnOnce(&HashSet<String>) -> Result<Vec<Step<'a>>, MigrationError>,
    {
        self.validate()?;

        let mut conn = self.orm.pool().acquire().await?;
        self.ensure_table(&mut conn).await?;
        let applied = self.applied_ids(&mut conn).await?;
        self.check_unknown(&applied)?;

        let steps = plan(&applied)?;
        if steps.is_empty() {
            debug!("nothing to do");
            return Ok(Vec::new());
        }

        if !self.options.use_transaction {
            return self.run_steps(&mut conn, &steps).await;
        }

        let mut tx = conn.begin().await?;
        match self.run_steps(&mut tx, &steps).await {
            Ok(results) => {
                tx.commit().await?;
                Ok(results)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!(error = %rollback_error, "failed to roll back migration transaction");
                }
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        conn: &mut AnyConnection,
        steps: &[Step<'a>],
    ) -> Result<Vec<MigrationResult>, MigrationError> {
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            let (migration, direction) = match *step {
                Step::Up(m) => (m, MigrationDirection::Up),
                Step::Down(m) => (m, MigrationDirection::Down),
            };

            let span = spans::migration_span(&migration.id, direction.as_str());
            let timer = Timer::start("migration");
            let outcome = self
                .run_step(conn, *step)
                .instrument(span.clone())
                .await;

            match &outcome {
                Ok(()) => spans::record_ok(&span),
                Err(e) => spans::record_error(&span, e),
            }
            outcome?;

            let elapsed = timer.finish();
            info!(
                id = %migration.id,
                direction = %direction,
                elapsed_ms = elapsed.as_millis() as u64,
                "migration step complete"
            );
            results.push(MigrationResult {
                id: migration.id.clone(),
                direction,
                elapsed,
            });
        }

        Ok(results)
    }

    async fn run_step(&self, conn: &mut AnyConnection, step: Step<'a>) -> Result<(), MigrationError> {
        match step {
            Step::Up(m) => {
                m.migrate
                    .run(self.orm, conn)
                    .await
                    .map_err(|source| MigrationError::ExecutionFailed {
                        id: m.id.clone(),
                        source,
                    })?;
                self.record_applied(conn, &m.id).await
            }
            Step::Down(m) => {
                let rollback = m
                    .rollback
                    .as_ref()
                    .ok_or_else(|| MigrationError::RollbackImpossible(m.id.clone()))?;
                rollback
                    .run(self.orm, conn)
                    .await
                    .map_err(|source| MigrationError::RollbackFailed {
                        id: m.id.clone(),
                        source,
                    })?;
                self.record_reverted(conn, &m.id).await
            }
        }
    }

    fn validate(&self) -> Result<(), MigrationError> {
        let mut seen = HashSet::with_capacity(self.migrations.len());
        for migration in self.migrations {
            if migration.id.is_empty() {
                return Err(MigrationError::MissingId);
            }
            if !seen.insert(migration.id.as_str()) {
                return Err(MigrationError::DuplicatedId(migration.id.clone()));
            }
        }

        for pair in self.migrations.windows(2) {
            if pair[1].id < pair[0].id {
                warn!(
                    previous = %pair[0].id,
                    next = %pair[1].id,
                    "migration ids are out of order; applying in list order"
                );
            }
        }
        Ok(())
    }

    fn check_unknown(&self, applied: &HashSet<String>) -> Result<(), MigrationError> {
        if !self.options.validate_unknown_migrations {
            return Ok(());
        }

        let known: HashSet<&str> = self.migrations.iter().map(|m| m.id.as_str()).collect();
        let mut unknown: Vec<&String> = applied
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .collect();
        unknown.sort();

        match unknown.first() {
            Some(id) => Err(MigrationError::UnknownPastMigration((*id).clone())),
            None => Ok(()),
        }
    }

    fn position(&self, id: &str) -> Result<usize, MigrationError> {
        self.validate()?;
        self.migrations
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MigrationError::IdNotFound(id.to_string()))
    }

    async fn ensure_table(&self, conn: &mut AnyConnection) -> Result<(), MigrationError> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR({}) PRIMARY KEY)",
            self.options.table_name, self.options.id_column_name, self.options.id_column_size
        );
        self.orm
            .observe(&sql, conn.execute(sql.as_str()), |_| None)
            .await?;
        Ok(())
    }

    async fn applied_ids(&self, conn: &mut AnyConnection) -> Result<HashSet<String>, MigrationError> {
        let sql = format!(
            "SELECT {} FROM {}",
            self.options.id_column_name, self.options.table_name
        );
        let ids = self
            .orm
            .observe(
                &sql,
                sqlx::query_scalar::<_, String>(&sql).fetch_all(&mut *conn),
                |ids| Some(ids.len() as u64),
            )
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn record_applied(&self, conn: &mut AnyConnection, id: &str) -> Result<(), MigrationError> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES (?)",
            self.options.table_name, self.options.id_column_name
        );
        self.orm
            .observe(&sql, sqlx::query(&sql).bind(id).execute(&mut *conn), |done| {
                Some(done.rows_affected())
            })
            .await?;
        Ok(())
    }

    async fn record_reverted(&self, conn: &mut AnyConnection, id: &str) -> Result<(), MigrationError> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.options.table_name, self.options.id_column_name
        );
        self.orm
            .observe(&sql, sqlx::query(&sql).bind(id).execute(&mut *conn), |done| {
                Some(done.rows_affected())
            })
            .await?;
        Ok(())
    }
}

fn ensure_reversible(migration: &Migration) -> Result<(), MigrationError> {
    if migration.is_reversible() {
        Ok(())
    } else {
        Err(MigrationError::RollbackImpossible(migration.id.clone()))
    }
}
