//! Migration runner scenarios on the in-memory engine.

use clap::Parser;
use orm_config::OrmConfig;
use orm_database::{
    MigrateCli, Migration, MigrationDirection, MigrationError, MigrationOptions, Migrator, Orm,
    Plugin, QueryOutcome,
};
use orm_test_utils::{assert_err, assert_ok, init_test_tracing, unique_store_name, SpanCapture};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::Span;

async fn open(prefix: &str) -> Orm {
    init_test_tracing();
    assert_ok!(
        Orm::sqlite(
            OrmConfig::builder()
                .sqlite_store(unique_store_name(prefix))
                .build()
        )
        .await
    )
}

async fn table_exists(orm: &Orm, table: &str) -> bool {
    let sql = "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?";
    orm.fetch_optional(sqlx::query(sql).bind(table))
        .await
        .unwrap()
        .is_some()
}

fn create(id: &str, table: &str) -> Migration {
    Migration::sql(id, format!("CREATE TABLE {} (id INTEGER PRIMARY KEY)", table))
        .with_rollback_sql(format!("DROP TABLE {}", table))
}

fn clinic_migrations() -> Vec<Migration> {
    vec![
        create("202401010000", "patients"),
        create("202401020000", "visits"),
        create("202401030000", "invoices"),
    ]
}

fn ids(results: &[orm_database::MigrationResult]) -> Vec<&str> {
    results.iter().map(|r| r.id.as_str()).collect()
}

#[tokio::test]
async fn test_empty_list_is_a_no_op() {
    let orm = open("mig-empty").await;
    let results = orm.run_migrations(&[]).await.unwrap();
    assert!(results.is_empty());
    assert!(!table_exists(&orm, "migrations").await);
}

#[tokio::test]
async fn test_migrate_applies_in_order_and_records_ids() {
    let orm = open("mig-order").await;
    let migrations = clinic_migrations();

    let results = orm.run_migrations(&migrations).await.unwrap();
    assert_eq!(ids(&results), vec!["202401010000", "202401020000", "202401030000"]);
    assert!(results.iter().all(|r| r.direction == MigrationDirection::Up));

    for table in ["patients", "visits", "invoices", "migrations"] {
        assert!(table_exists(&orm, table).await, "{} missing", table);
    }

    let migrator = Migrator::new(&orm, MigrationOptions::default(), &migrations);
    assert_eq!(
        migrator.applied().await.unwrap(),
        vec!["202401010000", "202401020000", "202401030000"]
    );
}

#[tokio::test]
async fn test_reapplying_runs_nothing() {
    let orm = open("mig-idempotent").await;
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();

    let migrations = vec![Migration::new("202401010000", move |conn| {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            sqlx::query("CREATE TABLE counted (id INTEGER)")
                .execute(&mut *conn)
                .await?;
            Ok(())
        })
    })];

    assert_eq!(orm.run_migrations(&migrations).await.unwrap().len(), 1);
    assert!(orm.run_migrations(&migrations).await.unwrap().is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_steps_are_picked_up_later() {
    let orm = open("mig-append").await;
    let mut migrations = clinic_migrations();
    let last = migrations.pop().unwrap();

    orm.run_migrations(&migrations).await.unwrap();
    migrations.push(last);
    let results = orm.run_migrations(&migrations).await.unwrap();
    assert_eq!(ids(&results), vec!["202401030000"]);
}

#[tokio::test]
async fn test_rollback_last_until_nothing_is_applied() {
    let orm = open("mig-rollback").await;
    let migrations = vec![
        create("202401010000", "patients"),
        create("202401020000", "visits"),
    ];
    orm.run_migrations(&migrations).await.unwrap();

    let undone = orm.rollback_last_migration(&migrations).await.unwrap();
    assert_eq!(undone.id, "202401020000");
    assert_eq!(undone.direction, MigrationDirection::Down);
    assert!(!table_exists(&orm, "visits").await);
    assert!(table_exists(&orm, "patients").await);

    let undone = orm.rollback_last_migration(&migrations).await.unwrap();
    assert_eq!(undone.id, "202401010000");

    let err = assert_err!(orm.rollback_last_migration(&migrations).await);
    assert!(matches!(err, MigrationError::NoRunMigration));

    // Reapplying after a full rollback starts over.
    assert_eq!(orm.run_migrations(&migrations).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rollback_without_reverse_action_is_refused() {
    let orm = open("mig-irreversible").await;
    let migrations = vec![
        create("202401010000", "patients"),
        Migration::sql("202401020000", "CREATE INDEX idx_patients ON patients (id)"),
    ];
    orm.run_migrations(&migrations).await.unwrap();

    let err = assert_err!(orm.rollback_last_migration(&migrations).await);
    assert!(matches!(err, MigrationError::RollbackImpossible(ref id) if id == "202401020000"));

    let migrator = Migrator::new(&orm, MigrationOptions::default(), &migrations);
    assert_eq!(migrator.applied().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failure_without_transaction_keeps_earlier_steps() {
    let orm = open("mig-partial").await;
    let migrations = vec![
        create("202401010000", "patients"),
        Migration::sql("202401020000", "CREATE TABLE broken ("),
        create("202401030000", "invoices"),
    ];

    let err = assert_err!(orm.run_migrations(&migrations).await);
    assert!(matches!(err, MigrationError::ExecutionFailed { ref id, .. } if id == "202401020000"));

    assert!(table_exists(&orm, "patients").await);
    assert!(!table_exists(&orm, "invoices").await);
    let migrator = Migrator::new(&orm, MigrationOptions::default(), &migrations);
    assert_eq!(migrator.applied().await.unwrap(), vec!["202401010000"]);
}

#[tokio::test]
async fn test_failure_inside_transaction_applies_nothing() {
    let orm = open("mig-atomic").await;
    let migrations = vec![
        create("202401010000", "patients"),
        Migration::sql("202401020000", "CREATE TABLE broken ("),
    ];
    let options = MigrationOptions {
        use_transaction: true,
        ..MigrationOptions::default()
    };
    let migrator = Migrator::new(&orm, options, &migrations);

    assert_err!(migrator.migrate().await);
    assert!(!table_exists(&orm, "patients").await);
    assert!(migrator.applied().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_transaction_flag_from_config() {
    init_test_tracing();
    let orm = assert_ok!(
        Orm::sqlite(
            OrmConfig::builder()
                .sqlite_store(unique_store_name("mig-config-tx"))
                .migrate_use_transaction(true)
                .build()
        )
        .await
    );
    let migrations = vec![
        create("202401010000", "patients"),
        Migration::sql("202401020000", "NOT SQL AT ALL"),
    ];

    assert_err!(orm.run_migrations(&migrations).await);
    assert!(!table_exists(&orm, "patients").await);
}

#[tokio::test]
async fn test_invalid_lists_are_rejected_before_running() {
    let orm = open("mig-validate").await;

    let duplicated = vec![create("1", "a"), create("1", "b")];
    let err = assert_err!(orm.run_migrations(&duplicated).await);
    assert!(matches!(err, MigrationError::DuplicatedId(ref id) if id == "1"));

    let missing = vec![create("", "a")];
    let err = assert_err!(orm.run_migrations(&missing).await);
    assert!(matches!(err, MigrationError::MissingId));

    assert!(!table_exists(&orm, "a").await);
}

#[tokio::test]
async fn test_out_of_order_ids_follow_list_order() {
    let orm = open("mig-out-of-order").await;
    let migrations = vec![create("202402010000", "later"), create("202401010000", "earlier")];

    let results = orm.run_migrations(&migrations).await.unwrap();
    assert_eq!(ids(&results), vec!["202402010000", "202401010000"]);
}

#[tokio::test]
async fn test_migrate_to_and_rollback_to() {
    let orm = open("mig-targets").await;
    let migrations = clinic_migrations();
    let migrator = Migrator::new(&orm, MigrationOptions::default(), &migrations);

    let results = migrator.migrate_to("202401020000").await.unwrap();
    assert_eq!(ids(&results), vec!["202401010000", "202401020000"]);
    assert!(!table_exists(&orm, "invoices").await);

    let err = assert_err!(migrator.migrate_to("209901010000").await);
    assert!(matches!(err, MigrationError::IdNotFound(_)));

    migrator.migrate().await.unwrap();
    let results = migrator.rollback_to("202401010000").await.unwrap();
    assert_eq!(ids(&results), vec!["202401030000", "202401020000"]);
    assert_eq!(migrator.applied().await.unwrap(), vec!["202401010000"]);
    assert!(table_exists(&orm, "patients").await);
}

#[tokio::test]
async fn test_unknown_applied_ids() {
    let orm = open("mig-unknown").await;
    let migrations = clinic_migrations();
    orm.run_migrations(&migrations).await.unwrap();

    let fewer = &migrations[..2];
    let strict = MigrationOptions {
        validate_unknown_migrations: true,
        ..MigrationOptions::default()
    };
    let err = assert_err!(Migrator::new(&orm, strict, fewer).migrate().await);
    assert!(matches!(err, MigrationError::UnknownPastMigration(ref id) if id == "202401030000"));

    let lenient = Migrator::new(&orm, MigrationOptions::default(), fewer);
    assert!(lenient.migrate().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_custom_bookkeeping_table() {
    let orm = open("mig-table").await;
    let migrations = clinic_migrations();
    let options = MigrationOptions {
        table_name: "schema_versions".to_string(),
        id_column_name: "version".to_string(),
        ..MigrationOptions::default()
    };

    Migrator::new(&orm, options, &migrations)
        .migrate()
        .await
        .unwrap();
    assert!(table_exists(&orm, "schema_versions").await);
    assert!(!table_exists(&orm, "migrations").await);
}

#[tokio::test]
async fn test_status_reports_each_step() {
    let orm = open("mig-status").await;
    let mut migrations = clinic_migrations();
    migrations.push(Migration::sql("202401040000", "CREATE TABLE notes (id INTEGER)"));
    let migrator = Migrator::new(&orm, MigrationOptions::default(), &migrations);
    migrator.migrate_to("202401020000").await.unwrap();

    let status = migrator.status().await.unwrap();
    let applied: Vec<bool> = status.iter().map(|s| s.applied).collect();
    let reversible: Vec<bool> = status.iter().map(|s| s.reversible).collect();
    assert_eq!(applied, vec![true, true, false, false]);
    assert_eq!(reversible, vec![true, true, true, false]);
}

#[tokio::test]
async fn test_cli_drives_the_migrator() {
    let orm = open("mig-cli").await;
    let migrations = clinic_migrations();
    let mut out = Vec::new();

    let up = MigrateCli::parse_from(["migrate", "up", "--to", "202401020000"]);
    up.run_with_output(&orm, &migrations, &mut out).await.unwrap();

    let status = MigrateCli::parse_from(["migrate", "status"]);
    status.run_with_output(&orm, &migrations, &mut out).await.unwrap();

    let rollback = MigrateCli::parse_from(["migrate", "rollback"]);
    rollback.run_with_output(&orm, &migrations, &mut out).await.unwrap();

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("[OK] 202401010000"));
    assert!(text.contains("[x] 202401020000"));
    assert!(text.contains("[ ] 202401030000"));
    assert!(text.contains("Summary: 2 applied, 1 pending"));
    assert!(text.contains("[ROLLED BACK] 202401020000"));
}

#[derive(Default)]
struct StatementLog {
    outcomes: Mutex<Vec<bool>>,
}

impl StatementLog {
    fn counts(&self) -> (usize, usize) {
        let outcomes = self.outcomes.lock().unwrap();
        let ok = outcomes.iter().filter(|ok| **ok).count();
        (ok, outcomes.len() - ok)
    }
}

impl Plugin for StatementLog {
    fn name(&self) -> &'static str {
        "statement-log"
    }

    fn record_outcome(&self, _span: &Span, outcome: &QueryOutcome<'_>) {
        let ok = matches!(outcome, QueryOutcome::Success { .. });
        self.outcomes.lock().unwrap().push(ok);
    }
}

#[tokio::test]
async fn test_plugins_see_migration_statements() {
    let mut orm = open("mig-plugins").await;
    let log = Arc::new(StatementLog::default());
    orm.use_plugin(log.clone()).unwrap();
    let migrations = vec![
        create("202401010000", "patients"),
        create("202401020000", "visits"),
    ];

    // Table setup, applied-id read, then action and bookkeeping row per step.
    orm.run_migrations(&migrations).await.unwrap();
    assert_eq!(log.counts(), (6, 0));

    // Table setup, applied-id read, reverse action, bookkeeping delete.
    orm.rollback_last_migration(&migrations).await.unwrap();
    assert_eq!(log.counts(), (10, 0));

    let broken = vec![Migration::sql("202401030000", "CREATE TABLE broken (")];
    assert_err!(orm.run_migrations(&broken).await);
    assert_eq!(log.counts(), (12, 1));
}

#[tokio::test]
async fn test_migration_statements_run_inside_the_step_span() {
    let orm = open("mig-spans").await;
    let capture = SpanCapture::default();
    let _guard = capture.install();

    orm.run_migrations(&[create("202401010000", "patients")])
        .await
        .unwrap();

    let steps = capture.spans_named("db.migration");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].field("migration.id"), Some("202401010000"));
    assert_eq!(steps[0].field("otel.status_code"), Some("OK"));

    let in_step: Vec<_> = capture
        .spans_named("db.query")
        .into_iter()
        .filter(|s| s.parent.as_deref() == Some("db.migration"))
        .map(|s| s.field("db.operation").unwrap_or_default().to_string())
        .collect();
    assert_eq!(in_step, vec!["CREATE", "INSERT"]);
}
