// Catalog integration scenarios. These need a live Postgres and are
// ignored by default:
//
//   DATABASE_URL=postgres://localhost/lakeflow_test cargo test -- --ignored

use std::time::Duration;

use chrono::Utc;
use lakeflow_core::{
    DependencyType, TaskType, Workflow, WorkflowDependency, WorkflowTask,
};
use lakeflow_storage::{CatalogLock, Database};
use uuid::Uuid;

async fn test_db() -> Database {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a test database");
    let db = Database::from_url(&url).await.expect("connect");
    db.migrate().await.expect("migrate");
    db
}

fn unique(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[ignore]
async fn lock_contention_and_handover() {
    let db = test_db().await;
    let lock_name = unique("lock_x");

    let mut holder = CatalogLock::new(db.clone(), lock_name.clone());
    assert!(holder
        .try_acquire(300, Duration::from_secs(5))
        .await
        .is_acquired());

    // A competing session must time out without disturbing the holder
    let started = tokio::time::Instant::now();
    let mut contender = CatalogLock::new(db.clone(), lock_name.clone());
    let result = contender.try_acquire(300, Duration::from_secs(2)).await;
    assert!(!result.is_acquired());
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert!(holder.is_acquired());

    // After release the contender gets it within one retry interval
    holder.release().await.expect("release");
    let mut contender = CatalogLock::new(db.clone(), lock_name);
    assert!(contender
        .try_acquire(300, Duration::from_secs(2))
        .await
        .is_acquired());
    contender.release().await.expect("release");
}

#[tokio::test]
#[ignore]
async fn expired_lock_is_reclaimed() {
    let db = test_db().await;
    let lock_name = unique("lock_y");

    sqlx::query(
        r#"
        INSERT INTO metadata.catalog_locks (lock_name, acquired_by, session_id, expires_at)
        VALUES ($1, 'dead-host', 'old', NOW() - interval '1 hour')
        "#,
    )
    .bind(&lock_name)
    .execute(db.pool())
    .await
    .expect("seed stale lock");

    let started = tokio::time::Instant::now();
    let mut lock = CatalogLock::new(db.clone(), lock_name.clone());
    assert!(lock
        .try_acquire(300, Duration::from_secs(5))
        .await
        .is_acquired());
    assert!(started.elapsed() < Duration::from_secs(1));

    // Only the new session appears in the row
    let session: String =
        sqlx::query_scalar("SELECT session_id FROM metadata.catalog_locks WHERE lock_name = $1")
            .bind(&lock_name)
            .fetch_one(db.pool())
            .await
            .expect("lock row");
    assert_eq!(session, lock.session_id());
    lock.release().await.expect("release");
}

#[tokio::test]
#[ignore]
async fn out_of_range_ttl_times_out_without_touching_db() {
    let db = test_db().await;
    let mut lock = CatalogLock::new(db.clone(), unique("lock_ttl"));
    assert!(!lock.try_acquire(0, Duration::from_secs(1)).await.is_acquired());
    assert!(!lock
        .try_acquire(3601, Duration::from_secs(1))
        .await
        .is_acquired());
}

#[tokio::test]
#[ignore]
async fn workflow_round_trips_with_tasks_and_dependencies() {
    let db = test_db().await;
    let name = unique("wf_roundtrip");

    db.create_workflow(&Workflow::new(name.clone())).await.expect("create");
    for task_name in ["extract", "transform", "load"] {
        let mut task = WorkflowTask::new(&name, task_name, TaskType::CustomJob, task_name);
        task.priority = 3;
        db.upsert_task(&task).await.expect("task");
    }
    for (up, down, dep_type) in [
        ("extract", "transform", DependencyType::Success),
        ("transform", "load", DependencyType::Completion),
    ] {
        db.upsert_dependency(&WorkflowDependency {
            workflow_name: name.clone(),
            upstream_task: up.into(),
            downstream_task: down.into(),
            dependency_type: dep_type,
            condition_expression: None,
        })
        .await
        .expect("dependency");
    }

    let definition = db
        .load_definition(&name)
        .await
        .expect("load")
        .expect("present");
    let mut task_names: Vec<&str> = definition.tasks.iter().map(|t| t.task_name.as_str()).collect();
    task_names.sort_unstable();
    assert_eq!(task_names, vec!["extract", "load", "transform"]);
    assert_eq!(definition.dependencies.len(), 2);
    assert!(definition
        .dependencies
        .iter()
        .any(|d| d.upstream_task == "transform"
            && d.dependency_type == DependencyType::Completion));
    assert!(definition.tasks.iter().all(|t| t.priority == 3));
}

#[tokio::test]
#[ignore]
async fn versions_grow_monotonically_with_unique_current() {
    let db = test_db().await;
    let name = unique("wf_versions");
    db.create_workflow(&Workflow::new(name.clone())).await.expect("create");
    db.upsert_task(&WorkflowTask::new(&name, "only", TaskType::Script, ""))
        .await
        .expect("task");

    let v1 = db
        .create_workflow_version(&name, "tests", "first")
        .await
        .expect("v1");
    let v2 = db
        .create_workflow_version(&name, "tests", "second")
        .await
        .expect("v2");
    assert!(v2 > v1);

    let versions = db.list_workflow_versions(&name).await.expect("list");
    assert_eq!(versions.len(), 2);
    assert_eq!(
        versions.iter().filter(|v| v.is_current).count(),
        1,
        "is_current must be unique per workflow"
    );
    assert_eq!(db.current_workflow_version(&name).await.expect("current"), Some(v2));

    // Restore moves the marker without inventing versions
    db.restore_workflow_version(&name, v1).await.expect("restore");
    assert_eq!(db.current_workflow_version(&name).await.expect("current"), Some(v1));
    let versions = db.list_workflow_versions(&name).await.expect("list");
    assert_eq!(versions.len(), 2);
}

#[tokio::test]
#[ignore]
async fn hygiene_is_idempotent() {
    let db = test_db().await;

    // Seed one active NO_DATA entry and one inactive FULL_LOAD entry
    let schema = unique("hyg");
    for (table, status, active) in [
        ("t_nodata", "NO_DATA", true),
        ("t_stale", "FULL_LOAD", false),
    ] {
        sqlx::query(
            r#"
            INSERT INTO metadata.catalog
                (schema_name, table_name, db_engine, connection_string, status, active,
                 last_processed_pk, has_pk)
            VALUES ($1, $2, 'PostgreSQL', 'host=h;user=u;db=d', $3, $4, '42', FALSE)
            "#,
        )
        .bind(&schema)
        .bind(table)
        .bind(status)
        .bind(active)
        .execute(db.pool())
        .await
        .expect("seed");
    }

    let first = (
        db.deactivate_no_data_tables().await.expect("deactivate"),
        db.mark_inactive_as_skip(false).await.expect("skip"),
        db.clean_invalid_offsets().await.expect("offsets"),
    );
    assert!(first.0 >= 1);
    assert!(first.1 >= 1);

    // Second pass with no source changes leaves the catalog unchanged
    let snapshot_before: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT table_name, status, active FROM metadata.catalog WHERE schema_name = $1 ORDER BY table_name",
    )
    .bind(&schema)
    .fetch_all(db.pool())
    .await
    .expect("snapshot");

    let second = (
        db.deactivate_no_data_tables().await.expect("deactivate"),
        db.mark_inactive_as_skip(false).await.expect("skip"),
        db.clean_invalid_offsets().await.expect("offsets"),
    );
    assert_eq!(second, (0, 0, 0));

    let snapshot_after: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT table_name, status, active FROM metadata.catalog WHERE schema_name = $1 ORDER BY table_name",
    )
    .bind(&schema)
    .fetch_all(db.pool())
    .await
    .expect("snapshot");
    assert_eq!(snapshot_before, snapshot_after);
}

#[tokio::test]
#[ignore]
async fn execution_counters_add_up() {
    let db = test_db().await;
    let name = unique("wf_counters");
    db.create_workflow(&Workflow::new(name.clone())).await.expect("create");

    let execution = db
        .create_workflow_execution(lakeflow_storage::CreateWorkflowExecution {
            execution_id: Database::generate_execution_id(),
            workflow_name: name,
            trigger_type: lakeflow_core::TriggerType::Manual,
            total_tasks: 3,
        })
        .await
        .expect("execution");

    for status in [
        lakeflow_core::ExecutionStatus::Success,
        lakeflow_core::ExecutionStatus::Failed,
        lakeflow_core::ExecutionStatus::Skipped,
    ] {
        db.bump_execution_counter(&execution.execution_id, status)
            .await
            .expect("bump");
    }
    db.finish_workflow_execution(
        &execution.execution_id,
        lakeflow_core::ExecutionStatus::Failed,
        None,
    )
    .await
    .expect("finish");

    let row = db
        .get_workflow_execution(&execution.execution_id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(
        row.completed_tasks + row.failed_tasks + row.skipped_tasks,
        row.total_tasks
    );
    assert!(row.end_time.is_some());
    assert!(row.end_time.unwrap() <= Utc::now());
}
