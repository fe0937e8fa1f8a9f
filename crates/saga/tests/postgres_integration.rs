//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::Utc;
use common::Payload;
use outbox::{NewOutboxMessage, OutboxStatus, OutboxStore, PostgresOutboxStore};
use saga::{
    CompensationLog, PostgresCompensationLog, PostgresSagaStore, Saga, SagaStatus, SagaStep,
    SagaStore, StepStatus, COMPENSATION_TOPIC,
};
use sqlx::PgPool;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Run migrations using raw_sql to execute multiple statements
            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_outbox_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresSagaStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_steps, sagas, outbox_messages")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaStore::new(pool)
}

#[tokio::test]
async fn insert_update_and_get_saga() {
    let store = get_test_store().await;

    let mut saga = Saga::new("UserRegistration", Payload::new().with("email", "a@b.c"));
    store.insert_saga(&saga).await.unwrap();

    let loaded = store.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(loaded.saga_type, "UserRegistration");
    assert_eq!(loaded.status, SagaStatus::Started);
    assert_eq!(loaded.payload.get_str("email"), Some("a@b.c"));
    assert!(loaded.completed_at.is_none());

    saga.last_error = Some("boom".to_string());
    saga.transition(SagaStatus::Compensating);
    store.update_saga(&saga).await.unwrap();

    let loaded = store.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, SagaStatus::Compensating);
    assert_eq!(loaded.last_error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn update_missing_saga_errors() {
    let store = get_test_store().await;
    let saga = Saga::new("UserRegistration", Payload::new());

    let err = store.update_saga(&saga).await.unwrap_err();
    assert!(matches!(err, saga::SagaError::SagaNotFound(_)));
}

#[tokio::test]
async fn steps_round_trip_and_order() {
    let store = get_test_store().await;

    let saga = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&saga).await.unwrap();

    for name in ["First", "Second", "Third"] {
        let step = SagaStep::forward(
            saga.id,
            name,
            StepStatus::Completed,
            Some(Payload::new().with("step", name)),
        );
        store.insert_step(&step).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let steps = store.steps_for_saga(saga.id).await.unwrap();
    let names: Vec<_> = steps.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, ["First", "Second", "Third"]);

    let undo_order = store.completed_steps_desc(saga.id).await.unwrap();
    let names: Vec<_> = undo_order.iter().map(|s| s.step_name.as_str()).collect();
    assert_eq!(names, ["Third", "Second", "First"]);
}

#[tokio::test]
async fn compensation_records_are_excluded_from_undo_order() {
    let store = get_test_store().await;

    let saga = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&saga).await.unwrap();

    let original = SagaStep::forward(saga.id, "CreateUser", StepStatus::Completed, None);
    store.insert_step(&original).await.unwrap();

    let mut comp = SagaStep::compensation_for(&original);
    store.insert_step(&comp).await.unwrap();
    comp.status = StepStatus::Compensated;
    comp.completed_at = Some(Utc::now());
    store.update_step(&comp).await.unwrap();

    let undo_order = store.completed_steps_desc(saga.id).await.unwrap();
    assert_eq!(undo_order.len(), 1);
    assert_eq!(undo_order[0].id, original.id);

    let found = store
        .find_compensation_record(original.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, comp.id);
    assert_eq!(found.status, StepStatus::Compensated);
    assert!(found.completed_at.is_some());
}

#[tokio::test]
async fn update_step_rejects_backward_transition() {
    let store = get_test_store().await;

    let saga = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&saga).await.unwrap();

    let original = SagaStep::forward(saga.id, "CreateUser", StepStatus::Completed, None);
    store.insert_step(&original).await.unwrap();

    let mut comp = SagaStep::compensation_for(&original);
    store.insert_step(&comp).await.unwrap();
    comp.status = StepStatus::Compensated;
    comp.completed_at = Some(Utc::now());
    store.update_step(&comp).await.unwrap();

    // Settled records never reopen.
    comp.status = StepStatus::Started;
    let err = store.update_step(&comp).await.unwrap_err();
    assert!(matches!(
        err,
        saga::SagaError::InvalidStepTransition {
            from: StepStatus::Compensated,
            to: StepStatus::Started,
            ..
        }
    ));

    let loaded = store.get_step(comp.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, StepStatus::Compensated);
}

#[tokio::test]
async fn compensation_log_commits_record_and_message_together() {
    let store = get_test_store().await;
    let log = PostgresCompensationLog::new(store.pool().clone());
    let outbox = PostgresOutboxStore::new(store.pool().clone());

    let saga = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&saga).await.unwrap();
    let original = SagaStep::forward(saga.id, "CreateUser", StepStatus::Completed, None);
    store.insert_step(&original).await.unwrap();

    let record = SagaStep::compensation_for(&original);
    let message = NewOutboxMessage::new(COMPENSATION_TOPIC, saga.id.to_string(), Payload::new())
        .for_saga(saga.id);
    let row = log.append(&record, message).await.unwrap();

    assert_eq!(row.status, OutboxStatus::Pending);
    assert!(store.get_step(record.id).await.unwrap().is_some());
    assert_eq!(outbox.messages_for_saga(saga.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn compensation_log_rolls_back_message_when_record_insert_fails() {
    let store = get_test_store().await;
    let log = PostgresCompensationLog::new(store.pool().clone());
    let outbox = PostgresOutboxStore::new(store.pool().clone());

    // A record pointing at a saga that was never inserted violates the
    // foreign key, so the whole append must fail.
    let orphan = Saga::new("UserRegistration", Payload::new());
    let original = SagaStep::forward(orphan.id, "CreateUser", StepStatus::Completed, None);
    let record = SagaStep::compensation_for(&original);
    let message = NewOutboxMessage::new(COMPENSATION_TOPIC, orphan.id.to_string(), Payload::new())
        .for_saga(orphan.id);

    assert!(log.append(&record, message).await.is_err());
    assert!(outbox
        .messages_for_saga(orphan.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn update_missing_step_errors() {
    let store = get_test_store().await;
    let step = SagaStep::forward(
        Saga::new("X", Payload::new()).id,
        "Nope",
        StepStatus::Completed,
        None,
    );

    let err = store.update_step(&step).await.unwrap_err();
    assert!(matches!(err, saga::SagaError::StepNotFound(_)));
}

#[tokio::test]
async fn find_stalled_scans_non_terminal_sagas() {
    let store = get_test_store().await;

    let mut stuck = Saga::new("UserRegistration", Payload::new());
    stuck.updated_at = Utc::now() - chrono::Duration::hours(2);
    store.insert_saga(&stuck).await.unwrap();

    let mut compensating = Saga::new("OrderFulfilment", Payload::new());
    compensating.transition(SagaStatus::Compensating);
    compensating.updated_at = Utc::now() - chrono::Duration::hours(3);
    store.insert_saga(&compensating).await.unwrap();

    let mut done = Saga::new("UserRegistration", Payload::new());
    done.transition(SagaStatus::Completed);
    done.updated_at = Utc::now() - chrono::Duration::hours(2);
    store.insert_saga(&done).await.unwrap();

    let fresh = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&fresh).await.unwrap();

    let stalled = store
        .find_stalled(Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let ids: Vec<_> = stalled.iter().map(|s| s.id).collect();
    // Oldest update first.
    assert_eq!(ids, [compensating.id, stuck.id]);
}

#[tokio::test]
async fn step_payload_may_be_absent() {
    let store = get_test_store().await;

    let saga = Saga::new("UserRegistration", Payload::new());
    store.insert_saga(&saga).await.unwrap();

    let step = SagaStep::forward(saga.id, "Ping", StepStatus::Started, None);
    store.insert_step(&step).await.unwrap();

    let loaded = store.get_step(step.id).await.unwrap().unwrap();
    assert!(loaded.payload.is_none());
    assert!(loaded.completed_at.is_none());
    assert_eq!(loaded.status, StepStatus::Started);
}
