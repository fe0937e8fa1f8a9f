//! End-to-end orchestration tests over the in-memory stores and the
//! in-process bus: manager, dispatcher, outbox publisher, and consumer
//! wired together the way the runner wires them.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::Payload;
use outbox::{InMemoryOutboxStore, InProcessBus, OutboxPublisher, OutboxStore, PublisherConfig};
use saga::{
    CompensationCommand, CompensationConsumer, CompensationRegistry, ConsumeOutcome,
    InMemoryCompensationLog, InMemorySagaStore, Result, SagaDefinitions, SagaManager, SagaStatus,
    SagaStep, SagaStore, StepStatus, UndoAction, UndoOutcome, UndoRegistry, COMPENSATION_TOPIC,
};

const STEPS: [&str; 4] = [
    "CreateAuthUser",
    "CreateUserEvent",
    "CreateVerificationToken",
    "CreateMailEvent",
];

fn action_for(step_name: &str) -> String {
    format!("UNDO_{}", step_name.to_uppercase())
}

fn definitions() -> SagaDefinitions {
    SagaDefinitions::new().define("UserRegistration", STEPS)
}

fn registry() -> CompensationRegistry {
    let mut registry = CompensationRegistry::new();
    for name in STEPS {
        registry = registry.register(
            name,
            move |step: &SagaStep| -> Result<CompensationCommand> {
                Ok(CompensationCommand::new(
                    step,
                    action_for(&step.step_name),
                    step.payload.clone().unwrap_or_default(),
                ))
            },
        );
    }
    registry
}

/// Records the order in which undo actions run.
struct LoggingUndo {
    action: String,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl UndoAction for LoggingUndo {
    async fn undo(&self, _data: &Payload) -> Result<UndoOutcome> {
        self.log.lock().unwrap().push(self.action.clone());
        Ok(UndoOutcome::Applied)
    }
}

fn undo_registry(log: &Arc<Mutex<Vec<String>>>) -> UndoRegistry {
    let mut registry = UndoRegistry::new();
    for name in STEPS {
        registry = registry.register(
            action_for(name),
            LoggingUndo {
                action: action_for(name),
                log: log.clone(),
            },
        );
    }
    registry
}

struct Harness {
    manager: SagaManager<InMemorySagaStore, InMemoryCompensationLog>,
    store: InMemorySagaStore,
    outbox: InMemoryOutboxStore,
    bus: InProcessBus,
}

fn harness() -> Harness {
    let store = InMemorySagaStore::new();
    let outbox = InMemoryOutboxStore::new();
    let log = InMemoryCompensationLog::new(store.clone(), outbox.clone());
    Harness {
        manager: SagaManager::new(store.clone(), log, definitions(), registry()),
        store,
        outbox,
        bus: InProcessBus::default(),
    }
}

fn publisher(h: &Harness) -> OutboxPublisher<InMemoryOutboxStore, InProcessBus> {
    OutboxPublisher::new(h.outbox.clone(), h.bus.clone(), PublisherConfig::default())
}

async fn pause() {
    // Distinct created_at stamps so undo ordering is deterministic.
    tokio::time::sleep(Duration::from_millis(2)).await;
}

#[tokio::test]
async fn all_steps_completed_finishes_the_saga() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new().with("email", "a@b.c"))
        .await
        .unwrap();

    // Steps arrive out of registration order; completion is set-based.
    for name in [
        "CreateMailEvent",
        "CreateAuthUser",
        "CreateVerificationToken",
    ] {
        h.manager
            .record_step(saga.id, name, StepStatus::Completed, None)
            .await
            .unwrap();
        let current = h.manager.get_saga(saga.id).await.unwrap().unwrap();
        assert_eq!(current.status, SagaStatus::Started);
    }

    h.manager
        .record_step(saga.id, "CreateUserEvent", StepStatus::Completed, None)
        .await
        .unwrap();

    let finished = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);
    assert!(finished.completed_at.is_some());
    assert!(h.outbox.row_count().await == 0);
}

#[tokio::test]
async fn duplicate_step_completion_after_finish_is_recorded_without_error() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    for name in STEPS {
        h.manager
            .record_step(saga.id, name, StepStatus::Completed, None)
            .await
            .unwrap();
    }
    let finished = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);

    // At-least-once delivery can re-report a step after the saga settled.
    let step = h
        .manager
        .record_step(saga.id, "CreateMailEvent", StepStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(step.status, StepStatus::Completed);

    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Completed);
    assert_eq!(saga.completed_at, finished.completed_at);
}

#[tokio::test]
async fn step_failure_compensates_completed_steps_newest_first() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    for name in ["CreateAuthUser", "CreateUserEvent", "CreateVerificationToken"] {
        h.manager
            .record_step(
                saga.id,
                name,
                StepStatus::Completed,
                Some(Payload::new().with("step", name)),
            )
            .await
            .unwrap();
        pause().await;
    }

    h.manager
        .record_step(
            saga.id,
            "CreateMailEvent",
            StepStatus::Failed,
            Some(Payload::new().with("error", "smtp relay refused connection")),
        )
        .await
        .unwrap();

    // Dispatch issued but no undo has settled yet: the saga must still be
    // observable in Compensating.
    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensating);
    assert!(saga.completed_at.is_none());
    assert_eq!(
        saga.last_error.as_deref(),
        Some("smtp relay refused connection")
    );

    // One compensation message per completed step, newest first.
    let messages = h.outbox.messages_for_saga(saga.id).await.unwrap();
    assert_eq!(messages.len(), 3);
    let actions: Vec<String> = messages
        .iter()
        .map(|m| {
            CompensationCommand::from_payload(&m.payload)
                .unwrap()
                .action
        })
        .collect();
    assert_eq!(
        actions,
        [
            "UNDO_CREATEVERIFICATIONTOKEN",
            "UNDO_CREATEUSEREVENT",
            "UNDO_CREATEAUTHUSER",
        ]
    );
    for message in &messages {
        assert_eq!(message.topic, COMPENSATION_TOPIC);
        assert_eq!(message.key, saga.id.to_string());
    }

    // A compensation record in Started exists for each completed step.
    let records: Vec<SagaStep> = h
        .store
        .steps_for_saga(saga.id)
        .await
        .unwrap()
        .into_iter()
        .filter(SagaStep::is_compensation)
        .collect();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == StepStatus::Started));
}

#[tokio::test]
async fn compensation_flows_through_publisher_and_consumer() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    for name in ["CreateAuthUser", "CreateUserEvent"] {
        h.manager
            .record_step(saga.id, name, StepStatus::Completed, None)
            .await
            .unwrap();
        pause().await;
    }
    h.manager
        .record_step(
            saga.id,
            "CreateVerificationToken",
            StepStatus::Failed,
            None,
        )
        .await
        .unwrap();

    let current = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(current.status, SagaStatus::Compensating);

    let log = Arc::new(Mutex::new(Vec::new()));
    let consumer = CompensationConsumer::new(h.store.clone(), undo_registry(&log));

    // Drain the outbox onto the bus, then consume everything published.
    let published = publisher(&h).tick().await.unwrap();
    assert_eq!(published, 2);
    for message in h.bus.published_on(COMPENSATION_TOPIC) {
        assert_eq!(
            consumer.handle(&message).await.unwrap(),
            ConsumeOutcome::Compensated
        );
    }

    // Undone in reverse chronological order.
    assert_eq!(
        *log.lock().unwrap(),
        ["UNDO_CREATEUSEREVENT", "UNDO_CREATEAUTHUSER"]
    );

    // Every compensation record settled.
    let records: Vec<SagaStep> = h
        .store
        .steps_for_saga(saga.id)
        .await
        .unwrap()
        .into_iter()
        .filter(SagaStep::is_compensation)
        .collect();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.status == StepStatus::Compensated));

    // The last settlement finalizes the saga.
    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert!(saga.completed_at.is_some());
}

#[tokio::test]
async fn redelivered_compensation_is_applied_once() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    h.manager
        .record_step(saga.id, "CreateAuthUser", StepStatus::Completed, None)
        .await
        .unwrap();
    h.manager
        .record_step(saga.id, "CreateUserEvent", StepStatus::Failed, None)
        .await
        .unwrap();

    publisher(&h).tick().await.unwrap();
    let messages = h.bus.published_on(COMPENSATION_TOPIC);
    assert_eq!(messages.len(), 1);

    let log = Arc::new(Mutex::new(Vec::new()));
    let consumer = CompensationConsumer::new(h.store.clone(), undo_registry(&log));

    assert_eq!(
        consumer.handle(&messages[0]).await.unwrap(),
        ConsumeOutcome::Compensated
    );
    assert_eq!(
        consumer.handle(&messages[0]).await.unwrap(),
        ConsumeOutcome::Duplicate
    );
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn partial_completion_is_terminal_with_mixed_results() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    h.manager
        .record_step(
            saga.id,
            "CreateMailEvent",
            StepStatus::PartiallyCompleted,
            Some(Payload::new().with("sent", 8).with("failed", 2)),
        )
        .await
        .unwrap();

    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::PartiallyCompleted);
    assert!(saga.completed_at.is_some());

    // Terminal: a late completion must not move the saga again.
    let result = h
        .manager
        .record_step(saga.id, "CreateAuthUser", StepStatus::Completed, None)
        .await;
    assert!(result.is_ok());
    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::PartiallyCompleted);
}

#[tokio::test]
async fn explicit_failure_signal_compensates() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    h.manager
        .record_step(saga.id, "CreateAuthUser", StepStatus::Completed, None)
        .await
        .unwrap();

    let failed = h
        .manager
        .fail_saga(saga.id, "upstream timeout")
        .await
        .unwrap();
    assert_eq!(failed.status, SagaStatus::Compensating);
    assert_eq!(failed.last_error.as_deref(), Some("upstream timeout"));

    let messages = h.outbox.messages_for_saga(saga.id).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn failure_with_no_completed_steps_dispatches_nothing() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("UserRegistration", Payload::new())
        .await
        .unwrap();

    h.manager
        .record_step(saga.id, "CreateAuthUser", StepStatus::Failed, None)
        .await
        .unwrap();

    let saga = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(h.outbox.row_count().await, 0);
}

#[tokio::test]
async fn unregistered_saga_type_requires_explicit_completion() {
    let h = harness();
    let saga = h
        .manager
        .start_saga("AdHocMigration", Payload::new())
        .await
        .unwrap();

    h.manager
        .record_step(saga.id, "CopyRows", StepStatus::Completed, None)
        .await
        .unwrap();
    let current = h.manager.get_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(current.status, SagaStatus::Started);

    let finished = h.manager.complete_saga(saga.id).await.unwrap();
    assert_eq!(finished.status, SagaStatus::Completed);
}
