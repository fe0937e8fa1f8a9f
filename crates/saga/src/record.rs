//! Saga and saga step records with their state machines.

use chrono::{DateTime, Utc};
use common::{Payload, SagaId, StepId};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a saga instance.
///
/// Transitions:
/// ```text
/// Started ──┬──► Completed            (all expected steps completed)
///           ├──► PartiallyCompleted   (a fan-out step had mixed results)
///           ├──► Compensating         (a step reported Failed)
///           └──► Failed               (explicit external failure signal)
/// Failed ──────► Compensating
/// Compensating ► Compensated          (every compensation record settled)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Saga created; steps are being recorded.
    #[default]
    Started,

    /// Every expected step completed (terminal).
    Completed,

    /// Explicit external failure signal received; compensation follows.
    Failed,

    /// Compensation dispatch in progress.
    Compensating,

    /// Every compensation record settled successfully (terminal).
    Compensated,

    /// A batch step reported mixed results (terminal).
    PartiallyCompleted,
}

impl SagaStatus {
    /// Returns true if the status machine permits moving to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Started, Completed)
                | (Started, Compensating)
                | (Started, PartiallyCompleted)
                | (Started, Failed)
                | (Failed, Compensating)
                | (Compensating, Compensated)
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::PartiallyCompleted
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "Started",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::PartiallyCompleted => "PartiallyCompleted",
        }
    }

    /// Parses a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Started" => Some(SagaStatus::Started),
            "Completed" => Some(SagaStatus::Completed),
            "Failed" => Some(SagaStatus::Failed),
            "Compensating" => Some(SagaStatus::Compensating),
            "Compensated" => Some(SagaStatus::Compensated),
            "PartiallyCompleted" => Some(SagaStatus::PartiallyCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single step record.
///
/// A step record is written once and only its status (and completion
/// timestamp) may change afterwards; it never moves backward. A forward
/// step keeps its `Completed` status even while being undone; the undo is
/// tracked by a separate compensation record linked through
/// [`SagaStep::compensation_step_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepStatus {
    /// Unit of work started (informational) or compensation scheduled.
    #[default]
    Started,

    /// Unit of work finished successfully.
    Completed,

    /// Unit of work failed; triggers compensation of prior steps.
    Failed,

    /// Compensation in flight for this record.
    Compensating,

    /// Compensation applied successfully (terminal).
    Compensated,

    /// Compensation failed; requires operator attention (terminal).
    CompensationFailed,

    /// Batch unit of work finished with mixed results.
    PartiallyCompleted,
}

impl StepStatus {
    /// Returns true if a record in this status may move to `next`.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        *self == StepStatus::Started && next != StepStatus::Started
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Started => "Started",
            StepStatus::Completed => "Completed",
            StepStatus::Failed => "Failed",
            StepStatus::Compensating => "Compensating",
            StepStatus::Compensated => "Compensated",
            StepStatus::CompensationFailed => "CompensationFailed",
            StepStatus::PartiallyCompleted => "PartiallyCompleted",
        }
    }

    /// Parses a status from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Started" => Some(StepStatus::Started),
            "Completed" => Some(StepStatus::Completed),
            "Failed" => Some(StepStatus::Failed),
            "Compensating" => Some(StepStatus::Compensating),
            "Compensated" => Some(StepStatus::Compensated),
            "CompensationFailed" => Some(StepStatus::CompensationFailed),
            "PartiallyCompleted" => Some(StepStatus::PartiallyCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable record of a saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Saga {
    /// Immutable identifier.
    pub id: SagaId,

    /// Tag identifying the business operation (e.g. "UserRegistration").
    pub saga_type: String,

    /// Current lifecycle status.
    pub status: SagaStatus,

    /// Opaque context supplied at start; never interpreted here.
    pub payload: Payload,

    /// When the saga was started.
    pub started_at: DateTime<Utc>,

    /// Bumped on every status or step change.
    pub updated_at: DateTime<Utc>,

    /// Set exactly once, on entering a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// Most recent failure description, if any.
    pub last_error: Option<String>,
}

impl Saga {
    /// Creates a new saga in `Started`.
    pub fn new(saga_type: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Started,
            payload,
            started_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
        }
    }

    /// Bumps `updated_at` without changing status.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves the saga to `next`, stamping `updated_at`, and `completed_at`
    /// exactly once when a terminal status is entered.
    pub fn transition(&mut self, next: SagaStatus) {
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(self.updated_at);
        }
    }
}

/// Durable record of one unit of work within a saga.
///
/// Steps are append-only per saga; once written only `status` and
/// `completed_at` change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStep {
    /// Record identifier.
    pub id: StepId,

    /// Owning saga.
    pub saga_id: SagaId,

    /// Tag identifying which unit of work this is (e.g. "CreateUser").
    pub step_name: String,

    /// Current status.
    pub status: StepStatus,

    /// Data needed to reverse the step (created row id, before-values).
    pub payload: Option<Payload>,

    /// When the record was written.
    pub created_at: DateTime<Utc>,

    /// When the record reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,

    /// For compensation records: the forward step being undone.
    pub compensation_step_id: Option<StepId>,
}

impl SagaStep {
    /// Creates a forward step record.
    pub fn forward(
        saga_id: SagaId,
        step_name: impl Into<String>,
        status: StepStatus,
        payload: Option<Payload>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StepId::new(),
            saga_id,
            step_name: step_name.into(),
            status,
            payload,
            created_at: now,
            completed_at: None,
            compensation_step_id: None,
        }
        .with_initial_completion()
    }

    /// Creates a compensation record undoing `original`.
    ///
    /// The record starts in `Started` with `step_name = "Compensate" +
    /// original step name` and is linked through `compensation_step_id`.
    pub fn compensation_for(original: &SagaStep) -> Self {
        Self {
            id: StepId::new(),
            saga_id: original.saga_id,
            step_name: format!("Compensate{}", original.step_name),
            status: StepStatus::Started,
            payload: original.payload.clone(),
            created_at: Utc::now(),
            completed_at: None,
            compensation_step_id: Some(original.id),
        }
    }

    fn with_initial_completion(mut self) -> Self {
        // Records written already-terminal carry their completion stamp.
        self.completed_at = match self.status {
            StepStatus::Started | StepStatus::Compensating => None,
            _ => Some(self.created_at),
        };
        self
    }

    /// Returns true if this record tracks an undo rather than forward work.
    pub fn is_compensation(&self) -> bool {
        self.compensation_step_id.is_some()
    }
}
