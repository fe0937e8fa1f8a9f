//! Per-saga-type expected step configuration.

use std::collections::HashMap;

/// Maps each saga type to the ordered list of step names it must complete.
///
/// Passed into the [`SagaManager`](crate::SagaManager) at construction so
/// tests can supply arbitrary configurations; there is no module-level
/// registry. A saga type with no entry never auto-completes and must be
/// finished explicitly via `complete_saga`.
#[derive(Debug, Clone, Default)]
pub struct SagaDefinitions {
    expected_steps: HashMap<String, Vec<String>>,
}

impl SagaDefinitions {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the required steps for a saga type, builder style.
    pub fn define<I, S>(mut self, saga_type: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_steps.insert(
            saga_type.into(),
            steps.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Returns the registered step list for a saga type.
    pub fn steps_for(&self, saga_type: &str) -> Option<&[String]> {
        self.expected_steps.get(saga_type).map(Vec::as_slice)
    }

    /// True when every registered step name appears in `completed`.
    ///
    /// The check is a set comparison: arrival order does not matter and
    /// duplicate completions are harmless. Unknown saga types return false
    /// rather than erroring, so they can only be completed explicitly.
    pub fn all_steps_completed(&self, saga_type: &str, completed: &[String]) -> bool {
        match self.expected_steps.get(saga_type) {
            Some(expected) => expected
                .iter()
                .all(|name| completed.iter().any(|c| c == name)),
            None => false,
        }
    }
}
