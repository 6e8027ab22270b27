//! Instance status, derived entirely from history.

use serde::{Deserialize, Serialize};

use crate::Event;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestrationStatus {
    /// No such instance.
    NotFound,
    /// Instance created, no turn has run yet.
    Pending,
    Running,
    Completed { output: String },
    Failed { error: String },
    Cancelled { reason: String },
}

impl OrchestrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed { .. }
                | OrchestrationStatus::Failed { .. }
                | OrchestrationStatus::Cancelled { .. }
        )
    }
}

/// Derive status from a history read. `NotFound` is the caller's to
/// decide; an existing instance with an empty history is `Pending`.
pub fn status_from_history(history: &[Event]) -> OrchestrationStatus {
    for event in history.iter().rev() {
        match event {
            Event::OrchestrationCompleted { output } => {
                return OrchestrationStatus::Completed { output: output.clone() };
            }
            Event::OrchestrationFailed { error } => {
                return OrchestrationStatus::Failed { error: error.clone() };
            }
            Event::OrchestrationCancelled { reason } => {
                return OrchestrationStatus::Cancelled { reason: reason.clone() };
            }
            _ => {}
        }
    }
    if history.is_empty() {
        OrchestrationStatus::Pending
    } else {
        OrchestrationStatus::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_pending() {
        assert_eq!(status_from_history(&[]), OrchestrationStatus::Pending);
    }

    #[test]
    fn started_history_is_running() {
        let history = vec![Event::OrchestrationStarted {
            name: "Flow".into(),
            version: "1.0.0".into(),
            input: String::new(),
        }];
        let status = status_from_history(&history);
        assert_eq!(status, OrchestrationStatus::Running);
        assert!(!status.is_terminal());
    }

    #[test]
    fn terminal_event_decides_the_status() {
        let history = vec![
            Event::OrchestrationStarted {
                name: "Flow".into(),
                version: "1.0.0".into(),
                input: String::new(),
            },
            Event::OrchestrationFailed { error: "boom".into() },
        ];
        let status = status_from_history(&history);
        assert_eq!(status, OrchestrationStatus::Failed { error: "boom".into() });
        assert!(status.is_terminal());
    }
}
