use journey_core::error::{EngineError, EngineResult};
use journey_core::types::InstanceStatus;

/// Describes a single valid lifecycle move for a journey instance.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub from: InstanceStatus,
    pub to: InstanceStatus,
    pub trigger: &'static str,
}

/// Guards the instance lifecycle by enforcing a finite set of valid status
/// moves: `Pending → Running → {Completed | Failed}`, with cancellation
/// permitted from any non-terminal status.
#[derive(Debug, Clone)]
pub struct InstanceLifecycle {
    transitions: Vec<StatusTransition>,
}

impl InstanceLifecycle {
    pub fn new() -> Self {
        let transitions = vec![
            StatusTransition {
                from: InstanceStatus::Pending,
                to: InstanceStatus::Running,
                trigger: "start",
            },
            StatusTransition {
                from: InstanceStatus::Running,
                to: InstanceStatus::Completed,
                trigger: "complete",
            },
            StatusTransition {
                from: InstanceStatus::Running,
                to: InstanceStatus::Failed,
                trigger: "fail",
            },
            StatusTransition {
                from: InstanceStatus::Pending,
                to: InstanceStatus::Cancelled,
                trigger: "cancel",
            },
            StatusTransition {
                from: InstanceStatus::Running,
                to: InstanceStatus::Cancelled,
                trigger: "cancel",
            },
        ];

        Self { transitions }
    }

    /// Returns `true` if the given status move is allowed.
    pub fn can_transition(&self, from: InstanceStatus, to: InstanceStatus) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Fails with `InvalidTransition` if the move is not permitted.
    pub fn assert_transition(
        &self,
        from: InstanceStatus,
        to: InstanceStatus,
        trigger: &str,
    ) -> EngineResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                from: format!("{from:?}"),
                to: format!("{to:?}"),
                trigger: trigger.to_string(),
            })
        }
    }
}

impl Default for InstanceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_lifecycle_path() {
        let lifecycle = InstanceLifecycle::new();
        assert!(lifecycle.can_transition(InstanceStatus::Pending, InstanceStatus::Running));
        assert!(lifecycle.can_transition(InstanceStatus::Running, InstanceStatus::Completed));
        assert!(lifecycle.can_transition(InstanceStatus::Running, InstanceStatus::Failed));
        assert!(lifecycle.can_transition(InstanceStatus::Running, InstanceStatus::Cancelled));
    }

    #[test]
    fn test_invalid_moves_rejected() {
        let lifecycle = InstanceLifecycle::new();
        assert!(!lifecycle.can_transition(InstanceStatus::Pending, InstanceStatus::Completed));
        assert!(!lifecycle.can_transition(InstanceStatus::Completed, InstanceStatus::Running));
        assert!(!lifecycle.can_transition(InstanceStatus::Failed, InstanceStatus::Running));

        let err = lifecycle
            .assert_transition(InstanceStatus::Completed, InstanceStatus::Running, "start")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }
}
