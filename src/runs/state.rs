use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Queued,
    Initializing,
    Running,
    Complete,
    ExecutorError,
    Canceled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Complete | RunState::ExecutorError | RunState::Canceled
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (RunState::Queued, RunState::Initializing)
                | (RunState::Queued, RunState::Running)
                | (RunState::Queued, RunState::ExecutorError)
                | (RunState::Queued, RunState::Canceled)
                | (RunState::Initializing, RunState::Running)
                | (RunState::Initializing, RunState::ExecutorError)
                | (RunState::Initializing, RunState::Canceled)
                | (RunState::Running, RunState::Complete)
                | (RunState::Running, RunState::ExecutorError)
                | (RunState::Running, RunState::Canceled)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Queued => write!(f, "QUEUED"),
            RunState::Initializing => write!(f, "INITIALIZING"),
            RunState::Running => write!(f, "RUNNING"),
            RunState::Complete => write!(f, "COMPLETE"),
            RunState::ExecutorError => write!(f, "EXECUTOR_ERROR"),
            RunState::Canceled => write!(f, "CANCELED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_terminal() {
        assert!(RunState::Complete.is_terminal());
        assert!(RunState::ExecutorError.is_terminal());
        assert!(RunState::Canceled.is_terminal());
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Initializing.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }

    #[test]
    fn transitions_only_move_forward() {
        assert!(RunState::Queued.can_transition_to(RunState::Initializing));
        assert!(RunState::Initializing.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Complete));
        assert!(RunState::Running.can_transition_to(RunState::Canceled));

        assert!(!RunState::Running.can_transition_to(RunState::Queued));
        assert!(!RunState::Complete.can_transition_to(RunState::Running));
        assert!(!RunState::Canceled.can_transition_to(RunState::Complete));
        assert!(!RunState::ExecutorError.can_transition_to(RunState::Complete));
    }

    #[test]
    fn serializes_with_wire_tokens() {
        let encoded = serde_json::to_string(&RunState::ExecutorError).expect("encode");
        assert_eq!(encoded, "\"EXECUTOR_ERROR\"");
        let decoded: RunState = serde_json::from_str("\"CANCELED\"").expect("decode");
        assert_eq!(decoded, RunState::Canceled);
        assert_eq!(RunState::Complete.to_string(), "COMPLETE");
    }
}
