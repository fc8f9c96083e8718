use thiserror::Error;

/// Phases of a single dev server launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Spawning,
    Starting,
    Ready,
    Failed,
    TimedOut,
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Failed | Self::TimedOut)
    }
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(LaunchState, LaunchState),
}

pub struct StateMachine {
    module: String,
    pub state: LaunchState,
}

impl StateMachine {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            state: LaunchState::Spawning,
        }
    }

    pub fn can_transition(&self, to: &LaunchState) -> bool {
        matches!(
            (&self.state, to),
            (LaunchState::Spawning, LaunchState::Starting)
                | (LaunchState::Spawning, LaunchState::Failed)
                | (LaunchState::Starting, LaunchState::Ready)
                | (LaunchState::Starting, LaunchState::Failed)
                | (LaunchState::Starting, LaunchState::TimedOut)
        )
    }

    pub fn transition(&mut self, to: LaunchState) -> Result<(), TransitionError> {
        if self.can_transition(&to) {
            tracing::debug!("[{}] launch {:?} -> {:?}", self.module, self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions() {
        let mut sm = StateMachine::new("app");
        assert_eq!(sm.state, LaunchState::Spawning);
        assert!(sm.transition(LaunchState::Starting).is_ok());
        assert!(sm.transition(LaunchState::Ready).is_ok());
        assert!(sm.state.is_terminal());
    }

    #[test]
    fn spawn_failure_skips_starting() {
        let mut sm = StateMachine::new("app");
        assert!(sm.transition(LaunchState::Failed).is_ok());
    }

    #[test]
    fn terminal_states_are_final() {
        let mut sm = StateMachine::new("app");
        sm.transition(LaunchState::Starting).unwrap();
        sm.transition(LaunchState::TimedOut).unwrap();
        assert!(sm.transition(LaunchState::Ready).is_err());
        assert!(sm.transition(LaunchState::Starting).is_err());
    }

    #[test]
    fn invalid_transition() {
        let mut sm = StateMachine::new("app");
        // cannot be ready before the process is up
        assert!(sm.transition(LaunchState::Ready).is_err());
        assert!(sm.transition(LaunchState::TimedOut).is_err());
    }
}
