//! Execution engine state machine.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    WorkspaceAcquired,
    Looping,
    StepExecuting,
    TaskExecuting,
    MarkingDone,
    Completed,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Completed | EngineState::Failed)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::WorkspaceAcquired => "workspace_acquired",
            EngineState::Looping => "looping",
            EngineState::StepExecuting => "step_executing",
            EngineState::TaskExecuting => "task_executing",
            EngineState::MarkingDone => "marking_done",
            EngineState::Completed => "completed",
            EngineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Legal transitions. Any non-terminal state may fail; terminal states are final.
pub fn can_transition(from: EngineState, to: EngineState) -> bool {
    use EngineState::{
        Completed, Failed, Idle, Looping, MarkingDone, StepExecuting, TaskExecuting,
        WorkspaceAcquired,
    };
    if from.is_terminal() {
        return false;
    }
    if to == Failed {
        return true;
    }
    matches!(
        (from, to),
        (Idle, WorkspaceAcquired)
            | (WorkspaceAcquired, Looping)
            | (Looping, StepExecuting)
            | (Looping, TaskExecuting)
            | (Looping, Completed)
            | (StepExecuting, MarkingDone)
            | (TaskExecuting, MarkingDone)
            | (MarkingDone, Looping)
            | (MarkingDone, Completed)
    )
}

/// Tracks the current state and rejects illegal moves.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: EngineState,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            current: EngineState::Idle,
        }
    }
}

impl StateTracker {
    pub fn current(&self) -> EngineState {
        self.current
    }

    pub fn advance(&mut self, to: EngineState) -> Result<(), String> {
        if !can_transition(self.current, to) {
            return Err(format!("illegal engine transition {} -> {}", self.current, to));
        }
        self.current = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_iteration_path_is_legal() {
        let mut tracker = StateTracker::default();
        for next in [
            EngineState::WorkspaceAcquired,
            EngineState::Looping,
            EngineState::StepExecuting,
            EngineState::MarkingDone,
            EngineState::Looping,
            EngineState::TaskExecuting,
            EngineState::MarkingDone,
            EngineState::Completed,
        ] {
            tracker.advance(next).expect("legal transition");
        }
        assert!(tracker.current().is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(!can_transition(EngineState::Completed, EngineState::Looping));
        assert!(!can_transition(EngineState::Failed, EngineState::Failed));
    }

    #[test]
    fn skipping_mark_done_is_rejected() {
        let mut tracker = StateTracker::default();
        tracker.advance(EngineState::WorkspaceAcquired).expect("acquire");
        tracker.advance(EngineState::Looping).expect("loop");
        tracker.advance(EngineState::StepExecuting).expect("exec");
        let err = tracker.advance(EngineState::Looping).unwrap_err();
        assert!(err.contains("step_executing -> looping"));
    }

    #[test]
    fn any_live_state_may_fail() {
        assert!(can_transition(EngineState::Idle, EngineState::Failed));
        assert!(can_transition(EngineState::MarkingDone, EngineState::Failed));
    }
}
