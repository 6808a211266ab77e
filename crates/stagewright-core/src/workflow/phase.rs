//! Per-run phase tracking.
//!
//! ```text
//! NotStarted -> Running | Resumed
//! Resumed    -> Running
//! Running    -> StepRunning -> StepCheckpointed -> [GateEvaluating] -> Advancing
//! GateEvaluating -> Advancing | Blocked | Escalated
//! Advancing  -> StepRunning | Completed
//! Escalated  -> Resumed (after a decision)
//! any non-terminal -> Failed | Cancelled
//! ```

use std::fmt;

use stagewright_types::run::RunStatus;
use uuid::Uuid;

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NotStarted,
    Running,
    Resumed,
    StepRunning,
    StepCheckpointed,
    GateEvaluating,
    Advancing,
    Blocked,
    Escalated,
    Completed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::NotStarted => "not_started",
            RunPhase::Running => "running",
            RunPhase::Resumed => "resumed",
            RunPhase::StepRunning => "step_running",
            RunPhase::StepCheckpointed => "step_checkpointed",
            RunPhase::GateEvaluating => "gate_evaluating",
            RunPhase::Advancing => "advancing",
            RunPhase::Blocked => "blocked",
            RunPhase::Escalated => "escalated",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Completed | RunPhase::Failed | RunPhase::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Cancelled) {
            // Escalated runs only leave through a decision.
            return *self != Escalated || next == Failed;
        }
        matches!(
            (self, next),
            (NotStarted, Running)
                | (NotStarted, Resumed)
                | (Resumed, Running)
                | (Running, StepRunning)
                | (Running, Completed)
                | (StepRunning, StepCheckpointed)
                | (StepRunning, Advancing)
                | (StepCheckpointed, GateEvaluating)
                | (StepCheckpointed, Advancing)
                | (GateEvaluating, Advancing)
                | (GateEvaluating, Blocked)
                | (GateEvaluating, Escalated)
                | (Advancing, StepRunning)
                | (Advancing, Completed)
                | (Escalated, Resumed)
        )
    }

    /// The persisted run status this phase corresponds to.
    pub fn run_status(&self) -> RunStatus {
        match self {
            RunPhase::Completed => RunStatus::Completed,
            RunPhase::Failed | RunPhase::Blocked => RunStatus::Failed,
            RunPhase::Escalated => RunStatus::Escalated,
            RunPhase::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Running,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An illegal phase transition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal run phase transition {from} -> {to}")]
pub struct PhaseError {
    pub from: RunPhase,
    pub to: RunPhase,
}

/// Tracks one run's phase and rejects illegal transitions.
#[derive(Debug)]
pub struct RunPhaseTracker {
    run_id: Uuid,
    phase: RunPhase,
    history: Vec<RunPhase>,
}

impl RunPhaseTracker {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            phase: RunPhase::NotStarted,
            history: vec![RunPhase::NotStarted],
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn transition(&mut self, next: RunPhase) -> Result<(), PhaseError> {
        if !self.phase.can_transition_to(next) {
            return Err(PhaseError {
                from: self.phase,
                to: next,
            });
        }
        tracing::debug!(run_id = %self.run_id, from = %self.phase, to = %next, "run phase transition");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RunPhase::*;

    #[test]
    fn happy_path_with_gate() {
        let mut t = RunPhaseTracker::new(Uuid::now_v7());
        for next in [
            Running,
            StepRunning,
            StepCheckpointed,
            GateEvaluating,
            Advancing,
            StepRunning,
            StepCheckpointed,
            Advancing,
            Completed,
        ] {
            t.transition(next).unwrap();
        }
        assert_eq!(t.phase(), Completed);
        assert_eq!(t.phase().run_status(), RunStatus::Completed);
        assert_eq!(t.history().len(), 10);
    }

    #[test]
    fn escalation_then_resume() {
        let mut t = RunPhaseTracker::new(Uuid::now_v7());
        for next in [Running, StepRunning, StepCheckpointed, GateEvaluating, Escalated] {
            t.transition(next).unwrap();
        }
        assert_eq!(t.phase().run_status(), RunStatus::Escalated);
        assert!(t.transition(Cancelled).is_err());
        t.transition(Resumed).unwrap();
        t.transition(Running).unwrap();
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut t = RunPhaseTracker::new(Uuid::now_v7());
        let err = t.transition(GateEvaluating).unwrap_err();
        assert_eq!(err, PhaseError { from: NotStarted, to: GateEvaluating });

        t.transition(Running).unwrap();
        t.transition(Failed).unwrap();
        assert!(t.transition(Running).is_err());
        assert!(t.transition(Failed).is_err());
    }

    #[test]
    fn blocked_maps_to_failed_status() {
        assert_eq!(Blocked.run_status(), RunStatus::Failed);
        assert!(Blocked.can_transition_to(Failed));
        assert!(!Blocked.can_transition_to(Advancing));
    }
}
