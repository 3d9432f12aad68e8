//! Workflow phase machine: explicit phases and legal transition guards.
//!
//! The engine loop calls `advance()` to move between phases. Each call
//! validates the edge against the phase graph and records it, so a
//! finished workflow carries an auditable transition log and an illegal
//! edge is a hard error rather than silent state drift. The engine is
//! the only writer of `MigrationState.phase`; workers never touch it.

use std::fmt;
use std::time::Instant;

use modernizer_core::Phase;
use serde::{Deserialize, Serialize};

/// Legal transitions between workflow phases.
///
/// ```text
/// Planning   → Validating | Failed
/// Validating → Deploying | Analyzing | Escalated | Failed
/// Analyzing  → Validating | Escalated | Failed
/// Deploying  → Succeeded | Failed
/// ```
fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    // Cancellation and internal errors can fail any live workflow.
    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Planning, Validating)
            // Validation verdict routes three ways: success deploys,
            // failure analyzes while budget remains, else escalates.
            | (Validating, Deploying)
            | (Validating, Analyzing)
            | (Validating, Escalated)
            // A diagnosis with an applicable patch re-validates; one
            // without escalates.
            | (Analyzing, Validating)
            | (Analyzing, Escalated)
            | (Deploying, Succeeded)
    )
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    /// Retry counter at the time of transition.
    pub retries_used: u32,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal phase transition: {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// The phase machine for one workflow.
#[derive(Debug)]
pub struct PhaseMachine {
    current: Phase,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl PhaseMachine {
    /// A machine starting at the given phase (resume re-enters the
    /// persisted phase rather than Planning).
    pub fn starting_at(phase: Phase) -> Self {
        Self {
            current: phase,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn new() -> Self {
        Self::starting_at(Phase::Planning)
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    /// Attempt to advance to the next phase.
    pub fn advance(
        &mut self,
        to: Phase,
        retries_used: u32,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            retries_used,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(str::to_string),
        });
        self.current = to;
        Ok(())
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Exactly one terminal phase may ever be entered.
    pub fn terminal_count(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.to.is_terminal())
            .count()
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        let mut machine = PhaseMachine::new();
        machine.advance(Phase::Validating, 0, None).unwrap();
        machine.advance(Phase::Deploying, 0, Some("outcome ok")).unwrap();
        machine.advance(Phase::Succeeded, 0, Some("pr opened")).unwrap();
        assert_eq!(machine.current(), Phase::Succeeded);
        assert_eq!(machine.transitions().len(), 3);
        assert_eq!(machine.terminal_count(), 1);
    }

    #[test]
    fn retry_loop_is_legal() {
        let mut machine = PhaseMachine::new();
        machine.advance(Phase::Validating, 0, None).unwrap();
        machine.advance(Phase::Analyzing, 0, Some("outcome not ok")).unwrap();
        machine.advance(Phase::Validating, 1, Some("patch applied")).unwrap();
        machine.advance(Phase::Escalated, 1, Some("budget exhausted")).unwrap();
        assert_eq!(machine.current(), Phase::Escalated);
    }

    #[test]
    fn planning_cannot_jump_to_deploying() {
        let mut machine = PhaseMachine::new();
        let err = machine.advance(Phase::Deploying, 0, None).unwrap_err();
        assert_eq!(err.from, Phase::Planning);
        assert_eq!(err.to, Phase::Deploying);
        // The failed attempt is not recorded.
        assert!(machine.transitions().is_empty());
    }

    #[test]
    fn any_live_phase_can_fail() {
        for phase in [
            Phase::Planning,
            Phase::Validating,
            Phase::Analyzing,
            Phase::Deploying,
        ] {
            let mut machine = PhaseMachine::starting_at(phase);
            machine.advance(Phase::Failed, 0, Some("canceled")).unwrap();
        }
    }

    #[test]
    fn terminal_phases_accept_nothing() {
        for terminal in [Phase::Succeeded, Phase::Failed, Phase::Escalated] {
            let mut machine = PhaseMachine::starting_at(terminal);
            assert!(machine.advance(Phase::Planning, 0, None).is_err());
            assert!(machine.advance(Phase::Failed, 0, None).is_err());
        }
    }

    #[test]
    fn transition_log_records_reasons() {
        let mut machine = PhaseMachine::new();
        machine
            .advance(Phase::Validating, 0, Some("plan produced"))
            .unwrap();
        assert_eq!(
            machine.transitions()[0].reason.as_deref(),
            Some("plan produced")
        );
    }
}
