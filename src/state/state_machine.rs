use thiserror::Error;
use uuid::Uuid;

use crate::dao::models::SessionStatus;

/// Phases a live session goes through. `order` is the 1-based playable question position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for the host to start; participants may join.
    Idle,
    /// Start countdown running.
    Starting,
    /// Question text shown, reading countdown running.
    Questioning { order: u32 },
    /// Question media playing.
    Media { order: u32 },
    /// Options shown, answers accepted.
    Answering { order: u32 },
    /// Answering closed; correct answer and distribution shown.
    RevealingAnswer { order: u32 },
    /// Standings shown between two questions.
    Leaderboard { order: u32 },
    /// Final standings shown.
    Concluding,
    /// Teardown in progress.
    Ending,
    /// Terminal.
    Ended,
}

impl SessionPhase {
    /// Persisted status matching the phase.
    pub fn status(self) -> SessionStatus {
        match self {
            SessionPhase::Idle => SessionStatus::Idle,
            SessionPhase::Starting => SessionStatus::Starting,
            SessionPhase::Questioning { .. } => SessionStatus::Questioning,
            SessionPhase::Media { .. } => SessionStatus::Media,
            SessionPhase::Answering { .. } => SessionStatus::Answering,
            SessionPhase::RevealingAnswer { .. } => SessionStatus::RevealingAnswer,
            SessionPhase::Leaderboard { .. } => SessionStatus::Leaderboard,
            SessionPhase::Concluding => SessionStatus::Concluding,
            SessionPhase::Ending => SessionStatus::Ending,
            SessionPhase::Ended => SessionStatus::Ended,
        }
    }

    /// Question order attached to the phase, if any.
    pub fn order(self) -> Option<u32> {
        match self {
            SessionPhase::Questioning { order }
            | SessionPhase::Media { order }
            | SessionPhase::Answering { order }
            | SessionPhase::RevealingAnswer { order }
            | SessionPhase::Leaderboard { order } => Some(order),
            _ => None,
        }
    }

    /// Whether the session has started its teardown.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Ending | SessionPhase::Ended)
    }
}

/// Events that can be applied to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Host starts the session.
    Start,
    /// Start countdown reached zero.
    StartCountdownElapsed,
    /// Reading countdown reached zero; `has_media` decides whether media plays first.
    ReadingElapsed { has_media: bool },
    /// Media duration elapsed.
    MediaElapsed,
    /// Answer time ran out or every participant answered.
    AnsweringClosed,
    /// Host moves on after a reveal or a leaderboard.
    Next,
    /// Session is being ended (host, timeout or failure).
    End,
    /// Teardown finished.
    Finalize,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub event: SessionEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("a transition is already pending")]
    AlreadyPending,
    #[error(transparent)]
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("no transition is pending")]
    NoPending,
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch { expected: PlanId, got: PlanId },
    #[error("phase changed since planning (expected {expected:?}, got {actual:?})")]
    PhaseMismatch {
        expected: SessionPhase,
        actual: SessionPhase,
    },
    #[error("version changed since planning (expected {expected}, got {actual})")]
    VersionMismatch { expected: usize, actual: usize },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortError {
    #[error("no transition is pending")]
    NoPending,
    #[error("plan {got} does not match pending plan {expected}")]
    IdMismatch { expected: PlanId, got: PlanId },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A planned state machine transition that has been validated but not yet applied.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: PlanId,
    pub from: SessionPhase,
    pub to: SessionPhase,
    pub event: SessionEvent,
    /// Version number after applying this transition.
    pub version_next: usize,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub phase: SessionPhase,
    pub version: usize,
    pub pending: Option<SessionPhase>,
}

/// Lifecycle of one live session.
///
/// Transitions are planned first, side effects run, then the plan is applied
/// (or aborted when a side effect fails).
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    version: usize,
    pending: Option<Plan>,
    question_count: u32,
    leaderboard_between: bool,
}

impl SessionStateMachine {
    /// Machine for a session of `question_count` playable questions.
    pub fn new(question_count: u32, leaderboard_between: bool) -> Self {
        Self {
            phase: SessionPhase::Idle,
            version: 0,
            pending: None,
            question_count,
            leaderboard_between,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn question_count(&self) -> u32 {
        self.question_count
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.pending.as_ref().map(|plan| plan.to),
        }
    }

    /// Validate `event` against the current phase and reserve the transition.
    pub fn plan(&mut self, event: SessionEvent) -> Result<Plan, PlanError> {
        if self.pending.is_some() {
            return Err(PlanError::AlreadyPending);
        }

        let next = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to: next,
            event,
            version_next: self.version + 1,
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected,
                got: plan_id,
            });
        }

        if self.phase != plan.from {
            return Err(ApplyError::PhaseMismatch {
                expected: plan.from,
                actual: self.phase,
            });
        }

        if self.version + 1 != plan.version_next {
            return Err(ApplyError::VersionMismatch {
                expected: plan.version_next,
                actual: self.version + 1,
            });
        }

        self.phase = plan.to;
        self.version = plan.version_next;

        Ok(self.phase)
    }

    /// Drop a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    fn after_question(&self, order: u32) -> SessionPhase {
        if order < self.question_count {
            SessionPhase::Questioning { order: order + 1 }
        } else {
            SessionPhase::Concluding
        }
    }

    fn compute_transition(&self, event: SessionEvent) -> Result<SessionPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (SessionPhase::Idle, SessionEvent::Start) => SessionPhase::Starting,
            (SessionPhase::Starting, SessionEvent::StartCountdownElapsed) => self.after_question(0),
            (SessionPhase::Questioning { order }, SessionEvent::ReadingElapsed { has_media }) => {
                if has_media {
                    SessionPhase::Media { order }
                } else {
                    SessionPhase::Answering { order }
                }
            }
            (SessionPhase::Media { order }, SessionEvent::MediaElapsed) => {
                SessionPhase::Answering { order }
            }
            (SessionPhase::Answering { order }, SessionEvent::AnsweringClosed) => {
                SessionPhase::RevealingAnswer { order }
            }
            (SessionPhase::RevealingAnswer { order }, SessionEvent::Next) => {
                if self.leaderboard_between {
                    SessionPhase::Leaderboard { order }
                } else {
                    self.after_question(order)
                }
            }
            (SessionPhase::Leaderboard { order }, SessionEvent::Next) => self.after_question(order),
            (from, SessionEvent::End) if !from.is_terminal() => SessionPhase::Ending,
            (SessionPhase::Ending, SessionEvent::Finalize) => SessionPhase::Ended,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}
