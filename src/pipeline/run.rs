//! Per-run state: the state machine, the deadline, the cancellation signal
//! and the accumulated field warnings.
//!
//! A [`PipelineRun`] is created when a document arrives and dropped when the
//! response is written. Nothing in it is shared with other runs.

use crate::error::{FieldWarning, StageFailure};
use crate::stage::StageKind;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where a run is in the five-stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Detecting,
    Extracting,
    Preprocessing,
    Recognizing,
    Aggregating,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// The state a run is in while `stage` is being called.
    pub fn for_stage(stage: StageKind) -> Self {
        match stage {
            StageKind::Detection => RunState::Detecting,
            StageKind::Extraction => RunState::Extracting,
            StageKind::Preprocessing => RunState::Preprocessing,
            StageKind::Recognition => RunState::Recognizing,
            StageKind::Aggregation => RunState::Aggregating,
        }
    }

    /// The legal successor in the happy path, if any.
    fn next(self) -> Option<RunState> {
        match self {
            RunState::Idle => Some(RunState::Detecting),
            RunState::Detecting => Some(RunState::Extracting),
            RunState::Extracting => Some(RunState::Preprocessing),
            RunState::Preprocessing => Some(RunState::Recognizing),
            RunState::Recognizing => Some(RunState::Aggregating),
            RunState::Aggregating => Some(RunState::Done),
            RunState::Done | RunState::Failed => None,
        }
    }

    /// `Failed` is reachable from every non-terminal state; otherwise only
    /// the next state in the sequence is.
    pub fn can_transition_to(self, to: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == RunState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The time and cancellation envelope a stage call must respect.
///
/// Cheap to clone; clones share the same cancellation token.
#[derive(Debug, Clone)]
pub struct RunBudget {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl RunBudget {
    pub fn new(deadline: Instant, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    /// A budget expiring `timeout` from now with a fresh token.
    pub fn from_now(timeout: Duration) -> Self {
        Self::new(Instant::now() + timeout, CancellationToken::new())
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Same deadline; a token that is cancelled with this one but can also be
    /// cancelled on its own without touching the parent.
    pub fn child(&self) -> Self {
        Self::new(self.deadline, self.cancel.child_token())
    }
}

/// The unit of work for one document.
#[derive(Debug)]
pub struct PipelineRun {
    pub id: Uuid,
    state: RunState,
    started: Instant,
    budget: RunBudget,
    finalize_deadline: Instant,
    warnings: Vec<FieldWarning>,
}

impl PipelineRun {
    /// Start a run whose deadline is `deadline` from now. Aggregation may
    /// run until `deadline + finalize_grace`.
    pub fn new(deadline: Duration, finalize_grace: Duration, cancel: CancellationToken) -> Self {
        let started = Instant::now();
        let deadline = started + deadline;
        Self {
            id: Uuid::new_v4(),
            state: RunState::Idle,
            started,
            budget: RunBudget::new(deadline, cancel),
            finalize_deadline: deadline + finalize_grace,
            warnings: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Move to `to`, returning the previous state.
    ///
    /// An illegal transition is reported as a protocol error against `stage`
    /// rather than panicking.
    pub fn transition(&mut self, to: RunState, stage: StageKind) -> Result<RunState, StageFailure> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(StageFailure::protocol(
                stage,
                format!("illegal run transition {from} -> {to}"),
            ));
        }
        self.state = to;
        Ok(from)
    }

    /// Budget for detection, extraction and the fan-out stages.
    pub fn budget(&self) -> RunBudget {
        self.budget.clone()
    }

    /// Budget for aggregation: the run deadline plus the finalisation grace.
    pub fn finalize_budget(&self) -> RunBudget {
        RunBudget::new(self.finalize_deadline, self.budget.cancel.clone())
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.budget.cancel
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_warning(&mut self, warning: FieldWarning) {
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[FieldWarning] {
        &self.warnings
    }

    /// Hand the warnings over, sorted by field name.
    pub fn take_warnings(&mut self) -> Vec<FieldWarning> {
        let mut warnings = std::mem::take(&mut self.warnings);
        warnings.sort_by(|a, b| a.field.cmp(&b.field));
        warnings
    }
}
