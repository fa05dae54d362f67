//! Run observer: a hook for per-run lifecycle events.
//!
//! Attach an [`Arc<dyn RunObserver>`] with
//! [`crate::PipelineCoordinator::with_observer`] to receive state changes,
//! per-field failures and the final outcome of every run, e.g. to feed
//! metrics or an audit log without the coordinator knowing about either.
//!
//! # Example
//!
//! ```rust
//! use cin_gateway::{FieldWarning, RunObserver};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use uuid::Uuid;
//!
//! struct FailedFieldCounter(AtomicUsize);
//!
//! impl RunObserver for FailedFieldCounter {
//!     fn on_field_failed(&self, _run_id: Uuid, warning: &FieldWarning) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!         eprintln!("{} dropped at {}", warning.field, warning.stage);
//!     }
//! }
//! ```

use crate::coordinator::RunStats;
use crate::error::{FieldWarning, StageFailure};
use crate::pipeline::run::RunState;
use std::sync::Arc;
use uuid::Uuid;

/// Called by the coordinator as a run progresses.
///
/// Methods have no-op defaults. Many runs execute concurrently, so
/// implementations must synchronise any shared state.
pub trait RunObserver: Send + Sync {
    /// Called on every state-machine transition, including into `Failed`.
    fn on_state_change(&self, run_id: Uuid, from: RunState, to: RunState) {
        let _ = (run_id, from, to);
    }

    /// Called once per field dropped by preprocessing or recognition.
    fn on_field_failed(&self, run_id: Uuid, warning: &FieldWarning) {
        let _ = (run_id, warning);
    }

    /// Called once when the run reaches `Done` or `Failed`.
    fn on_run_finished(&self, run_id: Uuid, outcome: Result<&RunStats, &StageFailure>) {
        let _ = (run_id, outcome);
    }
}

/// The default observer.
pub struct NoopObserver;

impl RunObserver for NoopObserver {}

/// Shared handle stored by the coordinator.
pub type SharedObserver = Arc<dyn RunObserver>;
