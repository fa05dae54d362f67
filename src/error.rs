//! Error types for the cin-gateway library.
//!
//! Two tiers mirror the two ways a run can go wrong:
//!
//! * [`StageFailure`]: a structured `{stage, kind, message}` record produced
//!   by one remote stage call. On a single-point stage (detection,
//!   extraction, aggregation) it is the run's terminal failure; on a fan-out
//!   stage it is wrapped in a [`FieldWarning`] and the run continues without
//!   that field.
//!
//! * [`GatewayError`]: **fatal** setup or boundary errors: bad
//!   configuration, an unusable upload, an HTTP client that cannot be built.
//!   These never reach a remote stage.
//!
//! Every failure carries a [`FailureKind`] so callers branch on the kind
//! rather than on message text.

use crate::stage::StageKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of a failure, shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// Transport failure: connection refused, reset, per-call timeout.
    /// The only kind eligible for retry.
    Unreachable,
    /// The stage answered with a non-2xx status.
    RemoteError,
    /// The stage answered 2xx but the body was malformed or incomplete.
    ProtocolError,
    /// The run deadline expired before the call could finish.
    Timeout,
    /// The run was cancelled (client went away) or a sibling aborted the batch.
    Cancelled,
    /// The upload was rejected at the gateway; no stage was invoked.
    ValidationError,
}

impl FailureKind {
    /// Whether a call that failed with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Unreachable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Unreachable => "Unreachable",
            FailureKind::RemoteError => "RemoteError",
            FailureKind::ProtocolError => "ProtocolError",
            FailureKind::Timeout => "Timeout",
            FailureKind::Cancelled => "Cancelled",
            FailureKind::ValidationError => "ValidationError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one failed stage call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{stage} stage failed ({kind}): {message}")]
pub struct StageFailure {
    pub stage: StageKind,
    pub kind: FailureKind,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: StageKind, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, FailureKind::Unreachable, message)
    }

    pub fn remote(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, FailureKind::RemoteError, message)
    }

    pub fn protocol(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, FailureKind::ProtocolError, message)
    }

    pub fn timeout(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, FailureKind::Timeout, message)
    }

    pub fn cancelled(stage: StageKind, message: impl Into<String>) -> Self {
        Self::new(stage, FailureKind::Cancelled, message)
    }
}

/// A non-fatal, per-field failure reported alongside a successful run.
///
/// The field was dropped from downstream stages at `stage`; everything else
/// in the document was still aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWarning {
    pub field: String,
    pub stage: StageKind,
    pub kind: FailureKind,
    pub reason: String,
}

impl FieldWarning {
    pub fn from_failure(field: impl Into<String>, failure: StageFailure) -> Self {
        Self {
            field: field.into(),
            stage: failure.stage,
            kind: failure.kind,
            reason: failure.message,
        }
    }
}

/// All fatal errors returned by the cin-gateway library outside a run.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Configuration ─────────────────────────────────────────────────────
    /// Builder or file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::GatewayConfig`].
    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    // ── Boundary ──────────────────────────────────────────────────────────
    /// The uploaded document was rejected before any stage ran.
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// The shared outbound HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // ── Run ───────────────────────────────────────────────────────────────
    /// A run ended in the `Failed` state.
    #[error(transparent)]
    Stage(#[from] StageFailure),
}

impl GatewayError {
    /// The failure kind this error is reported as at the HTTP boundary.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            GatewayError::InvalidUpload(_) => Some(FailureKind::ValidationError),
            GatewayError::Stage(failure) => Some(failure.kind),
            _ => None,
        }
    }
}
