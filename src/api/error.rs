//! Mapping of run and boundary failures onto HTTP responses.
//!
//! | Failure | Status |
//! |---------|--------|
//! | `ValidationError` | 400 |
//! | `Timeout` | 504 |
//! | `Unreachable`, `RemoteError`, `ProtocolError`, `Cancelled` | 502 |
//! | anything internal | 500 |
//!
//! Every error body has the same shape:
//! `{"error": {"stage": .., "kind": .., "message": ..}}`, with `stage` set to
//! `"gateway"` when no stage was involved.

use crate::error::{FailureKind, GatewayError, StageFailure};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;

/// Stage name reported for failures that never reached a stage.
pub const GATEWAY_STAGE: &str = "gateway";

#[derive(Debug)]
pub enum ApiError {
    /// Rejected upload (400). No stage was called.
    Validation(String),
    /// The run ended in `Failed`.
    Stage(StageFailure),
    /// Bug or misconfiguration inside the gateway (500).
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: ErrorDetail<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail<'a> {
    stage: &'a str,
    kind: &'a str,
    message: &'a str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Stage(failure) => match failure.kind {
                FailureKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                FailureKind::ValidationError => StatusCode::BAD_REQUEST,
                FailureKind::Unreachable
                | FailureKind::RemoteError
                | FailureKind::ProtocolError
                | FailureKind::Cancelled => StatusCode::BAD_GATEWAY,
            },
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> ErrorDetail<'_> {
        match self {
            Self::Validation(message) => ErrorDetail {
                stage: GATEWAY_STAGE,
                kind: FailureKind::ValidationError.as_str(),
                message,
            },
            Self::Stage(failure) => ErrorDetail {
                stage: failure.stage.name(),
                kind: failure.kind.as_str(),
                message: &failure.message,
            },
            Self::Internal(message) => ErrorDetail {
                stage: GATEWAY_STAGE,
                kind: "InternalError",
                message,
            },
        }
    }

    /// The JSON body this error is rendered as.
    pub fn body(&self) -> serde_json::Value {
        serde_json::to_value(ErrorBody {
            error: self.detail(),
        })
        .unwrap_or_default()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation Error: {}", msg),
            Self::Stage(failure) => write!(f, "{}", failure),
            Self::Internal(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<StageFailure> for ApiError {
    fn from(failure: StageFailure) -> Self {
        Self::Stage(failure)
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidUpload(msg) => Self::Validation(msg),
            GatewayError::Stage(failure) => Self::Stage(failure),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!("{} → {}", self, status);
        } else {
            tracing::debug!("{} → {}", self, status);
        }
        (status, Json(self.body())).into_response()
    }
}
