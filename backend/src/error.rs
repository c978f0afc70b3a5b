use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use exchange_core::MatchError;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinError;

/// Failure writing the participant snapshot to disk.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] MatchError),
    #[error("roster task failed: {0}")]
    Task(#[from] JoinError),
}

/// Central error type for the exchange API
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Match(#[from] MatchError),

    /// The exchange was computed and applied in memory but could not be stored.
    #[error("assignment made but not saved: {0}")]
    MatchedButNotSaved(#[source] PersistError),

    #[error("storage error: {0}")]
    Storage(#[from] PersistError),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<JoinError> for AppError {
    fn from(err: JoinError) -> Self {
        AppError::Internal(anyhow::Error::new(err).context("roster task failed"))
    }
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Match(err) => {
                let (status, code) = match err {
                    MatchError::InsufficientParticipants { .. } => {
                        (StatusCode::BAD_REQUEST, "INSUFFICIENT_PARTICIPANTS")
                    }
                    MatchError::MissingFamily { .. } => (StatusCode::BAD_REQUEST, "MISSING_FAMILY"),
                    MatchError::NoEligibleRecipient { .. } => {
                        (StatusCode::CONFLICT, "NO_ELIGIBLE_RECIPIENT")
                    }
                    MatchError::Infeasible { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "INFEASIBLE"),
                    MatchError::StepBudgetExceeded { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "SEARCH_BUDGET_EXCEEDED")
                    }
                    MatchError::UnknownParticipant(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                    MatchError::DuplicateParticipant(_) => {
                        (StatusCode::CONFLICT, "DUPLICATE_PARTICIPANT")
                    }
                    MatchError::InvalidAssignment(_) | MatchError::LockPoisoned(_) => {
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "INTERNAL_ERROR",
                            "Internal server error".to_string(),
                        )
                    }
                };
                (status, code, err.to_string())
            }
            AppError::MatchedButNotSaved(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "MATCHED_NOT_SAVED",
                "The assignment was made but could not be saved".to_string(),
            ),
            AppError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "STORAGE_ERROR",
                "Could not save participants".to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        } else {
            tracing::warn!(error = %self, code, "request rejected");
        }

        let body = Json(json!({
            "error": code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_failures_map_to_distinct_codes() {
        let cases = [
            (
                MatchError::InsufficientParticipants { count: 1 },
                StatusCode::BAD_REQUEST,
                "INSUFFICIENT_PARTICIPANTS",
            ),
            (
                MatchError::Infeasible { participants: 2 },
                StatusCode::UNPROCESSABLE_ENTITY,
                "INFEASIBLE",
            ),
            (
                MatchError::NoEligibleRecipient { giver: "a".into() },
                StatusCode::CONFLICT,
                "NO_ELIGIBLE_RECIPIENT",
            ),
            (
                MatchError::StepBudgetExceeded { steps: 10 },
                StatusCode::SERVICE_UNAVAILABLE,
                "SEARCH_BUDGET_EXCEEDED",
            ),
            (
                MatchError::LockPoisoned("roster.add"),
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
            ),
        ];
        for (err, status, code) in cases {
            let (got_status, got_code, _) = AppError::from(err).parts();
            assert_eq!(got_status, status);
            assert_eq!(got_code, code);
        }
    }

    #[test]
    fn unsaved_match_is_not_infeasible() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let (status, code, _) = AppError::MatchedButNotSaved(PersistError::Io(io)).parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(code, "MATCHED_NOT_SAVED");
    }
}
