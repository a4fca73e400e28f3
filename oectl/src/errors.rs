use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

use crate::api::models::tasks::TaskStatus;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Task does not exist or belongs to a different API key. The two cases
    /// are deliberately indistinguishable.
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    /// Task result requested before the task completed
    #[error("Task {id} is not completed")]
    TaskNotReady { id: String },

    /// Cancellation requested for a task already in a terminal state
    #[error("Task {id} is already {status}")]
    CancellationConflict { id: String, status: TaskStatus },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::TaskNotFound { .. } => StatusCode::NOT_FOUND,
            Error::TaskNotReady { .. } => StatusCode::CONFLICT,
            Error::CancellationConflict { .. } => StatusCode::CONFLICT,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Internal { .. } => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::TaskNotReady { .. } | Error::CancellationConflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
            Error::TaskNotFound { .. } | Error::BadRequest { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        (self.status_code(), self.user_message()).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_taxonomy() {
        let not_found = Error::TaskNotFound { id: "t1".to_string() };
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let not_ready = Error::TaskNotReady { id: "t1".to_string() };
        assert_eq!(not_ready.status_code(), StatusCode::CONFLICT);

        let conflict = Error::CancellationConflict {
            id: "t1".to_string(),
            status: TaskStatus::Completed,
        };
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(conflict.to_string(), "Task t1 is already completed");

        let internal = Error::Internal {
            operation: "start worker pool".to_string(),
        };
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.user_message(), "Internal server error");
    }
}
