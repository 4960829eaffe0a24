//! Error types for the Rigtrack engine

use serde::Serialize;
use thiserror::Error;

use crate::models::enums::EquipmentStatus;

/// Stable numeric error codes surfaced to callers alongside the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Failure = 1,
    BadValue = 2,
    InvalidTransition = 3,
    NoSuchData = 4,
    NotAvailable = 5,
    Duplicate = 6,
    DbFailure = 7,
    Timeout = 8,
    RollbackFailure = 9,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: EquipmentStatus,
        to: EquipmentStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not available: {0}")]
    Availability(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Persistence-class failures may succeed on a later attempt; logical
    /// failures never will.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Persistence(_) | AppError::Database(_) | AppError::Timeout(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            AppError::NotFound(_) => ErrorCode::NoSuchData,
            AppError::Availability(_) => ErrorCode::NotAvailable,
            AppError::Conflict(_) => ErrorCode::Duplicate,
            AppError::Persistence(_) | AppError::Database(_) => ErrorCode::DbFailure,
            AppError::Timeout(_) => ErrorCode::Timeout,
            AppError::Rollback(_) => ErrorCode::RollbackFailure,
            AppError::Internal(_) => ErrorCode::Failure,
        }
    }

    /// Error summary passed through to callers verbatim
    pub fn summary(&self) -> ErrorSummary {
        let code = self.code();
        ErrorSummary {
            code: code as u32,
            error: format!("{:?}", code),
            message: self.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Serializable error summary
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub code: u32,
    pub error: String,
    pub message: String,
}

/// Result type alias for engine operations
pub type AppResult<T> = Result<T, AppError>;
