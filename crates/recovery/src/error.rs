//! Recovery error types

use thiserror::Error;

/// Errors raised by the recovery pipeline
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Malformed event or invalid field; nothing was written
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Every delivery channel rejected the message
    #[error("Message delivery failed: {0}")]
    Delivery(String),

    /// The messaging provider could not be reached at all
    #[error("Message delivery transport error: {0}")]
    DeliveryTransport(String),

    /// An external collaborator (account activity, directory) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RecoveryError {
    /// Storage failures are fatal to the current request
    pub fn is_storage(&self) -> bool {
        matches!(self, RecoveryError::Database(_))
    }
}

impl From<sqlx::Error> for RecoveryError {
    fn from(e: sqlx::Error) -> Self {
        RecoveryError::Database(e.to_string())
    }
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
