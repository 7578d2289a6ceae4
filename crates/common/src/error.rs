//! Error types for MailProof

use thiserror::Error;

/// Result type alias using MailProof Error
pub type Result<T> = std::result::Result<T, Error>;

/// MailProof error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid {entity}: {message}")]
    Validation {
        entity: &'static str,
        message: String,
    },

    #[error("Invalid {entity} state transition: cannot {action} while '{current}' (requires {required})")]
    InvalidStateTransition {
        entity: &'static str,
        action: &'static str,
        current: String,
        required: String,
    },

    #[error("Retry budget exhausted for screenshot {screenshot_id}: {retry_count}/{max_retries} retries used")]
    RetryExhausted {
        screenshot_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Aggregator channel closed for job {0}")]
    ChannelClosed(String),
}

impl Error {
    /// Build an invariant violation for `entity`
    pub fn validation(entity: &'static str, message: impl Into<String>) -> Self {
        Error::Validation {
            entity,
            message: message.into(),
        }
    }

    /// Build an invalid transition error naming the current and required states
    pub fn transition(
        entity: &'static str,
        action: &'static str,
        current: impl std::fmt::Display,
        required: impl Into<String>,
    ) -> Self {
        Error::InvalidStateTransition {
            entity,
            action,
            current: current.to_string(),
            required: required.into(),
        }
    }

    pub fn not_found(kind: &str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_message_names_both_states() {
        let err = Error::transition("render job", "complete", "queued", "'processing'");
        let msg = err.to_string();
        assert!(msg.contains("queued"));
        assert!(msg.contains("processing"));
    }

    #[test]
    fn test_not_found_message() {
        let err = Error::not_found("email client", "gmail");
        assert_eq!(err.to_string(), "Resource not found: email client with id gmail");
    }
}
