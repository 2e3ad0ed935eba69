//! Error types for the chat server
//!
//! Defines application-level errors and outbound queue send errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Covers both fatal errors (listener failure, hub gone) and
/// business errors whose text is relayed to the client as a notice.
#[derive(Debug, Error)]
pub enum AppError {
    /// IO error (listener or socket)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The hub loop has exited and accepts no more requests
    #[error("Hub is not running")]
    HubStopped,

    /// Requested nickname fails the syntax check
    #[error("Bad nick {0}, use 1-20 characters from a-z, A-Z, 0-9, '_' and '-'")]
    InvalidNickname(String),

    /// Requested nickname is held by another connection
    #[error("Error nick {0} is used")]
    NicknameInUse(String),

    /// The requesting connection is no longer registered
    #[error("Client {0} is not registered")]
    UnknownClient(crate::types::ClientId),

    /// Configuration rejected at startup
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A line could not be queued for a connection
    #[error("Outbound queue error: {0}")]
    Send(#[from] SendError),
}

/// Outbound queue send errors
///
/// `Full` means the enqueue would have blocked; `Closed` means the
/// connection's outbound loop is gone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    /// The queue is at capacity
    #[error("Channel full")]
    Full,

    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_business_error_text() {
        let err = AppError::NicknameInUse("Alice".to_string());
        assert_eq!(err.to_string(), "Error nick Alice is used");

        let err = AppError::InvalidNickname("a b".to_string());
        assert!(err.to_string().starts_with("Bad nick a b"));
    }
}
