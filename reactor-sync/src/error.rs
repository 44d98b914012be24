//! Error types for sync channels.

use reactor_server::{ReactorError, StorageError};
use reactor_types::{ErrorCode, WireError};
use std::fmt;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Request could not be sent or the response not read.
    #[error("request failed: {0}")]
    Request(String),

    /// The remote answered with a non-success HTTP status.
    #[error("remote returned HTTP {0}")]
    Status(u16),

    /// Request timed out.
    #[error("request timed out")]
    Timeout,

    /// The transport is closed or has nothing to answer with.
    #[error("transport closed")]
    Closed,

    /// Message could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Which layer a channel error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The poll loop
    Polling,
    /// A request/response exchange
    Rpc,
    /// The remote reactor
    Remote,
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorSource::Polling => "polling",
            ErrorSource::Rpc => "rpc",
            ErrorSource::Remote => "remote",
        })
    }
}

/// What went wrong in a channel.
#[derive(Debug, Error)]
pub enum ChannelCause {
    /// The exchange itself failed. Retryable.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The remote refused the request.
    #[error("{code:?}: {message}")]
    Rejected {
        /// Remote error code
        code: ErrorCode,
        /// Remote description
        message: String,
    },

    /// The remote answered with the wrong message type.
    #[error("expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Message type expected
        expected: &'static str,
        /// Message type received
        actual: &'static str,
    },

    /// No remote listener to pull from.
    #[error("channel has no remote listener")]
    NotRegistered,

    /// Handing strands to the local reactor failed in a way worth retrying.
    #[error("local failure: {0}")]
    Local(String),
}

/// Channel failure tagged with its source.
#[derive(Debug)]
pub struct ChannelError {
    /// Where it happened
    pub source: ErrorSource,
    /// What happened
    pub cause: ChannelCause,
}

// `source` is a tag here, not the underlying error.
impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} channel error: {}", self.source, self.cause)
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl ChannelError {
    /// Tag a cause.
    pub fn new(source: ErrorSource, cause: impl Into<ChannelCause>) -> Self {
        Self {
            source,
            cause: cause.into(),
        }
    }

    /// Same cause, new tag.
    pub fn retag(self, source: ErrorSource) -> Self {
        Self { source, ..self }
    }

    /// Transport failures, local failures and remote internal errors are
    /// worth retrying; rejections are not.
    pub fn is_retryable(&self) -> bool {
        match &self.cause {
            ChannelCause::Transport(_) | ChannelCause::Local(_) => true,
            ChannelCause::Rejected { code, .. } => *code == ErrorCode::Internal,
            ChannelCause::UnexpectedResponse { .. } | ChannelCause::NotRegistered => false,
        }
    }

    /// True when the exchange itself failed.
    pub fn is_transport(&self) -> bool {
        matches!(self.cause, ChannelCause::Transport(_))
    }

    /// True when the remote does not know the listener.
    pub fn is_unknown_listener(&self) -> bool {
        matches!(
            self.cause,
            ChannelCause::Rejected {
                code: ErrorCode::UnknownListener,
                ..
            }
        )
    }
}

/// Coordinator errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No remote with this name.
    #[error("unknown remote: {0}")]
    UnknownRemote(String),

    /// A remote with this name is already added.
    #[error("remote already added: {0}")]
    DuplicateRemote(String),

    /// Channel failure.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Local reactor failure.
    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_source() {
        let err = ChannelError::new(ErrorSource::Polling, TransportError::Timeout);
        assert_eq!(err.to_string(), "polling channel error: request timed out");
    }

    #[test]
    fn rejections_are_not_retried() {
        let rejected = ChannelError::new(
            ErrorSource::Remote,
            ChannelCause::Rejected {
                code: ErrorCode::BadRequest,
                message: "nope".into(),
            },
        );
        assert!(!rejected.is_retryable());

        let internal = ChannelError::new(
            ErrorSource::Remote,
            ChannelCause::Rejected {
                code: ErrorCode::Internal,
                message: "busy".into(),
            },
        );
        assert!(internal.is_retryable());
        assert!(!internal.is_transport());

        let transport = ChannelError::new(ErrorSource::Rpc, TransportError::Closed);
        assert!(transport.is_retryable());
        assert!(transport.retag(ErrorSource::Polling).is_transport());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ChannelError>();
        assert_send_sync::<SyncError>();
    }
}
