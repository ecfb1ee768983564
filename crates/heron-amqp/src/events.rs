//! Out-of-band failure reporting.
//!
//! Failures with no waiting caller (ack failures, handler panics, reply
//! publish failures) are emitted on the transport's error-event channel;
//! the owning process decides whether they are fatal.

use heron_errors::Error;

/// A failure that occurred outside the synchronous call/response path.
///
/// `correlation_id` is empty when the delivery carried none.
#[derive(Debug)]
pub enum ErrorEvent {
    /// Acknowledging a delivery failed after the handler ran.
    AckFailed {
        name: String,
        correlation_id: String,
        error: String,
    },
    /// A handler returned an error; no reply was published.
    HandlerFailed {
        name: String,
        correlation_id: String,
        error: Error,
    },
    /// A handler panicked; the delivery was still acknowledged and the
    /// consumer loop kept running.
    HandlerPanicked {
        name: String,
        correlation_id: String,
        message: String,
    },
    /// A handler succeeded with an empty body — a protocol violation for a
    /// pure call/response transport.
    EmptyResponse {
        name: String,
        correlation_id: String,
    },
    /// A request arrived without a reply address to publish the response to.
    MissingReplyAddress {
        name: String,
        correlation_id: String,
    },
    /// Publishing the handler's response failed.
    ReplyPublishFailed {
        name: String,
        correlation_id: String,
        error: String,
    },
    /// A subscription's consumer stream reported a broker-level error.
    ConsumerFailed { name: String, error: String },
    /// The broker connection was lost; the transport is reconnecting.
    ConnectionLost { error: String },
    /// Re-establishing a subscription after a reconnect failed.
    ResubscribeFailed { name: String, error: String },
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AckFailed {
                name,
                correlation_id,
                error,
            } => write!(f, "ack failed on {name} ({correlation_id}): {error}"),
            Self::HandlerFailed {
                name,
                correlation_id,
                error,
            } => write!(f, "handler failed on {name} ({correlation_id}): {error}"),
            Self::HandlerPanicked {
                name,
                correlation_id,
                message,
            } => write!(f, "handler panicked on {name} ({correlation_id}): {message}"),
            Self::EmptyResponse {
                name,
                correlation_id,
            } => write!(f, "empty response and no error on {name} ({correlation_id})"),
            Self::MissingReplyAddress {
                name,
                correlation_id,
            } => write!(f, "no reply address on {name} ({correlation_id})"),
            Self::ReplyPublishFailed {
                name,
                correlation_id,
                error,
            } => write!(
                f,
                "reply publish failed on {name} ({correlation_id}): {error}"
            ),
            Self::ConsumerFailed { name, error } => {
                write!(f, "consumer failed on {name}: {error}")
            }
            Self::ConnectionLost { error } => write!(f, "connection lost: {error}"),
            Self::ResubscribeFailed { name, error } => {
                write!(f, "resubscribe failed on {name}: {error}")
            }
        }
    }
}
