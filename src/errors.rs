// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Layer
//!
//! Two error families live here. `AmqpError` describes what went wrong while talking to
//! the broker transport (connections, channels, declarations, publishing, consuming).
//! `MessagingError` is what callers of the public API observe: a connectivity failure,
//! a reply timeout, a malformed address or payload, or a misuse of a closed resource.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Only [`AmqpError::ShutdownSignal`] is treated as a stale-channel condition worth a
/// foreground retry; everything else propagates as is.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The connection was closed on purpose and will not be re-established
    #[error("connection closed")]
    ConnectionClosedError,

    /// The channel or its connection was shut down underneath the caller
    #[error("channel shutdown `{0}`")]
    ShutdownSignal(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error closing a channel or a connection
    #[error("failure to close `{0}`")]
    CloseChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// Whether the failure means the channel (or its connection) is gone and a fresh
    /// channel may succeed where this one failed.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, AmqpError::ShutdownSignal(_))
    }
}

/// Errors surfaced to callers of the messaging API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    /// The broker could not be reached, or the channel died and the single retry failed too
    #[error("connectivity failure: {0}")]
    ConnectivityError(#[from] AmqpError),

    /// No reply arrived within the caller's window
    #[error("no reply received within {0}ms")]
    TimeoutError(u64),

    /// An address or host string did not have the expected shape
    #[error("invalid address `{0}`")]
    InvalidAddressError(String),

    /// A message body could not be encoded or decoded
    #[error("failure to parse payload `{0}`")]
    PayloadError(String),

    /// The replying destination was closed
    #[error("replying destination is closed")]
    DestinationClosedError,

    /// Null replying destinations cannot deliver anything
    #[error("cannot send message from a null replying destination")]
    NullDestinationError,

    /// A reply was attempted on a message that carries no reply address
    #[error("message has no reply address")]
    MissingReplyAddressError,

    /// A message handler failed to process a message
    #[error("handler failure `{0}`")]
    HandlerError(String),

    /// A delayed connection was initialized twice
    #[error("message connection was already initialized")]
    AlreadyInitializedError,
}

impl MessagingError {
    /// Builds a handler error out of anything printable.
    pub fn handler<T: ToString>(reason: T) -> Self {
        MessagingError::HandlerError(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_shutdown_signals_are_retryable() {
        assert!(AmqpError::ShutdownSignal("gone".into()).is_shutdown());
        assert!(!AmqpError::ConnectionClosedError.is_shutdown());
        assert!(!AmqpError::PublishingError("nope".into()).is_shutdown());
    }

    #[test]
    fn transport_errors_convert_into_connectivity_errors() {
        let err: MessagingError = AmqpError::ConnectionError("refused".into()).into();
        assert_eq!(
            err,
            MessagingError::ConnectivityError(AmqpError::ConnectionError("refused".into()))
        );
        assert_eq!(
            err.to_string(),
            "connectivity failure: failure to connect `refused`"
        );
    }
}
