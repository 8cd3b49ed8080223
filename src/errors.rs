// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! This module provides the single error type shared by every layer of the crate.
//! The `AmqpError` enum covers parameter validation, connection management,
//! broker primitives, acknowledgment bookkeeping and consumer recovery.
//!
//! Variants fall in two families that callers need to tell apart: *bad input*
//! (see [`AmqpError::is_validation`]) is never retried, while *infrastructure*
//! failures (see [`AmqpError::is_infrastructure`]) are the ones the reconnection
//! machinery is able to recover from.

use thiserror::Error;

/// Stable prefix carried by every validation failure message.
pub const VALIDATION_PREFIX: &str = "validation failure => ";

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Caller supplied parameters that do not match the operation shape
    #[error("validation failure => {0}")]
    ValidationError(String),

    /// The requested provider name is not part of the provider registry
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The channel died between `connect()` returning and the broker call
    #[error("channel disconnected during `{0}`")]
    DisconnectedMidOperation(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error fetching a single message
    #[error("failure to get message from `{0}`")]
    GetMessageError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// A consumer callback rejected the message
    #[error("consumer handler failure `{0}`")]
    HandlerError(String),

    /// Ack or nack issued for an id that is not tracked (acked, evicted or unknown)
    #[error("message `{0}` not found")]
    NotFound(String),

    /// A recovery replay attempt failed, the registration is kept for the next cycle
    #[error("failure to replay client `{0}`: {1}")]
    ReplayError(String, String),
}

impl AmqpError {
    /// True when the failure comes from malformed caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, AmqpError::ValidationError(_))
    }

    /// True when the failure comes from the broker or the transport, which is
    /// what the reconnection machinery can eventually fix.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError
                | AmqpError::ChannelError
                | AmqpError::DisconnectedMidOperation(_)
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::PublishingError
                | AmqpError::AckMessageError
                | AmqpError::NackMessageError
                | AmqpError::GetMessageError(_)
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError
                | AmqpError::CancelConsumerError(_)
        )
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        AmqpError::ValidationError(msg.into())
    }
}
