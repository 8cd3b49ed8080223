// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Encodes JSON payloads and hands them to the broker, either straight to a queue
//! through the default exchange (`produce`) or to a named exchange (`publish`).
//! OpenTelemetry context is propagated in the message headers.

use crate::{
    errors::AmqpError,
    otel,
    transport::{AmqpChannel, OutboundMessage},
};
use opentelemetry::Context;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serializes a JSON document into a message body.
pub fn encode(json: &Value) -> Result<Vec<u8>, AmqpError> {
    serde_json::to_vec(json).map_err(|err| {
        error!(error = err.to_string(), "failure to encode payload");
        AmqpError::ParsePayloadError
    })
}

/// Parses a message body back into a JSON document.
pub fn decode(data: &[u8]) -> Result<Value, AmqpError> {
    serde_json::from_slice(data).map_err(|err| {
        error!(error = err.to_string(), "failure to decode payload");
        AmqpError::ParsePayloadError
    })
}

/// Publishes JSON messages on a channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQPublisher {
    pub fn new(channel: Arc<dyn AmqpChannel>) -> RabbitMQPublisher {
        RabbitMQPublisher { channel }
    }

    /// Publishes `json` to `exchange` with the given routing key.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context propagated to consumers
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `key` - Routing key, the queue name when using the default exchange
    /// * `json` - Message payload
    /// * `persistent` - Whether the broker should write the message to disk
    ///
    /// # Returns
    /// The id given to the message
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        key: &str,
        json: &Value,
        persistent: bool,
    ) -> Result<String, AmqpError> {
        let msg = OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: key.to_owned(),
            persistent,
            message_id: Uuid::new_v4().to_string(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            headers: otel::inject(ctx),
            data: encode(json)?,
        };

        self.channel.publish(&msg).await?;
        debug!(
            exchange = exchange,
            key = key,
            message_id = msg.message_id,
            "message published"
        );

        Ok(msg.message_id)
    }
}
