// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker transport on top of lapin. It establishes the
//! connection to RabbitMQ, creates the communication channel on it and exposes the
//! broker primitives (declare, publish, consume, ack...) the rest of the crate uses.
//!
//! Connection loss is reported through a `watch` channel fed by lapin's error hook, so
//! the connection manager can start its reconnect loop.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpTransport, DeliveryStream, InboundDelivery, OutboundMessage},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Reply code sent to the broker on a normal close
const REPLY_SUCCESS: u16 = 200;
/// AMQP delivery mode for persistent messages
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Creates a new AMQP connection and a channel on it.
///
/// # Parameters
/// * `cfg` - Provider configuration holding the broker url and the connection name
///
/// # Returns
/// * `Result<(Connection, Channel), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(cfg: &AmqpConfigs) -> Result<(Connection, Channel), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.url, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((conn, c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

/// Transport that opens real lapin connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinTransport;

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn open(&self, configs: &AmqpConfigs) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let (conn, channel) = new_amqp_channel(configs).await?;
        Ok(Arc::new(LapinChannel::new(conn, channel)))
    }
}

/// A lapin connection/channel pair.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
    disconnected: watch::Receiver<bool>,
}

impl LapinChannel {
    /// Wraps an established connection and channel, wiring lapin's error hook into
    /// the disconnect signal.
    pub fn new(connection: Connection, channel: Channel) -> Self {
        let (tx, rx) = watch::channel(false);
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection lost");
            let _ = tx.send(true);
        });

        LapinChannel {
            connection,
            channel,
            disconnected: rx,
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected.clone()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(QueueInfo {
                    name: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to configure qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(msg.content_type.clone()))
            .with_message_id(ShortString::from(msg.message_id.clone()))
            .with_headers(field_table(&msg.headers));

        if msg.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        match self
            .channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                props,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(inbound(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ChannelError)
                }
            })
            .boxed())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<InboundDelivery>, AmqpError> {
        match self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue = queue, "error to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
            Ok(msg) => Ok(msg.map(|m| inbound(m.delivery))),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(AmqpError::AckMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling nack msg");
                Err(AmqpError::NackMessageError)
            }
            _ => Ok(()),
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to cancel the consumer");
                Err(AmqpError::CancelConsumerError(consumer_tag.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
                warn!(error = err.to_string(), "error to close the channel");
            }
        }

        if !self.connection.status().connected() {
            return Ok(());
        }

        match self.connection.close(REPLY_SUCCESS, "closing").await {
            Err(err) => {
                error!(error = err.to_string(), "error to close the connection");
                Err(AmqpError::ConnectionError)
            }
            _ => Ok(()),
        }
    }
}

fn inbound(delivery: Delivery) -> InboundDelivery {
    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers: string_headers(&delivery.properties),
        data: delivery.data,
    }
}

/// Collects the string-valued headers of a message.
fn string_headers(props: &AMQPProperties) -> HashMap<String, String> {
    let Some(table) = props.headers() else {
        return HashMap::default();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()?
                    .to_owned(),
                AMQPValue::ShortString(v) => v.to_string(),
                _ => return None,
            };
            Some((key.to_string(), value))
        })
        .collect()
}

fn field_table(headers: &HashMap<String, String>) -> FieldTable {
    let btree: BTreeMap<ShortString, AMQPValue> = headers
        .iter()
        .map(|(key, value)| {
            (
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            )
        })
        .collect();

    FieldTable::from(btree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_round_trip_through_field_tables() {
        let headers = HashMap::from([("traceparent".to_owned(), "00-abc-01".to_owned())]);
        let props = BasicProperties::default().with_headers(field_table(&headers));

        assert_eq!(string_headers(&props), headers);
    }

    #[test]
    fn missing_headers_are_empty() {
        assert!(string_headers(&BasicProperties::default()).is_empty());
    }
}
