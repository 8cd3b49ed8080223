// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The broker primitives the recovery engine relies on. The production implementation
//! lives in [`crate::channel`] on top of lapin; tests plug in doubles.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a broker consumer. It ends when the consumer is
/// cancelled or its channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// A message handed over by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundDelivery {
    /// Channel-scoped tag used to ack or nack the delivery
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// String-valued message headers
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
}

/// A message to hand over to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange, empty for the default exchange
    pub exchange: String,
    pub routing_key: String,
    pub persistent: bool,
    pub message_id: String,
    pub content_type: String,
    pub headers: HashMap<String, String>,
    pub data: Vec<u8>,
}

/// Opens connection/channel pairs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Opens a connection and a channel on it.
    async fn open(&self, configs: &AmqpConfigs) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// A live channel together with the connection that carries it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Whether both the connection and the channel are still usable.
    fn is_open(&self) -> bool;

    /// Flips to `true` once the underlying connection is lost. A dropped sender
    /// means the same.
    fn disconnected(&self) -> watch::Receiver<bool>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<InboundDelivery>, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
