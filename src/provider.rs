// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Providers
//!
//! A provider implements the public operations against one broker technology. Every
//! operation runs through the [`executor`](crate::executor) pipeline, so bad input is
//! rejected before any connection is attempted and every result comes back together
//! with the normalized parameters it ran with.
//!
//! Providers are picked by name through [`ProviderKind`]; `rabbitmq` (alias `amqp`)
//! is the only one available.

use crate::{
    channel::LapinTransport,
    configs::AmqpConfigs,
    connection::{ConnectionManager, ConnectionStatus, ReconnectedEvent},
    consumer::ConsumerDefinition,
    dispatcher::RabbitMQDispatcher,
    errors::AmqpError,
    executor::{exec, Executed},
    handler::ConsumerMessage,
    params::{
        AckMode, AckParams, CancelParams, ConsumeOptions, ConsumeParams, GetOptions, GetParams,
        InfoParams, ProduceOptions, ProduceParams, PublishOptions, PublishParams,
        SubscribeOptions, SubscribeParams,
    },
    publisher::{decode, RabbitMQPublisher},
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    tracker::MessageTracker,
    transport::AmqpTransport,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{fmt, str::FromStr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A consumer started by `consume` or `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// Tag to cancel the consumer with
    pub consumer_tag: String,
    /// Queue the consumer reads from, broker generated for subscribers
    pub queue: String,
}

/// The operations every message provider offers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Sends a message straight to a queue.
    async fn produce(
        &self,
        params: ProduceParams,
    ) -> Result<Executed<String, ProduceOptions>, AmqpError>;

    /// Runs a handler for every message of a queue.
    async fn consume(
        &self,
        params: ConsumeParams,
    ) -> Result<Executed<Consumer, ConsumeOptions>, AmqpError>;

    /// Sends a message to an exchange.
    async fn publish(
        &self,
        params: PublishParams,
    ) -> Result<Executed<String, PublishOptions>, AmqpError>;

    /// Runs a handler for every message published under a routing key.
    async fn subscribe(
        &self,
        params: SubscribeParams,
    ) -> Result<Executed<Consumer, SubscribeOptions>, AmqpError>;

    /// Pulls a single message, `None` when the queue is empty.
    async fn get(
        &self,
        params: GetParams,
    ) -> Result<Executed<Option<ConsumerMessage>, GetOptions>, AmqpError>;

    async fn ack(&self, params: AckParams) -> Result<Executed<(), AckParams>, AmqpError>;

    async fn nack(&self, params: AckParams) -> Result<Executed<(), AckParams>, AmqpError>;

    async fn info(&self, params: InfoParams) -> Result<Executed<QueueInfo, InfoParams>, AmqpError>;

    async fn cancel(&self, params: CancelParams)
        -> Result<Executed<(), CancelParams>, AmqpError>;

    /// Whether the provider currently holds a live connection.
    async fn health_check(&self) -> bool;

    /// Stops every consumer and closes the connection without reconnecting.
    async fn close(&self) -> Result<(), AmqpError>;

    fn status(&self) -> ConnectionStatus;

    /// Hands out the reconnected signal. Only the first caller gets it.
    fn take_reconnected(&self) -> Option<mpsc::UnboundedReceiver<ReconnectedEvent>>;
}

/// Static registry of the available providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    RabbitMQ,
}

impl FromStr for ProviderKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rabbitmq" | "amqp" => Ok(ProviderKind::RabbitMQ),
            _ => Err(AmqpError::UnknownProvider(s.to_owned())),
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::RabbitMQ => f.write_str("rabbitmq"),
        }
    }
}

impl ProviderKind {
    /// Builds a provider of this kind on top of the given transport.
    pub fn build(
        &self,
        transport: Arc<dyn AmqpTransport>,
        configs: AmqpConfigs,
    ) -> Arc<dyn Provider> {
        match self {
            ProviderKind::RabbitMQ => RabbitMQProvider::with_transport(transport, configs),
        }
    }
}

/// Builds the provider registered under `name`, connected through lapin.
///
/// Must be called from within a tokio runtime.
pub fn new_provider(name: &str, configs: AmqpConfigs) -> Result<Arc<dyn Provider>, AmqpError> {
    let kind = name.parse::<ProviderKind>()?;
    Ok(kind.build(Arc::new(LapinTransport), configs))
}

/// RabbitMQ implementation of [`Provider`].
pub struct RabbitMQProvider {
    connection: Arc<ConnectionManager>,
    dispatcher: Arc<RabbitMQDispatcher>,
    tracker: Arc<MessageTracker>,
    housekeeping: JoinHandle<()>,
}

impl RabbitMQProvider {
    /// Creates a provider connected through lapin.
    ///
    /// No connection is opened until the first operation. Must be called from within a
    /// tokio runtime since it spawns the tracker housekeeping.
    pub fn new(configs: AmqpConfigs) -> Arc<Self> {
        Self::with_transport(Arc::new(LapinTransport), configs)
    }

    pub fn with_transport(transport: Arc<dyn AmqpTransport>, configs: AmqpConfigs) -> Arc<Self> {
        let tracker = MessageTracker::new(configs.ack_retention);
        let housekeeping = tracker.spawn_housekeeping(configs.housekeeping_interval);

        Arc::new(RabbitMQProvider {
            connection: ConnectionManager::new(transport, configs),
            dispatcher: RabbitMQDispatcher::new(),
            tracker,
            housekeeping,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn tracker(&self) -> &Arc<MessageTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<RabbitMQDispatcher> {
        &self.dispatcher
    }

    fn requeue_on_reject(&self) -> bool {
        self.connection.configs().requeue_on_reject
    }
}

impl Drop for RabbitMQProvider {
    fn drop(&mut self) {
        self.housekeeping.abort();
    }
}

fn new_consumer_tag() -> String {
    format!("ctag-{}", Uuid::new_v4())
}

#[async_trait]
impl Provider for RabbitMQProvider {
    async fn produce(
        &self,
        params: ProduceParams,
    ) -> Result<Executed<String, ProduceOptions>, AmqpError> {
        exec(&self.connection, "produce", params, |channel, opts| async move {
            channel
                .declare_queue(&QueueDefinition::new(&opts.queue).with_durable(opts.durable))
                .await?;

            RabbitMQPublisher::new(channel)
                .publish(&Context::current(), "", &opts.queue, &opts.json, opts.persistent)
                .await
        })
        .await
    }

    async fn consume(
        &self,
        params: ConsumeParams,
    ) -> Result<Executed<Consumer, ConsumeOptions>, AmqpError> {
        let dispatcher = &self.dispatcher;
        let tracker = self.tracker.clone();
        let requeue_on_reject = self.requeue_on_reject();

        exec(&self.connection, "consume", params, |channel, opts| async move {
            channel
                .declare_queue(&QueueDefinition::new(&opts.queue).with_durable(opts.durable))
                .await?;
            channel.qos(opts.prefetch).await?;

            let consumer_tag = new_consumer_tag();
            let stream = channel
                .consume(&opts.queue, &consumer_tag, opts.no_ack)
                .await?;

            dispatcher
                .start(
                    &consumer_tag,
                    stream,
                    ConsumerDefinition {
                        source: opts.queue.clone(),
                        handler: opts.handler.clone(),
                        ack: opts.ack,
                        no_ack: opts.no_ack,
                        requeue_on_reject,
                        channel,
                        tracker,
                    },
                )
                .await;

            info!(queue = opts.queue, consumer_tag = consumer_tag, "consumer started");
            Ok(Consumer {
                consumer_tag,
                queue: opts.queue,
            })
        })
        .await
    }

    async fn publish(
        &self,
        params: PublishParams,
    ) -> Result<Executed<String, PublishOptions>, AmqpError> {
        exec(&self.connection, "publish", params, |channel, opts| async move {
            channel.declare_exchange(&opts.exchange).await?;

            RabbitMQPublisher::new(channel)
                .publish(
                    &Context::current(),
                    opts.exchange.name(),
                    &opts.key,
                    &opts.json,
                    opts.exchange.is_durable(),
                )
                .await
        })
        .await
    }

    async fn subscribe(
        &self,
        params: SubscribeParams,
    ) -> Result<Executed<Consumer, SubscribeOptions>, AmqpError> {
        let dispatcher = &self.dispatcher;
        let tracker = self.tracker.clone();
        let requeue_on_reject = self.requeue_on_reject();

        exec(&self.connection, "subscribe", params, |channel, opts| async move {
            channel.declare_exchange(&opts.exchange).await?;
            let queue = channel
                .declare_queue(&QueueDefinition::server_named())
                .await?;

            channel
                .bind_queue(
                    &QueueBinding::new(&queue.name)
                        .exchange(opts.exchange.name())
                        .routing_key(&opts.key),
                )
                .await?;

            // auto subscribers let the broker forget deliveries on its own
            let no_ack = opts.ack == AckMode::Auto;
            let consumer_tag = new_consumer_tag();
            let stream = channel.consume(&queue.name, &consumer_tag, no_ack).await?;

            dispatcher
                .start(
                    &consumer_tag,
                    stream,
                    ConsumerDefinition {
                        source: opts.key.clone(),
                        handler: opts.handler.clone(),
                        ack: opts.ack,
                        no_ack,
                        requeue_on_reject,
                        channel,
                        tracker,
                    },
                )
                .await;

            info!(
                exchange = opts.exchange.name(),
                key = opts.key,
                consumer_tag = consumer_tag,
                "subscriber started"
            );
            Ok(Consumer {
                consumer_tag,
                queue: queue.name,
            })
        })
        .await
    }

    async fn get(
        &self,
        params: GetParams,
    ) -> Result<Executed<Option<ConsumerMessage>, GetOptions>, AmqpError> {
        let tracker = &self.tracker;

        exec(&self.connection, "get", params, |channel, opts| async move {
            let manual = opts.ack == AckMode::Manual;
            let Some(delivery) = channel.get(&opts.queue, !manual).await? else {
                debug!(queue = opts.queue, "queue is empty");
                return Ok(None);
            };

            let json = match decode(&delivery.data) {
                Ok(json) => json,
                Err(err) => {
                    if manual {
                        if let Err(e) = channel.nack(delivery.delivery_tag, false).await {
                            warn!(error = e.to_string(), "error to nack msg");
                        }
                    }
                    return Err(err);
                }
            };

            let ack_id = if manual {
                Some(
                    tracker
                        .track(channel.clone(), delivery.delivery_tag, delivery.data)
                        .await,
                )
            } else {
                None
            };

            Ok(Some(ConsumerMessage {
                source: opts.queue,
                json,
                ack_id,
                redelivered: delivery.redelivered,
            }))
        })
        .await
    }

    async fn ack(&self, params: AckParams) -> Result<Executed<(), AckParams>, AmqpError> {
        let tracker = &self.tracker;
        exec(&self.connection, "ack", params, |_, opts| async move {
            tracker.ack(&opts.ack_id).await
        })
        .await
    }

    async fn nack(&self, params: AckParams) -> Result<Executed<(), AckParams>, AmqpError> {
        let tracker = &self.tracker;
        exec(&self.connection, "nack", params, |_, opts| async move {
            tracker.nack(&opts.ack_id).await
        })
        .await
    }

    async fn info(&self, params: InfoParams) -> Result<Executed<QueueInfo, InfoParams>, AmqpError> {
        exec(&self.connection, "info", params, |channel, opts| async move {
            channel
                .declare_queue(&QueueDefinition::new(&opts.queue).passive())
                .await
        })
        .await
    }

    async fn cancel(
        &self,
        params: CancelParams,
    ) -> Result<Executed<(), CancelParams>, AmqpError> {
        let dispatcher = &self.dispatcher;

        exec(&self.connection, "cancel", params, |channel, opts| async move {
            if !dispatcher.contains(&opts.consumer_tag).await {
                return Err(AmqpError::NotFound(opts.consumer_tag));
            }

            channel.cancel(&opts.consumer_tag).await?;
            dispatcher.stop(&opts.consumer_tag).await;

            info!(consumer_tag = opts.consumer_tag, "consumer cancelled");
            Ok(())
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.connection.is_connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        for consumer_tag in self.dispatcher.consumer_tags().await {
            self.dispatcher.stop(&consumer_tag).await;
        }

        self.connection.close().await
    }

    fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    fn take_reconnected(&self) -> Option<mpsc::UnboundedReceiver<ReconnectedEvent>> {
        self.connection.take_reconnected()
    }
}
