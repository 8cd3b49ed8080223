// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Runs one task per broker consumer, feeding its deliveries to
//! [`consumer::consume`](crate::consumer), and keeps the table of running consumers
//! keyed by consumer tag so they can be cancelled. A consumer whose stream ends (the
//! channel went away or the broker cancelled it) drops out of the table on its own.

use crate::{
    consumer::{consume, ConsumerDefinition},
    params::AckMode,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error};

/// A running consumer.
pub struct ConsumerRecord {
    pub source: String,
    pub ack: AckMode,
    task: JoinHandle<()>,
}

/// Table of the consumers running on a provider.
#[derive(Default)]
pub struct RabbitMQDispatcher {
    consumers: Mutex<HashMap<String, ConsumerRecord>>,
}

impl RabbitMQDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(RabbitMQDispatcher::default())
    }

    /// Starts dispatching the deliveries of `stream` under `consumer_tag`.
    pub(crate) async fn start(
        self: &Arc<Self>,
        consumer_tag: &str,
        mut stream: DeliveryStream,
        def: ConsumerDefinition,
    ) {
        // the table stays locked until the record is in, so a stream that ends right
        // away still finds it to remove
        let mut consumers = self.consumers.lock().await;

        let dispatcher: Weak<RabbitMQDispatcher> = Arc::downgrade(self);
        let tag = consumer_tag.to_owned();
        let source = def.source.clone();
        let ack = def.ack;

        let task = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            while let Some(result) = stream.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = consume(&tracer, delivery, &def).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }

                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }

            debug!(consumer_tag = tag, "consumer stream ended");
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.consumers.lock().await.remove(&tag);
            }
        });

        consumers.insert(consumer_tag.to_owned(), ConsumerRecord { source, ack, task });
    }

    /// Stops the consumer with the given tag and returns its record.
    pub async fn stop(&self, consumer_tag: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.lock().await.remove(consumer_tag)?;
        record.task.abort();
        Some(record)
    }

    pub async fn contains(&self, consumer_tag: &str) -> bool {
        self.consumers.lock().await.contains_key(consumer_tag)
    }

    pub async fn consumer_tags(&self) -> Vec<String> {
        self.consumers.lock().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.lock().await.is_empty()
    }
}
