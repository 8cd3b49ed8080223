// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! The callback side of `consume`, `subscribe` and `get`: what a handler receives and
//! the trait it implements.

use crate::errors::AmqpError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{future::Future, sync::Arc};

/// A decoded delivery handed to a consumer handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    /// Queue name for consumers, routing key for subscribers
    pub source: String,
    pub json: Value,
    /// Present when the delivery is tracked and must be acked or nacked explicitly
    pub ack_id: Option<String>,
    pub redelivered: bool,
}

/// Processes consumed messages.
///
/// In `resolve` mode an `Ok` acknowledges the message and an `Err` rejects it. In the
/// other modes the result is only logged.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Adapter turning an async closure into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError> {
        (self.f)(msg.clone()).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// ```ignore
/// let cb = handler_fn(|msg| async move {
///     println!("{}", msg.json);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
