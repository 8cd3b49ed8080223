// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod executor;
mod otel;

pub mod bus;
pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod params;
pub mod provider;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod tracker;
pub mod transport;

pub use bus::{MessageBus, Registered};
pub use configs::AmqpConfigs;
pub use errors::AmqpError;
pub use executor::Executed;
pub use handler::{handler_fn, ConsumerHandler, ConsumerMessage};
pub use params::AckMode;
pub use provider::{new_provider, Consumer, Provider, ProviderKind};
