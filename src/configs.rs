// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Provider Configuration
//!
//! Explicit configuration handed to a provider at construction time and threaded
//! through every operation. Values can be deserialized with serde or read from the
//! process environment.

use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use tracing::warn;

pub const DEFAULT_URL: &str = "amqp://localhost";
pub const DEFAULT_CONNECTION_NAME: &str = "resilient-rabbitmq";

pub const ENV_URL: &str = "AMQP_URL";
pub const ENV_CONNECTION_NAME: &str = "AMQP_CONNECTION_NAME";
pub const ENV_RECONNECT_AFTER_MS: &str = "AMQP_RECONNECT_AFTER_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "AMQP_MAX_RECONNECT_ATTEMPTS";
pub const ENV_ACK_RETENTION_MS: &str = "AMQP_ACK_RETENTION_MS";
pub const ENV_HOUSEKEEPING_INTERVAL_MS: &str = "AMQP_HOUSEKEEPING_INTERVAL_MS";
pub const ENV_REQUEUE_ON_REJECT: &str = "AMQP_REQUEUE_ON_REJECT";

/// Connection, recovery and housekeeping settings for a provider instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    /// Broker address
    pub url: String,
    /// Name reported to the broker for the connection
    pub connection_name: String,
    /// Fixed delay between a disconnect (or failed attempt) and the next reconnect attempt
    pub reconnect_after: Duration,
    /// Upper bound on consecutive reconnect attempts, `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Age after which an unacknowledged tracked message is evicted
    pub ack_retention: Duration,
    /// Tick of the tracker housekeeping task
    pub housekeeping_interval: Duration,
    /// Whether a rejected `resolve` delivery goes back to the queue
    pub requeue_on_reject: bool,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            url: DEFAULT_URL.to_owned(),
            connection_name: DEFAULT_CONNECTION_NAME.to_owned(),
            reconnect_after: Duration::from_secs(1),
            max_reconnect_attempts: None,
            ack_retention: Duration::from_secs(15 * 60),
            housekeeping_interval: Duration::from_secs(60),
            requeue_on_reject: true,
        }
    }
}

impl AmqpConfigs {
    /// Creates a configuration pointing at the given broker url.
    pub fn new(url: &str) -> Self {
        AmqpConfigs {
            url: url.to_owned(),
            ..Default::default()
        }
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn reconnect_after(mut self, delay: Duration) -> Self {
        self.reconnect_after = delay;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn ack_retention(mut self, retention: Duration) -> Self {
        self.ack_retention = retention;
        self
    }

    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    pub fn requeue_on_reject(mut self, requeue: bool) -> Self {
        self.requeue_on_reject = requeue;
        self
    }

    /// Reads the configuration from the process environment.
    ///
    /// Missing variables keep their default, unparsable ones are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = AmqpConfigs::default();

        if let Some(url) = lookup(ENV_URL) {
            cfg.url = url;
        }

        if let Some(name) = lookup(ENV_CONNECTION_NAME) {
            cfg.connection_name = name;
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RECONNECT_AFTER_MS) {
            cfg.reconnect_after = Duration::from_millis(ms);
        }

        if let Some(attempts) = parse_var::<u32, _>(&lookup, ENV_MAX_RECONNECT_ATTEMPTS) {
            cfg.max_reconnect_attempts = Some(attempts);
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_ACK_RETENTION_MS) {
            cfg.ack_retention = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_HOUSEKEEPING_INTERVAL_MS) {
            cfg.housekeeping_interval = Duration::from_millis(ms);
        }

        if let Some(requeue) = parse_var::<bool, _>(&lookup, ENV_REQUEUE_ON_REJECT) {
            cfg.requeue_on_reject = requeue;
        }

        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = raw, "ignoring invalid configuration value");
            None
        }
    }
}
