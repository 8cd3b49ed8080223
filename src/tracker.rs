// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Tracker
//!
//! Bookkeeping for deliveries consumed in manual acknowledgment mode. Each tracked
//! delivery gets an opaque ack id the caller later resolves with `ack` or `nack`.
//!
//! Memory stays bounded by a housekeeping task that evicts entries older than the
//! retention window, as well as entries whose channel is gone (their delivery tag can
//! never be acknowledged again). Eviction is silent: the broker redelivers whatever was
//! never acknowledged.

use crate::{errors::AmqpError, transport::AmqpChannel};
use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// A delivery waiting for an explicit acknowledgment.
pub(crate) struct TrackedMessage {
    delivery_tag: u64,
    channel: Arc<dyn AmqpChannel>,
    payload: Vec<u8>,
    received_at: Instant,
}

pub struct MessageTracker {
    entries: Mutex<HashMap<String, TrackedMessage>>,
    retention: Duration,
}

impl MessageTracker {
    pub fn new(retention: Duration) -> Arc<Self> {
        Arc::new(MessageTracker {
            entries: Mutex::new(HashMap::default()),
            retention,
        })
    }

    /// Records a delivery and returns the id the caller acknowledges it with.
    pub async fn track(
        &self,
        channel: Arc<dyn AmqpChannel>,
        delivery_tag: u64,
        payload: Vec<u8>,
    ) -> String {
        let ack_id = Uuid::new_v4().to_string();

        self.entries.lock().await.insert(
            ack_id.clone(),
            TrackedMessage {
                delivery_tag,
                channel,
                payload,
                received_at: Instant::now(),
            },
        );

        debug!(ack_id = ack_id, delivery_tag = delivery_tag, "tracking message");
        ack_id
    }

    /// Acknowledges a tracked delivery, removing it from the queue.
    pub async fn ack(&self, ack_id: &str) -> Result<(), AmqpError> {
        self.resolve(ack_id, "ack", |channel, tag| async move { channel.ack(tag).await })
            .await
    }

    /// Negatively acknowledges a tracked delivery, putting it back in the queue.
    pub async fn nack(&self, ack_id: &str) -> Result<(), AmqpError> {
        self.resolve(ack_id, "nack", |channel, tag| async move {
            channel.nack(tag, true).await
        })
        .await
    }

    /// Raw payload of a tracked delivery.
    pub async fn payload(&self, ack_id: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .await
            .get(ack_id)
            .map(|msg| msg.payload.clone())
    }

    pub async fn contains(&self, ack_id: &str) -> bool {
        self.entries.lock().await.contains_key(ack_id)
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Evicts entries past the retention window or whose channel is closed.
    ///
    /// Returns the number of evicted entries.
    pub async fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();

        entries.retain(|ack_id, msg| {
            let keep = msg.received_at.elapsed() <= self.retention && msg.channel.is_open();
            if !keep {
                debug!(ack_id = ack_id, "evicting unacknowledged message");
            }
            keep
        });

        before - entries.len()
    }

    /// Spawns the periodic housekeeping task. It stops once the tracker is dropped.
    pub fn spawn_housekeeping(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker: Weak<MessageTracker> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(tracker) = tracker.upgrade() else {
                    break;
                };

                let evicted = tracker.sweep().await;
                if evicted > 0 {
                    debug!(evicted = evicted, "housekeeping evicted stale messages");
                }
            }
        })
    }

    async fn resolve<F, Fut>(&self, ack_id: &str, op: &str, send: F) -> Result<(), AmqpError>
    where
        F: FnOnce(Arc<dyn AmqpChannel>, u64) -> Fut,
        Fut: std::future::Future<Output = Result<(), AmqpError>>,
    {
        let Some(msg) = self.entries.lock().await.remove(ack_id) else {
            return Err(AmqpError::NotFound(ack_id.to_owned()));
        };
        // past retention is evicted, whether or not housekeeping ran yet
        if msg.received_at.elapsed() > self.retention {
            debug!(ack_id = ack_id, "evicting unacknowledged message");
            return Err(AmqpError::NotFound(ack_id.to_owned()));
        }

        match send(msg.channel.clone(), msg.delivery_tag).await {
            Ok(()) => {
                debug!(ack_id = ack_id, "message {}ed", op);
                Ok(())
            }
            Err(err) if msg.channel.is_open() => {
                warn!(error = err.to_string(), ack_id = ack_id, "failure to {} message", op);
                self.entries.lock().await.insert(ack_id.to_owned(), msg);
                Err(err)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    ack_id = ack_id,
                    "channel gone, dropping tracked message"
                );
                Err(AmqpError::DisconnectedMidOperation(op.to_owned()))
            }
        }
    }
}
