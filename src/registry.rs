// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Registry
//!
//! Remembers every successful `consume` and `subscribe` so they can be replayed once
//! the provider reconnects. A registration leaves the table exactly once: when it is
//! cancelled, or when its replay succeeds (the replay registered itself under a new
//! uid).
//!
//! Replay passes are serialized and iterate over a snapshot of the uids taken when the
//! pass starts, so a registration added during a pass waits for the next one.
//!
//! A replayed registration remembers the uids and consumer tags it ran under before,
//! so callers holding them can still look it up or cancel it.

use crate::{
    errors::AmqpError,
    params::{ConsumeOptions, SubscribeOptions},
};
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Identifier of a registration. Ids increase monotonically and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientUid(u64);

impl fmt::Display for ClientUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// The recorded call: which operation, with which normalized parameters.
#[derive(Debug, Clone)]
pub enum Registration {
    Consume(ConsumeOptions),
    Subscribe(SubscribeOptions),
}

impl Registration {
    pub fn method(&self) -> &'static str {
        match self {
            Registration::Consume(_) => "consume",
            Registration::Subscribe(_) => "subscribe",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    registration: Registration,
    consumer_tag: String,
    previous_uids: Vec<ClientUid>,
    previous_tags: Vec<String>,
}

impl Entry {
    fn answers_to(&self, uid: ClientUid) -> bool {
        self.previous_uids.contains(&uid)
    }

    fn has_tag(&self, consumer_tag: &str) -> bool {
        self.consumer_tag == consumer_tag || self.previous_tags.iter().any(|t| t == consumer_tag)
    }
}

fn find(clients: &BTreeMap<ClientUid, Entry>, uid: ClientUid) -> Option<(&ClientUid, &Entry)> {
    clients
        .get_key_value(&uid)
        .or_else(|| clients.iter().find(|(_, entry)| entry.answers_to(uid)))
}

/// Outcome of a replay pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Nothing was registered when the pass started
    NoClients,
    Completed { replayed: usize, failed: usize },
}

/// Re-invokes a recorded call.
#[async_trait]
pub trait Replayer: Send + Sync {
    /// Runs the call again. On success the call has registered itself, and its new uid
    /// is returned.
    async fn replay(&self, registration: Registration) -> Result<ClientUid, AmqpError>;

    /// Stops the consumer a replay started for a registration that was cancelled while
    /// the replay ran.
    async fn discard(&self, uid: ClientUid);
}

#[derive(Default)]
pub struct ConsumerRegistry {
    clients: Mutex<BTreeMap<ClientUid, Entry>>,
    next_uid: AtomicU64,
    replay_guard: Mutex<()>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        ConsumerRegistry::default()
    }

    /// Records a successful call.
    pub async fn register(&self, registration: Registration, consumer_tag: &str) -> ClientUid {
        let uid = ClientUid(self.next_uid.fetch_add(1, Ordering::SeqCst) + 1);
        let method = registration.method();

        self.clients.lock().await.insert(
            uid,
            Entry {
                registration,
                consumer_tag: consumer_tag.to_owned(),
                previous_uids: vec![],
                previous_tags: vec![],
            },
        );

        info!(uid = %uid, method = method, "registered new client");
        uid
    }

    pub async fn unregister(&self, uid: ClientUid) -> Option<Registration> {
        let mut clients = self.clients.lock().await;
        let current = find(&clients, uid).map(|(current, _)| *current)?;
        clients.remove(&current).map(|entry| entry.registration)
    }

    /// Removes the registration of the consumer with the given broker tag, current or
    /// one it had before a replay. Returns the uid it was registered under.
    pub async fn unregister_by_tag(&self, consumer_tag: &str) -> Option<ClientUid> {
        let mut clients = self.clients.lock().await;
        let uid = clients
            .iter()
            .find(|(_, entry)| entry.has_tag(consumer_tag))
            .map(|(uid, _)| *uid)?;
        clients.remove(&uid);
        Some(uid)
    }

    /// The registration under `uid`, following it across replays.
    pub async fn get(&self, uid: ClientUid) -> Option<Registration> {
        find(&*self.clients.lock().await, uid).map(|(_, entry)| entry.registration.clone())
    }

    /// The tag of the live consumer for `uid`, following it across replays.
    pub async fn consumer_tag(&self, uid: ClientUid) -> Option<String> {
        find(&*self.clients.lock().await, uid).map(|(_, entry)| entry.consumer_tag.clone())
    }

    /// Maps a tag, current or from before a replay, to the tag of the live consumer.
    pub async fn current_tag(&self, consumer_tag: &str) -> Option<String> {
        self.clients
            .lock()
            .await
            .values()
            .find(|entry| entry.has_tag(consumer_tag))
            .map(|entry| entry.consumer_tag.clone())
    }

    /// Registered uids in registration order.
    pub async fn uids(&self) -> Vec<ClientUid> {
        self.clients.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Replays every registration present when the pass starts.
    pub async fn replay_all(&self, replayer: &dyn Replayer) -> ReplayOutcome {
        let _pass = self.replay_guard.lock().await;

        let snapshot = self.uids().await;
        if snapshot.is_empty() {
            info!("no clients detected");
            return ReplayOutcome::NoClients;
        }

        info!(clients = snapshot.len(), "client(s) detected, reconnecting them...");
        let mut replayed = 0;
        let mut failed = 0;

        for uid in snapshot {
            // cancelled while the pass was running
            let Some(registration) = self
                .clients
                .lock()
                .await
                .get(&uid)
                .map(|entry| entry.registration.clone())
            else {
                continue;
            };

            match replayer.replay(registration.clone()).await {
                Ok(new_uid) => {
                    let mut clients = self.clients.lock().await;
                    let Some(original) = clients.remove(&uid) else {
                        drop(clients);
                        warn!(
                            uid = %uid,
                            new_uid = %new_uid,
                            "client cancelled during its replay"
                        );
                        replayer.discard(new_uid).await;
                        continue;
                    };

                    if let Some(entry) = clients.get_mut(&new_uid) {
                        entry.previous_uids.extend(original.previous_uids);
                        entry.previous_uids.push(uid);
                        entry.previous_tags.extend(original.previous_tags);
                        entry.previous_tags.push(original.consumer_tag);
                    }
                    drop(clients);

                    info!(uid = %uid, new_uid = %new_uid, "reconnected client");
                    replayed += 1;
                }
                Err(err) => {
                    let err = AmqpError::ReplayError(uid.to_string(), err.to_string());
                    error!(
                        error = err.to_string(),
                        method = registration.method(),
                        "can't reconnect client"
                    );
                    failed += 1;
                }
            }
        }

        ReplayOutcome::Completed { replayed, failed }
    }
}
