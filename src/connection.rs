// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager
//!
//! Owns the single connection/channel pair of a provider and runs the reconnect state
//! machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -(disconnect)-> Reconnecting -> Connected
//!                                                              ^    |
//!                                                              +----+ (attempt failed)
//! ```
//!
//! Every opening of a connection happens while holding the state lock, so at most one
//! live pair exists at any time, and callers that invoke [`ConnectionManager::connect`]
//! during a reconnect attempt simply wait for it. Each successful reconnect cycle emits
//! exactly one [`ReconnectedEvent`] on a single-consumer channel.

use crate::{
    configs::AmqpConfigs,
    errors::AmqpError,
    transport::{AmqpChannel, AmqpTransport},
};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Observable state of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Emitted once per successful reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectedEvent {
    /// 1-based index of the reconnect cycle
    pub cycle: u64,
    /// Attempts the cycle needed
    pub attempts: u32,
}

struct ConnectionState {
    channel: Option<Arc<dyn AmqpChannel>>,
    generation: u64,
}

/// Manages the connection lifecycle of one provider instance.
pub struct ConnectionManager {
    transport: Arc<dyn AmqpTransport>,
    configs: AmqpConfigs,
    state: Mutex<ConnectionState>,
    status: watch::Sender<ConnectionStatus>,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    /// A reconnect loop gave up, the next successful connect closes its cycle
    abandoned: AtomicBool,
    cycles: AtomicU64,
    reconnected_tx: mpsc::UnboundedSender<ReconnectedEvent>,
    reconnected_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ReconnectedEvent>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn AmqpTransport>, configs: AmqpConfigs) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (reconnected_tx, reconnected_rx) = mpsc::unbounded_channel();

        Arc::new(ConnectionManager {
            transport,
            configs,
            state: Mutex::new(ConnectionState {
                channel: None,
                generation: 0,
            }),
            status,
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            reconnected_tx,
            reconnected_rx: std::sync::Mutex::new(Some(reconnected_rx)),
        })
    }

    pub fn configs(&self) -> &AmqpConfigs {
        &self.configs
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Subscribes to status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Hands out the receiving side of the reconnected signal.
    ///
    /// There is at most one subscriber: the first call gets the receiver, later calls
    /// get `None`.
    pub fn take_reconnected(&self) -> Option<mpsc::UnboundedReceiver<ReconnectedEvent>> {
        match self.reconnected_rx.lock() {
            Ok(mut rx) => rx.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Returns the live channel, opening a new connection when there is none or when
    /// `force` is set.
    pub async fn connect(self: &Arc<Self>, force: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.state.lock().await;

        if !force {
            if let Some(channel) = state.channel.as_ref().filter(|c| c.is_open()) {
                return Ok(channel.clone());
            }
        }

        let mut lost = false;
        if let Some(previous) = state.channel.take() {
            // bumping the generation first makes the old watcher a no-op
            state.generation += 1;
            if previous.is_open() {
                debug!("closing previous amqp channel");
                if let Err(err) = previous.close().await {
                    warn!(error = err.to_string(), "failure to close previous channel");
                }
            } else {
                lost = true;
            }
        }

        self.closed.store(false, Ordering::SeqCst);
        if !self.reconnecting.load(Ordering::SeqCst) {
            self.status.send_replace(ConnectionStatus::Connecting);
        }

        let channel = match self.transport.open(&self.configs).await {
            Ok(channel) => channel,
            Err(err) => {
                if !self.reconnecting.load(Ordering::SeqCst) {
                    self.status.send_replace(ConnectionStatus::Disconnected);
                }
                return Err(err);
            }
        };

        state.generation += 1;
        state.channel = Some(channel.clone());
        self.watch_disconnect(channel.clone(), state.generation);
        self.status.send_replace(ConnectionStatus::Connected);
        info!(url = self.configs.url, "amqp connection established");

        // the dead channel was swapped before its watcher ran, or the loop gave up:
        // no reconnect loop will announce this cycle
        let abandoned = self.abandoned.swap(false, Ordering::SeqCst);
        if (lost || abandoned) && !self.reconnecting.load(Ordering::SeqCst) {
            self.emit_reconnected(1);
        }

        Ok(channel)
    }

    /// Closes the connection without triggering the reconnect loop.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.abandoned.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.generation += 1;
        self.status.send_replace(ConnectionStatus::Disconnected);

        match state.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Reports that an operation failed on `channel`. When that channel is still the
    /// current one and no longer usable, the disconnect is handled right away.
    pub async fn report_failure(self: &Arc<Self>, channel: &Arc<dyn AmqpChannel>) {
        if channel.is_open() {
            return;
        }

        let generation = {
            let state = self.state.lock().await;
            match state.channel.as_ref() {
                Some(current) if std::ptr::addr_eq(Arc::as_ptr(current), Arc::as_ptr(channel)) => {
                    state.generation
                }
                _ => return,
            }
        };

        self.on_disconnect(generation).await;
    }

    fn watch_disconnect(self: &Arc<Self>, channel: Arc<dyn AmqpChannel>, generation: u64) {
        let mut rx = channel.disconnected();
        let manager: Weak<ConnectionManager> = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                if *rx.borrow_and_update() {
                    break;
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }

            if let Some(manager) = manager.upgrade() {
                manager.on_disconnect(generation).await;
            }
        });
    }

    async fn on_disconnect(self: &Arc<Self>, generation: u64) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("connection closed on purpose, not reconnecting");
            return;
        }

        {
            let mut state = self.state.lock().await;
            if state.generation != generation {
                debug!(generation = generation, "ignoring disconnect of a replaced channel");
                return;
            }
            state.channel = None;

            if self.reconnecting.swap(true, Ordering::SeqCst) {
                debug!("reconnect already in flight");
                return;
            }
            self.status.send_replace(ConnectionStatus::Reconnecting);
        }

        warn!(
            reconnect_after = ?self.configs.reconnect_after,
            "amqp connection lost, reconnecting"
        );

        let manager = self.clone();
        tokio::spawn(async move { manager.reconnect_loop().await });
    }

    fn emit_reconnected(&self, attempts: u32) {
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle = cycle, attempts = attempts, "amqp reconnected");

        if self
            .reconnected_tx
            .send(ReconnectedEvent { cycle, attempts })
            .is_err()
        {
            debug!("no listener for the reconnected event");
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut attempts: u32 = 0;

        loop {
            tokio::time::sleep(self.configs.reconnect_after).await;

            if self.closed.load(Ordering::SeqCst) {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }

            attempts += 1;
            // a live channel opened meanwhile by an operation is adopted as is
            match self.connect(false).await {
                Ok(_) => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    self.emit_reconnected(attempts);
                    return;
                }
                Err(err) => {
                    warn!(
                        error = err.to_string(),
                        attempt = attempts,
                        "reconnect attempt failed"
                    );

                    if let Some(max) = self.configs.max_reconnect_attempts {
                        if attempts >= max {
                            error!(attempts = attempts, "giving up reconnecting");
                            self.abandoned.store(true, Ordering::SeqCst);
                            self.reconnecting.store(false, Ordering::SeqCst);
                            self.status.send_replace(ConnectionStatus::Disconnected);
                            return;
                        }
                    }
                }
            }
        }
    }
}
