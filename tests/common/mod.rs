// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits, with knobs to simulate outages.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use resilient_rabbitmq::{
    configs::AmqpConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::{handler_fn, ConsumerHandler, ConsumerMessage},
    queue::{QueueBinding, QueueDefinition, QueueInfo},
    transport::{AmqpChannel, AmqpTransport, DeliveryStream, InboundDelivery, OutboundMessage},
};
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::{mpsc, watch};

#[derive(Clone)]
struct Ready {
    exchange: String,
    routing_key: String,
    headers: HashMap<String, String>,
    data: Vec<u8>,
    redelivered: bool,
}

struct FakeConsumer {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>,
}

#[derive(Default)]
struct FakeQueue {
    ready: VecDeque<Ready>,
    consumers: Vec<FakeConsumer>,
    next_consumer: usize,
    /// Channel owning an exclusive queue, deleted along with it
    owner: Option<u64>,
}

struct Link {
    open: Arc<AtomicBool>,
    signal: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct BrokerState {
    down: bool,
    fail_publishes: bool,
    open_attempts: usize,
    connects: usize,
    next_channel: u64,
    next_queue: u64,
    links: HashMap<u64, Link>,
    delivery_tags: HashMap<u64, u64>,
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<QueueBinding>,
    queues: HashMap<String, FakeQueue>,
    unacked: HashMap<(u64, u64), (String, Ready)>,
    published: Vec<Vec<u8>>,
}

impl BrokerState {
    fn next_delivery_tag(&mut self, channel_id: u64) -> u64 {
        let tag = self.delivery_tags.entry(channel_id).or_insert(0);
        *tag += 1;
        *tag
    }

    /// Hands `msg` to the next consumer of `queue`, or stores it.
    fn route(&mut self, queue: &str, msg: Ready) {
        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return;
            };
            if q.consumers.is_empty() {
                q.ready.push_back(msg);
                return;
            }

            let idx = q.next_consumer % q.consumers.len();
            q.next_consumer = q.next_consumer.wrapping_add(1);
            let channel_id = q.consumers[idx].channel_id;
            let no_ack = q.consumers[idx].no_ack;
            let tx = q.consumers[idx].tx.clone();

            let delivery_tag = self.next_delivery_tag(channel_id);
            let delivery = InboundDelivery {
                delivery_tag,
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: msg.redelivered,
                headers: msg.headers.clone(),
                data: msg.data.clone(),
            };

            if tx.send(Ok(delivery)).is_ok() {
                if !no_ack {
                    self.unacked
                        .insert((channel_id, delivery_tag), (queue.to_owned(), msg));
                }
                return;
            }

            // the consumer stream is gone
            if let Some(q) = self.queues.get_mut(queue) {
                q.consumers.remove(idx);
            }
        }
    }

    fn drain(&mut self, queue: &str) {
        let pending: Vec<Ready> = match self.queues.get_mut(queue) {
            Some(q) => q.ready.drain(..).collect(),
            None => return,
        };
        for msg in pending {
            self.route(queue, msg);
        }
    }

    /// Drops everything a channel owned: consumers, exclusive queues, unacked messages.
    fn release(&mut self, channel_id: u64) {
        for q in self.queues.values_mut() {
            q.consumers.retain(|c| c.channel_id != channel_id);
        }

        let owned: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(channel_id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            self.queues.remove(name);
        }
        self.bindings
            .retain(|b| !owned.iter().any(|name| name == b.queue_name()));

        let keys: Vec<(u64, u64)> = self
            .unacked
            .keys()
            .filter(|(id, _)| *id == channel_id)
            .copied()
            .collect();
        for key in keys {
            if let Some((queue, mut msg)) = self.unacked.remove(&key) {
                msg.redelivered = true;
                self.route(&queue, msg);
            }
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => topic_matches(&pattern[1..], &key[1..]),
        _ => false,
    }
}

fn routes(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

/// A broker living in memory.
#[derive(Clone, Default)]
pub struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeBroker::default())
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().expect("broker state")
    }

    /// Successful connections so far.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    /// Refuses new connections while set.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    /// Kills every open connection, as a broker restart would.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let links: Vec<(u64, Link)> = state.links.drain().collect();

        for (id, link) in links {
            link.open.store(false, Ordering::SeqCst);
            state.release(id);
            link.signal.send_replace(true);
        }
    }

    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn consumers(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Bodies of every accepted publish, in order.
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.lock().published.clone()
    }
}

#[async_trait]
impl AmqpTransport for FakeBroker {
    async fn open(&self, _configs: &AmqpConfigs) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.lock();
        state.open_attempts += 1;
        if state.down {
            return Err(AmqpError::ConnectionError);
        }

        state.connects += 1;
        state.next_channel += 1;
        let id = state.next_channel;

        let open = Arc::new(AtomicBool::new(true));
        let (signal, _) = watch::channel(false);
        let signal = Arc::new(signal);
        state.links.insert(
            id,
            Link {
                open: open.clone(),
                signal: signal.clone(),
            },
        );

        Ok(Arc::new(FakeChannel {
            id,
            broker: self.clone(),
            open,
            signal,
        }))
    }
}

pub struct FakeChannel {
    id: u64,
    broker: FakeBroker,
    open: Arc<AtomicBool>,
    signal: Arc<watch::Sender<bool>>,
}

impl FakeChannel {
    fn ensure_open(&self, err: AmqpError) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(err)
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        self.ensure_open(AmqpError::DeclareQueueError(def.name().to_owned()))?;
        let mut state = self.broker.lock();

        let name = if def.name().is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            def.name().to_owned()
        };

        if def.is_passive() && !state.queues.contains_key(&name) {
            return Err(AmqpError::DeclareQueueError(name));
        }

        let owner = def.is_exclusive().then_some(self.id);
        let queue = state.queues.entry(name.clone()).or_insert_with(|| FakeQueue {
            owner,
            ..Default::default()
        });

        Ok(QueueInfo {
            name,
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
        })
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::DeclareExchangeError(def.name().to_owned()))?;
        self.broker
            .lock()
            .exchanges
            .insert(def.name().to_owned(), def.exchange_kind().clone());
        Ok(())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::BindingExchangeToQueueError(
            binding.exchange_name().to_owned(),
            binding.queue_name().to_owned(),
        ))?;
        self.broker.lock().bindings.push(binding.clone());
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::QoSDeclarationError(prefetch.to_string()))
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::PublishingError)?;
        let mut state = self.broker.lock();
        if state.fail_publishes {
            return Err(AmqpError::PublishingError);
        }

        state.published.push(msg.data.clone());
        let ready = Ready {
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            headers: msg.headers.clone(),
            data: msg.data.clone(),
            redelivered: false,
        };

        if msg.exchange.is_empty() {
            state.route(&msg.routing_key, ready);
            return Ok(());
        }

        let Some(kind) = state.exchanges.get(&msg.exchange).cloned() else {
            return Err(AmqpError::PublishingError);
        };
        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| {
                b.exchange_name() == msg.exchange && routes(&kind, b.key(), &msg.routing_key)
            })
            .map(|b| b.queue_name().to_owned())
            .collect();

        for queue in targets {
            state.route(&queue, ready.clone());
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open(AmqpError::ConsumerDeclarationError)?;
        let mut state = self.broker.lock();

        let (tx, rx) = mpsc::unbounded_channel();
        let Some(q) = state.queues.get_mut(queue) else {
            return Err(AmqpError::ConsumerDeclarationError);
        };
        q.consumers.push(FakeConsumer {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            no_ack,
            tx,
        });
        state.drain(queue);

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        })
        .boxed())
    }

    async fn get(&self, queue: &str, no_ack: bool) -> Result<Option<InboundDelivery>, AmqpError> {
        self.ensure_open(AmqpError::GetMessageError(queue.to_owned()))?;
        let mut state = self.broker.lock();

        let Some(msg) = state.queues.get_mut(queue).and_then(|q| q.ready.pop_front()) else {
            return Ok(None);
        };

        let delivery_tag = state.next_delivery_tag(self.id);
        let delivery = InboundDelivery {
            delivery_tag,
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            redelivered: msg.redelivered,
            headers: msg.headers.clone(),
            data: msg.data.clone(),
        };
        if !no_ack {
            state
                .unacked
                .insert((self.id, delivery_tag), (queue.to_owned(), msg));
        }

        Ok(Some(delivery))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::AckMessageError)?;
        match self.broker.lock().unacked.remove(&(self.id, delivery_tag)) {
            Some(_) => Ok(()),
            None => Err(AmqpError::AckMessageError),
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::NackMessageError)?;
        let mut state = self.broker.lock();
        let Some((queue, mut msg)) = state.unacked.remove(&(self.id, delivery_tag)) else {
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            msg.redelivered = true;
            state.route(&queue, msg);
        }
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.ensure_open(AmqpError::CancelConsumerError(consumer_tag.to_owned()))?;
        for q in self.broker.lock().queues.values_mut() {
            q.consumers.retain(|c| c.tag != consumer_tag);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.lock();
        state.links.remove(&self.id);
        state.release(self.id);
        Ok(())
    }
}

/// Handler forwarding every message to the returned receiver.
pub fn collecting_handler() -> (
    Arc<dyn ConsumerHandler>,
    mpsc::UnboundedReceiver<ConsumerMessage>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = handler_fn(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
            Ok(())
        }
    });
    (handler, rx)
}

/// Waits for the next handled message.
pub async fn next_message(rx: &mut mpsc::UnboundedReceiver<ConsumerMessage>) -> ConsumerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message in time")
        .expect("handler alive")
}

/// Polls `cond` until it holds, for at most two seconds.
pub async fn eventually<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond().await
}

pub fn configs() -> AmqpConfigs {
    AmqpConfigs::default().reconnect_after(Duration::from_millis(20))
}
