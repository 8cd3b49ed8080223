// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bus
//!
//! The single entry point of the crate. A bus picks its provider by name, forwards the
//! public operations to it, and remembers every consumer and subscriber it started in
//! a [`ConsumerRegistry`]. Whenever the provider reconnects, the registered calls are
//! replayed with the parameters they last ran with.
//!
//! ```ignore
//! let bus = MessageBus::new("rabbitmq", AmqpConfigs::from_env())?;
//!
//! bus.produce(ProduceParams::new("jobs", json!({"wait": 3}))).await?;
//!
//! let registered = bus
//!     .consume(ConsumeParams::new("jobs", handler_fn(|msg| async move {
//!         println!("{}", msg.json);
//!         Ok(())
//!     })))
//!     .await?;
//! ```

use crate::{
    channel::LapinTransport,
    configs::AmqpConfigs,
    connection::ConnectionStatus,
    errors::AmqpError,
    executor::Executed,
    handler::ConsumerMessage,
    params::{
        AckParams, CancelParams, ConsumeOptions, ConsumeParams, GetOptions, GetParams,
        InfoParams, ProduceOptions, ProduceParams, PublishOptions, PublishParams,
        SubscribeOptions, SubscribeParams,
    },
    provider::{Consumer, Provider, ProviderKind},
    queue::QueueInfo,
    registry::{ClientUid, ConsumerRegistry, Registration, ReplayOutcome, Replayer},
    transport::AmqpTransport,
};
use async_trait::async_trait;
use std::sync::{Arc, OnceLock, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Result of `consume` and `subscribe`: the registration uid on top of the usual
/// result and normalized parameters.
///
/// A replay after a reconnection starts a consumer with a new uid and tag. The ones
/// returned here keep working with [`MessageBus::cancel`], [`MessageBus::cancel_client`],
/// [`MessageBus::registration`] and [`MessageBus::consumer_tag`], which resolve them to
/// the live consumer.
#[derive(Debug, Clone)]
pub struct Registered<P> {
    pub uid: ClientUid,
    pub result: Consumer,
    pub params: P,
}

pub struct MessageBus {
    provider: Arc<dyn Provider>,
    registry: ConsumerRegistry,
    replay: OnceLock<JoinHandle<()>>,
}

impl MessageBus {
    /// Creates a bus on the provider registered under `name`, connected through lapin.
    ///
    /// Fails with [`AmqpError::UnknownProvider`] for names outside the registry. Must
    /// be called from within a tokio runtime.
    pub fn new(name: &str, configs: AmqpConfigs) -> Result<Arc<Self>, AmqpError> {
        Self::with_transport(name, Arc::new(LapinTransport), configs)
    }

    pub fn with_transport(
        name: &str,
        transport: Arc<dyn AmqpTransport>,
        configs: AmqpConfigs,
    ) -> Result<Arc<Self>, AmqpError> {
        let kind = name.parse::<ProviderKind>()?;
        info!(provider = %kind, url = configs.url, "creating message bus");
        Ok(Self::with_provider(kind.build(transport, configs)))
    }

    /// Creates a bus on an already built provider.
    ///
    /// The bus takes the reconnected signal of the provider. When someone else took it
    /// first, consumers are not replayed.
    pub fn with_provider(provider: Arc<dyn Provider>) -> Arc<Self> {
        let reconnected = provider.take_reconnected();
        let bus = Arc::new(MessageBus {
            provider,
            registry: ConsumerRegistry::new(),
            replay: OnceLock::new(),
        });

        let Some(mut rx) = reconnected else {
            warn!("reconnected signal already taken, clients will not be replayed");
            return bus;
        };

        let weak: Weak<MessageBus> = Arc::downgrade(&bus);
        let replay = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(bus) = weak.upgrade() else {
                    break;
                };

                info!(cycle = event.cycle, "provider reconnected, replaying clients");
                if let ReplayOutcome::Completed { replayed, failed } =
                    bus.registry.replay_all(bus.as_ref()).await
                {
                    info!(replayed = replayed, failed = failed, "replay done");
                }
            }
        });
        let _ = bus.replay.set(replay);

        bus
    }

    pub async fn produce(
        &self,
        params: ProduceParams,
    ) -> Result<Executed<String, ProduceOptions>, AmqpError> {
        self.provider.produce(params).await
    }

    /// Starts a consumer and registers it for replay.
    pub async fn consume(
        &self,
        params: ConsumeParams,
    ) -> Result<Registered<ConsumeOptions>, AmqpError> {
        let executed = self.provider.consume(params).await?;
        let uid = self
            .registry
            .register(
                Registration::Consume(executed.params.clone()),
                &executed.result.consumer_tag,
            )
            .await;

        Ok(Registered {
            uid,
            result: executed.result,
            params: executed.params,
        })
    }

    pub async fn publish(
        &self,
        params: PublishParams,
    ) -> Result<Executed<String, PublishOptions>, AmqpError> {
        self.provider.publish(params).await
    }

    /// Starts a subscriber and registers it for replay.
    pub async fn subscribe(
        &self,
        params: SubscribeParams,
    ) -> Result<Registered<SubscribeOptions>, AmqpError> {
        let executed = self.provider.subscribe(params).await?;
        let uid = self
            .registry
            .register(
                Registration::Subscribe(executed.params.clone()),
                &executed.result.consumer_tag,
            )
            .await;

        Ok(Registered {
            uid,
            result: executed.result,
            params: executed.params,
        })
    }

    pub async fn get(
        &self,
        params: GetParams,
    ) -> Result<Executed<Option<ConsumerMessage>, GetOptions>, AmqpError> {
        self.provider.get(params).await
    }

    pub async fn ack(&self, ack_id: &str) -> Result<Executed<(), AckParams>, AmqpError> {
        self.provider
            .ack(AckParams {
                ack_id: ack_id.to_owned(),
            })
            .await
    }

    pub async fn nack(&self, ack_id: &str) -> Result<Executed<(), AckParams>, AmqpError> {
        self.provider
            .nack(AckParams {
                ack_id: ack_id.to_owned(),
            })
            .await
    }

    pub async fn info(&self, queue: &str) -> Result<Executed<QueueInfo, InfoParams>, AmqpError> {
        self.provider
            .info(InfoParams {
                queue: queue.to_owned(),
            })
            .await
    }

    /// Cancels a consumer and forgets its registration.
    ///
    /// The tag may be one the consumer had before being replayed. A registration whose
    /// consumer is already gone (its replay keeps failing, for instance) is still
    /// forgotten.
    pub async fn cancel(
        &self,
        consumer_tag: &str,
    ) -> Result<Executed<(), CancelParams>, AmqpError> {
        let consumer_tag = self
            .registry
            .current_tag(consumer_tag)
            .await
            .unwrap_or_else(|| consumer_tag.to_owned());
        let params = CancelParams {
            consumer_tag: consumer_tag.clone(),
        };

        match self.provider.cancel(params.clone()).await {
            Ok(executed) => {
                self.registry.unregister_by_tag(&consumer_tag).await;
                Ok(executed)
            }
            Err(AmqpError::NotFound(tag)) => match self.registry.unregister_by_tag(&tag).await {
                Some(uid) => {
                    debug!(uid = %uid, "forgot registration of a stopped consumer");
                    Ok(Executed { result: (), params })
                }
                None => Err(AmqpError::NotFound(tag)),
            },
            Err(err) => Err(err),
        }
    }

    /// Cancels the consumer registered under `uid`.
    pub async fn cancel_client(
        &self,
        uid: ClientUid,
    ) -> Result<Executed<(), CancelParams>, AmqpError> {
        match self.registry.consumer_tag(uid).await {
            Some(consumer_tag) => self.cancel(&consumer_tag).await,
            None => Err(AmqpError::NotFound(uid.to_string())),
        }
    }

    pub async fn health_check(&self) -> bool {
        self.provider.health_check().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.provider.status()
    }

    /// Currently registered clients, oldest first.
    pub async fn clients(&self) -> Vec<ClientUid> {
        self.registry.uids().await
    }

    pub async fn registration(&self, uid: ClientUid) -> Option<Registration> {
        self.registry.get(uid).await
    }

    pub async fn consumer_tag(&self, uid: ClientUid) -> Option<String> {
        self.registry.consumer_tag(uid).await
    }

    /// Closes the provider. Registrations are kept but no longer replayed.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Some(replay) = self.replay.get() {
            replay.abort();
        }
        self.provider.close().await
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        if let Some(replay) = self.replay.get() {
            replay.abort();
        }
    }
}

#[async_trait]
impl Replayer for MessageBus {
    async fn replay(&self, registration: Registration) -> Result<ClientUid, AmqpError> {
        match registration {
            Registration::Consume(opts) => self
                .consume(ConsumeParams::from(opts))
                .await
                .map(|registered| registered.uid),
            Registration::Subscribe(opts) => self
                .subscribe(SubscribeParams::from(opts))
                .await
                .map(|registered| registered.uid),
        }
    }

    async fn discard(&self, uid: ClientUid) {
        if let Err(err) = self.cancel_client(uid).await {
            warn!(uid = %uid, error = err.to_string(), "failure to cancel replayed client");
            self.registry.unregister(uid).await;
        }
    }
}
