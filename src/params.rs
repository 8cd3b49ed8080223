// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Operation Parameters
//!
//! Caller-facing parameter shapes for every operation and their normalized
//! counterparts. [`Validate`] plays the role of the validation pattern: it checks the
//! required fields, fills in the defaults of the optional `extra` parameters and fails
//! with [`AmqpError::ValidationError`] before any I/O happens.
//!
//! Normalized options convert back into parameters (`From<ConsumeOptions> for
//! ConsumeParams`...) so a registered consumer can be replayed with exactly the
//! values the broker last agreed to.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    handler::ConsumerHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr, sync::Arc};

pub const DEFAULT_EXCHANGE_NAME: &str = "default";
pub const DEFAULT_EXCHANGE_TYPE: &str = "topic";
pub const DEFAULT_PREFETCH: u16 = 1;

/// Turns raw parameters into normalized, defaulted options.
pub trait Validate {
    type Output: Clone + Send + Sync + 'static;

    fn validate(self) -> Result<Self::Output, AmqpError>;
}

/// How deliveries get acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Acknowledged on receipt, before the handler runs
    #[default]
    Auto,
    /// Acknowledged once the handler succeeds, rejected when it fails
    Resolve,
    /// Tracked, the caller acks or nacks with the issued ack id
    Manual,
}

impl FromStr for AckMode {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "resolve" => Ok(AckMode::Resolve),
            "manual" => Ok(AckMode::Manual),
            other => Err(AmqpError::validation(format!("unknown ack mode `{}`", other))),
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckMode::Auto => "auto",
            AckMode::Resolve => "resolve",
            AckMode::Manual => "manual",
        };
        f.write_str(name)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<(), AmqpError> {
    if value.trim().is_empty() {
        return Err(AmqpError::validation(format!("missing `{}`", field)));
    }
    Ok(())
}

fn require_object(json: &Value) -> Result<(), AmqpError> {
    if !json.is_object() {
        return Err(AmqpError::validation("`json` must be an object"));
    }
    Ok(())
}

// ---- produce -------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProduceExtra {
    #[serde(rename = "mq_persistent", skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(rename = "mq_durable", skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

/// Parameters of `produce`: send `json` to `queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProduceParams {
    pub queue: String,
    pub json: Value,
    #[serde(default)]
    pub extra: ProduceExtra,
}

impl ProduceParams {
    pub fn new(queue: &str, json: Value) -> Self {
        ProduceParams {
            queue: queue.to_owned(),
            json,
            extra: ProduceExtra::default(),
        }
    }

    pub fn extra(mut self, extra: ProduceExtra) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceOptions {
    pub queue: String,
    pub json: Value,
    pub persistent: bool,
    pub durable: bool,
}

impl Validate for ProduceParams {
    type Output = ProduceOptions;

    fn validate(self) -> Result<ProduceOptions, AmqpError> {
        require_non_empty("queue", &self.queue)?;
        require_object(&self.json)?;

        Ok(ProduceOptions {
            queue: self.queue,
            json: self.json,
            persistent: self.extra.persistent.unwrap_or(true),
            durable: self.extra.durable.unwrap_or(true),
        })
    }
}

// ---- consume -------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumeExtra {
    #[serde(rename = "mq_noAck", skip_serializing_if = "Option::is_none")]
    pub no_ack: Option<bool>,
    #[serde(rename = "mq_prefetch", skip_serializing_if = "Option::is_none")]
    pub prefetch: Option<u16>,
    #[serde(rename = "mq_durable", skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

/// Parameters of `consume`: run `cb` for every message of `queue`.
#[derive(Clone)]
pub struct ConsumeParams {
    pub queue: String,
    pub cb: Arc<dyn ConsumerHandler>,
    /// Defaults to `resolve`
    pub ack: Option<AckMode>,
    pub extra: ConsumeExtra,
}

impl ConsumeParams {
    pub fn new(queue: &str, cb: Arc<dyn ConsumerHandler>) -> Self {
        ConsumeParams {
            queue: queue.to_owned(),
            cb,
            ack: None,
            extra: ConsumeExtra::default(),
        }
    }

    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = Some(mode);
        self
    }

    pub fn extra(mut self, extra: ConsumeExtra) -> Self {
        self.extra = extra;
        self
    }
}

impl fmt::Debug for ConsumeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeParams")
            .field("queue", &self.queue)
            .field("ack", &self.ack)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ConsumeOptions {
    pub queue: String,
    pub handler: Arc<dyn ConsumerHandler>,
    pub ack: AckMode,
    pub no_ack: bool,
    pub prefetch: u16,
    pub durable: bool,
}

impl fmt::Debug for ConsumeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeOptions")
            .field("queue", &self.queue)
            .field("ack", &self.ack)
            .field("no_ack", &self.no_ack)
            .field("prefetch", &self.prefetch)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl Validate for ConsumeParams {
    type Output = ConsumeOptions;

    fn validate(self) -> Result<ConsumeOptions, AmqpError> {
        require_non_empty("queue", &self.queue)?;

        let ack = self.ack.unwrap_or(AckMode::Resolve);
        let no_ack = self.extra.no_ack.unwrap_or(false);
        if no_ack && ack != AckMode::Auto {
            return Err(AmqpError::validation(format!(
                "`mq_noAck` cannot be combined with the `{}` ack mode",
                ack
            )));
        }

        Ok(ConsumeOptions {
            queue: self.queue,
            handler: self.cb,
            ack,
            no_ack,
            prefetch: self.extra.prefetch.unwrap_or(DEFAULT_PREFETCH),
            durable: self.extra.durable.unwrap_or(true),
        })
    }
}

impl From<ConsumeOptions> for ConsumeParams {
    fn from(opts: ConsumeOptions) -> Self {
        ConsumeParams {
            queue: opts.queue,
            cb: opts.handler,
            ack: Some(opts.ack),
            extra: ConsumeExtra {
                no_ack: Some(opts.no_ack),
                prefetch: Some(opts.prefetch),
                durable: Some(opts.durable),
            },
        }
    }
}

// ---- publish / subscribe -------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeExtra {
    #[serde(rename = "mq_ex_name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "mq_ex_type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "mq_durable", skip_serializing_if = "Option::is_none")]
    pub durable: Option<bool>,
}

impl ExchangeExtra {
    fn definition(self) -> Result<ExchangeDefinition, AmqpError> {
        let name = self
            .name
            .unwrap_or_else(|| DEFAULT_EXCHANGE_NAME.to_owned());
        require_non_empty("mq_ex_name", &name)?;

        let kind = self
            .kind
            .as_deref()
            .unwrap_or(DEFAULT_EXCHANGE_TYPE)
            .parse::<ExchangeKind>()?;

        Ok(ExchangeDefinition::new(&name)
            .kind(kind)
            .with_durable(self.durable.unwrap_or(false)))
    }
}

impl From<&ExchangeDefinition> for ExchangeExtra {
    fn from(def: &ExchangeDefinition) -> Self {
        ExchangeExtra {
            name: Some(def.name.clone()),
            kind: Some(def.kind.to_string()),
            durable: Some(def.durable),
        }
    }
}

fn require_routing_key(key: &str, exchange: &ExchangeDefinition) -> Result<(), AmqpError> {
    if exchange.kind == ExchangeKind::Fanout {
        return Ok(());
    }
    require_non_empty("key", key)
}

/// Parameters of `publish`: send `json` to the exchange under routing `key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishParams {
    pub key: String,
    pub json: Value,
    #[serde(default)]
    pub extra: ExchangeExtra,
}

impl PublishParams {
    pub fn new(key: &str, json: Value) -> Self {
        PublishParams {
            key: key.to_owned(),
            json,
            extra: ExchangeExtra::default(),
        }
    }

    pub fn extra(mut self, extra: ExchangeExtra) -> Self {
        self.extra = extra;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub key: String,
    pub json: Value,
    pub exchange: ExchangeDefinition,
}

impl Validate for PublishParams {
    type Output = PublishOptions;

    fn validate(self) -> Result<PublishOptions, AmqpError> {
        require_object(&self.json)?;
        let exchange = self.extra.definition()?;
        require_routing_key(&self.key, &exchange)?;

        Ok(PublishOptions {
            key: self.key,
            json: self.json,
            exchange,
        })
    }
}

/// Parameters of `subscribe`: run `cb` for every message published under `key`.
#[derive(Clone)]
pub struct SubscribeParams {
    pub key: String,
    pub cb: Arc<dyn ConsumerHandler>,
    /// Defaults to `auto`
    pub ack: Option<AckMode>,
    pub extra: ExchangeExtra,
}

impl SubscribeParams {
    pub fn new(key: &str, cb: Arc<dyn ConsumerHandler>) -> Self {
        SubscribeParams {
            key: key.to_owned(),
            cb,
            ack: None,
            extra: ExchangeExtra::default(),
        }
    }

    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = Some(mode);
        self
    }

    pub fn extra(mut self, extra: ExchangeExtra) -> Self {
        self.extra = extra;
        self
    }
}

impl fmt::Debug for SubscribeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeParams")
            .field("key", &self.key)
            .field("ack", &self.ack)
            .field("extra", &self.extra)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SubscribeOptions {
    pub key: String,
    pub handler: Arc<dyn ConsumerHandler>,
    pub ack: AckMode,
    pub exchange: ExchangeDefinition,
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("key", &self.key)
            .field("ack", &self.ack)
            .field("exchange", &self.exchange)
            .finish_non_exhaustive()
    }
}

impl Validate for SubscribeParams {
    type Output = SubscribeOptions;

    fn validate(self) -> Result<SubscribeOptions, AmqpError> {
        let exchange = self.extra.definition()?;
        require_routing_key(&self.key, &exchange)?;

        Ok(SubscribeOptions {
            key: self.key,
            handler: self.cb,
            ack: self.ack.unwrap_or(AckMode::Auto),
            exchange,
        })
    }
}

impl From<SubscribeOptions> for SubscribeParams {
    fn from(opts: SubscribeOptions) -> Self {
        SubscribeParams {
            extra: ExchangeExtra::from(&opts.exchange),
            key: opts.key,
            cb: opts.handler,
            ack: Some(opts.ack),
        }
    }
}

// ---- get -----------------------------------------------------------------------

/// Parameters of `get`: pull a single message from `queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetParams {
    pub queue: String,
    /// `auto` (default) or `manual`
    #[serde(default)]
    pub ack: Option<AckMode>,
}

impl GetParams {
    pub fn new(queue: &str) -> Self {
        GetParams {
            queue: queue.to_owned(),
            ack: None,
        }
    }

    pub fn ack(mut self, mode: AckMode) -> Self {
        self.ack = Some(mode);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetOptions {
    pub queue: String,
    pub ack: AckMode,
}

impl Validate for GetParams {
    type Output = GetOptions;

    fn validate(self) -> Result<GetOptions, AmqpError> {
        require_non_empty("queue", &self.queue)?;

        let ack = self.ack.unwrap_or(AckMode::Auto);
        if ack == AckMode::Resolve {
            return Err(AmqpError::validation(
                "`get` has no callback, use the `auto` or `manual` ack mode",
            ));
        }

        Ok(GetOptions {
            queue: self.queue,
            ack,
        })
    }
}

// ---- single value operations ---------------------------------------------------

/// Parameters of `ack` and `nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckParams {
    pub ack_id: String,
}

impl Validate for AckParams {
    type Output = AckParams;

    fn validate(self) -> Result<AckParams, AmqpError> {
        require_non_empty("ack_id", &self.ack_id)?;
        Ok(self)
    }
}

/// Parameters of `info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoParams {
    pub queue: String,
}

impl Validate for InfoParams {
    type Output = InfoParams;

    fn validate(self) -> Result<InfoParams, AmqpError> {
        require_non_empty("queue", &self.queue)?;
        Ok(self)
    }
}

/// Parameters of `cancel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelParams {
    pub consumer_tag: String,
}

impl Validate for CancelParams {
    type Output = CancelParams;

    fn validate(self) -> Result<CancelParams, AmqpError> {
        require_non_empty("consumer_tag", &self.consumer_tag)?;
        Ok(self)
    }
}
