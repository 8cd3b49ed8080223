// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module processes a single delivery according to the acknowledgment mode of its
//! consumer:
//!
//! - `auto`: the delivery is acknowledged on receipt, then the handler runs
//! - `resolve`: the delivery is acknowledged when the handler succeeds and rejected
//!   when it fails
//! - `manual`: the delivery is tracked and the handler receives the ack id to resolve
//!   it later
//!
//! Every delivery opens an OpenTelemetry consumer span from the propagated context.

use crate::{
    errors::AmqpError,
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    params::AckMode,
    publisher::decode,
    tracker::MessageTracker,
    transport::{AmqpChannel, InboundDelivery},
};
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tracing::{debug, error, warn};

/// Everything needed to process the deliveries of one consumer.
#[derive(Clone)]
pub(crate) struct ConsumerDefinition {
    /// Queue name or routing key, used as span name and message source
    pub(crate) source: String,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) ack: AckMode,
    /// The broker does not expect acknowledgments at all
    pub(crate) no_ack: bool,
    pub(crate) requeue_on_reject: bool,
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) tracker: Arc<MessageTracker>,
}

/// Consumes and processes one delivery.
///
/// # Parameters
/// * `tracer` - OpenTelemetry tracer for creating spans
/// * `delivery` - The delivery to process
/// * `def` - The consumer the delivery belongs to
///
/// # Returns
/// Ok(()) on success or AmqpError on failure
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: InboundDelivery,
    def: &ConsumerDefinition,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &def.source);

    debug!(
        "received: {} - exchange: {}",
        def.source,
        delivery.exchange.to_string(),
    );

    let json = match decode(&delivery.data) {
        Ok(json) => json,
        Err(err) => {
            let msg = "removing message from queue - reason: payload is not json";
            record(&mut span, &err, msg);
            debug!("{}", msg);

            if !def.no_ack {
                if let Err(e) = def.channel.nack(delivery.delivery_tag, false).await {
                    record(&mut span, &e, "error to nack msg");
                }
            }

            return Err(err);
        }
    };

    let mut msg = ConsumerMessage {
        source: def.source.clone(),
        json,
        ack_id: None,
        redelivered: delivery.redelivered,
    };

    match def.ack {
        AckMode::Auto => {
            if !def.no_ack {
                if let Err(e) = def.channel.ack(delivery.delivery_tag).await {
                    error!("error whiling ack msg");
                    record(&mut span, &e, "error to ack msg");
                    return Err(AmqpError::AckMessageError);
                }
            }

            if let Err(e) = def.handler.exec(&ctx, &msg).await {
                warn!(error = e.to_string(), "handler failure on auto acked msg");
                record(&mut span, &e, "handler failure");
                return Ok(());
            }

            span.set_status(Status::Ok);
            Ok(())
        }

        AckMode::Resolve => {
            if def.handler.exec(&ctx, &msg).await.is_ok() {
                debug!("message successfully processed");
                return match def.channel.ack(delivery.delivery_tag).await {
                    Err(e) => {
                        error!("error whiling ack msg");
                        record(&mut span, &e, "error to ack msg");
                        Err(AmqpError::AckMessageError)
                    }
                    _ => {
                        span.set_status(Status::Ok);
                        Ok(())
                    }
                };
            }

            warn!(
                requeue = def.requeue_on_reject,
                "error whiling handling msg, rejecting"
            );
            match def
                .channel
                .nack(delivery.delivery_tag, def.requeue_on_reject)
                .await
            {
                Err(e) => {
                    error!("error whiling nack msg");
                    record(&mut span, &e, "error to nack msg");
                    Err(AmqpError::NackMessageError)
                }
                _ => {
                    span.set_status(Status::Error {
                        description: Cow::from("handler rejected the msg"),
                    });
                    Ok(())
                }
            }
        }

        AckMode::Manual => {
            let ack_id = def
                .tracker
                .track(def.channel.clone(), delivery.delivery_tag, delivery.data)
                .await;
            msg.ack_id = Some(ack_id);

            if let Err(e) = def.handler.exec(&ctx, &msg).await {
                warn!(error = e.to_string(), "handler failure on tracked msg");
                record(&mut span, &e, "handler failure");
                return Ok(());
            }

            span.set_status(Status::Ok);
            Ok(())
        }
    }
}

fn record(span: &mut BoxedSpan, err: &(dyn std::error::Error + 'static), description: &str) {
    span.record_error(err);
    span.set_status(Status::Error {
        description: Cow::from(description.to_owned()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::handler_fn, transport::MockAmqpChannel};
    use opentelemetry::global;
    use serde_json::json;
    use std::{sync::Mutex, time::Duration};

    fn definition(
        ack: AckMode,
        channel: MockAmqpChannel,
        handler: Arc<dyn ConsumerHandler>,
    ) -> ConsumerDefinition {
        ConsumerDefinition {
            source: "jobs".to_owned(),
            handler,
            ack,
            no_ack: false,
            requeue_on_reject: true,
            channel: Arc::new(channel),
            tracker: MessageTracker::new(Duration::from_secs(60)),
        }
    }

    fn delivery(tag: u64, data: &[u8]) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: tag,
            routing_key: "jobs".to_owned(),
            data: data.to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn resolve_acks_after_the_handler_succeeds() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_ack().withf(|t| *t == 1).times(1).returning(|_| Ok(()));

        let seen = Arc::new(Mutex::new(vec![]));
        let sink = seen.clone();
        let handler = handler_fn(move |msg| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("lock").push(msg.json);
                Ok(())
            }
        });

        let def = definition(AckMode::Resolve, channel, handler);
        consume(&global::tracer("test"), delivery(1, br#"{"a":1}"#), &def)
            .await
            .expect("consumed");

        assert_eq!(*seen.lock().expect("lock"), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn resolve_nacks_when_the_handler_fails() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_ack().times(0);
        channel
            .expect_nack()
            .withf(|t, requeue| *t == 2 && *requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = handler_fn(|_| async { Err(AmqpError::HandlerError("boom".to_owned())) });
        let def = definition(AckMode::Resolve, channel, handler);

        consume(&global::tracer("test"), delivery(2, b"{}"), &def)
            .await
            .expect("rejected");
    }

    #[tokio::test]
    async fn auto_acks_before_the_handler_runs() {
        let acked = Arc::new(Mutex::new(false));
        let flag = acked.clone();
        let mut channel = MockAmqpChannel::new();
        channel.expect_ack().times(1).returning(move |_| {
            *flag.lock().expect("lock") = true;
            Ok(())
        });

        let observed = acked.clone();
        let handler = handler_fn(move |_| {
            let observed = observed.clone();
            async move {
                assert!(*observed.lock().expect("lock"));
                Err(AmqpError::HandlerError("ignored".to_owned()))
            }
        });

        let def = definition(AckMode::Auto, channel, handler);
        consume(&global::tracer("test"), delivery(3, b"{}"), &def)
            .await
            .expect("consumed");
    }

    #[tokio::test]
    async fn auto_with_broker_no_ack_sends_nothing() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_ack().times(0);

        let mut def = definition(AckMode::Auto, channel, handler_fn(|_| async { Ok(()) }));
        def.no_ack = true;

        consume(&global::tracer("test"), delivery(4, b"{}"), &def)
            .await
            .expect("consumed");
    }

    #[tokio::test]
    async fn manual_tracks_the_delivery() {
        let mut channel = MockAmqpChannel::new();
        channel.expect_ack().times(0);

        let ids = Arc::new(Mutex::new(vec![]));
        let sink = ids.clone();
        let handler = handler_fn(move |msg| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("lock").push(msg.ack_id);
                Ok(())
            }
        });

        let def = definition(AckMode::Manual, channel, handler);
        consume(&global::tracer("test"), delivery(5, b"{}"), &def)
            .await
            .expect("consumed");

        let ack_id = ids.lock().expect("lock")[0].clone().expect("ack id");
        assert!(def.tracker.contains(&ack_id).await);
    }

    #[tokio::test]
    async fn malformed_payloads_are_dropped() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_nack()
            .withf(|t, requeue| *t == 6 && !*requeue)
            .times(1)
            .returning(|_, _| Ok(()));

        let def = definition(AckMode::Resolve, channel, handler_fn(|_| async { Ok(()) }));
        let err = consume(&global::tracer("test"), delivery(6, b"nope"), &def)
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::ParsePayloadError);
    }
}
