// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Operation Executor
//!
//! The pipeline every provider operation goes through:
//!
//! 1. validate the parameters (no I/O happens on bad input)
//! 2. ensure a live channel through the connection manager
//! 3. run the broker operation
//! 4. hand back the result together with the normalized parameters
//!
//! A broker failure on a channel that is no longer open is reported as
//! [`AmqpError::DisconnectedMidOperation`] and handed to the connection manager, which
//! starts recovering on its own.

use crate::{
    connection::ConnectionManager,
    errors::AmqpError,
    params::Validate,
    transport::AmqpChannel,
};
use std::{future::Future, sync::Arc};
use tracing::{debug, warn};

/// Result of an operation along with the parameters it actually ran with.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed<R, P> {
    pub result: R,
    pub params: P,
}

/// Runs `operation` through the validate, connect, execute pipeline.
pub(crate) async fn exec<P, R, F, Fut>(
    connection: &Arc<ConnectionManager>,
    method: &str,
    params: P,
    operation: F,
) -> Result<Executed<R, P::Output>, AmqpError>
where
    P: Validate,
    F: FnOnce(Arc<dyn AmqpChannel>, P::Output) -> Fut,
    Fut: Future<Output = Result<R, AmqpError>>,
{
    let params = params.validate().map_err(|err| {
        debug!(method = method, error = err.to_string(), "invalid parameters");
        err
    })?;

    let channel = connection.connect(false).await?;

    match operation(channel.clone(), params.clone()).await {
        Ok(result) => Ok(Executed { result, params }),
        Err(err) if err.is_infrastructure() && !channel.is_open() => {
            warn!(
                method = method,
                error = err.to_string(),
                "channel lost while executing"
            );
            connection.report_failure(&channel).await;
            Err(AmqpError::DisconnectedMidOperation(method.to_owned()))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::AmqpConfigs,
        params::{InfoParams, ProduceParams},
        transport::{MockAmqpChannel, MockAmqpTransport},
    };
    use crate::connection::{ConnectionStatus, ReconnectedEvent};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::watch;

    fn manager_with(channel: MockAmqpChannel, opens: usize) -> Arc<ConnectionManager> {
        let channel: Arc<dyn AmqpChannel> = Arc::new(channel);
        let mut transport = MockAmqpTransport::new();
        transport
            .expect_open()
            .times(opens)
            .returning(move |_| Ok(channel.clone()));
        ConnectionManager::new(Arc::new(transport), AmqpConfigs::default())
    }

    #[tokio::test]
    async fn validation_failures_never_connect() {
        let manager = manager_with(MockAmqpChannel::new(), 0);

        let err = exec(
            &manager,
            "produce",
            ProduceParams::new("", json!({})),
            |_, _| async { Ok(()) },
        )
        .await
        .unwrap_err();

        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn returns_the_normalized_params() {
        let (_tx, rx) = watch::channel(false);
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_disconnected().returning(move || rx.clone());

        let manager = manager_with(channel, 1);
        let executed = exec(
            &manager,
            "produce",
            ProduceParams::new("jobs", json!({"a": 1})),
            |_, opts| async move { Ok(opts.queue.len()) },
        )
        .await
        .expect("executed");

        assert_eq!(executed.result, 4);
        assert!(executed.params.persistent);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_failures_on_a_dead_channel_are_disconnections() {
        let (_tx, rx) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));

        let state = alive.clone();
        let signal = rx.clone();
        let mut dying = MockAmqpChannel::new();
        dying
            .expect_is_open()
            .returning(move || state.load(Ordering::SeqCst));
        dying.expect_disconnected().returning(move || signal.clone());
        let dying: Arc<dyn AmqpChannel> = Arc::new(dying);

        let mut healthy = MockAmqpChannel::new();
        healthy.expect_is_open().return_const(true);
        healthy.expect_disconnected().returning(move || rx.clone());
        let healthy: Arc<dyn AmqpChannel> = Arc::new(healthy);

        let opens = Arc::new(AtomicUsize::new(0));
        let counter = opens.clone();
        let mut transport = MockAmqpTransport::new();
        transport.expect_open().times(2).returning(move |_| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0 => Ok(dying.clone()),
                _ => Ok(healthy.clone()),
            }
        });

        let manager = ConnectionManager::new(Arc::new(transport), AmqpConfigs::default());
        let mut reconnected = manager.take_reconnected().expect("reconnected signal");

        let err = exec(
            &manager,
            "info",
            InfoParams {
                queue: "jobs".to_owned(),
            },
            |_, _| async move {
                alive.store(false, Ordering::SeqCst);
                Err::<(), _>(AmqpError::DeclareQueueError("jobs".to_owned()))
            },
        )
        .await
        .unwrap_err();

        assert_eq!(err, AmqpError::DisconnectedMidOperation("info".to_owned()));
        assert_eq!(manager.status(), ConnectionStatus::Reconnecting);

        let event = reconnected.recv().await.expect("reconnected event");
        assert_eq!(event, ReconnectedEvent { cycle: 1, attempts: 1 });
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(manager.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn broker_failures_on_a_live_channel_are_surfaced() {
        let (_tx, rx) = watch::channel(false);
        let mut channel = MockAmqpChannel::new();
        channel.expect_is_open().return_const(true);
        channel.expect_disconnected().returning(move || rx.clone());

        let manager = manager_with(channel, 1);
        let err = exec(
            &manager,
            "info",
            InfoParams {
                queue: "jobs".to_owned(),
            },
            |_, _| async { Err::<(), _>(AmqpError::DeclareQueueError("jobs".to_owned())) },
        )
        .await
        .unwrap_err();

        assert_eq!(err, AmqpError::DeclareQueueError("jobs".to_owned()));
    }
}
