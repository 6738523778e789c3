// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Loop
//!
//! A long-lived loop that streams deliveries from one queue into a
//! [`WorkerPool`] and recovers on its own when the stream ends:
//!
//! ```text
//! Declaring -> Streaming -> RecoveringChannel    -> Streaming
//!                        -> RecoveringConnection -> RecoveringChannel
//! ```
//!
//! Only the first declaration is fatal. Once streaming, channel loss is handled
//! by re-declaring on the current connection and connection loss by asking the
//! [`ConnectionSupervisor`] to reconnect; both retry forever with a fixed delay
//! until the loop is cancelled.

use crate::{
    dispatcher::{DeliveryHandler, WorkerPool},
    errors::AmqpError,
    queue::QueueDefinition,
    supervisor::ConnectionSupervisor,
    topology::declare_queue,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// An open delivery stream and the channel it was opened on.
pub struct Session {
    channel: Arc<dyn BrokerChannel>,
    deliveries: DeliveryStream,
}

/// States of the consumer loop.
pub enum LoopState {
    /// First declaration of the queue; a failure here ends the loop
    Declaring,
    /// Deliveries are flowing from the session into the worker pool
    Streaming(Session),
    /// The connection is alive but the channel was lost; re-declare on it
    RecoveringChannel,
    /// The connection was lost; ask the supervisor for a new one
    RecoveringConnection,
    /// Cancelled, nothing left to do but drain the workers
    Stopped,
}

impl LoopState {
    /// Short state name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            LoopState::Declaring => "declaring",
            LoopState::Streaming(_) => "streaming",
            LoopState::RecoveringChannel => "recovering_channel",
            LoopState::RecoveringConnection => "recovering_connection",
            LoopState::Stopped => "stopped",
        }
    }
}

/// Self-healing consumer of a single queue.
///
/// Every delivery is handed to the [`DeliveryHandler`] through a bounded
/// [`WorkerPool`] sized by [`RabbitMQConfigs::workers`](crate::configs::RabbitMQConfigs)
/// and is never acked or nacked by the loop itself.
pub struct ConsumerLoop {
    supervisor: Arc<ConnectionSupervisor>,
    def: QueueDefinition,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
}

impl ConsumerLoop {
    /// Creates a loop consuming `queue`. The queue is declared exactly as the
    /// publisher declares it for the same `expire_secs`.
    ///
    /// # Parameters
    /// * `supervisor` - Holder of the connection the loop consumes over
    /// * `queue` - Name of the queue to consume
    /// * `expire_secs` - Message TTL the queue is declared with, 0 for none
    /// * `handler` - Receives every delivery
    ///
    /// # Returns
    /// A loop that does nothing until [`ConsumerLoop::run`] is awaited
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        queue: &str,
        expire_secs: u64,
        handler: Arc<dyn DeliveryHandler>,
    ) -> ConsumerLoop {
        ConsumerLoop {
            supervisor,
            def: QueueDefinition::new(queue)
                .with_dead_letter()
                .expire(expire_secs),
            handler,
            cancel: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stops the loop when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Stops the loop when the owning client shuts down.
    pub(crate) fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs the loop.
    ///
    /// On cancellation intake stops first, then queued and in-flight handlers
    /// are awaited while the channel is still open so that their acks reach
    /// the broker, and only then the channel is closed.
    ///
    /// # Returns
    /// `Ok(())` once cancelled, or the error of the first declaration
    pub async fn run(self) -> Result<(), AmqpError> {
        let cfg = self.supervisor.configs();
        let pool = WorkerPool::new(
            self.def.name(),
            cfg.workers,
            cfg.worker_queue_capacity,
            self.handler.clone(),
        );

        let mut state = LoopState::Declaring;
        let mut draining = None;
        let result = loop {
            if self.is_stopped() {
                if let LoopState::Streaming(session) = state {
                    draining = Some(session.channel);
                }
                state = LoopState::Stopped;
            }

            debug!(queue = self.def.name(), state = state.name(), "consumer state");

            state = match state {
                LoopState::Declaring => match self.open_session().await {
                    Ok(session) => LoopState::Streaming(session),
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = self.def.name(),
                            "failure to start consumer"
                        );
                        break Err(err);
                    }
                },
                LoopState::Streaming(session) => match self.stream(session, &pool).await {
                    Ok(next) => next,
                    Err((channel, err)) => {
                        draining = Some(channel);
                        break Err(err);
                    }
                },
                LoopState::RecoveringChannel => self.recover_channel().await,
                LoopState::RecoveringConnection => self.recover_connection().await,
                LoopState::Stopped => break Ok(()),
            };
        };

        pool.shutdown().await;
        if let Some(channel) = draining {
            // unacked deliveries go back to the queue once the channel closes
            close_channel(self.def.name(), channel.as_ref()).await;
        }
        debug!(queue = self.def.name(), "consumer exited");

        result
    }

    fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.shutdown.is_cancelled()
    }

    async fn stopped(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    /// Declares the queue on a fresh channel and opens a manual-ack stream.
    async fn open_session(&self) -> Result<Session, AmqpError> {
        let conn = self.supervisor.current().await;
        let (channel, info) = declare_queue(
            conn.as_ref(),
            &self.def,
            self.supervisor.configs().prefetch_count,
        )
        .await?;

        let tag = format!("{}-{}", info.name, Uuid::new_v4());
        match channel.basic_consume(&info.name, &tag).await {
            Ok(deliveries) => {
                debug!(queue = info.name.as_str(), consumer_tag = tag.as_str(), "consumer declared");
                Ok(Session {
                    channel,
                    deliveries,
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                close_channel(self.def.name(), channel.as_ref()).await;
                Err(err)
            }
        }
    }

    /// Feeds deliveries to the pool until the stream ends or the loop is
    /// cancelled, then classifies the closure. A cancelled loop gets its
    /// session back untouched so the channel outlives the draining handlers.
    async fn stream(
        &self,
        mut session: Session,
        pool: &WorkerPool,
    ) -> Result<LoopState, (Arc<dyn BrokerChannel>, AmqpError)> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stopped() => None,
                next = session.deliveries.next() => Some(next),
            };
            let Some(next) = next else {
                return Ok(LoopState::Streaming(session));
            };

            match next {
                Some(Ok(delivery)) => {
                    let submitted = tokio::select! {
                        biased;
                        _ = self.stopped() => None,
                        submitted = pool.submit(delivery) => Some(submitted),
                    };
                    match submitted {
                        None => return Ok(LoopState::Streaming(session)),
                        Some(Err(err)) => return Err((session.channel, err)),
                        Some(Ok(())) => {}
                    }
                }
                Some(Err(err)) => {
                    warn!(error = err.to_string(), queue = self.def.name(), "errors consume msg");
                }
                None => {
                    if self.supervisor.is_connected().await {
                        warn!(queue = self.def.name(), "channel closed, reopening");
                        return Ok(LoopState::RecoveringChannel);
                    }

                    warn!(queue = self.def.name(), "connection closed, reconnecting");
                    return Ok(LoopState::RecoveringConnection);
                }
            }
        }
    }

    async fn recover_channel(&self) -> LoopState {
        match self.open_session().await {
            Ok(session) => {
                info!(queue = self.def.name(), "channel reopened");
                LoopState::Streaming(session)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.def.name(),
                    delay_ms = self.supervisor.configs().retry_delay_ms,
                    "failure to reopen channel, waiting before retry"
                );

                if !self.pause().await {
                    return LoopState::Stopped;
                }

                if self.supervisor.is_connected().await {
                    LoopState::RecoveringChannel
                } else {
                    LoopState::RecoveringConnection
                }
            }
        }
    }

    async fn recover_connection(&self) -> LoopState {
        match self.supervisor.reconnect().await {
            Ok(()) => LoopState::RecoveringChannel,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue = self.def.name(),
                    delay_ms = self.supervisor.configs().retry_delay_ms,
                    "failure to reconnect, waiting before retry"
                );

                if !self.pause().await {
                    return LoopState::Stopped;
                }
                LoopState::RecoveringConnection
            }
        }
    }

    /// Sleeps for the retry delay. Returns false when cancelled meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.stopped() => false,
            _ = tokio::time::sleep(self.supervisor.configs().retry_delay()) => true,
        }
    }
}

async fn close_channel(queue: &str, channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), queue, "failure to close consumer channel");
    }
}
