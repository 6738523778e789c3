// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Every publish and every consumer (re)start opens a fresh channel and makes
//! sure its queue exists. When dead-lettering is requested the `dead:<queue>`
//! companion is declared first, then the primary queue is declared with the
//! arguments derived by [`QueueDefinition::arguments`].

use crate::{
    errors::AmqpError,
    queue::QueueDefinition,
    transport::{BrokerChannel, BrokerConnection, QueueInfo},
};
use lapin::types::FieldTable;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Opens a channel on `conn`, limits it to `prefetch_count` unacknowledged
/// deliveries and declares the queue described by `def`.
///
/// On failure after the channel was opened, the channel is closed before the
/// error is returned.
///
/// # Parameters
/// * `conn` - Connection to open the channel on
/// * `def` - Queue to declare, with its dead-letter companion if requested
/// * `prefetch_count` - Unacknowledged deliveries allowed on the channel
///
/// # Returns
/// The open channel and the broker's view of the declared queue
pub async fn declare_queue(
    conn: &dyn BrokerConnection,
    def: &QueueDefinition,
    prefetch_count: u16,
) -> Result<(Arc<dyn BrokerChannel>, QueueInfo), AmqpError> {
    debug!(queue = def.name(), "creating amqp channel...");
    let channel = conn.create_channel().await.map_err(|err| {
        error!(error = err.to_string(), queue = def.name(), "failure to open a channel");
        err
    })?;

    match install(channel.as_ref(), def, prefetch_count).await {
        Ok(info) => Ok((channel, info)),
        Err(err) => {
            if let Err(close_err) = channel.close().await {
                warn!(
                    error = close_err.to_string(),
                    queue = def.name(),
                    "failure to close channel after declaration error"
                );
            }
            Err(err)
        }
    }
}

async fn install(
    channel: &dyn BrokerChannel,
    def: &QueueDefinition,
    prefetch_count: u16,
) -> Result<QueueInfo, AmqpError> {
    channel.basic_qos(prefetch_count).await.map_err(|err| {
        error!(error = err.to_string(), "failure to set channel qos");
        err
    })?;

    if let Some(dead) = def.dead_letter_definition() {
        debug!("creating dead-letter queue: {}", dead.name());
        channel
            .queue_declare(dead.name(), dead.options(), FieldTable::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to declare dead-letter queue");
                err
            })?;
    }

    debug!("creating queue: {}", def.name());
    let info = channel
        .queue_declare(def.name(), def.options(), def.arguments())
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "failure to declare queue");
            err
        })?;

    debug!("queue: {} was created", info.name);
    Ok(info)
}
