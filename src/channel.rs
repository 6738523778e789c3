// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! `lapin` backed implementations of the [`crate::transport`] traits. This is
//! the only module talking to the broker library directly; every `lapin::Error`
//! is logged and mapped onto [`AmqpError`] here.

use crate::{
    configs::RabbitMQConfigs,
    delivery::{Acknowledger, Delivery},
    errors::AmqpError,
    publisher::Envelope,
    transport::{BrokerChannel, BrokerConnection, Connector, DeliveryStream, QueueInfo},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    uri::AMQPUri,
    Channel, Connection, ConnectionProperties,
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Parses the configured URL and applies the configured heartbeat to it.
pub fn amqp_uri(cfg: &RabbitMQConfigs) -> Result<AMQPUri, AmqpError> {
    let mut uri = AMQPUri::from_str(&cfg.url).map_err(|err| {
        error!(error = err.as_str(), "invalid amqp url");
        AmqpError::ConfigError(err)
    })?;

    uri.query.heartbeat = Some(cfg.heartbeat_secs);
    Ok(uri)
}

/// Dials RabbitMQ with `lapin`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let uri = amqp_uri(cfg)?;

        let mut options = ConnectionProperties::default();
        if let Some(name) = &cfg.connection_name {
            options = options.with_connection_name(LongString::from(name.clone()));
        }

        debug!(heartbeat = cfg.heartbeat_secs, "dialing amqp server...");
        match Connection::connect_uri(uri, options).await {
            Ok(conn) => Ok(Arc::new(LapinConnection { conn })),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(REPLY_SUCCESS, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Ok(queue) => Ok(QueueInfo {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned(), err.to_string()))
            }
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError> {
        let properties = envelope.properties();

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: false,
                    immediate: false,
                },
                &envelope.body,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }
}

/// Settles a delivery through the `lapin` channel it arrived on.
struct LapinAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.delivery
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::NackMessageError
            })
    }
}

fn into_delivery(mut delivery: lapin::message::Delivery) -> Delivery {
    let data = std::mem::take(&mut delivery.data);
    let tag = delivery.delivery_tag;
    let routing_key = delivery.routing_key.to_string();
    let exchange = delivery.exchange.to_string();
    let redelivered = delivery.redelivered;
    let properties = delivery.properties.clone();

    Delivery::new(
        tag,
        &routing_key,
        properties,
        data,
        Arc::new(LapinAcker { delivery }),
    )
    .exchange(&exchange)
    .redelivered(redelivered)
}
