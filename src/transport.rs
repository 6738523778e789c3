// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The handful of broker primitives the relay needs (dial, channel open/close,
//! QoS, queue declare, publish, consume) expressed as traits. The production
//! implementations in [`crate::channel`] wrap `lapin`; tests substitute mocks.
//!
//! Implementations map their native failures onto [`AmqpError`] so callers never
//! see transport specific error types.

use crate::{configs::RabbitMQConfigs, delivery::Delivery, errors::AmqpError, publisher::Envelope};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{options::QueueDeclareOptions, types::FieldTable};
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Stream of inbound deliveries. End of stream means the underlying channel,
/// or its connection, was closed.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Information returned by the broker for a declared queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Dials new broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, cfg: &RabbitMQConfigs) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One logical connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel. Fails with [`AmqpError::ChannelError`].
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// One channel opened on a [`BrokerConnection`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Fails with [`AmqpError::QoSDeclarationError`].
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Fails with [`AmqpError::DeclareQueueError`].
    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    /// Fails with [`AmqpError::PublishingError`].
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: Envelope,
    ) -> Result<(), AmqpError>;

    /// Opens a manual-ack, non-exclusive delivery stream. Fails with
    /// [`AmqpError::ConsumerDeclarationError`].
    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
