// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries
//!
//! A [`Delivery`] is one inbound message plus the capability to acknowledge it.
//! The relay hands every delivery to the user handler untouched and never acks
//! or nacks on the handler's behalf.

use crate::{errors::AmqpError, otel::RabbitMQTracePropagator};
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use std::{fmt, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Settles a single delivery on the channel it arrived on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// One inbound message handed to a consumer handler.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    /// Creates a delivery received through the default exchange.
    ///
    /// # Parameters
    /// * `delivery_tag` - Channel scoped tag identifying the delivery
    /// * `routing_key` - Routing key, the queue name for default exchange publishes
    /// * `properties` - AMQP properties sent by the publisher
    /// * `data` - Message body
    /// * `acker` - Settles the delivery on its channel
    pub fn new(
        delivery_tag: u64,
        routing_key: &str,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange = exchange.to_owned();
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Positively acknowledges this delivery only.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Negatively acknowledges this delivery. Without `requeue` the broker
    /// dead-letters it to `dead:<queue>` when the queue was declared that way.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }

    /// Rejects this delivery, see [`Delivery::nack`].
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(requeue).await
    }

    /// Trace context propagated by the publisher through the message headers.
    pub fn context(&self) -> Context {
        let mut headers = self
            .properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();

        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
        })
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data_len", &self.data.len())
            .finish()
    }
}
