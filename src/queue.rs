// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! A [`QueueDefinition`] is the `(name, durable, dead-letter target, ttl)` tuple
//! the relay declares. Its declaration arguments are derived only from the queue
//! name and the expiration, so a producer and a consumer built from the same
//! `(queue, expire)` pair always declare identical queues and the broker never
//! answers with a precondition mismatch.

use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use std::collections::BTreeMap;

/// Prefix of every dead-letter queue name: queue `Q` dead-letters into `dead:Q`.
pub const DEAD_LETTER_PREFIX: &str = "dead:";
/// Queue argument naming the exchange dead-lettered messages are routed through
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key of dead-lettered messages
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Queue argument holding the per-queue message TTL in milliseconds
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Message header holding the per-message TTL in milliseconds
pub const AMQP_HEADERS_EXPIRATION: &str = "expiration";

/// Returns the dead-letter queue name paired with `queue`.
pub fn dead_letter_name(queue: &str) -> String {
    format!("{}{}", DEAD_LETTER_PREFIX, queue)
}

/// Converts an expiration in seconds to the millisecond TTL sent to the broker.
/// Zero means the message never expires.
pub fn expire_millis(expire_secs: u64) -> Option<i64> {
    if expire_secs == 0 {
        return None;
    }

    Some(i64::try_from(expire_secs.saturating_mul(1000)).unwrap_or(i64::MAX))
}

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
    pub(crate) dead_letter: bool,
    pub(crate) expire_secs: u64,
}

impl QueueDefinition {
    /// Creates a durable, non-exclusive, non auto-deleted queue definition
    /// without dead-lettering or TTL.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            no_wait: false,
            dead_letter: false,
            expire_secs: 0,
        }
    }

    /// Pairs the queue with a durable `dead:<name>` queue reached through the
    /// default exchange.
    pub fn with_dead_letter(mut self) -> Self {
        self.dead_letter = true;
        self
    }

    /// Sets the queue message TTL.
    ///
    /// # Parameters
    /// * `secs` - TTL in seconds, 0 disables it
    ///
    /// # Returns
    /// Self for method chaining
    pub fn expire(mut self, secs: u64) -> Self {
        self.expire_secs = secs;
        self
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the paired dead-letter queue.
    ///
    /// # Returns
    /// `Some("dead:<name>")` when dead-lettering was requested, `None` otherwise
    pub fn dead_letter_name(&self) -> Option<String> {
        self.dead_letter.then(|| dead_letter_name(&self.name))
    }

    /// Message TTL declared on the queue.
    ///
    /// # Returns
    /// The TTL in milliseconds, or `None` when messages never expire
    pub fn ttl_millis(&self) -> Option<i64> {
        expire_millis(self.expire_secs)
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Declaration arguments of the primary queue.
    ///
    /// Always a fresh table: `x-dead-letter-exchange` and
    /// `x-dead-letter-routing-key` when dead-lettering, `x-message-ttl` when
    /// expiring, nothing otherwise.
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(dead) = self.dead_letter_name() {
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dead)),
            );
        }

        if let Some(ttl) = self.ttl_millis() {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongLongInt(ttl),
            );
        }

        FieldTable::from(args)
    }

    /// Definition of the paired dead-letter queue, if any.
    pub(crate) fn dead_letter_definition(&self) -> Option<QueueDefinition> {
        self.dead_letter_name().map(|name| QueueDefinition::new(&name))
    }
}
