// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Single-queue RabbitMQ publish/consume helpers with dead-lettering, message
//! TTL and self-healing consumers.

mod otel;

pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;
pub mod transport;

pub use client::RabbitMQClient;
pub use configs::RabbitMQConfigs;
pub use delivery::Delivery;
pub use dispatcher::{handler_fn, DeliveryHandler};
pub use errors::AmqpError;
