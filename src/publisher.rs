// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! One-shot publishing to a single queue through the default exchange. Each
//! call declares the queue (always with its `dead:<queue>` companion) on a fresh
//! channel, sends one [`Envelope`] routed by the queue name and closes the
//! channel again. Failures are surfaced to the caller and never retried here.

use crate::{
    errors::AmqpError,
    otel,
    queue::{expire_millis, QueueDefinition, AMQP_HEADERS_EXPIRATION},
    supervisor::ConnectionSupervisor,
    topology::declare_queue,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type of raw payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type of serialized JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Outbound message plus its metadata. Built once, then moved into the
/// transport on send.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub content_type: String,
    pub message_id: String,
    pub body: Vec<u8>,
    pub expiration_ms: Option<i64>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl Envelope {
    /// Builds an envelope whose body expires `expire_secs` seconds after
    /// enqueueing, 0 meaning never.
    pub fn new(content_type: &str, body: Vec<u8>, expire_secs: u64) -> Envelope {
        let expiration_ms = expire_millis(expire_secs);

        let mut headers = BTreeMap::new();
        if let Some(ms) = expiration_ms {
            headers.insert(
                ShortString::from(AMQP_HEADERS_EXPIRATION),
                AMQPValue::LongLongInt(ms),
            );
        }

        Envelope {
            content_type: content_type.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            body,
            expiration_ms,
            headers,
        }
    }

    /// Adds the propagation fields of `ctx` to the headers.
    pub fn with_context(mut self, ctx: &Context) -> Envelope {
        otel::inject_context(ctx, &mut self.headers);
        self
    }

    /// AMQP properties sent along with the body. The expiration is set both
    /// as a header and as the `expiration` property the broker enforces.
    pub fn properties(&self) -> BasicProperties {
        let props = BasicProperties::default()
            .with_content_type(ShortString::from(self.content_type.clone()))
            .with_message_id(ShortString::from(self.message_id.clone()))
            .with_headers(FieldTable::from(self.headers.clone()));

        match self.expiration_ms {
            Some(ms) => props.with_expiration(ShortString::from(ms.to_string())),
            None => props,
        }
    }
}

/// Publishes messages over the connection held by a [`ConnectionSupervisor`].
pub struct RabbitMQPublisher {
    supervisor: Arc<ConnectionSupervisor>,
}

impl RabbitMQPublisher {
    /// Creates a publisher sending over the connection held by `supervisor`.
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> RabbitMQPublisher {
        RabbitMQPublisher { supervisor }
    }

    /// Publishes `body` as `text/plain` to `queue`.
    ///
    /// With `expire_secs > 0` the message carries a TTL of `expire_secs * 1000`
    /// milliseconds and the queue is declared with the same message TTL, after
    /// which the broker moves it to `dead:<queue>`.
    pub async fn publish(&self, queue: &str, body: &[u8], expire_secs: u64) -> Result<(), AmqpError> {
        let envelope = Envelope::new(TEXT_CONTENT_TYPE, body.to_vec(), expire_secs)
            .with_context(&Context::current());

        self.send(queue, envelope, expire_secs).await
    }

    /// Serializes `payload` to JSON and publishes it as `application/json`.
    pub async fn publish_json<T>(&self, queue: &str, payload: &T, expire_secs: u64) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        let envelope = Envelope::new(JSON_CONTENT_TYPE, body, expire_secs)
            .with_context(&Context::current());

        self.send(queue, envelope, expire_secs).await
    }

    async fn send(&self, queue: &str, envelope: Envelope, expire_secs: u64) -> Result<(), AmqpError> {
        let def = QueueDefinition::new(queue)
            .with_dead_letter()
            .expire(expire_secs);

        let conn = self.supervisor.current().await;
        let (channel, info) =
            declare_queue(conn.as_ref(), &def, self.supervisor.configs().prefetch_count).await?;

        let message_id = envelope.message_id.clone();
        let result = channel.basic_publish("", &info.name, envelope).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), queue, "failure to close publish channel");
        }

        match result {
            Err(err) => {
                error!(error = err.to_string(), queue, "error publishing message");
                Err(err)
            }
            Ok(_) => {
                debug!(queue, message_id = message_id.as_str(), "message published");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        configs::RabbitMQConfigs,
        transport::{BrokerChannel, BrokerConnection, MockBrokerChannel, MockBrokerConnection, MockConnector, QueueInfo},
    };
    use std::sync::Mutex;

    fn expiration_header(envelope: &Envelope) -> Option<&AMQPValue> {
        envelope.headers.get(&ShortString::from(AMQP_HEADERS_EXPIRATION))
    }

    /// Publisher over a single mocked channel that records what was published.
    async fn publisher_with(
        channel: MockBrokerChannel,
    ) -> RabbitMQPublisher {
        let channel: Arc<dyn BrokerChannel> = Arc::new(channel);

        let mut conn = MockBrokerConnection::new();
        conn.expect_is_connected().returning(|| true);
        conn.expect_create_channel()
            .returning(move || Ok(channel.clone()));
        let conn: Arc<dyn BrokerConnection> = Arc::new(conn);

        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .returning(move |_| Ok(conn.clone()));

        let supervisor = ConnectionSupervisor::connect(
            RabbitMQConfigs::new("amqp://localhost"),
            Arc::new(connector),
        )
        .await
        .unwrap();

        RabbitMQPublisher::new(Arc::new(supervisor))
    }

    fn declaring_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel.expect_queue_declare().returning(|name, _, _| {
            Ok(QueueInfo {
                name: name.to_owned(),
                ..Default::default()
            })
        });
        channel
    }

    #[test]
    fn should_set_expiration_header_and_property() {
        let envelope = Envelope::new(TEXT_CONTENT_TYPE, b"hello".to_vec(), 5);

        assert_eq!(envelope.expiration_ms, Some(5000));
        assert_eq!(expiration_header(&envelope), Some(&AMQPValue::LongLongInt(5000)));

        let props = envelope.properties();
        assert_eq!(props.expiration().as_ref().map(|e| e.as_str()), Some("5000"));
        assert_eq!(props.content_type().as_ref().map(|c| c.as_str()), Some("text/plain"));
    }

    #[test]
    fn should_not_expire_without_ttl() {
        let envelope = Envelope::new(TEXT_CONTENT_TYPE, b"hello".to_vec(), 0);

        assert_eq!(expiration_header(&envelope), None);
        assert!(envelope.properties().expiration().is_none());
    }

    #[test]
    fn should_generate_distinct_message_ids() {
        let a = Envelope::new(TEXT_CONTENT_TYPE, vec![], 0);
        let b = Envelope::new(TEXT_CONTENT_TYPE, vec![], 0);
        assert_ne!(a.message_id, b.message_id);
    }

    #[tokio::test]
    async fn should_publish_to_default_exchange_and_close_channel() {
        let sent = Arc::new(Mutex::new(vec![]));

        let mut channel = declaring_channel();
        {
            let sent = sent.clone();
            channel
                .expect_basic_publish()
                .times(1)
                .returning(move |exchange, routing_key, envelope| {
                    sent.lock()
                        .unwrap()
                        .push((exchange.to_owned(), routing_key.to_owned(), envelope));
                    Ok(())
                });
        }
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = publisher_with(channel).await;
        publisher.publish("orders", b"hello", 0).await.unwrap();

        let sent = sent.lock().unwrap();
        let (exchange, routing_key, envelope) = &sent[0];
        assert_eq!(exchange, "");
        assert_eq!(routing_key, "orders");
        assert_eq!(envelope.body, b"hello");
        assert_eq!(envelope.content_type, TEXT_CONTENT_TYPE);
        assert_eq!(expiration_header(envelope), None);
    }

    #[tokio::test]
    async fn should_always_declare_dead_letter_queue() {
        let declared = Arc::new(Mutex::new(vec![]));

        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_qos().returning(|_| Ok(()));
        {
            let declared = declared.clone();
            channel
                .expect_queue_declare()
                .returning(move |name, opts, _| {
                    declared.lock().unwrap().push((name.to_owned(), opts.durable));
                    Ok(QueueInfo {
                        name: name.to_owned(),
                        ..Default::default()
                    })
                });
        }
        channel.expect_basic_publish().returning(|_, _, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let publisher = publisher_with(channel).await;
        publisher.publish("orders", b"hello", 5).await.unwrap();

        assert_eq!(
            *declared.lock().unwrap(),
            vec![("dead:orders".to_owned(), true), ("orders".to_owned(), true)]
        );
    }

    #[tokio::test]
    async fn should_surface_send_error_and_still_close() {
        let mut channel = declaring_channel();
        channel
            .expect_basic_publish()
            .returning(|_, _, _| Err(AmqpError::PublishingError("channel closed".into())));
        channel.expect_close().times(1).returning(|| Ok(()));

        let publisher = publisher_with(channel).await;
        let err = publisher.publish("orders", b"hello", 0).await.unwrap_err();

        assert_eq!(err, AmqpError::PublishingError("channel closed".into()));
    }

    #[tokio::test]
    async fn should_not_send_when_declaration_fails() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_basic_qos().returning(|_| Ok(()));
        channel.expect_queue_declare().returning(|name, _, _| {
            Err(AmqpError::DeclareQueueError(name.to_owned(), "PRECONDITION_FAILED".into()))
        });
        channel.expect_basic_publish().never();
        channel.expect_close().returning(|| Ok(()));

        let publisher = publisher_with(channel).await;
        let err = publisher.publish("orders", b"hello", 5).await.unwrap_err();

        assert!(matches!(err, AmqpError::DeclareQueueError(_, _)));
    }

    #[tokio::test]
    async fn should_publish_json() {
        #[derive(Serialize)]
        struct Order {
            id: u32,
        }

        let mut channel = declaring_channel();
        channel
            .expect_basic_publish()
            .withf(|_, _, envelope| {
                envelope.content_type == JSON_CONTENT_TYPE && envelope.body == br#"{"id":7}"#
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_close().returning(|| Ok(()));

        let publisher = publisher_with(channel).await;
        publisher.publish_json("orders", &Order { id: 7 }, 0).await.unwrap();
    }
}
