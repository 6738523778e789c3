// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! Owns the single logical broker connection shared by the publisher and every
//! consumer loop of a client. Readers take a snapshot of the current handle,
//! [`ConnectionSupervisor::reconnect`] dials a fresh connection and swaps it in
//! atomically, so a reader observes either the old or the new handle.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    transport::{BrokerConnection, Connector},
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

/// Single owner of the broker connection of a client.
pub struct ConnectionSupervisor {
    cfg: RabbitMQConfigs,
    connector: Arc<dyn Connector>,
    current: RwLock<Arc<dyn BrokerConnection>>,
    reconnecting: Mutex<()>,
}

impl ConnectionSupervisor {
    /// Dials the first connection.
    ///
    /// # Parameters
    /// * `cfg` - Settings used for this and every later dial
    /// * `connector` - Transport used to dial
    ///
    /// # Returns
    /// The supervisor holding a live connection, or the dial error
    pub async fn connect(
        cfg: RabbitMQConfigs,
        connector: Arc<dyn Connector>,
    ) -> Result<ConnectionSupervisor, AmqpError> {
        debug!("creating amqp connection...");
        let conn = connector.connect(&cfg).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            err
        })?;
        debug!("amqp connected");

        Ok(ConnectionSupervisor {
            cfg,
            connector,
            current: RwLock::new(conn),
            reconnecting: Mutex::new(()),
        })
    }

    /// Settings the connection was dialed with.
    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.cfg
    }

    /// Snapshot of the connection handle currently held.
    pub async fn current(&self) -> Arc<dyn BrokerConnection> {
        self.current.read().await.clone()
    }

    /// Whether the connection currently held is open.
    pub async fn is_connected(&self) -> bool {
        self.current().await.is_connected()
    }

    /// Replaces a closed connection with a freshly dialed one.
    ///
    /// Concurrent callers are serialized; whoever gets the lock after a
    /// successful swap finds a live connection and returns without dialing.
    /// Dialing happens outside the handle lock so readers are never blocked by
    /// a slow broker.
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        let _serial = self.reconnecting.lock().await;

        if self.is_connected().await {
            debug!("connection already re-established");
            return Ok(());
        }

        let fresh = self.connector.connect(&self.cfg).await.map_err(|err| {
            error!(error = err.to_string(), "failure to reconnect");
            err
        })?;

        *self.current.write().await = fresh;
        info!("amqp reconnected");

        Ok(())
    }

    /// Closes the current connection. Channels opened on it are closed by the
    /// broker as well.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let conn = self.current().await;
        if !conn.is_connected() {
            return Ok(());
        }

        conn.close().await.map_err(|err| {
            error!(error = err.to_string(), "failure to close connection");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBrokerConnection, MockConnector};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Connection whose liveness can be flipped from the test.
    fn switchable(alive: Arc<AtomicBool>) -> Arc<dyn BrokerConnection> {
        let mut conn = MockBrokerConnection::new();
        conn.expect_is_connected()
            .returning(move || alive.load(Ordering::SeqCst));
        conn.expect_close().returning(|| Ok(()));
        Arc::new(conn)
    }

    #[tokio::test]
    async fn should_fail_when_first_dial_fails() {
        let mut connector = MockConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_| Err(AmqpError::ConnectionError("refused".into())));

        let res = ConnectionSupervisor::connect(
            RabbitMQConfigs::new("amqp://localhost"),
            Arc::new(connector),
        )
        .await;

        assert!(matches!(res, Err(AmqpError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn should_swap_dead_connection() {
        let first_alive = Arc::new(AtomicBool::new(true));
        let dials = Arc::new(AtomicUsize::new(0));

        let mut connector = MockConnector::new();
        {
            let first_alive = first_alive.clone();
            let dials = dials.clone();
            connector.expect_connect().returning(move |cfg| {
                assert_eq!(cfg.heartbeat_secs, 30);
                match dials.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(switchable(first_alive.clone())),
                    _ => Ok(switchable(Arc::new(AtomicBool::new(true)))),
                }
            });
        }

        let supervisor = ConnectionSupervisor::connect(
            RabbitMQConfigs::new("amqp://localhost"),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let before = supervisor.current().await;

        first_alive.store(false, Ordering::SeqCst);
        assert!(!supervisor.is_connected().await);

        supervisor.reconnect().await.unwrap();

        assert!(supervisor.is_connected().await);
        assert!(!Arc::ptr_eq(&before, &supervisor.current().await));
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn should_keep_old_handle_when_redial_fails() {
        let dials = Arc::new(AtomicUsize::new(0));
        let mut connector = MockConnector::new();
        {
            let dials = dials.clone();
            connector.expect_connect().returning(move |_| {
                match dials.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(switchable(Arc::new(AtomicBool::new(false)))),
                    _ => Err(AmqpError::ConnectionError("refused".into())),
                }
            });
        }

        let supervisor = ConnectionSupervisor::connect(
            RabbitMQConfigs::new("amqp://localhost"),
            Arc::new(connector),
        )
        .await
        .unwrap();
        let before = supervisor.current().await;

        let err = supervisor.reconnect().await.unwrap_err();

        assert_eq!(err, AmqpError::ConnectionError("refused".into()));
        assert!(Arc::ptr_eq(&before, &supervisor.current().await));
    }

    #[tokio::test]
    async fn should_dial_once_for_concurrent_reconnects() {
        let first_alive = Arc::new(AtomicBool::new(true));
        let dials = Arc::new(AtomicUsize::new(0));

        let mut connector = MockConnector::new();
        {
            let first_alive = first_alive.clone();
            let dials = dials.clone();
            connector.expect_connect().returning(move |_| {
                match dials.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(switchable(first_alive.clone())),
                    _ => Ok(switchable(Arc::new(AtomicBool::new(true)))),
                }
            });
        }

        let supervisor = Arc::new(
            ConnectionSupervisor::connect(
                RabbitMQConfigs::new("amqp://localhost"),
                Arc::new(connector),
            )
            .await
            .unwrap(),
        );
        first_alive.store(false, Ordering::SeqCst);

        let (a, b) = tokio::join!(supervisor.reconnect(), supervisor.reconnect());

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
