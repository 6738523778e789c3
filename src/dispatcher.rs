// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatching
//!
//! Deliveries pulled off a queue are handed to a fixed set of worker tasks
//! through a bounded queue. A slow handler never blocks intake until every
//! worker is busy and the queue is full; from then on intake waits, which keeps
//! the number of in-flight handlers bounded.

use crate::{delivery::Delivery, errors::AmqpError};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error};

/// Processes one delivery. The handler owns the delivery and is solely
/// responsible for acking or nacking it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// [`DeliveryHandler`] backed by an async closure, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure into a [`DeliveryHandler`].
///
/// ```ignore
/// let handler = handler_fn(|delivery: Delivery| async move {
///     let _ = delivery.ack().await;
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> DeliveryHandler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, delivery: Delivery) {
        (self.f)(delivery).await
    }
}

/// Fixed-size pool of handler tasks fed through a bounded queue.
pub struct WorkerPool {
    sender: mpsc::Sender<Delivery>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` tasks sharing a queue of `capacity` pending deliveries.
    /// Both values are clamped to at least one.
    pub fn new(queue: &str, workers: usize, capacity: usize, handler: Arc<dyn DeliveryHandler>) -> WorkerPool {
        let (sender, receiver) = mpsc::channel::<Delivery>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|id| {
                let receiver = receiver.clone();
                let handler = handler.clone();
                let queue = queue.to_owned();

                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(delivery) = next else {
                            break;
                        };

                        let tag = delivery.delivery_tag;
                        if AssertUnwindSafe(handler.handle(delivery))
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            error!(
                                queue = queue.as_str(),
                                worker = id,
                                delivery_tag = tag,
                                "delivery handler panicked"
                            );
                        }
                    }
                    debug!(queue = queue.as_str(), worker = id, "worker stopped");
                })
            })
            .collect();

        WorkerPool { sender, workers }
    }

    /// Queues a delivery, waiting for a free slot when the pool is saturated.
    pub async fn submit(&self, delivery: Delivery) -> Result<(), AmqpError> {
        self.sender.send(delivery).await.map_err(|_| {
            error!("worker pool is closed");
            AmqpError::InternalError
        })
    }

    /// Stops accepting deliveries and waits for the queued and in-flight ones
    /// to be handled.
    pub async fn shutdown(self) {
        let WorkerPool { sender, workers } = self;
        drop(sender);

        for worker in workers {
            if let Err(err) = worker.await {
                error!(error = err.to_string(), "worker task failure");
            }
        }
    }
}
