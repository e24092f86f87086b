//! In-process transport: one unbounded FIFO queue, one fan-out task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::subscription::{dispatch, Handler, SubscriptionTable};
use crate::{BusError, Message, Transport};

/// Zero-dependency pub/sub for single-process use and testing.
///
/// `publish` pushes onto an unbounded queue and returns; messages are never
/// dropped. The consumer task pops one message at a time and fans it out to
/// every matching handler sequentially, so a slow handler delays the rest of
/// that message's fan-out and the next dequeue, but never the producer.
///
/// `stop()` aborts the consumer task: an in-flight fan-out may not finish.
/// That trade-off is acceptable here because nothing is acknowledged; the
/// AMQP transport stops gracefully instead.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queue: Arc<Mutex<VecDeque<Message>>>,
    available: Arc<Notify>,
    subscriptions: Arc<SubscriptionTable>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl InMemoryTransport {
    /// Create a stopped transport with no subscriptions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct registered patterns.
    pub fn pattern_count(&self) -> usize {
        self.subscriptions.pattern_count()
    }

    /// Messages queued but not yet fanned out.
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        self.queue.lock().push_back(msg);
        self.available.notify_one();
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<(), BusError> {
        self.subscriptions.insert(pattern, handler)
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut consumer = self.consumer.lock();
        if consumer.is_none() {
            let queue = Arc::clone(&self.queue);
            let available = Arc::clone(&self.available);
            let subscriptions = Arc::clone(&self.subscriptions);

            *consumer = Some(tokio::spawn(async move {
                loop {
                    // Register interest before checking the queue so a
                    // publish between the check and the await still wakes us.
                    let msg = loop {
                        let notified = available.notified();
                        if let Some(msg) = queue.lock().pop_front() {
                            break msg;
                        }
                        notified.await;
                    };
                    dispatch(&subscriptions, &msg).await;
                }
            }));
            tracing::debug!("in-memory consumer loop started");
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        if let Some(task) = self.consumer.lock().take() {
            task.abort();
            tracing::debug!("in-memory consumer loop stopped");
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        !self.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::handler;
    use crate::HandlerError;
    use serde_json::json;

    use crate::message::fields;

    #[tokio::test]
    async fn test_publish_while_stopped_queues() {
        let transport = InMemoryTransport::new();
        let msg = Message::new("story.created", fields(json!({}))).unwrap();

        transport.publish(msg).await.unwrap();
        assert_eq!(transport.queued_len(), 1);
        assert!(transport.is_stopped());
    }

    #[tokio::test]
    async fn test_lifecycle_flags() {
        let transport = InMemoryTransport::new();
        assert!(transport.is_stopped());
        assert!(!transport.is_started());

        transport.start().await.unwrap();
        assert!(transport.is_started());

        transport.stop().await.unwrap();
        assert!(transport.is_stopped());

        // Stopping again must not fail.
        transport.stop().await.unwrap();
        assert!(transport.is_stopped());
    }

    #[tokio::test]
    async fn test_subscribe_valid_in_either_state() {
        let transport = InMemoryTransport::new();
        let noop = handler(|_| async { Ok::<(), HandlerError>(()) });

        transport.subscribe("story.*", noop.clone()).await.unwrap();
        transport.start().await.unwrap();
        transport.subscribe("saga.*", noop).await.unwrap();
        assert_eq!(transport.pattern_count(), 2);

        transport.stop().await.unwrap();
    }
}
