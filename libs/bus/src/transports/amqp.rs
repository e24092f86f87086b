//! AMQP transport: durable pub/sub through a topic exchange.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;

use crate::config::AmqpTransportConfig;
use crate::message::WireMessage;
use crate::subscription::{dispatch, Handler, SubscriptionTable};
use crate::{BusError, Message, Transport};

/// Queue binding key: receive every topic. Pattern filtering happens locally
/// after receipt, symmetric with the in-process transport.
const BIND_ALL_ROUTING_KEY: &str = "#";

const CONTENT_TYPE: &str = "application/json";

/// AMQP delivery mode 2: persist the message on the broker.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

const REDIAL_INITIAL_DELAY: Duration = Duration::from_millis(500);
const REDIAL_MAX_DELAY: Duration = Duration::from_secs(30);

/// Pub/sub backed by a topic exchange on an external AMQP broker.
///
/// Observable behavior matches [`InMemoryTransport`]: the process-local
/// queue is bound with `#` so every topic arrives, and the same glob
/// matching fans deliveries out to local handlers. The broker adds
/// durability (persistent publishes, durable exchange) and backpressure
/// (consumer prefetch).
///
/// Each delivery is a unit of work: undecodable bodies are rejected without
/// requeue so a poison message cannot wedge the queue, and the delivery is
/// acknowledged once all matching handlers have run, regardless of handler
/// outcome: at-least-once to the process, no per-handler retry.
///
/// The consumer task owns reconnection: when the delivery stream drops it
/// redials with exponential backoff, rebuilds the topology, and swaps the
/// shared channel handle so producers recover without seeing an error.
///
/// [`InMemoryTransport`]: crate::InMemoryTransport
pub struct AmqpTransport {
    config: AmqpTransportConfig,
    subscriptions: Arc<SubscriptionTable>,
    channel: Arc<RwLock<Option<Channel>>>,
    connection: Arc<Mutex<Option<Connection>>>,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<Notify>,
    started: AtomicBool,
}

impl AmqpTransport {
    /// Create a stopped transport. Nothing connects until `start()`.
    pub fn new(config: AmqpTransportConfig) -> Self {
        Self {
            config,
            subscriptions: Arc::new(SubscriptionTable::new()),
            channel: Arc::new(RwLock::new(None)),
            connection: Arc::new(Mutex::new(None)),
            consumer_task: Mutex::new(None),
            shutdown: Arc::new(Notify::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Number of distinct registered patterns.
    pub fn pattern_count(&self) -> usize {
        self.subscriptions.pattern_count()
    }

    /// Connect and declare the full topology: channel with prefetch, durable
    /// topic exchange, queue, `#` binding, and a server-named consumer.
    async fn open_topology(
        config: &AmqpTransportConfig,
    ) -> Result<(Connection, Channel, Consumer), BusError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::connection_failed(e.to_string()))?;

        let channel = connection.create_channel().await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // A fixed name gives a durable queue that restarts and multiple
        // consumers can share; no name gives this process its own
        // exclusive, auto-deleting queue for ephemeral fan-out.
        let (queue_name, queue_options) = match &config.queue {
            Some(name) => (
                name.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
            ),
            None => (
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            ),
        };
        let queue = channel
            .queue_declare(queue_name, queue_options, FieldTable::default())
            .await?;

        channel
            .queue_bind(
                queue.name().as_str(),
                &config.exchange,
                BIND_ALL_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = channel
            .basic_consume(
                queue.name().as_str(),
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok((connection, channel, consumer))
    }

    /// Decode a delivery body into a reconstructed envelope.
    fn decode(body: &[u8]) -> Result<Message, BusError> {
        let wire: WireMessage = serde_json::from_slice(body)?;
        if wire.topic.is_empty() {
            return Err(BusError::codec("wire message has an empty type field"));
        }
        Ok(wire.into_message())
    }

    /// Process one delivery as a unit of work: decode, fan out, settle.
    async fn handle_delivery(delivery: Delivery, subscriptions: &SubscriptionTable) {
        let msg = match Self::decode(&delivery.data) {
            Ok(msg) => msg,
            Err(error) => {
                tracing::warn!(%error, "rejecting undecodable delivery");
                if let Err(error) = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    tracing::warn!(%error, "failed to reject delivery");
                }
                return;
            }
        };

        dispatch(subscriptions, &msg).await;

        if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
            tracing::warn!(topic = %msg.topic, %error, "failed to ack delivery");
        }
    }

    /// Single consumer loop, with redial when the delivery stream drops.
    async fn run_consumer(
        mut consumer: Consumer,
        config: AmqpTransportConfig,
        subscriptions: Arc<SubscriptionTable>,
        channel_slot: Arc<RwLock<Option<Channel>>>,
        connection_slot: Arc<Mutex<Option<Connection>>>,
        shutdown: Arc<Notify>,
    ) {
        let mut delay = REDIAL_INITIAL_DELAY;
        'consume: loop {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break 'consume,
                    next = consumer.next() => match next {
                        Some(Ok(delivery)) => {
                            delay = REDIAL_INITIAL_DELAY;
                            Self::handle_delivery(delivery, &subscriptions).await;
                        }
                        Some(Err(error)) => {
                            tracing::warn!(%error, "consumer stream error, redialing");
                            break;
                        }
                        None => {
                            tracing::warn!("delivery stream closed, redialing");
                            break;
                        }
                    },
                }
            }

            // Transient connection loss: redial until shutdown, backing off
            // between attempts. Producers recover once the channel slot is
            // swapped; nothing surfaces to application code.
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break 'consume,
                    _ = tokio::time::sleep(delay) => {}
                }
                match Self::open_topology(&config).await {
                    Ok((connection, channel, new_consumer)) => {
                        *channel_slot.write().await = Some(channel);
                        *connection_slot.lock().await = Some(connection);
                        consumer = new_consumer;
                        tracing::info!(exchange = %config.exchange, "reconnected to broker");
                        continue 'consume;
                    }
                    Err(error) => {
                        tracing::warn!(
                            %error,
                            delay_ms = delay.as_millis() as u64,
                            "redial failed"
                        );
                        delay = (delay * 2).min(REDIAL_MAX_DELAY);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        let channel = self.channel.read().await;
        let channel = channel.as_ref().ok_or(BusError::NotStarted(
            "publish() called before start(), no channel to the exchange",
        ))?;

        let body = serde_json::to_vec(&WireMessage::from(&msg))?;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT);

        channel
            .basic_publish(
                &self.config.exchange,
                &msg.topic,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| BusError::publish_failed(e.to_string()))?
            .await
            .map_err(|e| BusError::publish_failed(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<(), BusError> {
        self.subscriptions.insert(pattern, handler)
    }

    async fn start(&self) -> Result<(), BusError> {
        let mut task = self.consumer_task.lock().await;
        if task.is_some() {
            return Ok(());
        }

        let (connection, channel, consumer) = Self::open_topology(&self.config).await?;
        *self.channel.write().await = Some(channel);
        *self.connection.lock().await = Some(connection);

        *task = Some(tokio::spawn(Self::run_consumer(
            consumer,
            self.config.clone(),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.channel),
            Arc::clone(&self.connection),
            Arc::clone(&self.shutdown),
        )));
        self.started.store(true, Ordering::SeqCst);
        tracing::info!(
            exchange = %self.config.exchange,
            queue = self.config.queue.as_deref(),
            "amqp transport started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<(), BusError> {
        // Await the consumer so an in-flight delivery settles before the
        // channel goes away; aborting here could lose an ack.
        if let Some(task) = self.consumer_task.lock().await.take() {
            self.shutdown.notify_one();
            if let Err(error) = task.await {
                tracing::warn!(%error, "consumer task ended abnormally");
            }
        }

        if let Some(channel) = self.channel.write().await.take() {
            if let Err(error) = channel.close(200, "bus shutdown").await {
                tracing::debug!(%error, "channel close failed");
            }
        }
        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(error) = connection.close(200, "bus shutdown").await {
                tracing::debug!(%error, "connection close failed");
            }
        }

        self.started.store(false, Ordering::SeqCst);
        tracing::info!("amqp transport stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn is_stopped(&self) -> bool {
        !self.is_started()
    }
}

impl fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("exchange", &self.config.exchange)
            .field("queue", &self.config.queue)
            .field("prefetch_count", &self.config.prefetch_count)
            .field("started", &self.is_started())
            .finish()
    }
}
