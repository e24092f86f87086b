//! Broker façade and transport factory.

use std::future::Future;

use crate::config::{BusConfig, TransportConfig};
use crate::subscription::{handler, Handler, HandlerError};
use crate::transports::{AmqpTransport, InMemoryTransport};
use crate::{BusError, Fields, Message, Transport};

/// The one bus object application code holds.
///
/// A pure delegation layer over the transport it exclusively owns: no
/// buffering, no ordering guarantees beyond the transport's, plus a typed
/// [`emit`](MessageBroker::emit) convenience. `emit` returns once the
/// message is handed off; it never waits for delivery to handlers.
///
/// The broker does not make `start()` idempotent beyond what its transport
/// guarantees; callers should not start twice in a row.
#[derive(Debug)]
pub struct MessageBroker {
    transport: Box<dyn Transport>,
}

impl MessageBroker {
    /// Wrap an already-constructed transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Build a broker with the transport the config selects, stopped.
    pub fn from_config(config: &BusConfig) -> Self {
        let transport: Box<dyn Transport> = match &config.transport {
            TransportConfig::Memory => Box::new(InMemoryTransport::new()),
            TransportConfig::Amqp(amqp) => Box::new(AmqpTransport::new(amqp.clone())),
        };
        Self::new(transport)
    }

    /// Build and start a broker in one step.
    ///
    /// An unreachable broker is a startup error for the hosting process;
    /// the connection failure propagates to the caller untouched.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let broker = Self::from_config(config);
        broker.start().await?;
        Ok(broker)
    }

    /// Start the underlying transport.
    pub async fn start(&self) -> Result<(), BusError> {
        self.transport.start().await
    }

    /// Stop the underlying transport and release its resources.
    pub async fn stop(&self) -> Result<(), BusError> {
        self.transport.stop().await
    }

    /// Construct a [`Message`] and hand it to the transport.
    pub async fn emit(
        &self,
        topic: &str,
        payload: Fields,
        metadata: Option<Fields>,
    ) -> Result<(), BusError> {
        let msg = Message::with_metadata(topic, payload, metadata.unwrap_or_default())?;
        self.transport.publish(msg).await
    }

    /// Publish a pre-built envelope unchanged.
    ///
    /// For causation/correlation chains, where the caller sets the link ids
    /// itself before emitting.
    pub async fn emit_message(&self, msg: Message) -> Result<(), BusError> {
        self.transport.publish(msg).await
    }

    /// Register an async closure for every topic matching `pattern`.
    ///
    /// Effective immediately, whether the broker is started or not.
    pub async fn subscribe<F, Fut>(&self, pattern: &str, f: F) -> Result<(), BusError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.transport.subscribe(pattern, handler(f)).await
    }

    /// Register an already-boxed [`Handler`].
    pub async fn subscribe_handler(&self, pattern: &str, handler: Handler) -> Result<(), BusError> {
        self.transport.subscribe(pattern, handler).await
    }

    /// True while the transport is running.
    pub fn started(&self) -> bool {
        self.transport.is_started()
    }

    /// True before `start()` and after `stop()`.
    pub fn stopped(&self) -> bool {
        self.transport.is_stopped()
    }

    /// The wrapped transport, for introspection.
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_selects_memory() {
        let broker = MessageBroker::from_config(&BusConfig::memory());
        assert!(broker.stopped());
        assert!(!broker.started());
    }

    #[tokio::test]
    async fn test_emit_rejects_empty_topic() {
        let broker = MessageBroker::from_config(&BusConfig::memory());
        let err = broker.emit("", Fields::new(), None).await.unwrap_err();
        assert!(matches!(err, BusError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_flags_mirror_transport() {
        let broker = MessageBroker::from_config(&BusConfig::memory());
        broker.start().await.unwrap();
        assert!(broker.started());

        broker.stop().await.unwrap();
        assert!(broker.stopped());
    }
}
