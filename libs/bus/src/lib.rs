//! Transport-agnostic publish/subscribe bus for Storyline components.
//!
//! Application code emits typed events and registers pattern-based
//! subscriptions through a [`MessageBroker`], which wraps a swappable
//! [`Transport`]. Two transports ship with the crate:
//!
//! - [`InMemoryTransport`]: a single-process FIFO queue with one fan-out
//!   task; no external dependency, suitable for tests and single-binary use.
//! - [`AmqpTransport`]: durable pub/sub through a topic exchange on an
//!   external AMQP broker.
//!
//! ```text
//! producer ──> MessageBroker::emit ──> Transport::publish
//!                                           │
//!                                   (queue / exchange)
//!                                           │
//!                                   consumer loop ──> pattern match ──> handlers
//! ```
//!
//! Both transports filter locally: every received message is matched against
//! the registered subscription patterns (shell-style globs over dot-segmented
//! topics such as `story.created`) and handed to each matching handler in
//! turn. Handler failures are logged and isolated; one bad subscriber never
//! disables the bus for the others.
//!
//! ## Usage
//!
//! ```no_run
//! use bus::{message::fields, BusConfig, MessageBroker};
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), bus::BusError> {
//! let broker = MessageBroker::from_config(&BusConfig::memory());
//!
//! broker
//!     .subscribe("story.*", |msg| async move {
//!         println!("{}: {:?}", msg.topic, msg.payload);
//!         Ok::<(), bus::HandlerError>(())
//!     })
//!     .await?;
//!
//! broker.start().await?;
//! broker
//!     .emit("story.created", fields(json!({ "story_id": "s1" })), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod message;
pub mod pattern;
pub mod subscription;
pub mod transports;

use std::fmt::Debug;

use async_trait::async_trait;

pub use broker::MessageBroker;
pub use config::{
    AmqpTransportConfig, BusConfig, TransportConfig, DEFAULT_EXCHANGE, DEFAULT_PREFETCH_COUNT,
};
pub use error::BusError;
pub use message::{Fields, Message, WireMessage};
pub use pattern::TopicPattern;
pub use subscription::{handler, Handler, HandlerError, HandlerFuture, SubscriptionTable};
pub use transports::{AmqpTransport, InMemoryTransport};

/// Swappable delivery mechanism behind the broker façade.
///
/// A transport owns its subscription table and exactly one background
/// consumer task, started by [`start`](Transport::start), the only place
/// handler code runs. Producers never block on handlers: `publish` suspends
/// only long enough to hand the message to the local queue or the network
/// client.
///
/// Lifecycle is `stopped` (initial) → `started` → `stopped`; there are no
/// other states. `subscribe` is valid in either state and takes effect
/// immediately; `publish` before `start` is a usage error only on the AMQP
/// transport (no exchange handle exists yet).
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Hand `msg` to the transport for delivery to matching handlers.
    async fn publish(&self, msg: Message) -> Result<(), BusError>;

    /// Register `handler` for every topic matching `pattern`.
    async fn subscribe(&self, pattern: &str, handler: Handler) -> Result<(), BusError>;

    /// Start the consumer loop. Calling again while running is a no-op.
    async fn start(&self) -> Result<(), BusError>;

    /// Stop the consumer loop and release transport resources.
    ///
    /// Safe to call when already stopped.
    async fn stop(&self) -> Result<(), BusError>;

    /// True once `start()` has completed and until `stop()`.
    fn is_started(&self) -> bool;

    /// True initially and again after `stop()`.
    fn is_stopped(&self) -> bool;
}
