//! Concrete [`Transport`](crate::Transport) implementations.
//!
//! Application code never touches these directly beyond construction; the
//! [`MessageBroker`](crate::MessageBroker) façade is the working surface.

mod amqp;
mod memory;

pub use amqp::AmqpTransport;
pub use memory::InMemoryTransport;
