/// Errors surfaced by the bus to producers and lifecycle callers.
///
/// Handler failures are deliberately absent: they are logged inside the
/// consumer loop and never propagate back to the emitter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// Construction-time configuration problem; fatal, never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The broker was unreachable at `start()`.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An operation that needs a running transport was called before `start()`.
    #[error("Transport not started: {0}")]
    NotStarted(&'static str),

    /// Hand-off of a published message to the broker failed.
    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// Wire document could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Any other AMQP client failure.
    #[error("AMQP error: {0}")]
    Amqp(String),
}

impl BusError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        BusError::InvalidConfig(msg.into())
    }

    /// Create a connection failed error.
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        BusError::ConnectionFailed(msg.into())
    }

    /// Create a publish failed error.
    pub fn publish_failed(msg: impl Into<String>) -> Self {
        BusError::PublishFailed(msg.into())
    }

    /// Create a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        BusError::Codec(msg.into())
    }

    /// Check if this is a connection-related error.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BusError::ConnectionFailed(_) | BusError::Amqp(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Codec(err.to_string())
    }
}

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        BusError::Amqp(err.to_string())
    }
}
