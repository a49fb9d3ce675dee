//! Lifecycle and publish capabilities shared across the workspace.

use async_trait::async_trait;
use thiserror::Error;

/// A manageable service component with ordered startup and shutdown.
///
/// The broker client, the Home Assistant integration and the scanner manager
/// all implement this so the orchestrator can start them in order and stop
/// them in reverse without knowing their internals.
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name used in log output.
    fn name(&self) -> &'static str;

    /// Start the service. A started service may spawn background tasks.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop the service and release its resources. Must be idempotent.
    async fn stop(&self) -> anyhow::Result<()>;
}

/// Error type for [`Publisher::publish`].
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker client is not connected; callers must not queue.
    #[error("broker client is not connected")]
    NotConnected,

    /// The publish was handed to the transport but failed or timed out.
    #[error("publish to {topic} failed: {reason}")]
    Failed { topic: String, reason: String },
}

/// Opaque broker publish capability.
///
/// The integration only ever needs `publish(topic, payload, retained)` and a
/// connectivity check; the wire protocol stays behind this seam so tests can
/// substitute an in-memory recorder.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str, retained: bool)
        -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;
}
