use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("radio link is not connected")]
    Disconnected,
    #[error("no response from pump")]
    NoResponse,
    #[error("radio link is busy with another exchange")]
    Busy,
    #[error("radio link I/O failure: {0}")]
    Io(String),
}

/// A connected radio bridge that can carry one request/response pair at a
/// time to the pump.
///
/// The handle is owned by the connectivity layer; a commissioning session only
/// borrows it while it runs. A handle serves one session at a time: an exchange
/// issued while another is still in flight fails with [`TransportError::Busy`].
#[async_trait]
pub trait TransportHandle: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn exchange(&self, request: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Placeholder for when no radio bridge has been discovered yet.
pub struct MissingTransport;

#[async_trait]
impl TransportHandle for MissingTransport {
    fn is_connected(&self) -> bool {
        false
    }

    async fn exchange(&self, _request: &[u8]) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Disconnected)
    }
}
