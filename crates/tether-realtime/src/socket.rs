use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("realtime endpoint rejected connection: {0}")]
    Open(String),
    #[error("realtime transport failure: {0}")]
    Transport(String),
    #[error("invalid realtime endpoint: {0}")]
    Endpoint(String),
    #[error("failed to encode realtime message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum SocketEvent {
    Text(String),
    /// The connection closed; `remote` distinguishes a server-side close
    /// from one we initiated.
    Closed { remote: bool },
}

/// Transport seam under the channel manager; the production implementation
/// is a websocket, tests use in-memory fakes.
#[async_trait]
pub trait RealtimeSocket: Send {
    async fn send(&mut self, text: String) -> Result<(), ChannelError>;
    async fn recv(&mut self) -> Result<SocketEvent, ChannelError>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn RealtimeSocket>, ChannelError>;
}
