use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::channel::RealtimeConfig;
use crate::socket::{ChannelError, Connector, RealtimeSocket, SocketEvent};

const PROTOCOL_VERSION: &str = "1.0.0";

/// Opens websocket connections to the realtime gateway, authenticated via
/// query-string API key.
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(cfg: &RealtimeConfig) -> Result<Self, ChannelError> {
        let mut url =
            Url::parse(&cfg.endpoint).map_err(|e| ChannelError::Endpoint(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("apikey", &cfg.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(Self { url })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn RealtimeSocket>, ChannelError> {
        debug!("realtime: opening websocket to {}", self.url.host_str().unwrap_or("?"));
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;
        Ok(Box::new(WsSocket { inner: stream }))
    }
}

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeSocket for WsSocket {
    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<SocketEvent, ChannelError> {
        loop {
            match self.inner.next().await {
                None => return Ok(SocketEvent::Closed { remote: true }),
                Some(Ok(Message::Text(text))) => return Ok(SocketEvent::Text(text.to_string())),
                Some(Ok(Message::Close(_))) => return Ok(SocketEvent::Closed { remote: true }),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = self.inner.send(Message::Pong(payload)).await;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ChannelError::Transport(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
