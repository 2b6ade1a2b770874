//! Websocket transport for the live narration service

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::protocol::{ClientMessage, ServerMessage};
use super::transport::{MediaInput, Transport, TransportEvent};
use crate::config::{Config, SessionConfig};
use crate::{Error, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over the `BidiGenerateContent` websocket
pub struct LiveTransport {
    endpoint: String,
    api_key: Option<SecretString>,
    connect_timeout: Duration,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveTransport {
    /// Create a transport from narrator configuration
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|k| SecretString::from(k.expose_secret().to_string())),
            connect_timeout: config.connect_timeout,
            outbound: None,
            reader: None,
            writer: None,
        }
    }

    /// Check if a connection is held
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.outbound.is_some()
    }

    fn url(&self) -> String {
        match &self.api_key {
            Some(key) => {
                let sep = if self.endpoint.contains('?') { '&' } else { '?' };
                format!("{}{sep}key={}", self.endpoint, key.expose_secret())
            }
            None => self.endpoint.clone(),
        }
    }
}

#[async_trait]
impl Transport for LiveTransport {
    async fn open(
        &mut self,
        config: &SessionConfig,
    ) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        self.close().await;

        tracing::info!(endpoint = %self.endpoint, model = %config.model, "opening narration session");

        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url()))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "handshake timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (mut sink, stream) = socket.split();

        let setup = serde_json::to_string(&ClientMessage::setup(config))?;
        sink.send(Message::Text(setup))
            .await
            .map_err(|e| Error::Connection(format!("failed to send setup: {e}")))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        self.writer = Some(tokio::spawn(write_loop(sink, out_rx, event_tx.clone())));
        self.reader = Some(tokio::spawn(read_loop(stream, event_tx)));
        self.outbound = Some(out_tx);

        tracing::debug!("narration session setup sent");
        Ok(event_rx)
    }

    fn send_media(&self, media: MediaInput) -> Result<()> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".to_string()))?;

        let text = serde_json::to_string(&ClientMessage::media(media))?;
        outbound
            .send(Message::Text(text))
            .map_err(|_| Error::Connection("connection writer has stopped".to_string()))
    }

    async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
        }

        if let Some(writer) = self.writer.take() {
            // Give the close frame a moment to flush
            if tokio::time::timeout(Duration::from_secs(2), writer).await.is_err() {
                tracing::debug!("writer did not finish in time");
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
            tracing::debug!("narration connection closed");
        }
    }
}

impl Drop for LiveTransport {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Forward queued messages to the socket in submission order
async fn write_loop(
    mut sink: SplitSink<Socket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));

        if let Err(e) = sink.send(message).await {
            if !closing {
                tracing::warn!(error = %e, "failed to send to narration service");
                let _ = events.send(TransportEvent::ErrorOccurred(e.to_string()));
            }
            return;
        }

        if closing {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Parse inbound frames into events until the connection ends
async fn read_loop(mut stream: SplitStream<Socket>, events: mpsc::UnboundedSender<TransportEvent>) {
    while let Some(frame) = stream.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(bytes)) => bytes,
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty());
                tracing::info!(reason = ?reason, "narration service closed the session");
                let _ = events.send(TransportEvent::Closed(reason));
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::error!(error = %e, "narration connection error");
                let _ = events.send(TransportEvent::ErrorOccurred(e.to_string()));
                return;
            }
        };

        let message: ServerMessage = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, bytes = payload.len(), "skipping unparsable server message");
                continue;
            }
        };

        if let Some(go_away) = &message.go_away {
            tracing::warn!(time_left = ?go_away.time_left, "narration service will disconnect soon");
        }

        for event in message.into_events() {
            if events.send(event).is_err() {
                return;
            }
        }
    }

    let _ = events.send(TransportEvent::Closed(None));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_appends_key() {
        let config = Config {
            api_key: Some(SecretString::from("secret".to_string())),
            ..Config::default()
        };
        let transport = LiveTransport::new(&config);
        assert!(transport.url().ends_with("BidiGenerateContent?key=secret"));

        let config = Config {
            endpoint: "ws://localhost:9000/live?v=1".to_string(),
            api_key: Some(SecretString::from("k".to_string())),
            ..Config::default()
        };
        assert_eq!(
            LiveTransport::new(&config).url(),
            "ws://localhost:9000/live?v=1&key=k"
        );
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let transport = LiveTransport::new(&Config::default());
        assert!(!transport.is_connected());
        assert!(transport.send_media(MediaInput::jpeg(String::new())).is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut transport = LiveTransport::new(&Config::default());
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
    }
}
