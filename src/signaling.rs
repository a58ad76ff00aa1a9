/**
 * signaling.rs
 *
 * The rendezvous channel is an external collaborator: it is abstracted
 * down to a two-operation key -> blob store. `WebSocketSignaling` is
 * one concrete implementation (TLS WebSocket, self-signed certs
 * accepted, matching the development posture of the retrieved prior
 * art); other implementations (HTTPS, a cloud-storage CLI, DNS TXT
 * records) are added by implementing `SignalingPort`.
 */

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use native_tls::TlsConnector;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream as TokioTcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[async_trait]
pub trait SignalingPort: Send + Sync {
    /// Idempotently overwrite the blob at `key`.
    async fn upload(&mut self, key: &str, value: &str) -> Result<()>;
    /// Return the latest blob at `key`, or fail if absent.
    async fn download(&mut self, key: &str) -> Result<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Upload { key: String, value: String },
    UploadAck { success: bool, message: Option<String> },
    Download { key: String },
    DownloadResult { value: Option<String> },
    Error { message: String },
}

pub struct WebSocketSignaling {
    ws: WebSocketStream<MaybeTlsStream<tokio_native_tls::TlsStream<TokioTcpStream>>>,
}

impl WebSocketSignaling {
    /// Connect to the signaling server over TLS (self-signed certs
    /// accepted, as in the retrieved prior art's development setup).
    pub async fn connect(url: &str) -> Result<Self> {
        let req = url
            .into_client_request()
            .context("invalid signaling URL")?;

        let mut builder = TlsConnector::builder();
        builder.danger_accept_invalid_certs(true);
        let tls = tokio_native_tls::TlsConnector::from(
            builder.build().context("failed to build TLS connector")?,
        );

        let host = req
            .uri()
            .host()
            .ok_or_else(|| anyhow!("signaling URL missing hostname"))?
            .to_string();
        let port = req.uri().port_u16().unwrap_or(443);

        let tcp = TokioTcpStream::connect((host.as_str(), port))
            .await
            .context("TCP connection to signaling server failed")?;

        let tls_stream = tls
            .connect(&host, tcp)
            .await
            .context("TLS handshake with signaling server failed")?;

        let (ws, _resp) =
            tokio_tungstenite::client_async_tls_with_config(req, tls_stream, None, None)
                .await
                .context("WebSocket upgrade with signaling server failed")?;

        Ok(Self { ws })
    }

    async fn send(&mut self, msg: &WireMessage) -> Result<()> {
        let json = serde_json::to_string(msg).context("signaling message serialization failed")?;
        self.ws
            .send(Message::Text(json))
            .await
            .context("signaling WebSocket send failed")
    }

    async fn receive(&mut self) -> Result<WireMessage> {
        loop {
            let msg = self
                .ws
                .next()
                .await
                .ok_or_else(|| anyhow!("signaling connection closed"))?
                .context("signaling WebSocket receive failed")?;

            match msg {
                Message::Text(text) => {
                    return serde_json::from_str(&text).context("failed to decode signaling message")
                }
                Message::Ping(data) => {
                    self.ws.send(Message::Pong(data)).await?;
                }
                Message::Pong(_) => {}
                Message::Close(_) => return Err(anyhow!("signaling server closed connection")),
                _ => {}
            }
        }
    }
}

#[async_trait]
impl SignalingPort for WebSocketSignaling {
    async fn upload(&mut self, key: &str, value: &str) -> Result<()> {
        self.send(&WireMessage::Upload {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await?;

        match self.receive().await? {
            WireMessage::UploadAck { success: true, .. } => Ok(()),
            WireMessage::UploadAck { success: false, message } => {
                Err(anyhow!("upload failed: {}", message.unwrap_or_default()))
            }
            WireMessage::Error { message } => Err(anyhow!("signaling error: {message}")),
            _ => Err(anyhow!("unexpected response to upload")),
        }
    }

    async fn download(&mut self, key: &str) -> Result<String> {
        self.send(&WireMessage::Download { key: key.to_string() })
            .await?;

        match self.receive().await? {
            WireMessage::DownloadResult { value: Some(v) } => Ok(v),
            WireMessage::DownloadResult { value: None } => Err(anyhow!("no blob at key {key}")),
            WireMessage::Error { message } => Err(anyhow!("signaling error: {message}")),
            _ => Err(anyhow!("unexpected response to download")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_roundtrips_through_json() {
        let msg = WireMessage::Upload {
            key: "alice".into(),
            value: "203.0.113.4:51000:1700000000".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WireMessage = serde_json::from_str(&json).unwrap();
        match back {
            WireMessage::Upload { key, value } => {
                assert_eq!(key, "alice");
                assert_eq!(value, "203.0.113.4:51000:1700000000");
            }
            _ => panic!("wrong variant"),
        }
    }
}
