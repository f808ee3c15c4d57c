//! VNC WebSocket reverse proxy
//!
//! Bridges a browser-side WebSocket to the hypervisor's vncwebsocket
//! endpoint over TLS, forwarding auth headers on the upgrade.

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reverse proxy for one console session
pub struct VncProxy {
    upstream_url: String,
    auth_headers: Vec<(String, String)>,
    insecure: bool,
}

impl VncProxy {
    pub fn new(upstream_url: String, auth_headers: Vec<(String, String)>, insecure: bool) -> Self {
        Self {
            upstream_url,
            auth_headers,
            insecure,
        }
    }

    /// Open the upstream websocket. Called before the local upgrade so a
    /// failure can still be answered with a diagnostic page.
    pub async fn connect(&self) -> anyhow::Result<Upstream> {
        let mut request = self.upstream_url.as_str().into_client_request()?;
        for (name, value) in &self.auth_headers {
            request
                .headers_mut()
                .insert(name.parse::<axum::http::HeaderName>()?, value.parse()?);
        }
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", "binary".parse()?);

        let connector = if self.insecure {
            Some(Connector::NativeTls(
                native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .build()?,
            ))
        } else {
            None
        };

        debug!("Connecting upstream websocket");
        let (upstream, response) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await?;
        debug!("Upstream websocket open ({})", response.status());
        Ok(upstream)
    }

    /// Bridge the browser socket and a connected upstream until either
    /// side closes.
    pub async fn bridge(socket: WebSocket, upstream: Upstream) {
        let (up_write, up_read) = upstream.split();
        let (ws_write, ws_read) = socket.split();

        let browser_to_upstream = Self::forward_to_upstream(ws_read, up_write);
        let upstream_to_browser = Self::forward_to_browser(up_read, ws_write);

        tokio::select! {
            result = browser_to_upstream => {
                if let Err(e) = result {
                    debug!("browser->upstream forwarding ended: {}", e);
                }
            }
            result = upstream_to_browser => {
                if let Err(e) = result {
                    debug!("upstream->browser forwarding ended: {}", e);
                }
            }
        }
        debug!("VNC proxy session ended");
    }

    async fn forward_to_upstream(
        mut ws_read: SplitStream<WebSocket>,
        mut up_write: SplitSink<Upstream, UpstreamMessage>,
    ) -> anyhow::Result<()> {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    up_write.send(UpstreamMessage::Binary(data)).await?;
                }
                Ok(Message::Text(text)) => {
                    // Some clients send text frames for the RFB handshake.
                    up_write.send(UpstreamMessage::Text(text)).await?;
                }
                Ok(Message::Close(_)) => {
                    debug!("browser closed websocket");
                    let _ = up_write.send(UpstreamMessage::Close(None)).await;
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Err(e) => {
                    error!("browser websocket error: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    async fn forward_to_browser(
        mut up_read: SplitStream<Upstream>,
        mut ws_write: SplitSink<WebSocket, Message>,
    ) -> anyhow::Result<()> {
        while let Some(msg) = up_read.next().await {
            match msg {
                Ok(UpstreamMessage::Binary(data)) => {
                    ws_write.send(Message::Binary(data)).await?;
                }
                Ok(UpstreamMessage::Text(text)) => {
                    ws_write.send(Message::Text(text)).await?;
                }
                Ok(UpstreamMessage::Close(_)) => {
                    debug!("upstream closed websocket");
                    break;
                }
                Ok(UpstreamMessage::Ping(_)) | Ok(UpstreamMessage::Pong(_)) => {}
                Ok(UpstreamMessage::Frame(_)) => {}
                Err(e) => {
                    error!("upstream websocket error: {}", e);
                    break;
                }
            }
        }
        let _ = ws_write.close().await;
        Ok(())
    }
}
