//! Console bridge orchestration
//!
//! One session per console: acquire a one-time ticket, bind an ephemeral
//! local port, serve the embedded client and the `/ws` reverse proxy, and
//! point the operator's browser at it. The session lives as long as the
//! websocket does; dropping it tears the local server down.

use crate::static_files::StaticFiles;
use crate::vnc_proxy::VncProxy;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use pvedash_api::Client;
use pvedash_common::{Error, Guest, Result};
use std::process::Command;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Builder for local console sessions
pub struct VncBridge {
    client: Arc<Client>,
    /// Skip upstream TLS verification, mirroring the API client setting
    insecure: bool,
    /// Node shells need a real ticket; API tokens cannot open them
    token_auth: bool,
}

/// A running local console session
pub struct VncSession {
    pub local_url: String,
    pub port: u16,
    server: JoinHandle<()>,
}

impl VncSession {
    pub fn close(&self) {
        self.server.abort();
    }
}

impl Drop for VncSession {
    fn drop(&mut self) {
        self.server.abort();
    }
}

struct BridgeState {
    upstream_url: String,
    auth_headers: Vec<(String, String)>,
    insecure: bool,
    title: String,
}

impl VncBridge {
    pub fn new(client: Arc<Client>, insecure: bool, token_auth: bool) -> Self {
        VncBridge {
            client,
            insecure,
            token_auth,
        }
    }

    /// Open a console to a guest and launch the browser.
    pub async fn connect_to_guest(&self, guest: &Guest) -> Result<VncSession> {
        if guest.template {
            return Err(Error::NotSupported(
                "templates have no console".to_string(),
            ));
        }
        let ticket = self.client.vnc_proxy_guest(guest).await?;
        let upstream = self.client.vnc_websocket_path(guest, &ticket);
        // QEMU hands out a one-time password; LXC sessions authenticate
        // with the vncticket itself.
        let secret = ticket.password.clone().unwrap_or_else(|| ticket.ticket.clone());
        let title = format!("{} ({})", guest.name, guest.vmid);
        self.serve(upstream, secret, title).await
    }

    /// Open a shell console on a node and launch the browser.
    pub async fn connect_to_node(&self, node: &str) -> Result<VncSession> {
        if self.token_auth {
            return Err(Error::NotSupported(
                "node shells require password authentication".to_string(),
            ));
        }
        let ticket = self.client.vnc_proxy_node(node).await?;
        let upstream = self.client.node_websocket_path(node, &ticket);
        let secret = ticket.password.clone().unwrap_or_else(|| ticket.ticket.clone());
        self.serve(upstream, secret, format!("node {}", node)).await
    }

    async fn serve(&self, upstream_url: String, secret: String, title: String) -> Result<VncSession> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::LocalBind(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::LocalBind(e.to_string()))?
            .port();

        let state = Arc::new(BridgeState {
            upstream_url,
            auth_headers: self.client.ws_auth_headers().await,
            insecure: self.insecure,
            title: title.clone(),
        });

        let app = Router::new()
            .route("/", get(console_handler))
            .route("/app/*path", get(static_handler))
            .route("/ws", get(ws_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("console bridge server ended: {}", e);
            }
        });

        let local_url = format!(
            "http://127.0.0.1:{}/?password={}&autoconnect=1",
            port,
            encode(&secret)
        );
        info!("console bridge for {} listening on port {}", title, port);

        if let Err(e) = open_browser(&local_url) {
            warn!("could not open browser: {}", e);
        }

        Ok(VncSession {
            local_url,
            port,
            server,
        })
    }
}

async fn console_handler(State(state): State<Arc<BridgeState>>) -> Html<String> {
    Html(StaticFiles::console_page(&state.title))
}

async fn static_handler(Path(path): Path<String>) -> Response {
    StaticFiles::serve(&path)
}

/// Connect upstream before upgrading so a dead endpoint can still be
/// answered with the diagnostic page.
async fn ws_handler(State(state): State<Arc<BridgeState>>, ws: WebSocketUpgrade) -> Response {
    let proxy = VncProxy::new(
        state.upstream_url.clone(),
        state.auth_headers.clone(),
        state.insecure,
    );
    match proxy.connect().await {
        Ok(upstream) => ws
            .protocols(["binary"])
            .on_upgrade(move |socket| VncProxy::bridge(socket, upstream)),
        Err(e) => {
            warn!("upstream websocket failed: {}", e);
            (
                StatusCode::BAD_GATEWAY,
                Html(StaticFiles::diagnostic_page(&e.to_string())),
            )
                .into_response()
        }
    }
}

fn encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

/// Open the operator's default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        Command::new("open").arg(url).spawn()?;
    }

    #[cfg(target_os = "linux")]
    {
        Command::new("xdg-open").arg(url).spawn()?;
    }

    #[cfg(target_os = "windows")]
    {
        Command::new("cmd").args(["/C", "start", url]).spawn()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_query_encoded() {
        assert_eq!(encode("PVEVNC:a+b=="), "PVEVNC%3Aa%2Bb%3D%3D");
    }

    #[tokio::test]
    async fn bridge_serves_console_and_rejects_dead_upstream() {
        let state = Arc::new(BridgeState {
            upstream_url: "wss://127.0.0.1:1/api2/json/nodes/a/qemu/1/vncwebsocket".to_string(),
            auth_headers: vec![],
            insecure: true,
            title: "test-vm (100)".to_string(),
        });

        let page = console_handler(State(Arc::clone(&state))).await;
        assert!(page.0.contains("test-vm (100)"));

        let res = static_handler(Path("rfb.js".to_string())).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
}
