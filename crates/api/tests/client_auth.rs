//! Ticket auth flow against a stub that enforces cookies and CSRF.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use pvedash_api::{Client, ConnectionOptions};
use pvedash_common::{Error, ResponseCache};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const TICKET: &str = "PVE:root@pam:AAAA::signature==";
const CSRF: &str = "4EEC61E2:csrf-token";

#[derive(Clone, Default)]
struct AuthStub {
    logins: Arc<AtomicUsize>,
    /// Status requests rejected with 401 before cookies are honoured,
    /// simulating an expired ticket.
    reject_first_n: Arc<AtomicUsize>,
}

async fn handle(State(stub): State<AuthStub>, req: Request) -> Response {
    let path = req.uri().path().trim_start_matches("/api2/json");
    match path {
        "/access/ticket" => {
            stub.logins.fetch_add(1, Ordering::SeqCst);
            Json(json!({"data": {"ticket": TICKET, "CSRFPreventionToken": CSRF}}))
                .into_response()
        }
        "/cluster/status" => {
            let rejections = stub.reject_first_n.load(Ordering::SeqCst);
            if rejections > 0 {
                stub.reject_first_n.fetch_sub(1, Ordering::SeqCst);
                return (StatusCode::UNAUTHORIZED, Json(json!({"data": null}))).into_response();
            }
            let cookie = req
                .headers()
                .get("Cookie")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if cookie != format!("PVEAuthCookie={}", TICKET) {
                return (StatusCode::UNAUTHORIZED, Json(json!({"data": null}))).into_response();
            }
            Json(json!({"data": []})).into_response()
        }
        "/nodes/a/qemu/100/status/stop" => {
            // Non-GET requests must carry the CSRF token.
            let csrf = req
                .headers()
                .get("CSRFPreventionToken")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if csrf != CSRF {
                return (StatusCode::UNAUTHORIZED, Json(json!({"data": null}))).into_response();
            }
            Json(json!({"data": "UPID:a:000"})).into_response()
        }
        _ => (StatusCode::NOT_FOUND, Json(json!({"data": null}))).into_response(),
    }
}

async fn spawn(stub: AuthStub) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handle).with_state(stub);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn ticket_client(addr: &str) -> Client {
    let opts = ConnectionOptions {
        addr: addr.to_string(),
        user: "root".to_string(),
        realm: "pam".to_string(),
        password: Some("hunter2".to_string()),
        ..Default::default()
    };
    Client::new(&opts, ResponseCache::new()).unwrap()
}

#[tokio::test]
async fn ticket_login_sets_cookie_on_requests() {
    let stub = AuthStub::default();
    let addr = spawn(stub.clone()).await;
    let client = ticket_client(&addr);

    client.verify().await.unwrap();
    assert_eq!(stub.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_ticket_reauthenticates_once() {
    let stub = AuthStub::default();
    stub.reject_first_n.store(1, Ordering::SeqCst);
    let addr = spawn(stub.clone()).await;
    let client = ticket_client(&addr);

    // First GET hits a 401, the client logs in again and retries once.
    client.verify().await.unwrap();
    assert_eq!(stub.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn persistent_401_surfaces_auth_rejected() {
    let stub = AuthStub::default();
    stub.reject_first_n.store(10, Ordering::SeqCst);
    let addr = spawn(stub.clone()).await;
    let client = ticket_client(&addr);

    assert!(matches!(
        client.verify().await,
        Err(Error::AuthRejected(_))
    ));
}

#[tokio::test]
async fn csrf_header_sent_on_post() {
    let stub = AuthStub::default();
    let addr = spawn(stub).await;
    let client = ticket_client(&addr);

    client.verify().await.unwrap();
    client
        .post("/nodes/a/qemu/100/status/stop", &[])
        .await
        .unwrap();
}
