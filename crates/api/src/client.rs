//! Auth-aware HTTP client for the Proxmox VE REST API
//!
//! Two auth strategies, chosen at construction: API tokens (stateless, one
//! header per request) and ticket auth (form login, cookie + CSRF header,
//! renewed every 2 hours). Responses are decoded as generic JSON trees;
//! callers pattern-match the `data` field.

use pvedash_common::cache::ttl_for_path;
use pvedash_common::{Error, ResponseCache, Result};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Interval between ticket renewals. Proxmox tickets last 2 hours.
const TICKET_RENEWAL_INTERVAL: Duration = Duration::from_secs(2 * 60 * 60);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection parameters, narrowed from the application config
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Base address, e.g. `https://pve.example.com:8006`
    pub addr: String,
    pub user: String,
    pub realm: String,
    pub password: Option<String>,
    pub token_id: Option<String>,
    pub token_secret: Option<String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
}

impl ConnectionOptions {
    pub fn is_using_token_auth(&self) -> bool {
        self.token_id.as_deref().is_some_and(|t| !t.is_empty())
            && self.token_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

enum AuthStrategy {
    /// `Authorization: PVEAPIToken=...` on every request; no session state.
    Token(String),
    /// Cookie + CSRF from `/access/ticket`, renewed in the background.
    Ticket {
        username: String,
        password: String,
        state: RwLock<Option<TicketState>>,
    },
}

#[derive(Clone)]
struct TicketState {
    ticket: String,
    csrf: String,
}

/// HTTP client owning TLS setup, auth state and the response cache
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    host: String,
    auth: AuthStrategy,
    cache: ResponseCache,
    no_cache: bool,
}

impl Client {
    pub fn new(opts: &ConnectionOptions, cache: ResponseCache) -> Result<Self> {
        let addr = opts.addr.trim_end_matches('/');
        let url = url::Url::parse(addr)
            .map_err(|e| Error::InvalidConfig(format!("invalid address {addr}: {e}")))?;
        let host = format!(
            "{}:{}",
            url.host_str()
                .ok_or_else(|| Error::InvalidConfig(format!("address {addr} has no host")))?,
            url.port().unwrap_or(8006)
        );

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(opts.insecure)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let auth = if opts.is_using_token_auth() {
            AuthStrategy::Token(format!(
                "PVEAPIToken={}@{}!{}={}",
                opts.user,
                opts.realm,
                opts.token_id.as_deref().unwrap_or_default(),
                opts.token_secret.as_deref().unwrap_or_default(),
            ))
        } else {
            let password = opts
                .password
                .clone()
                .ok_or(Error::AuthRequired)?;
            AuthStrategy::Ticket {
                username: format!("{}@{}", opts.user, opts.realm),
                password,
                state: RwLock::new(None),
            }
        };

        Ok(Client {
            http,
            base_url: format!("{addr}/api2/json"),
            host,
            auth,
            cache,
            no_cache: false,
        })
    }

    /// Disable the response cache entirely; every GET goes to the wire.
    pub fn with_no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }

    /// `host:port` of the upstream, for websocket URLs.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `wss://host:port` base for the vncwebsocket endpoint.
    pub fn ws_base(&self) -> String {
        format!("wss://{}/api2/json", self.host)
    }

    /// Auth headers a websocket upgrade to the upstream must carry.
    pub async fn ws_auth_headers(&self) -> Vec<(String, String)> {
        match &self.auth {
            AuthStrategy::Token(header) => {
                vec![("Authorization".to_string(), header.clone())]
            }
            AuthStrategy::Ticket { state, .. } => match state.read().await.as_ref() {
                Some(t) => vec![(
                    "Cookie".to_string(),
                    format!("PVEAuthCookie={}", t.ticket),
                )],
                None => Vec::new(),
            },
        }
    }

    /// One authenticated round-trip, used for startup verification.
    pub async fn verify(&self) -> Result<()> {
        self.get_fresh("/cluster/status").await.map(|_| ())
    }

    /// GET with the endpoint's standard TTL.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.get_with_ttl(path, ttl_for_path(path)).await
    }

    /// GET with an explicit TTL.
    pub async fn get_with_ttl(&self, path: &str, ttl: Duration) -> Result<Value> {
        if self.no_cache {
            return self.get_fresh(path).await;
        }
        if let Some(cached) = self.cache.lookup(path, ttl) {
            debug!("GET {} (cached)", path);
            return Ok(cached);
        }
        let value = self.request(Method::GET, path, None).await?;
        self.cache.store(path, &value);
        Ok(value)
    }

    /// GET bypassing the cache; the fresh payload still refreshes it.
    pub async fn get_fresh(&self, path: &str) -> Result<Value> {
        let value = self.request(Method::GET, path, None).await?;
        if !self.no_cache {
            self.cache.store(path, &value);
        }
        Ok(value)
    }

    /// Form POST. Never cached.
    pub async fn post(&self, path: &str, form: &[(&str, &str)]) -> Result<Value> {
        self.request(Method::POST, path, Some(form)).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, &str)]>,
    ) -> Result<Value> {
        if let AuthStrategy::Ticket { state, .. } = &self.auth {
            let needs_login = state.read().await.is_none();
            if needs_login {
                self.login().await?;
            }
        }
        match self.request_once(method.clone(), path, form).await {
            Err(Error::AuthRejected(_)) if matches!(self.auth, AuthStrategy::Ticket { .. }) => {
                // The ticket may have expired between renewals; one retry.
                self.login().await?;
                self.request_once(method, path, form).await
            }
            other => other,
        }
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        form: Option<&[(&str, &str)]>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut req = self.http.request(method.clone(), &url);

        match &self.auth {
            AuthStrategy::Token(header) => {
                req = req.header("Authorization", header);
            }
            AuthStrategy::Ticket { state, .. } => {
                let ticket = state.read().await.clone().ok_or(Error::AuthRequired)?;
                req = req.header("Cookie", format!("PVEAuthCookie={}", ticket.ticket));
                if method != Method::GET {
                    req = req.header("CSRFPreventionToken", ticket.csrf);
                }
            }
        }

        if let Some(form) = form {
            req = req.form(form);
        }

        let resp = req.send().await?;
        let status = resp.status();
        debug!("{} {} -> {}", method, path, status.as_u16());

        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthRejected(format!("{path} returned 401")));
        }
        if !status.is_success() {
            return Err(Error::Network(format!("{path} returned {status}")));
        }

        Ok(resp.json().await?)
    }

    /// Form POST to `/access/ticket`, storing the ticket and CSRF token.
    async fn login(&self) -> Result<()> {
        let AuthStrategy::Ticket {
            username,
            password,
            state,
        } = &self.auth
        else {
            return Ok(());
        };

        let url = format!("{}/access/ticket", self.base_url);
        let resp = self
            .http
            .post(&url)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await?;

        let status = resp.status();
        debug!("POST /access/ticket -> {}", status.as_u16());
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthRejected("bad username or password".to_string()));
        }
        if !status.is_success() {
            return Err(Error::Network(format!("/access/ticket returned {status}")));
        }

        let body: Value = resp.json().await?;
        let data = body
            .get("data")
            .ok_or_else(|| Error::format("/access/ticket", "missing data field"))?;
        let ticket = data
            .get("ticket")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::format("/access/ticket", "missing ticket"))?;
        let csrf = data
            .get("CSRFPreventionToken")
            .and_then(Value::as_str)
            .unwrap_or_default();

        *state.write().await = Some(TicketState {
            ticket: ticket.to_string(),
            csrf: csrf.to_string(),
        });
        info!("authenticated as {}", username);
        Ok(())
    }

    /// Spawn the ticket renewal task. No-op under token auth.
    pub fn spawn_ticket_renewal(self: Arc<Self>) {
        if matches!(self.auth, AuthStrategy::Token(_)) {
            return;
        }
        let client = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICKET_RENEWAL_INTERVAL);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                if let Err(e) = client.login().await {
                    warn!("ticket renewal failed: {}", e);
                }
            }
        });
    }
}
