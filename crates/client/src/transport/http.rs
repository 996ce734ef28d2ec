//! HTTP transport: `GET /health` liveness probe, a server-sent-events stream
//! on `GET /events` for inbound messages, and `POST /rpc` for outbound ones.

use super::sse::SseDecoder;
use super::{lock, Transport, TransportEvents};
use crate::error::{ClientError, ClientResult};
use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use reqwest::{header, Client, Response};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::protocol::McpMessage;
use tether_core::HttpAuth;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// HTTP + SSE transport for a remote MCP server.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    auth: HttpAuth,
    health_timeout: Duration,
    request_timeout: Duration,
    events: Arc<TransportEvents>,
    stream: Mutex<Option<JoinHandle<()>>>,
}

impl HttpTransport {
    /// Create a transport for the server rooted at `url`.
    pub fn new(
        url: &str,
        auth: HttpAuth,
        health_timeout: Duration,
        request_timeout: Duration,
    ) -> ClientResult<Self> {
        let mut base_url = Url::parse(url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut headers = header::HeaderMap::new();
        if let Some(value) = authorization_value(&auth) {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&value)
                    .map_err(|_| ClientError::Config("Invalid credential format".to_string()))?,
            );
        }

        let client = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            base_url,
            auth,
            health_timeout,
            request_timeout,
            events: Arc::new(TransportEvents::default()),
            stream: Mutex::new(None),
        })
    }

    /// Build a URL for the given path.
    fn build_url(&self, path: &str) -> ClientResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn events_url(&self) -> ClientResult<Url> {
        let mut url = self.build_url("events")?;
        if let Some(token) = self.auth.stream_token() {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }

    async fn probe(&self) -> ClientResult<()> {
        let url = self.build_url("health")?;
        debug!(url = %url, "Probing MCP server liveness");

        let response = self
            .client
            .get(url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("liveness probe failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "liveness probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// POST one envelope; a non-empty body is the server's synchronous reply.
    async fn post(&self, message: &McpMessage) -> ClientResult<Option<McpMessage>> {
        let url = self.build_url("rpc")?;
        debug!(url = %url, method = ?message.method, id = ?message.id, "POST envelope");

        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Transport(format!(
                "rpc endpoint returned {}: {}",
                status, body
            )));
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        McpMessage::parse(&body)
            .map(Some)
            .map_err(|e| ClientError::Protocol(format!("invalid rpc response body: {}", e)))
    }
}

fn authorization_value(auth: &HttpAuth) -> Option<String> {
    match auth {
        HttpAuth::None => None,
        HttpAuth::Bearer { token } => Some(format!("Bearer {}", token)),
        HttpAuth::OAuth2 { access_token } => Some(format!("Bearer {}", access_token)),
        HttpAuth::Basic { username, password } => {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", username, password));
            Some(format!("Basic {}", encoded))
        }
    }
}

fn spawn_event_reader(response: Response, events: Arc<TransportEvents>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(error = %e, "Event stream failed");
                    events.emit_error(&e.to_string());
                    return;
                }
            };

            for payload in decoder.push(&chunk) {
                match McpMessage::parse(&payload) {
                    Ok(message) => events.emit_message(&message),
                    Err(e) => warn!(error = %e, "Ignoring malformed event payload"),
                }
            }
        }

        debug!("Event stream ended");
        events.emit_close();
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn connect(&self) -> ClientResult<()> {
        if self.events.is_active() {
            return Ok(());
        }

        self.probe().await?;

        let url = self.events_url()?;
        let response = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::Transport(format!("event stream failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(ClientError::Transport(format!(
                "event stream returned {}",
                response.status()
            )));
        }

        self.events.activate();
        let reader = spawn_event_reader(response, self.events.clone());
        if let Some(previous) = lock(&self.stream).replace(reader) {
            previous.abort();
        }

        info!(url = %self.base_url, "Connected to MCP server over HTTP");
        Ok(())
    }

    async fn disconnect(&self) {
        self.events.deactivate();
        if let Some(reader) = lock(&self.stream).take() {
            reader.abort();
            debug!(url = %self.base_url, "Closed event stream");
        }
    }

    async fn send(&self, message: &McpMessage) -> ClientResult<()> {
        if !self.events.is_active() {
            return Err(ClientError::Transport("not connected".to_string()));
        }
        match self.post(message).await {
            Ok(Some(reply)) => self.events.emit_message(&reply),
            Ok(None) => {}
            Err(ClientError::Http(e)) if e.is_connect() => {
                self.events.emit_error(&e.to_string());
                return Err(ClientError::Http(e));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn events(&self) -> &TransportEvents {
        &self.events
    }
}
