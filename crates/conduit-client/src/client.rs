//! Main client implementation.
//!
//! Every endpoint wrapper funnels through two operations on [`Client`]:
//! [`Client::execute`] for calls that return one buffered response, and
//! [`Client::stream`] for calls answered with Server-Sent Events.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::Form;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{AuthScheme, ClientConfig, WORKSPACE_HEADER};
use crate::error::{ApiError, Error, Result};
use crate::handler::{ChannelRelay, EventHandler};
use crate::http::{Payload, Request, Response};
use crate::retry::Backoff;
use crate::sse::{self, EventStream};

/// Platform API client.
///
/// Cheap to clone; clones share one connection pool. Configuration is
/// fixed for the lifetime of a value: [`Client::with_token`] and
/// [`Client::with_workspace_id`] return a new client instead of mutating
/// this one, so in-flight requests always see a consistent config.
///
/// # Example
///
/// ```no_run
/// use conduit_client::{Client, Request};
///
/// # async fn example() -> conduit_client::Result<()> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/v1")
///     .token("secret")
///     .build()?;
///
/// let response = client.execute(Request::get("apps").query("page", "1")).await?;
/// println!("{}", response.text());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    config: ClientConfig,
}

/// A request resolved against the config, ready to send any number of times.
struct PreparedRequest {
    method: reqwest::Method,
    url: Url,
    headers: HeaderMap,
    body: Payload,
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Create a client from a complete config.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::from_parts(http, config))
    }

    fn from_parts(http: reqwest::Client, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner { http, config }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.inner.config.base_url
    }

    /// A client that authenticates with `token`, sharing this client's pool.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        let mut config = self.inner.config.clone();
        config.token = token.into();
        Self::from_parts(self.inner.http.clone(), config)
    }

    /// A client scoped to `workspace_id`, sharing this client's pool.
    pub fn with_workspace_id(&self, workspace_id: impl Into<String>) -> Self {
        let mut config = self.inner.config.clone();
        config.workspace_id = Some(workspace_id.into());
        Self::from_parts(self.inner.http.clone(), config)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Blocking calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute a request and return the buffered response.
    ///
    /// Transport errors and 5xx responses are retried up to
    /// `max_retries` times; anything below 500 ends the loop. Statuses
    /// >= 400 come back as [`Error::Api`] with the raw response attached.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.execute_inner(&request, None).await
    }

    /// [`Client::execute`], aborted with [`Error::Cancelled`] once `cancel`
    /// fires. A cancelled call makes no further attempts.
    pub async fn execute_with_cancel(
        &self,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<Response> {
        self.execute_inner(&request, Some(cancel)).await
    }

    /// Execute a request and decode the response body as JSON.
    pub async fn call_json<T: DeserializeOwned>(&self, request: Request) -> Result<T> {
        self.execute(request).await?.json()
    }

    /// Make a GET request and decode the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call_json(Request::get(path)).await
    }

    /// Make a POST request with a JSON body and decode the JSON response.
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.call_json(Request::post(path).json(body)?).await
    }

    /// Make a DELETE request, ignoring any response body.
    pub async fn delete(&self, path: &str) -> Result<()> {
        self.execute(Request::delete(path)).await?;
        Ok(())
    }

    async fn execute_inner(
        &self,
        request: &Request,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response> {
        let timeout = self.inner.config.timeout;
        let (response, attempts) = self.send(request, timeout, cancel).await?;
        with_cancel(cancel, read_response(response))
            .await?
            .map_err(|source| Error::Transport { attempts, source })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Streaming calls
    // ─────────────────────────────────────────────────────────────────────────

    /// Execute a request and deliver its Server-Sent Events to `handler`.
    ///
    /// Events are dispatched as they arrive. Failures to establish the
    /// stream (transport, HTTP status, unexpected content type) go through
    /// the same `on_error` / `on_complete` sequence as failures mid-stream,
    /// and the reported error is also returned.
    pub async fn stream<H>(&self, request: Request, handler: &mut H) -> Result<()>
    where
        H: EventHandler + ?Sized,
    {
        self.stream_inner(&request, handler, None).await
    }

    /// [`Client::stream`] that stops with [`Error::Cancelled`] once `cancel`
    /// fires, whether still connecting or mid-stream.
    pub async fn stream_with_cancel<H>(
        &self,
        request: Request,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        H: EventHandler + ?Sized,
    {
        self.stream_inner(&request, handler, Some(cancel)).await
    }

    /// Execute a request and return its events as a pull-based stream.
    pub async fn events(&self, request: Request) -> Result<EventStream> {
        let response = self.open_stream(&request, None).await?;
        Ok(sse::decode(body_stream(response)))
    }

    /// Relay a stream's JSON payloads onto a bounded channel.
    ///
    /// A spawned task owns the sender. Each event's `data` is decoded with
    /// [`decode_json`](crate::handler::decode_json). If the stream fails,
    /// the error is sent as the last item. The channel closing is the only
    /// completion signal. Dropping the receiver stops the stream.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream_channel(
        &self,
        request: Request,
        capacity: usize,
    ) -> mpsc::Receiver<Result<serde_json::Value>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let client = self.clone();

        tokio::spawn(async move {
            let watcher = tx.clone();
            let mut relay = ChannelRelay::new(tx);
            let outcome = tokio::select! {
                outcome = client.stream_inner(&request, &mut relay, None) => outcome,
                // Frees the connection even while the stream is idle.
                _ = watcher.closed() => {
                    tracing::debug!("Event receiver dropped, closing stream");
                    Err(Error::handler("event receiver dropped"))
                }
            };
            drop(watcher);
            relay.close(outcome).await;
        });

        rx
    }

    async fn stream_inner<H>(
        &self,
        request: &Request,
        handler: &mut H,
        cancel: Option<&CancellationToken>,
    ) -> Result<()>
    where
        H: EventHandler + ?Sized,
    {
        let response = match self.open_stream(request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                handler.on_error(&err).await;
                handler.on_complete().await;
                return Err(err);
            }
        };

        sse::dispatch_until(body_stream(response), handler, cancel).await
    }

    async fn open_stream(
        &self,
        request: &Request,
        cancel: Option<&CancellationToken>,
    ) -> Result<reqwest::Response> {
        let timeout = self.inner.config.stream_timeout;
        let (response, _) = self.send(request, timeout, cancel).await?;
        check_event_stream(&response)?;
        tracing::debug!(url = %response.url(), "Event stream opened");
        Ok(response)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal HTTP methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Build the absolute URL for a path and query.
    pub(crate) fn url(&self, path: &str, query: &[(String, String)]) -> Result<Url> {
        let base = self.inner.config.base_url.as_str();
        let mut url = Url::parse(&format!("{}{}", base, path.trim_start_matches('/')))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Resolve URL, headers and body once, before the first attempt.
    fn prepare(&self, request: &Request) -> Result<PreparedRequest> {
        let config = &self.inner.config;
        let url = self.url(&request.path, &request.query)?;
        let body = request.body.encode()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            insert_header(&mut headers, name, value)?;
        }
        if let Some(content_type) = request.body.content_type() {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        if let Some(authorization) = config.authorization() {
            let mut value = HeaderValue::from_str(&authorization)
                .map_err(|_| Error::Encoding("invalid auth token".to_string()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(workspace_id) = &config.workspace_id {
            insert_header(&mut headers, WORKSPACE_HEADER, workspace_id)?;
        }
        for (name, value) in &request.headers {
            insert_header(&mut headers, name, value)?;
        }

        Ok(PreparedRequest {
            method: request.method.into(),
            url,
            headers,
            body,
        })
    }

    /// Send with retry until a response with status < 400 is in hand.
    ///
    /// The returned response's body has not been read yet. Returns the
    /// number of attempts made alongside it.
    async fn send(
        &self,
        request: &Request,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<(reqwest::Response, u32)> {
        let prepared = self.prepare(request)?;
        let max_retries = self.inner.config.max_retries;
        let backoff = self.inner.config.backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            tracing::debug!(
                method = %prepared.method,
                url = %prepared.url,
                attempt,
                "Sending request"
            );

            let form = match &prepared.body {
                Payload::Multipart(form) => Some(form.to_form()?),
                _ => None,
            };
            let reason = match with_cancel(cancel, self.attempt(&prepared, form, timeout)).await? {
                Ok(Attempt::Live(response)) => return Ok((response, attempt)),
                Ok(Attempt::Failed(response)) if response.status() < 500 => {
                    return Err(ApiError::from_response(response).into());
                }
                Ok(Attempt::Failed(response)) => {
                    if attempt > max_retries {
                        return Err(ApiError::from_response(response).into());
                    }
                    format!("HTTP {}", response.status())
                }
                Err(source) => {
                    if attempt > max_retries {
                        return Err(Error::Transport {
                            attempts: attempt,
                            source,
                        });
                    }
                    source.to_string()
                }
            };

            let delay = backoff.delay(attempt);
            tracing::warn!(
                attempt,
                max_retries,
                backoff_ms = delay.as_millis() as u64,
                reason = %reason,
                "Request failed, retrying"
            );
            with_cancel(cancel, tokio::time::sleep(delay)).await?;
        }
    }

    /// One network round trip. Error responses are read in full so the
    /// connection goes back to the pool.
    async fn attempt(
        &self,
        prepared: &PreparedRequest,
        form: Option<Form>,
        timeout: Duration,
    ) -> std::result::Result<Attempt, reqwest::Error> {
        let mut headers = prepared.headers.clone();
        if form.is_some() {
            // reqwest appends its own, boundary included.
            headers.remove(CONTENT_TYPE);
        }

        let mut builder = self
            .inner
            .http
            .request(prepared.method.clone(), prepared.url.clone())
            .headers(headers)
            .timeout(timeout);
        builder = match (&prepared.body, form) {
            (_, Some(form)) => builder.multipart(form),
            (Payload::Bytes(body), None) => builder.body(body.clone()),
            _ => builder,
        };

        let response = builder.send().await?;
        if response.status().as_u16() >= 400 {
            Ok(Attempt::Failed(drain_error_response(response).await))
        } else {
            Ok(Attempt::Live(response))
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

enum Attempt {
    /// Status < 400, body still unread.
    Live(reqwest::Response),
    /// Status >= 400, body buffered.
    Failed(Response),
}

/// Run `future` unless `cancel` fires first.
async fn with_cancel<F: Future>(cancel: Option<&CancellationToken>, future: F) -> Result<F::Output> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::Cancelled),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

/// Buffer an error response. The status is already known, so a failed
/// read keeps whatever arrived instead of failing the attempt.
async fn drain_error_response(mut response: reqwest::Response) -> Response {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let mut body = BytesMut::new();

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(
                    status,
                    received_bytes = body.len(),
                    error = %err,
                    "Failed to read error response body"
                );
                break;
            }
        }
    }

    Response::new(status, headers, body.freeze())
}

/// Drain a response into memory.
async fn read_response(response: reqwest::Response) -> std::result::Result<Response, reqwest::Error> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    Ok(Response::new(status, headers, body))
}

fn body_stream(
    response: reqwest::Response,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| Error::Stream(e.to_string())))
}

/// Accept `text/event-stream`, `text/plain`, or no content type at all.
fn check_event_stream(response: &reqwest::Response) -> Result<()> {
    let Some(value) = response.headers().get(CONTENT_TYPE) else {
        return Ok(());
    };
    let mime = value
        .to_str()
        .unwrap_or_default()
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match mime.as_str() {
        "" | "text/event-stream" | "text/plain" => Ok(()),
        other => {
            tracing::warn!(content_type = %other, "Unexpected content type for event stream");
            Err(Error::Stream(format!(
                "unexpected content type '{other}' for event stream"
            )))
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::Encoding(format!("invalid header name '{name}'")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::Encoding(format!("invalid value for header '{name}'")))?;
    headers.insert(name, value);
    Ok(())
}

/// Builder for creating a [`Client`].
pub struct ClientBuilder {
    base_url: Option<String>,
    auth_scheme: AuthScheme,
    token: Option<String>,
    workspace_id: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    max_retries: Option<u32>,
    backoff: Option<Backoff>,
    user_agent: Option<String>,
    http: Option<reqwest::Client>,
}

impl ClientBuilder {
    /// Create a new builder with defaults.
    pub fn new() -> Self {
        Self {
            base_url: None,
            auth_scheme: AuthScheme::default(),
            token: None,
            workspace_id: None,
            headers: Vec::new(),
            timeout: None,
            stream_timeout: None,
            max_retries: None,
            backoff: None,
            user_agent: None,
            http: None,
        }
    }

    /// Set the base URL for the platform API.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }

    /// Set the authentication token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    /// Add a header sent with every request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Set the request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the streaming request timeout.
    pub fn stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = Some(timeout);
        self
    }

    /// Retries after the first attempt. Zero disables retrying.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Set a custom user agent.
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots, pool limits).
    ///
    /// The builder's user agent is not applied to an injected client.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::Config("base_url is required".to_string()))?;

        let mut config = ClientConfig::new(&base_url)?;
        config.auth_scheme = self.auth_scheme;
        config.token = self.token.unwrap_or_default();
        config.workspace_id = self.workspace_id;
        config.default_headers = self.headers;
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        if let Some(timeout) = self.stream_timeout {
            config.stream_timeout = timeout;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(backoff) = self.backoff {
            config.backoff = backoff;
        }
        if let Some(agent) = self.user_agent {
            config.user_agent = agent;
        }

        match self.http {
            Some(http) => Ok(Client::from_parts(http, config)),
            None => Client::new(config),
        }
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("base_url", &self.base_url)
            .field("auth_scheme", &self.auth_scheme)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("workspace_id", &self.workspace_id)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
