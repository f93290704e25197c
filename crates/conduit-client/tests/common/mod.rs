//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use conduit_client::{Backoff, Client, ClientBuilder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::MockServer;

/// Backoff unit used by tests so retries stay fast.
pub const TEST_BACKOFF: Duration = Duration::from_millis(1);

/// A mock platform API plus a client pointed at it.
pub struct TestServer {
    pub server: MockServer,
    pub client: Client,
}

impl TestServer {
    /// Start a mock server with a client using `max_retries` retries.
    pub async fn start(max_retries: u32) -> Result<Self> {
        Self::start_with(|builder| builder.max_retries(max_retries)).await
    }

    /// Start a mock server, letting the caller adjust the client builder.
    pub async fn start_with(
        configure: impl FnOnce(ClientBuilder) -> ClientBuilder,
    ) -> Result<Self> {
        let server = MockServer::start().await;
        let builder = Client::builder()
            .base_url(format!("{}/v1", server.uri()))
            .backoff(Backoff::linear(TEST_BACKOFF));
        let client = configure(builder).build()?;
        Ok(Self { server, client })
    }
}

/// A base URL nothing is listening on.
pub async fn closed_port_url() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(format!("http://{addr}/v1"))
}

/// An SSE body with `text/event-stream` content type.
pub fn sse_body(body: &str) -> wiremock::ResponseTemplate {
    wiremock::ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream")
}

/// A bare TCP server that answers every connection with `response`
/// verbatim and then hangs up. Returns the base URL and a connection count.
pub async fn raw_server(response: &'static [u8]) -> Result<(String, Arc<AtomicUsize>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                if read_request_head(&mut socket).await.is_ok() {
                    let _ = socket.write_all(response).await;
                    let _ = socket.shutdown().await;
                }
            });
        }
    });

    Ok((format!("http://{addr}/v1"), connections))
}

/// Read until the end of the request headers.
pub async fn read_request_head(socket: &mut TcpStream) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(())
}
