//! Transport core for the Conduit platform API.
//!
//! This crate provides the plumbing every endpoint wrapper is built on:
//! authenticated JSON requests with retry, file uploads, and Server-Sent
//! Event streams.
//!
//! # Example
//!
//! ```no_run
//! use conduit_client::{Client, JsonHandler, Request, Result};
//!
//! # async fn example() -> Result<()> {
//! // Create a client
//! let client = Client::builder()
//!     .base_url("https://api.example.com/v1")
//!     .token("secret")
//!     .build()?;
//!
//! // Plain JSON call
//! let app: serde_json::Value = client
//!     .call_json(Request::get("apps/42").query("include", "owner"))
//!     .await?;
//! println!("App: {}", app["name"]);
//!
//! // Stream a response
//! let request = Request::post("chat-messages")
//!     .json(&serde_json::json!({"query": "Tell me a story", "response_mode": "streaming"}))?;
//! let mut handler = JsonHandler::new(|chunk| {
//!     print!("{}", chunk["answer"].as_str().unwrap_or_default());
//!     Ok(())
//! });
//! client.stream(request, &mut handler).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - **config**: Base URL, credentials, timeouts and retry policy
//! - **http**: Request and response model
//! - **client**: Executor with retry, streaming entry points
//! - **multipart**: `multipart/form-data` uploads
//! - **sse**: Incremental Server-Sent Events decoding and dispatch
//! - **handler**: Event handler trait and JSON payload decoding
//! - **error**: Error taxonomy and API error decoding

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod multipart;
pub mod retry;
pub mod sse;

pub use client::{Client, ClientBuilder};
pub use config::{AuthScheme, ClientConfig};
pub use error::{ApiError, Error, Result};
pub use handler::{EventHandler, JsonHandler, decode_json};
pub use http::{Body, Method, Request, Response};
pub use multipart::MultipartForm;
pub use retry::Backoff;
pub use sse::{EventStream, SseDecoder, SseEvent};

pub use tokio_util::sync::CancellationToken;
