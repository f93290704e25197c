//! Client error types.
//!
//! Every failure surfaced by the transport core is an [`Error`]. Non-success
//! responses are decoded into an [`ApiError`] which keeps the raw
//! [`Response`] around so callers can still look at headers and body.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

use crate::http::Response;

/// Client error type.
#[derive(Debug, Error)]
pub enum Error {
    /// A request body, multipart form or header could not be encoded.
    ///
    /// Never retried: this is a local bug, not a remote condition.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The network call failed outright, after exhausting the retry budget.
    #[error("Transport error after {attempts} attempt(s): {source}")]
    Transport {
        /// Number of attempts made before giving up.
        attempts: u32,
        /// Last underlying failure.
        #[source]
        source: reqwest::Error,
    },

    /// Server returned a status >= 400.
    #[error(transparent)]
    Api(Box<ApiError>),

    /// A success body did not match the expected JSON type.
    #[error("JSON error: {0}")]
    Decode(#[from] serde_json::Error),

    /// URL parsing failed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The event stream could not be read or scanned.
    #[error("Stream error: {0}")]
    Stream(String),

    /// A stream handler rejected an event.
    #[error("Handler error: {0}")]
    Handler(String),

    /// The caller's cancellation token fired.
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a handler error from any displayable value.
    pub fn handler(message: impl fmt::Display) -> Self {
        Error::Handler(message.to_string())
    }

    /// The decoded API error, if this is one.
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            Error::Api(err) => Some(err),
            _ => None,
        }
    }

    /// HTTP status of the failed response, if there was one.
    pub fn status(&self) -> Option<u16> {
        self.api().map(|err| err.status)
    }

    /// Whether the executor treats this failure as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Api(err) => err.is_server_error(),
            _ => false,
        }
    }

    /// Check if this is a not-found error.
    pub fn is_not_found(&self) -> bool {
        self.api().is_some_and(ApiError::is_not_found)
    }

    /// Check if this is an authentication error.
    pub fn is_auth_error(&self) -> bool {
        self.api().is_some_and(ApiError::is_auth_error)
    }

    /// Check if this is a rate limit error.
    pub fn is_rate_limited(&self) -> bool {
        self.api().is_some_and(ApiError::is_rate_limited)
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        Error::Api(Box::new(err))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error decoded from a non-success response.
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// Error code reported by the platform, when the body carried one.
    pub code: Option<String>,
    /// Error message, or the raw body when it was not a JSON error.
    pub message: String,
    /// Free-form details from the error body.
    pub details: Option<serde_json::Value>,
    response: Response,
}

/// Error body shape returned by the platform.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    message: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

impl ApiError {
    /// Decode a failed response.
    ///
    /// Bodies shaped like `{code, message, details}` populate every field.
    /// Anything else falls back to the raw body text as the message.
    pub fn from_response(response: Response) -> Self {
        match serde_json::from_slice::<ErrorBody>(response.body()) {
            Ok(body) => Self {
                status: response.status(),
                code: body.code,
                message: body.message,
                details: body.details.filter(|details| !details.is_null()),
                response,
            },
            Err(_) => Self {
                status: response.status(),
                code: None,
                message: response.text(),
                details: None,
                response,
            },
        }
    }

    /// The raw response this error was decoded from.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Take ownership of the raw response.
    pub fn into_response(self) -> Response {
        self.response
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self.status, 401 | 403)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "API error ({} {}): {}", self.status, code, self.message),
            None => write!(f, "API error ({}): {}", self.status, self.message),
        }
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use serde_json::json;

    fn response(status: u16, body: &str) -> Response {
        Response::new(status, HeaderMap::new(), body.as_bytes().to_vec().into())
    }

    #[test]
    fn test_decode_structured_body() {
        let err = ApiError::from_response(response(
            400,
            r#"{"code":"invalid_param","message":"name is required","details":{"field":"name"}}"#,
        ));

        assert_eq!(err.status, 400);
        assert_eq!(err.code.as_deref(), Some("invalid_param"));
        assert_eq!(err.message, "name is required");
        assert_eq!(err.details, Some(json!({"field": "name"})));
        assert_eq!(err.to_string(), "API error (400 invalid_param): name is required");
    }

    #[test]
    fn test_decode_non_json_body_falls_back_to_raw_text() {
        let err = ApiError::from_response(response(502, "<html>Bad Gateway</html>"));

        assert_eq!(err.status, 502);
        assert!(err.code.is_none());
        assert_eq!(err.message, "<html>Bad Gateway</html>");
        assert!(err.details.is_none());
    }

    #[test]
    fn test_decode_shape_mismatch_falls_back() {
        let body = r#"{"error":"nope"}"#;
        let err = ApiError::from_response(response(422, body));

        assert_eq!(err.message, body);
        assert!(err.code.is_none());
    }

    #[test]
    fn test_null_details_are_dropped() {
        let err = ApiError::from_response(response(
            409,
            r#"{"code":"conflict","message":"exists","details":null}"#,
        ));
        assert!(err.details.is_none());
    }

    #[test]
    fn test_raw_response_is_kept() {
        let err = ApiError::from_response(response(404, "missing"));
        assert_eq!(err.response().status(), 404);
        assert_eq!(err.into_response().text(), "missing");
    }

    #[test]
    fn test_error_classification() {
        let not_found: Error = ApiError::from_response(response(404, "")).into();
        assert!(not_found.is_not_found());
        assert!(!not_found.is_retryable());
        assert_eq!(not_found.status(), Some(404));

        let unauthorized: Error = ApiError::from_response(response(401, "")).into();
        assert!(unauthorized.is_auth_error());

        let limited: Error = ApiError::from_response(response(429, "")).into();
        assert!(limited.is_rate_limited());
        assert!(!limited.is_retryable());

        let unavailable: Error = ApiError::from_response(response(503, "")).into();
        assert!(unavailable.is_retryable());

        assert!(!Error::Encoding("bad".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert_eq!(Error::Cancelled.status(), None);
    }
}
