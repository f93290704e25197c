//! Wire-agnostic request and response model.
//!
//! A [`Request`] describes one outbound call relative to the client's base
//! URL. The executor turns it into an HTTP exchange and hands back a fully
//! buffered [`Response`].

use std::fmt;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::multipart::MultipartForm;

pub(crate) const TEXT_PLAIN: &str = "text/plain";
pub(crate) const OCTET_STREAM: &str = "application/octet-stream";
pub(crate) const APPLICATION_JSON: &str = "application/json";

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// Request body. The variant decides the `Content-Type`.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Sent verbatim as `text/plain`.
    Text(String),
    /// Sent verbatim as `application/octet-stream`.
    Bytes(Bytes),
    /// Serialized as `application/json`.
    Json(serde_json::Value),
    /// Sent as `multipart/form-data` with a generated boundary.
    Multipart(MultipartForm),
}

/// A body resolved before the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    Empty,
    Bytes(Bytes),
    /// Turned into a reqwest form on every attempt.
    Multipart(MultipartForm),
}

impl Body {
    /// Content type implied by this body, if any. Multipart bodies get
    /// theirs, boundary included, when the form is attached.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            Body::Empty | Body::Multipart(_) => None,
            Body::Text(_) => Some(TEXT_PLAIN),
            Body::Bytes(_) => Some(OCTET_STREAM),
            Body::Json(_) => Some(APPLICATION_JSON),
        }
    }

    /// Encode the body once, ahead of any attempt.
    pub(crate) fn encode(&self) -> Result<Payload> {
        match self {
            Body::Empty => Ok(Payload::Empty),
            Body::Text(text) => Ok(Payload::Bytes(Bytes::from(text.clone()))),
            Body::Bytes(bytes) => Ok(Payload::Bytes(bytes.clone())),
            Body::Json(value) => serde_json::to_vec(value)
                .map(|encoded| Payload::Bytes(Bytes::from(encoded)))
                .map_err(|e| Error::Encoding(format!("failed to serialize JSON body: {e}"))),
            Body::Multipart(form) => {
                form.validate()?;
                Ok(Payload::Multipart(form.clone()))
            }
        }
    }
}

/// An outbound call, relative to the client's base URL.
///
/// Query parameters are an ordered list of pairs, so repeated keys such as
/// `tag_ids=a&tag_ids=b` survive intact. Header names are unique and
/// compared case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Body,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Set a header, replacing any existing value for the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Append a query parameter. Repeated keys are kept in order.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Append a query parameter only when a value is present.
    pub fn query_opt(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.query(key, value),
            None => self,
        }
    }

    /// Replace every existing value for `key` with a single one.
    pub fn set_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.query.retain(|(existing, _)| *existing != key);
        self.query.push((key, value.into()));
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.body = Body::Text(text.into());
        self
    }

    pub fn bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(bytes.into());
        self
    }

    /// Attach any serializable value as a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::Encoding(format!("failed to serialize JSON body: {e}")))?;
        self.body = Body::Json(value);
        Ok(self)
    }

    pub fn json_value(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    pub fn multipart(mut self, form: MultipartForm) -> Self {
        self.body = Body::Multipart(form);
        self
    }
}

/// A fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a header, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Every value of a repeated header, in order.
    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
