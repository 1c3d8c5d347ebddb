//! Request and response types seen by worker scripts

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// Errors from mutating a request
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Can't modify immutable headers")]
    ImmutableHeaders,

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),
}

/// Controls whether a request's headers may be mutated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeadersGuard {
    #[default]
    Mutable,
    /// Headers of an incoming request, as the platform delivers them
    Immutable,
}

/// An HTTP request
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    guard: HeadersGuard,
    form_data_files: bool,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            guard: HeadersGuard::Mutable,
            form_data_files: false,
        }
    }

    /// Parses `url` and builds a GET request
    pub fn get(url: &str) -> Result<Self, RequestError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::InvalidHeader(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| RequestError::InvalidHeader(e.to_string()))?;
        self.headers_mut()?.insert(name, value);
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable headers, unless the guard forbids it
    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, RequestError> {
        match self.guard {
            HeadersGuard::Mutable => Ok(&mut self.headers),
            HeadersGuard::Immutable => Err(RequestError::ImmutableHeaders),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn guard(&self) -> HeadersGuard {
        self.guard
    }

    pub fn with_guard(mut self, guard: HeadersGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Whether multipart form data parsing yields files rather than strings
    pub fn form_data_files(&self) -> bool {
        self.form_data_files
    }

    pub fn with_form_data_files(mut self, enabled: bool) -> Self {
        self.form_data_files = enabled;
        self
    }
}

/// An HTTP response
#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Something requests can be sent to: an upstream origin or another worker
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: Request) -> anyhow::Result<Response>;
}

/// Named fetchers that service bindings resolve against
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Arc<dyn Fetcher>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, service: Arc<dyn Fetcher>) {
        self.services.write().insert(name.into(), service);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Fetcher>> {
        self.services.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }
}
