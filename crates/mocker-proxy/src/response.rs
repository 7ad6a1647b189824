//! Response wrapper used by rule handlers and the forwarder.

use std::fmt;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
    TRANSFER_ENCODING,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Response, StatusCode, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::body::{BodyOptions, BodyReader, ContentCoding, MessageBody, ProxyBody};
use crate::error::{BodyError, ProxyError, Result};

/// A response on its way back to the client.
///
/// Either synthesized by a rule or wrapping the origin's response. Bodies are
/// lazy, exactly like request bodies.
pub struct ResponseContext {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    body: MessageBody,
    request_method: Method,
    upgrade: Option<OnUpgrade>,
}

impl ResponseContext {
    /// An empty response with `status`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: MessageBody::empty(),
            request_method: Method::GET,
            upgrade: None,
        }
    }

    /// A plain-text response.
    pub fn from_text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut response = Self::new(status);
        response.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.set_body(body.into());
        response
    }

    /// A JSON response.
    pub fn from_json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        let mut response = Self::new(status);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.set_body(body);
        Ok(response)
    }

    /// Wraps an origin response to a request made with `method`.
    pub(crate) fn from_upstream(mut response: Response<Incoming>, method: Method) -> Self {
        let upgrade = (response.status() == StatusCode::SWITCHING_PROTOCOLS)
            .then(|| hyper::upgrade::on(&mut response));
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body: MessageBody::new(body),
            request_method: method,
            upgrade,
        }
    }

    /// Adds a header, builder style.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the body, builder style.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.set_body(body);
        self
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Sets the status code.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns a header value if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a header, replacing any existing values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        let value =
            HeaderValue::from_str(value).map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Removes a header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    /// Method of the request this response answers.
    pub fn request_method(&self) -> &Method {
        &self.request_method
    }

    /// Content coding of the body, accounting for bodyless responses.
    pub fn coding(&self) -> ContentCoding {
        ContentCoding::for_response(&self.request_method, self.status, &self.headers)
    }

    /// The lazy body.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Opens a body reader.
    pub fn stream(&self, options: BodyOptions) -> std::result::Result<BodyReader, BodyError> {
        self.body.stream(options, self.coding())
    }

    /// Reads the raw body.
    pub async fn buffer(&self) -> std::result::Result<Bytes, BodyError> {
        self.body.buffer(BodyOptions::raw(), self.coding()).await
    }

    /// Reads the decoded body as text.
    pub async fn text(&self) -> std::result::Result<String, BodyError> {
        self.body.text(BodyOptions::decoded(), self.coding()).await
    }

    /// Reads the decoded body as JSON.
    pub async fn json<T: DeserializeOwned>(&self) -> std::result::Result<T, BodyError> {
        self.body.json(BodyOptions::decoded(), self.coding()).await
    }

    /// Replaces the body with identity-coded bytes and fixes the framing
    /// headers to match.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers.remove(CONTENT_ENCODING);
        self.headers.remove(TRANSFER_ENCODING);
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = MessageBody::from_bytes(body);
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// Converts into the hyper response written to the client.
    pub fn into_response(self) -> Result<Response<ProxyBody>> {
        let coding = self.coding();
        let body = self
            .body
            .into_http_body(BodyOptions::raw().consume(), coding)?;

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        if self.version == Version::HTTP_10 {
            *response.version_mut() = Version::HTTP_10;
        }
        Ok(response)
    }
}

impl Default for ResponseContext {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

impl fmt::Debug for ResponseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseContext")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// A canned response, cloned into a [`ResponseContext`] per request.
#[derive(Debug, Clone)]
pub struct MockResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl MockResponse {
    /// An empty response with `status`.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// An empty 200 response.
    pub fn ok() -> Self {
        Self::new(StatusCode::OK)
    }

    /// A plain-text 200 response.
    pub fn text(body: impl Into<String>) -> Self {
        Self::ok()
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(body.into())
    }

    /// A JSON 200 response.
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::ok()
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(serde_json::to_vec(value)?))
    }

    /// Sets the status.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Builds a fresh response for a request made with `method`.
    pub fn to_response(&self, method: &Method) -> ResponseContext {
        let mut response = ResponseContext::new(self.status);
        response.request_method = method.clone();
        response.headers = self.headers.clone();
        response.set_body(self.body.clone());
        response
    }
}

impl Default for MockResponse {
    fn default() -> Self {
        Self::ok()
    }
}
