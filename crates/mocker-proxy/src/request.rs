//! Mutable request wrapper seen by rule handlers.
//!
//! The destination (`hostname`, `port`) and the virtual host identity
//! (`servername`, carried in the `Host` header) are tracked separately, so a
//! rule can reroute a request without changing what the origin sees, and the
//! other way around. Composite views (`host`, `path`, `href`) are computed on
//! read; every setter updates the parts they are made of.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::body::Body;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST,
    PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Version};
use mocker_core::{
    default_port, parse_host, stringify_host, HostAddress, MatchTarget, Params, Query,
};
use serde::de::DeserializeOwned;

use crate::body::{
    full_body, BodyOptions, BodyReader, BoxError, ContentCoding, MessageBody, ProxyBody,
};
use crate::error::{BodyError, ProxyError, Result};
use crate::forward::Forwarder;
use crate::response::ResponseContext;

/// Hook applied to the response before it is written to the client.
pub type ResponseHook =
    Box<dyn FnOnce(ResponseContext) -> BoxFuture<'static, Result<ResponseContext>> + Send + Sync>;

/// Headers that describe the client's hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
];

/// Where an inbound request arrived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    /// The connection is TLS-terminated by the proxy.
    pub secure: bool,
    /// Target of the CONNECT tunnel the request came through.
    pub tunnel: Option<HostAddress>,
}

impl Endpoint {
    /// A request sent straight to the proxy port.
    pub fn direct() -> Self {
        Self::default()
    }

    /// A request that came through a CONNECT tunnel to `target`.
    pub fn tunnel(target: HostAddress, secure: bool) -> Self {
        Self {
            secure,
            tunnel: Some(target),
        }
    }
}

/// An inbound request, open for inspection and rewriting.
pub struct RequestContext {
    method: Method,
    version: Version,
    secure: bool,
    upgrade: Option<String>,
    hostname: String,
    port: u16,
    servername: String,
    pathname: String,
    search: String,
    query: Query,
    hash: String,
    headers: HeaderMap,
    params: Params,
    body: MessageBody,
    hooks: Vec<ResponseHook>,
    accepted: bool,
    on_upgrade: Option<OnUpgrade>,
    forwarder: Arc<Forwarder>,
}

impl RequestContext {
    /// Builds a context from a hyper request received on `endpoint`.
    pub fn from_request<B>(
        mut req: Request<B>,
        endpoint: &Endpoint,
        forwarder: Arc<Forwarder>,
    ) -> Result<Self>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let upgrade = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let on_upgrade = upgrade.as_ref().map(|_| hyper::upgrade::on(&mut req));

        let (parts, body) = req.into_parts();

        let secure = endpoint.secure
            || matches!(parts.uri.scheme_str(), Some("https") | Some("wss"));
        let fallback_port = default_port(secure);
        // A portless Host inside a tunnel still targets the tunnel's port
        let host_port = endpoint
            .tunnel
            .as_ref()
            .map_or(fallback_port, |target| target.port);

        let host_header = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(|v| parse_host(v, host_port))
            .transpose()?;

        let destination = match parts.uri.host() {
            Some(host) => HostAddress::new(
                unbracket(host),
                parts.uri.port_u16().unwrap_or(fallback_port),
            ),
            None => host_header
                .clone()
                .or_else(|| endpoint.tunnel.clone())
                .ok_or_else(|| ProxyError::InvalidRequest("Missing destination host".into()))?,
        };

        let servername = host_header
            .map(|h| h.hostname)
            .unwrap_or_else(|| destination.hostname.clone());

        let pathname = match parts.uri.path() {
            "" => "/".to_string(),
            path => path.to_string(),
        };
        let search = parts
            .uri
            .query()
            .map(|q| format!("?{}", q))
            .unwrap_or_default();
        let query = Query::parse(&search);

        Ok(Self {
            method: parts.method,
            version: parts.version,
            secure,
            upgrade,
            hostname: destination.hostname,
            port: destination.port,
            servername,
            pathname,
            search,
            query,
            hash: String::new(),
            headers: parts.headers,
            params: Params::new(),
            body: MessageBody::new(body),
            hooks: Vec::new(),
            accepted: false,
            on_upgrade,
            forwarder,
        })
    }

    /// Request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Replaces the request method.
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// HTTP version the client used.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Whether the request goes to the origin over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Protocol with trailing colon: `http:`, `https:`, or `ws:`/`wss:` for
    /// websocket upgrades.
    pub fn protocol(&self) -> &'static str {
        let websocket = self.upgrade.as_deref() == Some("websocket");
        match (websocket, self.secure) {
            (true, true) => "wss:",
            (true, false) => "ws:",
            (false, true) => "https:",
            (false, false) => "http:",
        }
    }

    /// Switches between plain and TLS. A port equal to the old scheme's
    /// default moves to the new scheme's default.
    pub fn set_protocol(&mut self, protocol: &str) -> Result<()> {
        let name = protocol.trim().trim_end_matches(':').to_ascii_lowercase();
        let secure = match name.as_str() {
            "https" | "wss" => true,
            "http" | "ws" => false,
            _ => {
                return Err(ProxyError::InvalidRequest(format!(
                    "Unsupported protocol '{}'",
                    protocol
                )))
            }
        };

        if self.port == default_port(self.secure) {
            self.port = default_port(secure);
        }
        self.secure = secure;
        Ok(())
    }

    /// Destination as `hostname[:port]`, port omitted when default.
    pub fn host(&self) -> String {
        stringify_host(&self.hostname, self.port, Some(default_port(self.secure)))
    }

    /// Sets hostname and port from `hostname[:port]`.
    pub fn set_host(&mut self, host: &str) -> Result<()> {
        let address = parse_host(host, default_port(self.secure))?;
        self.hostname = address.hostname;
        self.port = address.port;
        Ok(())
    }

    /// Destination hostname, unbracketed.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Sets the destination hostname. Brackets around IPv6 literals are
    /// dropped.
    pub fn set_hostname(&mut self, hostname: &str) -> Result<()> {
        let hostname = unbracket(hostname);
        if hostname.is_empty() {
            return Err(ProxyError::InvalidRequest("Empty hostname".into()));
        }
        self.hostname = hostname.to_string();
        Ok(())
    }

    /// Destination port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sets the destination port.
    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Virtual host identity sent to the origin.
    pub fn servername(&self) -> &str {
        &self.servername
    }

    /// Sets the virtual host identity and rewrites the `Host` header. The
    /// destination is unchanged.
    pub fn set_servername(&mut self, servername: &str) -> Result<()> {
        let servername = unbracket(servername);
        let host = stringify_host(servername, self.port, Some(default_port(self.secure)));
        let value =
            HeaderValue::from_str(&host).map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        self.headers.insert(HOST, value);
        self.servername = servername.to_string();
        Ok(())
    }

    /// Pathname plus search.
    pub fn path(&self) -> String {
        format!("{}{}", self.pathname, self.search)
    }

    /// Sets pathname, search and hash from a path like `/a?b=1#c`.
    pub fn set_path(&mut self, path: &str) {
        let (rest, hash) = match path.split_once('#') {
            Some((rest, hash)) => (rest, Some(hash)),
            None => (path, None),
        };
        let (pathname, search) = match rest.split_once('?') {
            Some((pathname, search)) => (pathname, search),
            None => (rest, ""),
        };

        self.set_pathname(pathname);
        self.set_search(search);
        if let Some(hash) = hash {
            self.set_hash(hash);
        }
    }

    /// Path without query string.
    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Sets the pathname, adding a leading `/` if missing.
    pub fn set_pathname(&mut self, pathname: &str) {
        self.pathname = if pathname.starts_with('/') {
            pathname.to_string()
        } else {
            format!("/{}", pathname)
        };
    }

    /// Query string with leading `?`, or empty.
    pub fn search(&self) -> &str {
        &self.search
    }

    /// Sets the raw query string. A leading `?` is optional.
    pub fn set_search(&mut self, search: &str) {
        let raw = search.strip_prefix('?').unwrap_or(search);
        self.search = if raw.is_empty() {
            String::new()
        } else {
            format!("?{}", raw)
        };
        self.query = Query::parse(raw);
    }

    /// Parsed query parameters.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Replaces the query parameters.
    pub fn set_query(&mut self, query: Query) {
        self.search = query.to_search();
        self.query = query;
    }

    /// Sets a single query parameter.
    pub fn set_query_param(&mut self, key: &str, value: &str) {
        self.query.set(key, value);
        self.search = self.query.to_search();
    }

    /// Removes a query parameter.
    pub fn remove_query_param(&mut self, key: &str) {
        self.query.remove(key);
        self.search = self.query.to_search();
    }

    /// Fragment with leading `#`, or empty. Never sent upstream.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Sets the fragment.
    pub fn set_hash(&mut self, hash: &str) {
        let raw = hash.strip_prefix('#').unwrap_or(hash);
        self.hash = if raw.is_empty() {
            String::new()
        } else {
            format!("#{}", raw)
        };
    }

    /// Absolute URL of the destination.
    pub fn href(&self) -> String {
        format!(
            "{}//{}{}{}",
            self.protocol(),
            self.host(),
            self.path(),
            self.hash
        )
    }

    /// Replaces protocol, host, path and fragment from an absolute URL.
    pub fn set_href(&mut self, href: &str) -> Result<()> {
        let url = url::Url::parse(href)
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid URL '{}': {}", href, e)))?;

        self.set_protocol(url.scheme())?;
        let hostname = url
            .host_str()
            .ok_or_else(|| ProxyError::InvalidRequest(format!("URL has no host: {}", href)))?;
        self.set_hostname(hostname)?;
        self.port = url
            .port_or_known_default()
            .unwrap_or_else(|| default_port(self.secure));
        self.set_pathname(url.path());
        self.set_search(url.query().unwrap_or(""));
        self.set_hash(url.fragment().unwrap_or(""));
        Ok(())
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns a header value if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Sets a header, replacing existing values.
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

    /// Parameters captured by the matched pattern.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// A single captured parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub(crate) fn set_params(&mut self, params: Params) {
        self.params = params;
    }

    /// View used for pattern matching.
    pub fn match_target(&self) -> MatchTarget<'_> {
        MatchTarget {
            method: self.method.as_str(),
            protocol: self.protocol(),
            hostname: &self.hostname,
            port: self.port,
            pathname: &self.pathname,
            query: &self.query,
        }
    }

    /// Content coding of the request body.
    pub fn coding(&self) -> ContentCoding {
        ContentCoding::from_headers(&self.headers)
    }

    /// The lazy body.
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Opens a body reader.
    pub fn stream(&self, options: BodyOptions) -> std::result::Result<BodyReader, BodyError> {
        self.body.stream(options, self.coding())
    }

    /// Reads the raw body. Later reads still see it.
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

    /// Replaces the body with identity-coded bytes.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        let body = body.into();
        self.headers.remove(CONTENT_ENCODING);
        self.headers.remove(TRANSFER_ENCODING);
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = MessageBody::from_bytes(body);
    }

    /// Registers a hook run on the response before it reaches the client.
    /// Hooks run in registration order and may replace the response.
    pub fn on_response<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce(ResponseContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResponseContext>> + Send + 'static,
    {
        self.hooks.push(Box::new(move |response| Box::pin(hook(response))));
    }

    pub(crate) fn take_response_hooks(&mut self) -> Vec<ResponseHook> {
        std::mem::take(&mut self.hooks)
    }

    /// Sends the request to its destination and returns the response.
    pub async fn send(&mut self) -> Result<ResponseContext> {
        let forwarder = self.forwarder.clone();
        forwarder.send(self).await
    }

    /// Whether the client asked for a protocol switch.
    pub fn is_upgrade(&self) -> bool {
        self.upgrade.is_some()
    }

    /// Requested protocol from the `Upgrade` header, lowercased.
    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.upgrade.as_deref()
    }

    /// Takes over an upgrade request. The caller answers with a
    /// `101 Switching Protocols` response and drives the returned upgrade
    /// future to obtain the client connection.
    pub fn accept_upgrade(&mut self) -> Option<OnUpgrade> {
        self.accepted = true;
        self.on_upgrade.take()
    }

    /// Whether a handler accepted the upgrade.
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub(crate) fn take_on_upgrade(&mut self) -> Option<OnUpgrade> {
        self.on_upgrade.take()
    }

    /// Builds the origin-form request written to the origin.
    pub(crate) async fn to_outbound(&self) -> Result<Request<ProxyBody>> {
        let mut headers = self.headers.clone();
        strip_hop_by_hop(&mut headers, self.upgrade.is_some());
        if !headers.contains_key(HOST) {
            let host = stringify_host(
                &self.servername,
                self.port,
                Some(default_port(self.secure)),
            );
            let value = HeaderValue::from_str(&host)
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
            headers.insert(HOST, value);
        }

        // A body already read by a handler is sent with a known length
        let body = if self.body.is_touched() {
            full_body(self.body.buffer(BodyOptions::raw(), self.coding()).await?)
        } else {
            self.body
                .into_http_body(BodyOptions::raw().consume(), self.coding())?
        };

        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.path())
            .version(Version::HTTP_11)
            .body(body)?;
        *request.headers_mut() = headers;
        Ok(request)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.method)
            .field("href", &self.href())
            .field("servername", &self.servername)
            .field("params", &self.params)
            .field("upgrade", &self.upgrade)
            .finish_non_exhaustive()
    }
}

/// Removes hop-by-hop headers, including those named by `Connection`. An
/// upgrade keeps `Connection: upgrade` and its `Upgrade` header.
fn strip_hop_by_hop(headers: &mut HeaderMap, upgrade: bool) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        if upgrade && *name == UPGRADE {
            continue;
        }
        headers.remove(name);
    }
    headers.remove(TRANSFER_ENCODING);

    if upgrade {
        headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    } else {
        headers.remove(UPGRADE);
    }
}

fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
