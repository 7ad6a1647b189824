//! JSON rule files.
//!
//! A rule file is a JSON array in which strings are pattern prefixes, arrays
//! are nested groups and objects are handlers:
//!
//! ```json
//! [
//!   "//api.example.test",
//!   [
//!     "/users/:id#GET", { "respond": { "status": 200, "body": { "id": "{id}" } } },
//!     "/legacy/::rest", { "rewrite": { "pathname": "/v2/{rest}" } },
//!     "/health", { "passthrough": true }
//!   ]
//! ]
//! ```
//!
//! Handler keys may be combined in one object. They apply in this order:
//! `rewrite`, `set_headers`, `remove_headers`, `set_query`,
//! `response_headers`, then `respond` or `passthrough` (alias `stop`). A
//! handler with neither lets evaluation continue. String values may reference
//! pattern parameters as `{name}`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::StatusCode;
use mocker_core::Params;
use mocker_proxy::{
    Handler, MockResponse, Outcome, ProxyError, RequestContext, RuleError, RuleNode,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// Rule file loading error.
#[derive(Debug, Error)]
pub enum RulesFileError {
    /// The rule file could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The rule file is not valid JSON or a handler object is malformed.
    #[error("Invalid rule file: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value that is neither a prefix, a group nor a handler.
    #[error("Unsupported rule node: {0}")]
    InvalidNode(String),

    /// A status code outside 100..=999.
    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),

    /// A header name or value that cannot be sent.
    #[error("Invalid header '{0}'")]
    InvalidHeader(String),

    /// The rule tree does not compile.
    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// One handler object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerSpec {
    /// Destination and path rewrites.
    pub rewrite: Option<RewriteSpec>,
    /// Request headers to set.
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    /// Request headers to remove.
    #[serde(default)]
    pub remove_headers: Vec<String>,
    /// Query parameters to set.
    #[serde(default)]
    pub set_query: BTreeMap<String, String>,
    /// Headers set on the response, whoever produced it.
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    /// Answer with this response.
    pub respond: Option<RespondSpec>,
    /// Skip the remaining rules and forward to the origin.
    #[serde(default, alias = "stop")]
    pub passthrough: bool,
}

impl HandlerSpec {
    fn is_plain_response(&self) -> bool {
        self.respond.is_some()
            && self.rewrite.is_none()
            && self.set_headers.is_empty()
            && self.remove_headers.is_empty()
            && self.set_query.is_empty()
            && self.response_headers.is_empty()
    }
}

/// Request rewrites. Applied in field order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteSpec {
    /// Full URL.
    pub href: Option<String>,
    /// `http`, `https`, `ws` or `wss`.
    pub protocol: Option<String>,
    /// `hostname[:port]`.
    pub host: Option<String>,
    /// Destination hostname.
    pub hostname: Option<String>,
    /// Destination port.
    pub port: Option<PortSpec>,
    /// Path with query string.
    pub path: Option<String>,
    /// Path without query string.
    pub pathname: Option<String>,
    /// `Host` header identity.
    pub servername: Option<String>,
}

/// A port as a number or a template string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    /// Literal port.
    Number(u16),
    /// Template such as `"{port}"`.
    Template(String),
}

/// A canned response.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RespondSpec {
    /// Status code.
    #[serde(default = "default_status")]
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Text body for strings, JSON body for anything else.
    pub body: Option<Value>,
    /// Body file, relative to the rule file.
    pub file: Option<PathBuf>,
}

fn default_status() -> u16 {
    200
}

/// Reads and parses the rule file at `path`.
pub fn load_rules(path: &Path) -> Result<RuleNode, RulesFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| RulesFileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_rules(&text, base_dir)
}

/// Parses rule file text. Relative `file` bodies resolve against `base_dir`.
pub fn parse_rules(text: &str, base_dir: &Path) -> Result<RuleNode, RulesFileError> {
    let value: Value = serde_json::from_str(text)?;
    to_node(value, base_dir)
}

fn to_node(value: Value, base_dir: &Path) -> Result<RuleNode, RulesFileError> {
    match value {
        Value::String(prefix) => Ok(RuleNode::Prefix(prefix)),
        Value::Array(items) => Ok(RuleNode::Group(
            items
                .into_iter()
                .map(|item| to_node(item, base_dir))
                .collect::<Result<_, _>>()?,
        )),
        value @ Value::Object(_) => {
            let spec: HandlerSpec = serde_json::from_value(value)?;
            Ok(RuleNode::Handler(build_handler(spec, base_dir)?))
        }
        other => Err(RulesFileError::InvalidNode(other.to_string())),
    }
}

/// Turns a handler object into a [`Handler`].
pub fn build_handler(mut spec: HandlerSpec, base_dir: &Path) -> Result<Handler, RulesFileError> {
    for name in spec
        .set_headers
        .keys()
        .chain(spec.response_headers.keys())
        .chain(spec.remove_headers.iter())
    {
        HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RulesFileError::InvalidHeader(name.clone()))?;
    }

    let plain = spec.is_plain_response();
    let response = spec
        .respond
        .take()
        .map(|respond| build_response(respond, base_dir))
        .transpose()?;

    if plain {
        if let Some(response) = response {
            return Ok(Handler::literal(response));
        }
    }

    let spec = Arc::new(spec);
    Ok(Handler::map(move |req| apply(&spec, response.as_ref(), req)))
}

fn build_response(spec: RespondSpec, base_dir: &Path) -> Result<MockResponse, RulesFileError> {
    let status =
        StatusCode::from_u16(spec.status).map_err(|_| RulesFileError::InvalidStatus(spec.status))?;
    let mut response = MockResponse::new(status);

    if let Some(file) = spec.file {
        let path = base_dir.join(&file);
        let bytes = std::fs::read(&path).map_err(|source| RulesFileError::Read {
            path: path.clone(),
            source,
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            response =
                response.with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        response = response.with_body(bytes);
    } else {
        match spec.body {
            Some(Value::String(text)) => {
                response = response
                    .with_header(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/plain; charset=utf-8"),
                    )
                    .with_body(text);
            }
            Some(value) => {
                response = response
                    .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                    .with_body(serde_json::to_vec(&value)?);
            }
            None => {}
        }
    }

    for (name, value) in spec.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| RulesFileError::InvalidHeader(name.clone()))?;
        let header_value =
            HeaderValue::from_str(&value).map_err(|_| RulesFileError::InvalidHeader(name))?;
        response = response.with_header(header_name, header_value);
    }

    Ok(response)
}

fn apply(
    spec: &HandlerSpec,
    response: Option<&MockResponse>,
    req: &mut RequestContext,
) -> mocker_proxy::Result<Outcome> {
    let params = req.params().clone();

    if let Some(rewrite) = &spec.rewrite {
        apply_rewrite(rewrite, &params, req)?;
    }
    for (name, value) in &spec.set_headers {
        req.set_header(name, &interpolate(value, &params))?;
    }
    for name in &spec.remove_headers {
        req.remove_header(name);
    }
    for (key, value) in &spec.set_query {
        req.set_query_param(key, &interpolate(value, &params));
    }

    if !spec.response_headers.is_empty() {
        let headers: Vec<(String, String)> = spec
            .response_headers
            .iter()
            .map(|(name, value)| (name.clone(), interpolate(value, &params)))
            .collect();
        req.on_response(move |mut res| async move {
            for (name, value) in &headers {
                res.set_header(name, value)?;
            }
            Ok::<_, ProxyError>(res)
        });
    }

    if let Some(response) = response {
        Ok(Outcome::Respond(response.to_response(req.method())))
    } else if spec.passthrough {
        Ok(Outcome::Stop)
    } else {
        Ok(Outcome::Next)
    }
}

fn apply_rewrite(
    rewrite: &RewriteSpec,
    params: &Params,
    req: &mut RequestContext,
) -> mocker_proxy::Result<()> {
    if let Some(href) = &rewrite.href {
        req.set_href(&interpolate(href, params))?;
    }
    if let Some(protocol) = &rewrite.protocol {
        req.set_protocol(&interpolate(protocol, params))?;
    }
    if let Some(host) = &rewrite.host {
        req.set_host(&interpolate(host, params))?;
    }
    if let Some(hostname) = &rewrite.hostname {
        req.set_hostname(&interpolate(hostname, params))?;
    }
    match &rewrite.port {
        Some(PortSpec::Number(port)) => req.set_port(*port),
        Some(PortSpec::Template(template)) => {
            let value = interpolate(template, params);
            let port = value
                .parse()
                .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", value)))?;
            req.set_port(port);
        }
        None => {}
    }
    if let Some(path) = &rewrite.path {
        req.set_path(&interpolate(path, params));
    }
    if let Some(pathname) = &rewrite.pathname {
        req.set_pathname(&interpolate(pathname, params));
    }
    if let Some(servername) = &rewrite.servername {
        req.set_servername(&interpolate(servername, params))?;
    }
    Ok(())
}

/// Replaces `{name}` with the matching parameter. Unknown names are kept.
pub fn interpolate(template: &str, params: &Params) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };

        let name = &after[..end];
        match params.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push('{');
                out.push_str(name);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::{Method, Request};
    use mocker_proxy::{Endpoint, Forwarder, RuleSet};
    use tempfile::TempDir;

    fn request(method: Method, uri: &str) -> RequestContext {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(String::new())
            .unwrap();
        let forwarder = Arc::new(Forwarder::direct().unwrap());
        RequestContext::from_request(req, &Endpoint::direct(), forwarder).unwrap()
    }

    fn compile(text: &str) -> RuleSet {
        RuleSet::compile(parse_rules(text, Path::new(".")).unwrap()).unwrap()
    }

    #[test]
    fn interpolates_params() {
        let mut params = Params::new();
        params.insert("id", "42");
        assert_eq!(interpolate("/users/{id}/x", &params), "/users/42/x");
        assert_eq!(interpolate("{missing}-{id}", &params), "{missing}-42");
        assert_eq!(interpolate("open {brace", &params), "open {brace");
        assert_eq!(interpolate("plain", &params), "plain");
    }

    #[tokio::test]
    async fn literal_json_response() {
        let rules = compile(
            r#"["//api.test", ["/users/:id#GET", {"respond": {"status": 201, "body": {"ok": true}}}]]"#,
        );

        let mut req = request(Method::GET, "http://api.test/users/7");
        let response = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.text().await.unwrap(), r#"{"ok":true}"#);

        let mut post = request(Method::POST, "http://api.test/users/7");
        assert!(rules.evaluate(&mut post).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rewrite_uses_params() {
        let rules = compile(
            r#"["//old.test/:name", {
                "rewrite": {"hostname": "new.test", "port": 8080, "pathname": "/v2/{name}"},
                "set_headers": {"x-user": "{name}"},
                "set_query": {"from": "old"}
            }]"#,
        );

        let mut req = request(Method::GET, "http://old.test/alice");
        assert!(rules.evaluate(&mut req).await.unwrap().is_none());
        assert_eq!(req.hostname(), "new.test");
        assert_eq!(req.port(), 8080);
        assert_eq!(req.pathname(), "/v2/alice");
        assert_eq!(req.header("x-user"), Some("alice"));
        assert_eq!(req.query().get("from"), Some("old"));
    }

    #[tokio::test]
    async fn passthrough_stops_evaluation() {
        let rules = compile(
            r#"["/a", {"passthrough": true}, "/a", {"respond": {"body": "mocked"}}, "/b", {"stop": true}]"#,
        );

        let mut req = request(Method::GET, "http://x.test/a");
        assert!(rules.evaluate(&mut req).await.unwrap().is_none());
        assert_eq!(rules.len(), 3);
    }

    #[tokio::test]
    async fn combined_handler_rewrites_then_responds() {
        let rules = compile(
            r#"["/echo/:word", {"set_headers": {"x-word": "{word}"}, "respond": {"body": "hi"}}]"#,
        );

        let mut req = request(Method::GET, "http://x.test/echo/yo");
        let response = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(response.text().await.unwrap(), "hi");
        assert_eq!(req.header("x-word"), Some("yo"));
    }

    #[tokio::test]
    async fn file_body_relative_to_rule_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("user.json"), r#"{"name":"bob"}"#).unwrap();
        let rules_path = temp_dir.path().join("rules.json");
        std::fs::write(&rules_path, r#"["/user", {"respond": {"file": "user.json"}}]"#).unwrap();

        let rules = RuleSet::compile(load_rules(&rules_path).unwrap()).unwrap();
        let mut req = request(Method::GET, "http://x.test/user");
        let response = rules.evaluate(&mut req).await.unwrap().unwrap();
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.text().await.unwrap(), r#"{"name":"bob"}"#);
    }

    #[test]
    fn rejects_malformed_files() {
        let base = Path::new(".");
        assert!(matches!(
            parse_rules("[1]", base),
            Err(RulesFileError::InvalidNode(_))
        ));
        assert!(matches!(
            parse_rules(r#"[{"bogus": 1}]"#, base),
            Err(RulesFileError::Parse(_))
        ));
        assert!(matches!(
            parse_rules(r#"[{"respond": {"status": 1000}}]"#, base),
            Err(RulesFileError::InvalidStatus(1000))
        ));
        assert!(matches!(
            parse_rules(r#"[{"set_headers": {"bad header": "x"}}]"#, base),
            Err(RulesFileError::InvalidHeader(_))
        ));
        assert!(matches!(
            parse_rules("[", base),
            Err(RulesFileError::Parse(_))
        ));
        assert!(matches!(
            load_rules(Path::new("/nonexistent/rules.json")),
            Err(RulesFileError::Read { .. })
        ));
    }

    #[test]
    fn root_must_be_an_array() {
        let root = parse_rules(r#"{"respond": {}}"#, Path::new(".")).unwrap();
        assert!(matches!(RuleSet::compile(root), Err(RuleError::NotAGroup)));
    }
}
