//! URL pattern DSL.
//!
//! A pattern is split into independent predicates that are ANDed together.
//! They run cheapest first: method, port, protocol, hostname, query and
//! finally pathname, which is the only one producing output (named params).
//!
//! ```text
//! https|http://*.example.com:443|8443/users/:id/::rest?debug&v=2#GET|POST
//! ```

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::PatternError;
use crate::query::Query;

static PATTERN_GRAMMAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?:(?P<protocol>[^:/?#]+:?)?//",
        r"(?P<hostname>\[[^\]]+\]|[^:/?#]+)?",
        r"(?::(?P<port>[^:/?#]*))?)?",
        r"(?P<pathname>/[^?#]*)?",
        r"(?P<search>\?[^#]*)?",
        r"(?P<hash>#.*)?$",
    ))
    .expect("pattern grammar is a valid regex")
});

static PATH_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::?(\w+)").expect("path param syntax is a valid regex"));

// =============================================================================
// Match input and output
// =============================================================================

/// The request components a pattern is matched against.
#[derive(Debug, Clone, Copy)]
pub struct MatchTarget<'a> {
    /// Request method, e.g. `GET`.
    pub method: &'a str,
    /// Protocol with trailing colon, e.g. `https:`.
    pub protocol: &'a str,
    /// Destination hostname, unbracketed.
    pub hostname: &'a str,
    /// Destination port (already defaulted by scheme).
    pub port: u16,
    /// Path without query string.
    pub pathname: &'a str,
    /// Parsed query string.
    pub query: &'a Query,
}

/// Named parameters extracted from a pathname match, in pattern order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    /// Creates an empty set of params.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value bound to `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Binds `name` to `value`, replacing an earlier binding.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Returns true if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// =============================================================================
// Component matchers
// =============================================================================

#[derive(Debug, Clone)]
enum HostMatcher {
    Exact(String),
    /// `*.suffix`: exactly one extra label.
    OneLabel(String),
    /// `*.*.suffix`: one or more extra labels.
    AnyDepth(String),
}

impl HostMatcher {
    fn new(pattern: &str) -> Self {
        let pattern = pattern.to_ascii_lowercase();
        let pattern = match pattern.strip_prefix('[') {
            Some(inner) => inner.strip_suffix(']').unwrap_or(inner).to_string(),
            None => pattern,
        };

        if let Some(suffix) = pattern.strip_prefix("*.*") {
            HostMatcher::AnyDepth(suffix.to_string())
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            if suffix.starts_with('.') {
                HostMatcher::OneLabel(suffix.to_string())
            } else {
                HostMatcher::Exact(pattern)
            }
        } else {
            HostMatcher::Exact(pattern)
        }
    }

    fn matches(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        match self {
            HostMatcher::Exact(expected) => hostname == *expected,
            HostMatcher::OneLabel(suffix) => match hostname.strip_suffix(suffix.as_str()) {
                Some(prefix) => !prefix.is_empty() && !prefix.contains('.'),
                None => false,
            },
            HostMatcher::AnyDepth(suffix) => match hostname.strip_suffix(suffix.as_str()) {
                Some(prefix) => !prefix.is_empty() && !prefix.starts_with('.'),
                None => false,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct PathMatcher {
    regex: Regex,
    names: Vec<String>,
}

impl PathMatcher {
    fn compile(pattern: &str, pathname: &str) -> Result<Self, PatternError> {
        let mut source = String::from("^");
        let mut names = Vec::new();
        let mut last = 0;

        for caps in PATH_PARAM.captures_iter(pathname) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            source.push_str(&regex::escape(&pathname[last..whole.start()]));
            if whole.as_str().starts_with("::") {
                source.push_str("(.+)");
            } else {
                source.push_str("([^/]+)");
            }
            names.push(name.as_str().to_string());
            last = whole.end();
        }
        source.push_str(&regex::escape(&pathname[last..]));
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| PatternError::Pathname {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { regex, names })
    }

    fn extract(&self, pathname: &str) -> Option<Params> {
        let caps = self.regex.captures(pathname)?;
        let mut params = Params::new();
        for (index, name) in self.names.iter().enumerate() {
            if let Some(value) = caps.get(index + 1) {
                params.insert(name.clone(), value.as_str());
            }
        }
        Some(params)
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split('|').map(str::trim).filter(|item| !item.is_empty())
}

// =============================================================================
// UrlPattern
// =============================================================================

/// A compiled URL pattern.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    methods: Option<Vec<String>>,
    ports: Option<Vec<u16>>,
    protocols: Option<Vec<String>>,
    hostname: Option<HostMatcher>,
    query: Vec<(String, Option<String>)>,
    pathname: Option<PathMatcher>,
}

impl UrlPattern {
    /// Compiles a pattern.
    pub fn parse(source: &str) -> Result<Self, PatternError> {
        let malformed = || PatternError::Malformed(source.to_string());
        let caps = PATTERN_GRAMMAR.captures(source).ok_or_else(malformed)?;
        let part = |name: &str| caps.name(name).map(|m| m.as_str());

        let protocols = part("protocol").map(|protocol| {
            split_list(protocol)
                .map(|p| p.trim_end_matches(':').to_ascii_lowercase())
                .collect()
        });

        let ports = match part("port").filter(|p| !p.is_empty()) {
            Some(ports) => Some(
                split_list(ports)
                    .map(|p| p.parse::<u16>().map_err(|_| malformed()))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let hostname = part("hostname").map(HostMatcher::new);

        let query = part("search")
            .map(|search| {
                Query::parse(search)
                    .iter()
                    .map(|(k, v)| {
                        let value = (!v.is_empty()).then(|| v.to_string());
                        (k.to_string(), value)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let pathname = part("pathname")
            .map(|pathname| PathMatcher::compile(source, pathname))
            .transpose()?;

        let methods = part("hash")
            .map(|hash| {
                split_list(hash.trim_start_matches('#'))
                    .map(str::to_ascii_uppercase)
                    .collect::<Vec<_>>()
            })
            .filter(|methods| !methods.is_empty());

        Ok(Self {
            source: source.to_string(),
            methods,
            ports,
            protocols,
            hostname,
            query,
            pathname,
        })
    }

    /// Returns the pattern text this was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Matches a request, returning the extracted params on success.
    pub fn matches(&self, target: &MatchTarget<'_>) -> Option<Params> {
        if let Some(methods) = &self.methods {
            if !methods.iter().any(|m| m.eq_ignore_ascii_case(target.method)) {
                return None;
            }
        }

        if let Some(ports) = &self.ports {
            if !ports.contains(&target.port) {
                return None;
            }
        }

        if let Some(protocols) = &self.protocols {
            let protocol = target.protocol.trim_end_matches(':');
            if !protocols.iter().any(|p| p.eq_ignore_ascii_case(protocol)) {
                return None;
            }
        }

        if let Some(hostname) = &self.hostname {
            if !hostname.matches(target.hostname) {
                return None;
            }
        }

        for (key, expected) in &self.query {
            match (target.query.get(key), expected) {
                (None, _) => return None,
                (Some(actual), Some(expected)) if actual != expected => return None,
                _ => {}
            }
        }

        match &self.pathname {
            Some(matcher) => matcher.extract(target.pathname),
            None => Some(Params::new()),
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Req {
        method: &'static str,
        protocol: &'static str,
        hostname: &'static str,
        port: u16,
        pathname: &'static str,
        query: Query,
    }

    impl Req {
        fn get(url: &'static str) -> Self {
            let (protocol, rest) = url.split_once("//").unwrap();
            let (host, path) = match rest.find('/') {
                Some(i) => rest.split_at(i),
                None => (rest, "/"),
            };
            let (pathname, search) = match path.find('?') {
                Some(i) => path.split_at(i),
                None => (path, ""),
            };
            let secure = protocol == "https:";
            let (hostname, port) = match host.rsplit_once(':') {
                Some((h, p)) => (h, p.parse().unwrap()),
                None => (host, if secure { 443 } else { 80 }),
            };
            Self {
                method: "GET",
                protocol,
                hostname,
                port,
                pathname,
                query: Query::parse(search),
            }
        }

        fn method(mut self, method: &'static str) -> Self {
            self.method = method;
            self
        }

        fn target(&self) -> MatchTarget<'_> {
            MatchTarget {
                method: self.method,
                protocol: self.protocol,
                hostname: self.hostname,
                port: self.port,
                pathname: self.pathname,
                query: &self.query,
            }
        }
    }

    fn matches(pattern: &str, url: &'static str) -> bool {
        UrlPattern::parse(pattern)
            .unwrap()
            .matches(&Req::get(url).target())
            .is_some()
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = UrlPattern::parse("").unwrap();
        let params = pattern.matches(&Req::get("http://a.com/x").target());
        assert_eq!(params, Some(Params::new()));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        assert!(matches!(
            UrlPattern::parse("example.com/x"),
            Err(PatternError::Malformed(_))
        ));
        assert!(matches!(
            UrlPattern::parse("//example.com:http/x"),
            Err(PatternError::Malformed(_))
        ));
    }

    #[test]
    fn path_params() {
        let pattern = UrlPattern::parse("/user/:id/::rest").unwrap();

        let params = pattern
            .matches(&Req::get("http://a.com/user/42/a/b/c").target())
            .unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("rest"), Some("a/b/c"));

        assert!(pattern
            .matches(&Req::get("http://a.com/user/42").target())
            .is_none());
    }

    #[test]
    fn pathname_literals_are_escaped() {
        assert!(matches("/api/v1.0/items", "http://a.com/api/v1.0/items"));
        assert!(!matches("/api/v1.0/items", "http://a.com/api/v1x0/items"));
        assert!(!matches("/api", "http://a.com/api/more"));
    }

    #[test]
    fn single_label_wildcard() {
        assert!(matches("//*.example.com", "http://api.example.com/"));
        assert!(!matches("//*.example.com", "http://example.com/"));
        assert!(!matches("//*.example.com", "http://a.b.example.com/"));
        assert!(!matches("//*.example.com", "http://api.example.org/"));
    }

    #[test]
    fn multi_label_wildcard() {
        assert!(matches("//*.*.example.com", "http://api.example.com/"));
        assert!(matches("//*.*.example.com", "http://a.b.c.example.com/"));
        assert!(!matches("//*.*.example.com", "http://example.com/"));
        assert!(!matches("//*.*.example.com", "http://badexample.com/"));
    }

    #[test]
    fn hostname_is_case_insensitive() {
        assert!(matches("//Example.COM/ping", "http://example.com/ping"));
        assert!(matches("//example.com/ping", "http://EXAMPLE.com/ping"));
    }

    #[test]
    fn protocol_list() {
        assert!(matches("https|wss://a.com", "https://a.com/"));
        assert!(matches("HTTP://a.com", "http://a.com/"));
        assert!(!matches("https://a.com", "http://a.com/"));
    }

    #[test]
    fn port_list_uses_scheme_defaults() {
        assert!(matches("//a.com:443|8443", "https://a.com/"));
        assert!(matches("//a.com:443|8443", "http://a.com:8443/"));
        assert!(!matches("//a.com:443", "http://a.com/"));
    }

    #[test]
    fn query_predicates() {
        assert!(matches("/search?q", "http://a.com/search?q=anything&x=1"));
        assert!(matches("/search?q=rust", "http://a.com/search?q=rust"));
        assert!(!matches("/search?q=rust", "http://a.com/search?q=go"));
        assert!(!matches("/search?q", "http://a.com/search?x=1"));
    }

    #[test]
    fn method_filter() {
        let pattern = UrlPattern::parse("/items#POST|put").unwrap();
        assert!(pattern
            .matches(&Req::get("http://a.com/items").method("POST").target())
            .is_some());
        assert!(pattern
            .matches(&Req::get("http://a.com/items").method("PUT").target())
            .is_some());
        assert!(pattern
            .matches(&Req::get("http://a.com/items").target())
            .is_none());
    }

    #[test]
    fn ipv6_hostname() {
        let pattern = UrlPattern::parse("//[::1]:8080/x").unwrap();
        let query = Query::new();
        let target = MatchTarget {
            method: "GET",
            protocol: "http:",
            hostname: "::1",
            port: 8080,
            pathname: "/x",
            query: &query,
        };
        assert!(pattern.matches(&target).is_some());
    }

    #[test]
    fn display_keeps_source() {
        let pattern = UrlPattern::parse("//a.com/x").unwrap();
        assert_eq!(pattern.to_string(), "//a.com/x");
    }
}
