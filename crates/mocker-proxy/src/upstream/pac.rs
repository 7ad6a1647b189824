//! Proxy auto-config scripts.
//!
//! Scripts run in an embedded JavaScript engine with only the standard PAC
//! helper functions available. Each evaluation gets a fresh context on the
//! blocking pool with loop and recursion limits, so a misbehaving script
//! cannot stall the runtime or leak state between lookups.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;

use boa_engine::{
    js_string, Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source,
};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::UpstreamError;

/// Iterations allowed per loop in one evaluation.
const LOOP_ITERATION_LIMIT: u64 = 100_000;

/// Maximum JavaScript call depth.
const RECURSION_LIMIT: usize = 256;

/// Pure helper functions defined in JavaScript.
const PAC_PRELUDE: &str = r#"
function isPlainHostName(host) {
  return host.indexOf('.') === -1;
}
function dnsDomainIs(host, domain) {
  return host.length >= domain.length &&
    host.substring(host.length - domain.length) === domain;
}
function localHostOrDomainIs(host, hostdom) {
  return host === hostdom || hostdom.lastIndexOf(host + '.', 0) === 0;
}
function dnsDomainLevels(host) {
  return host.split('.').length - 1;
}
function shExpMatch(str, shexp) {
  var source = shexp
    .replace(/[.+^${}()|[\]\\]/g, '\\$&')
    .replace(/\*/g, '.*')
    .replace(/\?/g, '.');
  return new RegExp('^' + source + '$').test(str);
}
"#;

#[derive(Debug, Clone)]
enum PacSource {
    Url(String),
    File(PathBuf),
}

/// Loads a PAC script once and evaluates it per destination.
#[derive(Debug)]
pub struct PacResolver {
    source: Option<PacSource>,
    script: OnceCell<Arc<str>>,
    client: reqwest::Client,
}

impl PacResolver {
    /// Creates a resolver for a script at `location`: an `http(s)://` URL, a
    /// `file://` URL, or a filesystem path.
    pub fn new(location: &str) -> Self {
        let source = if location.starts_with("http://") || location.starts_with("https://") {
            PacSource::Url(location.to_string())
        } else {
            let path = location.strip_prefix("file://").unwrap_or(location);
            PacSource::File(PathBuf::from(path))
        };

        Self {
            source: Some(source),
            script: OnceCell::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Creates a resolver for an inline script.
    pub fn from_script(script: impl Into<String>) -> Self {
        let script: String = script.into();
        Self {
            source: None,
            script: OnceCell::new_with(Some(Arc::from(script))),
            client: reqwest::Client::new(),
        }
    }

    /// Returns the script, loading it on first use. A failed load is retried
    /// on the next call.
    pub async fn script(&self) -> Result<Arc<str>, UpstreamError> {
        self.script
            .get_or_try_init(|| self.load())
            .await
            .cloned()
    }

    async fn load(&self) -> Result<Arc<str>, UpstreamError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| UpstreamError::Pac("No PAC script source".to_string()))?;

        let text = match source {
            PacSource::Url(url) => {
                debug!("Fetching PAC script from {}", url);
                self.client
                    .get(url)
                    .send()
                    .await
                    .and_then(|res| res.error_for_status())
                    .map_err(|e| UpstreamError::Pac(format!("Failed to fetch {}: {}", url, e)))?
                    .text()
                    .await
                    .map_err(|e| UpstreamError::Pac(format!("Failed to read {}: {}", url, e)))?
            }
            PacSource::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                UpstreamError::Pac(format!("Failed to read {}: {}", path.display(), e))
            })?,
        };

        Ok(Arc::from(text))
    }

    /// Runs `FindProxyForURL(href, hostname)` and returns its raw result.
    pub async fn find_proxy(&self, href: &str, hostname: &str) -> Result<String, UpstreamError> {
        let script = self.script().await?;
        let href = href.to_string();
        let hostname = hostname.to_string();

        tokio::task::spawn_blocking(move || evaluate(&script, &href, &hostname))
            .await
            .map_err(|e| UpstreamError::Pac(format!("PAC evaluation task failed: {}", e)))?
    }
}

/// Evaluates a PAC script in a fresh context.
pub fn evaluate(script: &str, href: &str, hostname: &str) -> Result<String, UpstreamError> {
    let js_error = |e: boa_engine::JsError| UpstreamError::Pac(e.to_string());

    let mut context = Context::default();
    let limits = context.runtime_limits_mut();
    limits.set_loop_iteration_limit(LOOP_ITERATION_LIMIT);
    limits.set_recursion_limit(RECURSION_LIMIT);
    register_helpers(&mut context).map_err(js_error)?;
    context
        .eval(Source::from_bytes(PAC_PRELUDE))
        .map_err(js_error)?;
    context.eval(Source::from_bytes(script)).map_err(js_error)?;

    let function = context
        .global_object()
        .get(js_string!("FindProxyForURL"), &mut context)
        .map_err(js_error)?;
    let function = function
        .as_callable()
        .ok_or_else(|| UpstreamError::Pac("FindProxyForURL is not a function".to_string()))?;

    let args = [
        JsValue::from(JsString::from(href)),
        JsValue::from(JsString::from(hostname)),
    ];
    let result = function
        .call(&JsValue::undefined(), &args, &mut context)
        .map_err(js_error)?;

    Ok(result
        .to_string(&mut context)
        .map_err(js_error)?
        .to_std_string_escaped())
}

fn register_helpers(context: &mut Context) -> JsResult<()> {
    context.register_global_builtin_callable(
        js_string!("dnsResolve"),
        1,
        NativeFunction::from_fn_ptr(dns_resolve),
    )?;
    context.register_global_builtin_callable(
        js_string!("isResolvable"),
        1,
        NativeFunction::from_fn_ptr(is_resolvable),
    )?;
    context.register_global_builtin_callable(
        js_string!("isInNet"),
        3,
        NativeFunction::from_fn_ptr(is_in_net),
    )?;
    context.register_global_builtin_callable(
        js_string!("myIpAddress"),
        0,
        NativeFunction::from_fn_ptr(my_ip_address),
    )?;
    Ok(())
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn ip_value(ip: Ipv4Addr) -> JsValue {
    JsValue::from(JsString::from(ip.to_string().as_str()))
}

/// First IPv4 address of `host`; IP literals resolve to themselves.
fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(ip);
    }
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
}

fn dns_resolve(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(resolve_ipv4(&host).map(ip_value).unwrap_or_else(JsValue::null))
}

fn is_resolvable(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    Ok(JsValue::from(resolve_ipv4(&host).is_some()))
}

fn is_in_net(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let host = string_arg(args, 0, context)?;
    let pattern = string_arg(args, 1, context)?;
    let mask = string_arg(args, 2, context)?;

    let contained = match (
        resolve_ipv4(&host),
        pattern.parse::<Ipv4Addr>(),
        mask.parse::<Ipv4Addr>(),
    ) {
        (Some(ip), Ok(pattern), Ok(mask)) => {
            let mask = u32::from(mask);
            u32::from(ip) & mask == u32::from(pattern) & mask
        }
        _ => false,
    };
    Ok(JsValue::from(contained))
}

fn my_ip_address(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(ip_value(local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST)))
}

/// Address of the interface used for outbound traffic. Connecting a UDP
/// socket sends no packets.
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn evaluates_find_proxy() {
        let script = r#"
            function FindProxyForURL(url, host) {
              if (isPlainHostName(host)) return "DIRECT";
              if (dnsDomainIs(host, ".corp.test")) return "PROXY proxy.corp.test:3128";
              if (shExpMatch(url, "*://*.cdn.test/*")) return "SOCKS5 127.0.0.1:1080; DIRECT";
              return "DIRECT";
            }
        "#;

        assert_eq!(evaluate(script, "http://intranet/", "intranet").unwrap(), "DIRECT");
        assert_eq!(
            evaluate(script, "https://a.corp.test/", "a.corp.test").unwrap(),
            "PROXY proxy.corp.test:3128"
        );
        assert_eq!(
            evaluate(script, "https://img.cdn.test/x.png", "img.cdn.test").unwrap(),
            "SOCKS5 127.0.0.1:1080; DIRECT"
        );
    }

    #[test]
    fn native_helpers_work_on_literals() {
        let script = r#"
            function FindProxyForURL(url, host) {
              var parts = [
                isInNet(host, "10.0.0.0", "255.0.0.0"),
                isInNet(host, "192.168.0.0", "255.255.0.0"),
                dnsResolve(host),
                isResolvable(host),
                dnsDomainLevels("a.b.c"),
                localHostOrDomainIs("www", "www.example.test")
              ];
              return parts.join(",");
            }
        "#;

        assert_eq!(
            evaluate(script, "http://10.1.2.3/", "10.1.2.3").unwrap(),
            "true,false,10.1.2.3,true,2,true"
        );
    }

    #[test]
    fn my_ip_address_returns_an_address() {
        let script = "function FindProxyForURL(u, h) { return myIpAddress(); }";
        let result = evaluate(script, "http://a/", "a").unwrap();
        assert!(result.parse::<Ipv4Addr>().is_ok());
    }

    #[test]
    fn script_errors_are_reported() {
        assert!(matches!(
            evaluate("function (", "http://a/", "a"),
            Err(UpstreamError::Pac(_))
        ));
        assert!(matches!(
            evaluate("var x = 1;", "http://a/", "a"),
            Err(UpstreamError::Pac(_))
        ));
    }

    #[test]
    fn runaway_scripts_are_stopped() {
        let looping = "function FindProxyForURL(u, h) { while (true) {} return 'DIRECT'; }";
        assert!(matches!(
            evaluate(looping, "http://a/", "a"),
            Err(UpstreamError::Pac(_))
        ));

        let recursive = "function f(n) { return f(n + 1); }\n\
                         function FindProxyForURL(u, h) { return f(0); }";
        assert!(matches!(
            evaluate(recursive, "http://a/", "a"),
            Err(UpstreamError::Pac(_))
        ));
    }

    #[tokio::test]
    async fn loads_script_from_file_once() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("proxy.pac");
        std::fs::write(
            &path,
            "function FindProxyForURL(u, h) { return 'PROXY p.test:8080'; }",
        )
        .unwrap();

        let resolver = PacResolver::new(&format!("file://{}", path.display()));
        assert_eq!(
            resolver.find_proxy("http://a/", "a").await.unwrap(),
            "PROXY p.test:8080"
        );

        // Cached: later edits are not seen
        std::fs::write(&path, "function FindProxyForURL(u, h) { return 'DIRECT'; }").unwrap();
        assert_eq!(
            resolver.find_proxy("http://a/", "a").await.unwrap(),
            "PROXY p.test:8080"
        );
    }

    #[tokio::test]
    async fn missing_file_is_retried() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("late.pac");
        let resolver = PacResolver::new(path.to_str().unwrap());

        assert!(resolver.script().await.is_err());

        std::fs::write(&path, "function FindProxyForURL() { return 'DIRECT'; }").unwrap();
        assert!(resolver.script().await.is_ok());
    }

    #[tokio::test]
    async fn inline_script() {
        let resolver =
            PacResolver::from_script("function FindProxyForURL() { return 'DIRECT'; }");
        assert_eq!(
            resolver.find_proxy("http://a/", "a").await.unwrap(),
            "DIRECT"
        );
    }
}
