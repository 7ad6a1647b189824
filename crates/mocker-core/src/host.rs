//! `host:port` parsing and formatting.
//!
//! Hostnames are stored unbracketed. IPv6 literals get their brackets back
//! when formatted, so `[::1]:8080` survives a parse/format round trip.

use std::fmt;

use crate::error::HostError;

/// Default HTTPS port.
pub const HTTPS_PORT: u16 = 443;

/// Default HTTP port.
pub const HTTP_PORT: u16 = 80;

/// Returns the default port for a scheme.
pub fn default_port(secure: bool) -> u16 {
    if secure {
        HTTPS_PORT
    } else {
        HTTP_PORT
    }
}

/// A hostname and port pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddress {
    /// Hostname or IP literal, without brackets.
    pub hostname: String,
    /// Port number.
    pub port: u16,
}

impl HostAddress {
    /// Creates a new address.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
        }
    }

    /// Formats the address, omitting the port if it equals `default_port`.
    pub fn to_host_string(&self, default_port: Option<u16>) -> String {
        stringify_host(&self.hostname, self.port, default_port)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_host_string(None))
    }
}

/// Parses `hostname[:port]`.
///
/// The port is only split off when the suffix after the last `:` is all
/// digits, so an unbracketed value like `a:b` is taken as a hostname. An empty
/// or missing port falls back to `default_port`.
pub fn parse_host(value: &str, default_port: u16) -> Result<HostAddress, HostError> {
    let (hostname, port) = split_host(value);

    let hostname = match hostname.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').unwrap_or(inner),
        None => hostname,
    };

    if hostname.is_empty() {
        return Err(HostError::MissingHostname(value.to_string()));
    }

    let port = match port {
        Some(digits) if !digits.is_empty() => digits
            .parse::<u16>()
            .map_err(|_| HostError::InvalidPort(value.to_string()))?,
        _ => default_port,
    };

    Ok(HostAddress::new(hostname, port))
}

fn split_host(value: &str) -> (&str, Option<&str>) {
    if value.starts_with('[') {
        if let Some(end) = value.find(']') {
            let rest = &value[end + 1..];
            return match rest.strip_prefix(':') {
                Some(port) if port.bytes().all(|b| b.is_ascii_digit()) => {
                    (&value[..=end], Some(port))
                }
                _ => (value, None),
            };
        }
    }

    match value.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => (host, Some(port)),
        _ => (value, None),
    }
}

/// Formats a hostname and port.
///
/// Hostnames containing `:` are bracketed. The port is left out when it
/// equals `default_port`.
pub fn stringify_host(hostname: &str, port: u16, default_port: Option<u16>) -> String {
    let host = if hostname.contains(':') {
        format!("[{}]", hostname)
    } else {
        hostname.to_string()
    };

    if default_port == Some(port) {
        host
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_host() {
        let addr = parse_host("example.com", 80).unwrap();
        assert_eq!(addr, HostAddress::new("example.com", 80));
    }

    #[test]
    fn parse_host_with_port() {
        let addr = parse_host("example.com:8080", 80).unwrap();
        assert_eq!(addr, HostAddress::new("example.com", 8080));
    }

    #[test]
    fn parse_empty_port_uses_default() {
        let addr = parse_host("example.com:", 443).unwrap();
        assert_eq!(addr.port, 443);
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let addr = parse_host("[::1]:8443", 443).unwrap();
        assert_eq!(addr, HostAddress::new("::1", 8443));

        let addr = parse_host("[fe80::1]", 80).unwrap();
        assert_eq!(addr, HostAddress::new("fe80::1", 80));
    }

    #[test]
    fn parse_non_numeric_suffix_is_hostname() {
        let addr = parse_host("a:b", 80).unwrap();
        assert_eq!(addr, HostAddress::new("a:b", 80));
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!(matches!(
            parse_host("example.com:70000", 80),
            Err(HostError::InvalidPort(_))
        ));
        assert!(matches!(
            parse_host("", 80),
            Err(HostError::MissingHostname(_))
        ));
        assert!(matches!(
            parse_host(":8080", 80),
            Err(HostError::MissingHostname(_))
        ));
    }

    #[test]
    fn stringify_elides_default_port() {
        assert_eq!(stringify_host("example.com", 443, Some(443)), "example.com");
        assert_eq!(
            stringify_host("example.com", 8443, Some(443)),
            "example.com:8443"
        );
        assert_eq!(stringify_host("example.com", 80, None), "example.com:80");
    }

    #[test]
    fn stringify_brackets_ipv6() {
        assert_eq!(stringify_host("::1", 8080, Some(80)), "[::1]:8080");
        assert_eq!(stringify_host("::1", 80, Some(80)), "[::1]");
    }

    #[test]
    fn round_trip() {
        let cases = [
            ("example.com", 80),
            ("example.com:80", 80),
            ("example.com:8080", 80),
            ("[::1]", 443),
            ("[::1]:443", 443),
            ("[2001:db8::7]:9000", 443),
            ("127.0.0.1:3000", 80),
        ];

        for (value, default) in cases {
            let parsed = parse_host(value, default).unwrap();
            let formatted = stringify_host(&parsed.hostname, parsed.port, Some(default));
            assert_eq!(parse_host(&formatted, default).unwrap(), parsed, "{}", value);
        }
    }

    #[test]
    fn display_always_includes_port() {
        assert_eq!(HostAddress::new("::1", 1080).to_string(), "[::1]:1080");
    }
}
