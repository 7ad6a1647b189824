//! HTTP proxy tunnel negotiation (`CONNECT`).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::UpstreamError;

/// Upper bound on a proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Asks the proxy on `stream` to open a tunnel to `target` (`host:port`).
///
/// Succeeds only on a `200` response. The stream is positioned right after
/// the response head, ready to carry tunnelled bytes.
pub async fn connect_tunnel<S>(
    stream: &mut S,
    target: &str,
    user_agent: Option<&str>,
    proxy: &str,
) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(user_agent) = user_agent {
        request.push_str(&format!("User-Agent: {}\r\n", user_agent));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_head(stream).await?;
    let status = parse_status(&head)?;
    debug!("Proxy {} answered CONNECT {} with {}", proxy, target, status);

    if status != 200 {
        return Err(UpstreamError::ProxyRejected {
            proxy: proxy.to_string(),
            status,
        });
    }
    Ok(())
}

/// Reads up to and including the blank line ending the response head.
///
/// Reads one byte at a time so nothing past the head is taken from the
/// stream.
async fn read_head<S>(stream: &mut S) -> Result<String, UpstreamError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(UpstreamError::ProxyProtocol(
                "Response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(UpstreamError::ProxyProtocol(
                "Connection closed before response".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn parse_status(head: &str) -> Result<u16, UpstreamError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();

    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/") => code
            .parse()
            .map_err(|_| UpstreamError::ProxyProtocol(status_line.to_string())),
        _ => Err(UpstreamError::ProxyProtocol(status_line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn successful_tunnel() {
        let mut stream = Builder::new()
            .write(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .build();

        connect_tunnel(&mut stream, "example.com:443", None, "proxy:3128")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn user_agent_is_sent() {
        let mut stream = Builder::new()
            .write(b"CONNECT a.test:80 HTTP/1.1\r\nHost: a.test:80\r\nUser-Agent: mocker\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\nProxy-Agent: test\r\n\r\n")
            .build();

        connect_tunnel(&mut stream, "a.test:80", Some("mocker"), "proxy:3128")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_200_is_rejected() {
        let mut stream = Builder::new()
            .write(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();

        let err = connect_tunnel(&mut stream, "a.test:443", None, "proxy:3128")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::ProxyRejected { status: 407, .. }
        ));
    }

    #[tokio::test]
    async fn early_close_is_an_error() {
        let mut stream = Builder::new()
            .write(b"CONNECT a.test:443 HTTP/1.1\r\nHost: a.test:443\r\n\r\n")
            .read(b"HTTP/1.1 200")
            .build();

        let err = connect_tunnel(&mut stream, "a.test:443", None, "proxy:3128")
            .await
            .unwrap_err();
        assert!(matches!(err, UpstreamError::ProxyProtocol(_)));
    }

    #[test]
    fn status_parsing() {
        assert_eq!(parse_status("HTTP/1.1 200 OK\r\n\r\n").unwrap(), 200);
        assert!(parse_status("garbage").is_err());
        assert!(parse_status("HTTP/1.1 abc").is_err());
    }
}
