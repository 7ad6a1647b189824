//! SOCKS4, SOCKS4a and SOCKS5 client handshakes (CONNECT command only).

use std::net::{IpAddr, Ipv4Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::SocksVersion;
use crate::error::UpstreamError;

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5a;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_CONNECT: u8 = 0x01;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

/// Negotiates a tunnel to `hostname:port` over an open proxy connection.
pub async fn handshake<S>(
    stream: &mut S,
    version: SocksVersion,
    hostname: &str,
    port: u16,
) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => socks5(stream, hostname, port).await,
        SocksVersion::V4a => socks4(stream, Socks4Target::Domain(hostname), port).await,
        SocksVersion::V4 => {
            let ip = resolve_ipv4(hostname, port).await?;
            socks4(stream, Socks4Target::Ip(ip), port).await
        }
    }
}

enum Socks4Target<'a> {
    Ip(Ipv4Addr),
    Domain(&'a str),
}

async fn resolve_ipv4(hostname: &str, port: u16) -> Result<Ipv4Addr, UpstreamError> {
    if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((hostname, port))
        .await?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| UpstreamError::Socks(format!("No IPv4 address for {}", hostname)))
}

async fn socks4<S>(stream: &mut S, target: Socks4Target<'_>, port: u16) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS4_VERSION, SOCKS4_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());

    match target {
        Socks4Target::Ip(ip) => {
            request.extend_from_slice(&ip.octets());
            // Empty user id
            request.push(0);
        }
        Socks4Target::Domain(domain) => {
            // 0.0.0.x tells a 4a server a domain follows the user id
            request.extend_from_slice(&[0, 0, 0, 1]);
            request.push(0);
            request.extend_from_slice(domain.as_bytes());
            request.push(0);
        }
    }

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[1] != SOCKS4_GRANTED {
        return Err(UpstreamError::Socks(format!(
            "SOCKS4 request rejected (code {:#04x})",
            reply[1]
        )));
    }
    Ok(())
}

async fn socks5<S>(stream: &mut S, hostname: &str, port: u16) -> Result<(), UpstreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: no authentication only
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH])
        .await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION || choice[1] != SOCKS5_NO_AUTH {
        return Err(UpstreamError::Socks(
            "SOCKS5 proxy requires unsupported authentication".to_string(),
        ));
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CONNECT, 0];
    match hostname.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(SOCKS5_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(SOCKS5_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = u8::try_from(hostname.len()).map_err(|_| {
                UpstreamError::Socks(format!("Hostname too long: {}", hostname))
            })?;
            request.push(SOCKS5_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(hostname.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());

    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0 {
        return Err(UpstreamError::Socks(format!(
            "SOCKS5 connect failed: {}",
            socks5_reply_message(reply[1])
        )));
    }

    // Drain the bound address
    let addr_len = match reply[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(UpstreamError::Socks(format!(
                "Unknown SOCKS5 address type {:#04x}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

fn socks5_reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
