//! Setup-time collaborators
//!
//! Address resolution and host-route install run once before listeners
//! start; neither is on the hot path and both degrade gracefully. The
//! SOCKS5 dialer is the outbound transport for rendezvous channels that
//! reach their remote through an anonymizing relay.

use std::net::{IpAddr, SocketAddr};
use std::process::ExitStatus;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;
/// No-authentication method
const SOCKS_NO_AUTH: u8 = 0x00;
/// CONNECT command
const SOCKS_CMD_CONNECT: u8 = 0x01;

/// Setup errors
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("route install exited with {0}")]
    RouteFailed(ExitStatus),
    #[error("proxy refused our authentication methods")]
    ProxyAuthRefused,
    #[error("proxy replied with error code {0:#04x}")]
    ProxyRefused(u8),
    #[error("malformed proxy reply")]
    ProxyProtocol,
    #[error("domain name too long for SOCKS5: {0:?}")]
    DomainTooLong(String),
}

/// Resolve a tunnel endpoint's name to an address. Setup-time only;
/// failure is logged and the channel simply degrades.
pub async fn resolve_endpoint(host: &str) -> Option<IpAddr> {
    match lookup_host((host, 0u16)).await {
        Ok(mut addrs) => {
            let ip = addrs.next().map(|a| a.ip());
            if let Some(ip) = ip {
                info!(host, %ip, "resolved endpoint");
            } else {
                warn!(host, "resolution returned no addresses");
            }
            ip
        }
        Err(e) => {
            warn!(host, error = %e, "could not resolve endpoint");
            None
        }
    }
}

/// Install a host route steering traffic for `ip` over `iface`.
/// Requires privileges; failures are the caller's to log, not fatal.
pub async fn install_host_route(ip: IpAddr, iface: &str) -> Result<(), SetupError> {
    debug!(%ip, iface, "installing host route");
    let status = Command::new("route")
        .args(["-nv", "add", "-host"])
        .arg(ip.to_string())
        .arg("-interface")
        .arg(iface)
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(SetupError::RouteFailed(status))
    }
}

/// Minimal RFC 1928 client: no-auth CONNECT through a SOCKS5 relay,
/// with IP or domain address forms (domains are resolved by the relay,
/// which is what an onion rendezvous requires).
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: SocketAddr,
}

impl Socks5Dialer {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }

    /// Dial `host:port` through the relay, returning the connected
    /// stream once the relay acknowledges the CONNECT.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, SetupError> {
        let mut stream = TcpStream::connect(self.proxy).await?;

        // Method negotiation: offer no-auth only.
        stream
            .write_all(&[SOCKS_VERSION, 1, SOCKS_NO_AUTH])
            .await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS_VERSION {
            return Err(SetupError::ProxyProtocol);
        }
        if choice[1] != SOCKS_NO_AUTH {
            return Err(SetupError::ProxyAuthRefused);
        }

        // CONNECT request.
        let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00];
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                request.push(0x01);
                request.extend_from_slice(&v4.octets());
            }
            Ok(IpAddr::V6(v6)) => {
                request.push(0x04);
                request.extend_from_slice(&v6.octets());
            }
            Err(_) => {
                let bytes = host.as_bytes();
                if bytes.len() > u8::MAX as usize {
                    return Err(SetupError::DomainTooLong(host.to_string()));
                }
                request.push(0x03);
                request.push(bytes.len() as u8);
                request.extend_from_slice(bytes);
            }
        }
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        // Reply: header, then the bound address we do not care about.
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(SetupError::ProxyProtocol);
        }
        if header[1] != 0x00 {
            return Err(SetupError::ProxyRefused(header[1]));
        }
        let addr_len = match header[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => return Err(SetupError::ProxyProtocol),
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        debug!(proxy = %self.proxy, host, port, "SOCKS5 connect established");
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Fake relay speaking just enough SOCKS5 for one CONNECT.
    async fn fake_relay(reply_code: u8) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(&header[..3], &[0x05, 0x01, 0x00]);

            let target = match header[3] {
                0x01 => {
                    let mut buf = vec![0u8; 4 + 2];
                    stream.read_exact(&mut buf).await.unwrap();
                    buf
                }
                0x03 => {
                    let mut len = [0u8; 1];
                    stream.read_exact(&mut len).await.unwrap();
                    let mut buf = vec![0u8; len[0] as usize + 2];
                    stream.read_exact(&mut buf).await.unwrap();
                    buf
                }
                other => panic!("unexpected atyp {other}"),
            };

            // Reply with the requested code and a zero IPv4 bound addr.
            stream
                .write_all(&[0x05, reply_code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();

            // Echo back whatever the client sends next.
            let mut payload = vec![0u8; 64];
            let n = stream.read(&mut payload).await.unwrap_or(0);
            payload.truncate(n);
            payload
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn connects_through_relay_with_domain_target() {
        let (proxy, relay) = fake_relay(0x00).await;
        let dialer = Socks5Dialer::new(proxy);

        let mut stream = dialer.dial("rendezvous.onion", 5001).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();

        assert_eq!(relay.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn connects_with_ipv4_target() {
        let (proxy, _relay) = fake_relay(0x00).await;
        let dialer = Socks5Dialer::new(proxy);
        assert!(dialer.dial("10.0.0.1", 80).await.is_ok());
    }

    #[tokio::test]
    async fn relay_refusal_is_an_error() {
        let (proxy, _relay) = fake_relay(0x05).await;
        let dialer = Socks5Dialer::new(proxy);
        let err = dialer.dial("example.com", 80).await.unwrap_err();
        assert!(matches!(err, SetupError::ProxyRefused(0x05)));
    }

    #[tokio::test]
    async fn rejects_oversized_domain() {
        let (proxy, _relay) = fake_relay(0x00).await;
        let dialer = Socks5Dialer::new(proxy);
        let long = "a".repeat(300);
        let err = dialer.dial(&long, 80).await.unwrap_err();
        assert!(matches!(err, SetupError::DomainTooLong(_)));
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let ip = resolve_endpoint("localhost").await;
        assert!(ip.is_some());
    }

    #[tokio::test]
    async fn unresolvable_name_is_none() {
        assert!(resolve_endpoint("definitely-not-a-real-host.invalid")
            .await
            .is_none());
    }
}
