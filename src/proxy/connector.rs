//! Proxy connector handed to HTTP clients
//!
//! A connector is a plain description of how to reach the network. Clients
//! that want socket-level help can call [`ProxyConnector::connect`].

use std::net::SocketAddr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_socks::tcp::{Socks4Stream, Socks5Stream};
use tracing::{debug, instrument};

use crate::error::{Result, RotanetError};
use crate::models::{ProxyDescriptor, ProxyProtocol};

/// How an HTTP client should reach its targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProxyConnector {
    /// No proxy, connect directly
    Direct,
    /// Tunnel through the described proxy
    Proxy(ProxyDescriptor),
}

impl ProxyConnector {
    pub fn is_direct(&self) -> bool {
        matches!(self, ProxyConnector::Direct)
    }

    pub fn descriptor(&self) -> Option<&ProxyDescriptor> {
        match self {
            ProxyConnector::Direct => None,
            ProxyConnector::Proxy(proxy) => Some(proxy),
        }
    }

    /// Proxy URL including credentials, `None` for direct
    pub fn url(&self) -> Option<String> {
        self.descriptor().map(ProxyDescriptor::url)
    }

    /// Open a TCP stream to `host:port` through this connector
    #[instrument(skip(self), fields(via = %self))]
    pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let Some(proxy) = self.descriptor() else {
            return TcpStream::connect((host, port)).await.map_err(|e| {
                RotanetError::ProxyConnectionFailed(format!("TCP connect failed: {}", e))
            });
        };

        let result = match proxy.protocol() {
            ProxyProtocol::Http => connect_via_http_proxy(proxy, host, port).await,
            ProxyProtocol::Socks4 => connect_via_socks4_proxy(proxy, host, port).await,
            ProxyProtocol::Socks5 => connect_via_socks5_proxy(proxy, host, port).await,
        };

        result.map_err(|e| {
            RotanetError::ProxyConnectionFailed(format!(
                "{} proxy connect failed ({} -> {}:{}): {}",
                proxy.protocol(),
                proxy.address(),
                host,
                port,
                e
            ))
        })
    }
}

impl From<Option<&ProxyDescriptor>> for ProxyConnector {
    fn from(proxy: Option<&ProxyDescriptor>) -> Self {
        match proxy {
            Some(proxy) => ProxyConnector::Proxy(proxy.clone()),
            None => ProxyConnector::Direct,
        }
    }
}

impl std::fmt::Display for ProxyConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyConnector::Direct => write!(f, "direct"),
            ProxyConnector::Proxy(proxy) => write!(f, "{}", proxy),
        }
    }
}

async fn connect_via_http_proxy(
    proxy: &ProxyDescriptor,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let mut stream = TcpStream::connect((proxy.host(), proxy.port())).await?;

    let authority = format_authority(target_host, target_port);
    let request = build_connect_request(proxy, &authority);
    stream.write_all(request.as_bytes()).await?;

    let mut response = vec![0u8; 1024];
    let n = stream.read(&mut response).await?;
    if n == 0 {
        anyhow::bail!("empty CONNECT response");
    }

    let response_str = String::from_utf8_lossy(&response[..n]);
    if !response_str.starts_with("HTTP/1.1 200") && !response_str.starts_with("HTTP/1.0 200") {
        anyhow::bail!(
            "CONNECT failed: {}",
            response_str.lines().next().unwrap_or("Unknown error")
        );
    }

    debug!("HTTP CONNECT tunnel established");
    Ok(stream)
}

fn build_connect_request(proxy: &ProxyDescriptor, authority: &str) -> String {
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

    if let Some(username) = proxy.username() {
        let password = proxy.password().unwrap_or("");
        let credentials = format!("{}:{}", username, password);
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(credentials.as_bytes())
        ));
    }

    request.push_str("\r\n");
    request
}

async fn connect_via_socks4_proxy(
    proxy: &ProxyDescriptor,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect((proxy.host(), proxy.port())).await?;

    // SOCKS4 only carries IPv4 targets; hostnames go through the 4a extension
    let stream = if proxy.route_dns_via_proxy() {
        let target = (target_host, target_port);
        match proxy.username() {
            Some(user) => Socks4Stream::connect_with_userid_and_socket(socket, target, user).await?,
            None => Socks4Stream::connect_with_socket(socket, target).await?,
        }
    } else {
        let target = resolve_target(target_host, target_port, true).await?;
        match proxy.username() {
            Some(user) => Socks4Stream::connect_with_userid_and_socket(socket, target, user).await?,
            None => Socks4Stream::connect_with_socket(socket, target).await?,
        }
    };

    debug!("SOCKS4 connection established");
    Ok(stream.into_inner())
}

async fn connect_via_socks5_proxy(
    proxy: &ProxyDescriptor,
    target_host: &str,
    target_port: u16,
) -> std::result::Result<TcpStream, anyhow::Error> {
    let socket = TcpStream::connect((proxy.host(), proxy.port())).await?;

    let stream = if proxy.route_dns_via_proxy() {
        let target = (target_host, target_port);
        match (proxy.username(), proxy.password()) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password_and_socket(socket, target, username, password)
                    .await?
            }
            _ => Socks5Stream::connect_with_socket(socket, target).await?,
        }
    } else {
        let target = resolve_target(target_host, target_port, false).await?;
        match (proxy.username(), proxy.password()) {
            (Some(username), Some(password)) => {
                Socks5Stream::connect_with_password_and_socket(socket, target, username, password)
                    .await?
            }
            _ => Socks5Stream::connect_with_socket(socket, target).await?,
        }
    };

    debug!("SOCKS5 connection established");
    Ok(stream.into_inner())
}

/// Resolve the target locally, for proxies that should not see hostnames
async fn resolve_target(
    host: &str,
    port: u16,
    ipv4_only: bool,
) -> std::result::Result<SocketAddr, anyhow::Error> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .find(|addr| !ipv4_only || addr.is_ipv4())
        .ok_or_else(|| anyhow::anyhow!("no usable address for {}", host))
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
