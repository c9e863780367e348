use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, RotanetError};

/// Proxy protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Socks4,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks4 => "socks4",
            ProxyProtocol::Socks5 => "socks5",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::from_scheme(s).map(|(protocol, _)| protocol)
    }

    /// Resolve a URL scheme to a protocol.
    ///
    /// The second value is true for the `socks4a`/`socks5h` aliases, which
    /// always resolve hostnames on the proxy side.
    pub fn from_scheme(scheme: &str) -> Option<(Self, bool)> {
        match scheme.to_lowercase().as_str() {
            "http" => Some((ProxyProtocol::Http, false)),
            "socks4" => Some((ProxyProtocol::Socks4, false)),
            "socks4a" => Some((ProxyProtocol::Socks4, true)),
            "socks5" => Some((ProxyProtocol::Socks5, false)),
            "socks5h" => Some((ProxyProtocol::Socks5, true)),
            _ => None,
        }
    }

    pub fn is_socks(&self) -> bool {
        matches!(self, ProxyProtocol::Socks4 | ProxyProtocol::Socks5)
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One upstream proxy endpoint.
///
/// Descriptors are immutable; rotating a session swaps in a whole new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    protocol: ProxyProtocol,
    host: String,
    port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing)]
    password: Option<String>,
    #[serde(default)]
    route_dns_via_proxy: bool,
}

impl ProxyDescriptor {
    pub fn new(protocol: ProxyProtocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
            route_dns_via_proxy: false,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_route_dns_via_proxy(mut self, enabled: bool) -> Self {
        self.route_dns_via_proxy = enabled;
        self
    }

    /// Parse `scheme://[user[:pass]@]host:port`.
    ///
    /// `route_dns_via_proxy` is the caller's default; the `socks4a` and
    /// `socks5h` schemes turn it on regardless.
    pub fn parse_url(raw: &str, route_dns_via_proxy: bool) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RotanetError::InvalidProxyUrl("empty proxy URL".into()));
        }

        let url = Url::parse(raw)
            .map_err(|e| RotanetError::InvalidProxyUrl(format!("{}: {}", raw, e)))?;

        let (protocol, forced_rdns) = ProxyProtocol::from_scheme(url.scheme()).ok_or_else(|| {
            RotanetError::InvalidProxyUrl(format!("unsupported scheme: {}", url.scheme()))
        })?;

        if url.fragment().is_some() || url.query().is_some() {
            return Err(RotanetError::InvalidProxyUrl(format!(
                "{}: must not include query/fragment",
                raw
            )));
        }
        if !(url.path().is_empty() || url.path() == "/") {
            return Err(RotanetError::InvalidProxyUrl(format!(
                "{}: must not include a path",
                raw
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RotanetError::InvalidProxyUrl(format!("{}: missing host", raw)))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        // The url crate reports a scheme's default port as absent, so
        // presence is read off the raw authority
        let port = has_explicit_port(raw)
            .then(|| url.port_or_known_default())
            .flatten()
            .ok_or_else(|| RotanetError::InvalidProxyUrl(format!("{}: missing port", raw)))?;
        if port == 0 {
            return Err(RotanetError::InvalidProxyUrl(format!("{}: port 0 is not allowed", raw)));
        }

        let username = decode_component(url.username())?;
        let password = match url.password() {
            Some(p) => decode_component(p)?,
            None => None,
        };

        Ok(Self {
            protocol,
            host: host.to_string(),
            port,
            username,
            password,
            route_dns_via_proxy: route_dns_via_proxy || forced_rdns,
        })
    }

    pub fn protocol(&self) -> ProxyProtocol {
        self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn route_dns_via_proxy(&self) -> bool {
        self.route_dns_via_proxy
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Get proxy URL with optional authentication
    pub fn url(&self) -> String {
        let scheme = self.protocol.as_str();
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}",
                scheme,
                urlencoding::encode(user),
                urlencoding::encode(pass),
                self.address()
            ),
            (Some(user), None) => {
                format!("{}://{}@{}", scheme, urlencoding::encode(user), self.address())
            }
            _ => format!("{}://{}", scheme, self.address()),
        }
    }
}

impl std::fmt::Display for ProxyDescriptor {
    // Never prints the password
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}://{}@{}", self.protocol, user, self.address()),
            None => write!(f, "{}://{}", self.protocol, self.address()),
        }
    }
}

/// True if the authority part of `raw` spells out a port
fn has_explicit_port(raw: &str) -> bool {
    let Some((_, rest)) = raw.split_once("://") else {
        return false;
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let port = match host_port.strip_prefix('[') {
        Some(bracketed) => bracketed
            .split_once(']')
            .and_then(|(_, after)| after.strip_prefix(':')),
        None => host_port.rsplit_once(':').map(|(_, port)| port),
    };
    port.is_some_and(|port| !port.is_empty())
}

fn decode_component(raw: &str) -> Result<Option<String>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let decoded = urlencoding::decode(raw)
        .map_err(|e| RotanetError::InvalidProxyUrl(format!("bad credential encoding: {}", e)))?;
    Ok(Some(decoded.into_owned()))
}
