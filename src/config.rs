use crate::error::{Result, RotanetError};
use crate::models::{AnonymityConfig, ProxyDescriptor, ProxyProtocol};
use crate::proxy::ProxySource;
use crate::session::SessionContext;
use crate::user_agent::UserAgentPool;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Session proxy and anonymity settings
    pub session: SessionConfig,
    /// Optional file of proxies to rotate through
    pub source: Option<SourceConfig>,
    /// Rotation loop settings
    pub rotation: RotationConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Initial proxy (ROTANET_PROXY_URL)
    pub proxy: Option<ProxyDescriptor>,
    /// Resolve hostnames on the proxy side
    pub route_dns_via_proxy: bool,
    /// Anonymity-network settings; `enabled` is false unless ROTANET_TOR is set
    pub anonymity: AnonymityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    /// Path to the proxy list
    pub path: PathBuf,
    /// Lines are full proxy URLs
    pub typed: bool,
    /// Protocol for `host:port` lines
    pub default_type: Option<ProxyProtocol>,
    /// Start over at end of file
    pub repeat: bool,
}

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Time between rotations (default: 60s)
    pub interval: Duration,
    /// Optional newline-delimited user-agent file
    pub user_agents_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let route_dns_via_proxy = parse_bool("ROTANET_RDNS", false)?;

        let proxy = match get_env_opt("ROTANET_PROXY_URL") {
            Some(raw) => Some(ProxyDescriptor::parse_url(&raw, route_dns_via_proxy).map_err(
                |e| RotanetError::InvalidConfig(format!("ROTANET_PROXY_URL: {}", e)),
            )?),
            None => None,
        };

        let mut anonymity = AnonymityConfig {
            enabled: parse_bool("ROTANET_TOR", false)?,
            socks_port: parse_opt("TOR_SOCKS_PORT")?,
            control_port: parse_opt("TOR_CONTROL_PORT")?,
            launch_command: get_env_opt("TOR_CMD"),
            control_password: get_env_opt("TOR_PASSWORD"),
            data_directory: get_env_opt("TOR_DATA_DIR").map(PathBuf::from),
            ..AnonymityConfig::default()
        };
        if let Some(secs) = parse_opt::<u64>("TOR_LAUNCH_TIMEOUT")? {
            anonymity.launch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_opt::<u64>("TOR_CONNECT_TIMEOUT")? {
            anonymity.connect_timeout = Duration::from_secs(secs);
        }

        let rotate_secs: u64 = get_env_or("ROTANET_ROTATE_INTERVAL", "60")
            .parse()
            .map_err(|_| {
                RotanetError::InvalidConfig(
                    "ROTANET_ROTATE_INTERVAL must be a number of seconds".into(),
                )
            })?;

        Ok(Config {
            session: SessionConfig {
                proxy,
                route_dns_via_proxy,
                anonymity,
            },
            source: parse_source()?,
            rotation: RotationConfig {
                interval: Duration::from_secs(rotate_secs.max(1)),
                user_agents_file: get_env_opt("ROTANET_USER_AGENTS_FILE").map(PathBuf::from),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Build the session described by this configuration
    pub fn session_context(&self) -> SessionContext {
        let anonymity = self
            .session
            .anonymity
            .enabled
            .then(|| self.session.anonymity.clone());
        SessionContext::new(anonymity, self.session.proxy.clone())
            .with_route_dns_via_proxy(self.session.route_dns_via_proxy)
    }

    /// Build the proxy file source, if one is configured
    pub fn proxy_source(&self) -> Result<Option<ProxySource>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        let proxy_source = ProxySource::new(&source.path, source.typed, source.default_type)?
            .repeat_forever(source.repeat)
            .route_dns_via_proxy(self.session.route_dns_via_proxy);
        Ok(Some(proxy_source))
    }

    /// Load the configured user agents, or fall back to browser defaults
    pub fn user_agents(&self) -> Result<UserAgentPool> {
        match &self.rotation.user_agents_file {
            Some(path) => UserAgentPool::from_file(path),
            None => Ok(UserAgentPool::browser_defaults()),
        }
    }
}

fn parse_source() -> Result<Option<SourceConfig>> {
    let Some(path) = get_env_opt("ROTANET_PROXY_FILE") else {
        return Ok(None);
    };

    let typed = parse_bool("ROTANET_PROXY_FILE_TYPED", false)?;
    let default_type = match get_env_opt("ROTANET_PROXY_TYPE") {
        Some(raw) => Some(ProxyProtocol::from_str(&raw).ok_or_else(|| {
            RotanetError::InvalidConfig(format!(
                "ROTANET_PROXY_TYPE has unsupported value: {}",
                raw
            ))
        })?),
        None => None,
    };
    if !typed && default_type.is_none() {
        return Err(RotanetError::InvalidConfig(
            "ROTANET_PROXY_TYPE is required unless ROTANET_PROXY_FILE_TYPED is set".into(),
        ));
    }

    Ok(Some(SourceConfig {
        path: PathBuf::from(path),
        typed,
        default_type,
        repeat: parse_bool("ROTANET_PROXY_REPEAT", false)?,
    }))
}

fn parse_bool(key: &str, default: bool) -> Result<bool> {
    match get_env_opt(key) {
        None => Ok(default),
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(RotanetError::InvalidConfig(format!(
                "{} must be a boolean, got {:?}",
                key, raw
            ))),
        },
    }
}

fn parse_opt<T: FromStr>(key: &str) -> Result<Option<T>> {
    match get_env_opt(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            RotanetError::InvalidConfig(format!("{} has invalid value {:?}", key, raw))
        }),
    }
}

/// Get environment variable, treating empty values as unset
fn get_env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
