use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default SOCKS port of the anonymity process.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port of the anonymity process.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Default command used to launch the anonymity process.
pub const DEFAULT_LAUNCH_COMMAND: &str = "tor";

/// Minimum spacing the control port enforces between identity rotations.
pub const DEFAULT_NEW_IDENTITY_INTERVAL: Duration = Duration::from_secs(10);

/// How long a freshly launched process gets to report bootstrap completion.
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(90);

/// How long connecting to the control port may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Anonymity-network settings for a session.
///
/// Unset fields stay `None` until [`AnonymityConfig::apply_defaults`] runs,
/// and only an enabled config ever receives defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_command: Option<String>,
    /// Control-port password (write-only)
    #[serde(default, skip_serializing)]
    pub control_password: Option<String>,
    /// Data directory handed to a spawned process
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_directory: Option<PathBuf>,
    #[serde(default = "default_new_identity_interval", with = "duration_secs")]
    pub new_identity_interval: Duration,
    #[serde(default = "default_launch_timeout", with = "duration_secs")]
    pub launch_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_secs")]
    pub connect_timeout: Duration,
}

fn default_new_identity_interval() -> Duration {
    DEFAULT_NEW_IDENTITY_INTERVAL
}

fn default_launch_timeout() -> Duration {
    DEFAULT_LAUNCH_TIMEOUT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

impl Default for AnonymityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socks_port: None,
            control_port: None,
            launch_command: None,
            control_password: None,
            data_directory: None,
            new_identity_interval: DEFAULT_NEW_IDENTITY_INTERVAL,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl AnonymityConfig {
    /// An enabled config with every port and command left to the defaults.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = Some(port);
        self
    }

    pub fn with_socks_port(mut self, port: u16) -> Self {
        self.socks_port = Some(port);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.control_password = Some(password.into());
        self
    }

    pub fn with_launch_command(mut self, command: impl Into<String>) -> Self {
        self.launch_command = Some(command.into());
        self
    }

    /// Fill unset fields. `socks_hint` is the port of the session's current
    /// proxy, which the anonymity process is expected to serve.
    ///
    /// No-op when disabled; never overwrites a field that is already set.
    pub fn apply_defaults(&mut self, socks_hint: Option<u16>) {
        if !self.enabled {
            return;
        }
        if self.socks_port.is_none() {
            self.socks_port = Some(socks_hint.unwrap_or(DEFAULT_SOCKS_PORT));
        }
        if self.control_port.is_none() {
            self.control_port = Some(DEFAULT_CONTROL_PORT);
        }
        if self.launch_command.is_none() {
            self.launch_command = Some(DEFAULT_LAUNCH_COMMAND.to_string());
        }
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port.unwrap_or(DEFAULT_SOCKS_PORT)
    }

    pub fn control_port(&self) -> u16 {
        self.control_port.unwrap_or(DEFAULT_CONTROL_PORT)
    }

    pub fn launch_command(&self) -> &str {
        self.launch_command
            .as_deref()
            .unwrap_or(DEFAULT_LAUNCH_COMMAND)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
