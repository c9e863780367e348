//! Anonymity-process lifecycle
//!
//! ```text
//! Idle -> Launching -> Connecting -> Authenticated -> ShuttingDown -> Idle
//!    \______________________/^
//!     pre-existing control port
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::control::{is_reachable, ControlChannel, TorControlChannel};
use super::process::AnonymityProcess;
use crate::error::{Result, RotanetError};
use crate::models::AnonymityConfig;

/// Timeout for probing an existing control port
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on closing the control channel during shutdown
const CLOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle state of the anonymity controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnonymityState {
    #[default]
    Idle,
    Launching,
    Connecting,
    Authenticated,
    ShuttingDown,
}

impl AnonymityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymityState::Idle => "idle",
            AnonymityState::Launching => "launching",
            AnonymityState::Connecting => "connecting",
            AnonymityState::Authenticated => "authenticated",
            AnonymityState::ShuttingDown => "shutting_down",
        }
    }
}

impl std::fmt::Display for AnonymityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Owns the anonymity process (when we spawned it) and the control channel.
///
/// Both handles exist only between a successful [`start`](Self::start) and
/// the matching [`shutdown`](Self::shutdown).
#[derive(Default)]
pub struct AnonymityController {
    state: AnonymityState,
    process: Option<AnonymityProcess>,
    // Serialises control-channel writes between concurrent callers
    channel: Mutex<Option<Box<dyn ControlChannel>>>,
}

impl AnonymityController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> AnonymityState {
        self.state
    }

    /// True if this controller spawned (and therefore owns) the process
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    /// Pid of the process this controller spawned, if any
    pub fn process_id(&self) -> Option<u32> {
        self.process.as_ref().and_then(AnonymityProcess::pid)
    }

    pub fn control_addr(config: &AnonymityConfig) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, config.control_port()))
    }

    /// Bring the anonymity process up and authenticate the control channel.
    ///
    /// On failure everything acquired so far is released and the controller
    /// is back in `Idle`.
    pub async fn start(&mut self, config: &AnonymityConfig) -> Result<()> {
        if self.state == AnonymityState::Authenticated {
            debug!("Anonymity controller already started");
            return Ok(());
        }
        if self.state != AnonymityState::Idle {
            // Left over from an interrupted start
            self.shutdown().await;
        }

        match self.bring_up(config).await {
            Ok(()) => {
                self.state = AnonymityState::Authenticated;
                info!(
                    "Anonymity control channel authenticated on port {}",
                    config.control_port()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Anonymity start failed, rolling back: {}", e);
                self.shutdown().await;
                Err(e)
            }
        }
    }

    async fn bring_up(&mut self, config: &AnonymityConfig) -> Result<()> {
        let addr = Self::control_addr(config);

        if is_reachable(addr, PROBE_TIMEOUT).await {
            info!("Found running anonymity process on control port {}", addr.port());
        } else {
            self.state = AnonymityState::Launching;
            // Held by the controller from here on, so an interrupted start is
            // still cleaned up by shutdown()
            self.process = Some(AnonymityProcess::launch(config).await?);
        }

        self.state = AnonymityState::Connecting;
        let mut channel =
            TorControlChannel::connect(addr, config.connect_timeout, config.new_identity_interval)
                .await?;

        if let Err(e) = channel
            .authenticate(config.control_password.as_deref())
            .await
        {
            let _ = channel.close().await;
            return Err(match e {
                // Rejections and unresponsive peers keep their own kind
                RotanetError::AnonymityAuthFailed(_) | RotanetError::AnonymityProcess(_) => e,
                other => RotanetError::AnonymityAuthFailed(other.to_string()),
            });
        }

        *self.channel.get_mut() = Some(Box::new(channel));
        Ok(())
    }

    /// Send a new-identity signal and return how long to wait for it.
    ///
    /// Signal dispatch is serialised; the wait itself is left to the caller
    /// so concurrent callers do not hold the channel while sleeping.
    pub async fn signal_new_identity(&self) -> Result<Duration> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or(RotanetError::NotEntered)?;
        channel.signal_new_identity().await?;
        Ok(channel.new_identity_wait())
    }

    /// Close the control channel and stop a process we spawned.
    ///
    /// Close errors are ignored. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        let channel = self.channel.get_mut().take();
        if self.state == AnonymityState::Idle && channel.is_none() && self.process.is_none() {
            return;
        }

        self.state = AnonymityState::ShuttingDown;

        if let Some(mut channel) = channel {
            match timeout(CLOSE_TIMEOUT, channel.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Ignoring control channel close error: {}", e),
                Err(_) => warn!("Control channel did not close within {}s", CLOSE_TIMEOUT.as_secs()),
            }
        }

        if let Some(process) = self.process.take() {
            process.terminate().await;
        }

        self.state = AnonymityState::Idle;
        info!("Anonymity controller idle");
    }

    #[cfg(test)]
    pub(crate) fn install_channel(&mut self, channel: Box<dyn ControlChannel>) {
        *self.channel.get_mut() = Some(channel);
        self.state = AnonymityState::Authenticated;
    }
}
