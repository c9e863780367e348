//! External anonymity process (a `tor` binary)
//!
//! The process is launched with its SOCKS and control ports bound on the
//! command line and is tied to us twice over: the child handle kills it on
//! drop, and `__OwningControllerProcess` makes it exit if we die first.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Result, RotanetError};
use crate::models::AnonymityConfig;

const READY_MARKER: &str = "Bootstrapped 100%";

/// How long to wait for the process to exit after killing it
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// A spawned anonymity process owned by one session
#[derive(Debug)]
pub struct AnonymityProcess {
    child: Child,
    pid: Option<u32>,
}

impl AnonymityProcess {
    /// Command-line arguments binding the configured ports
    pub fn launch_args(config: &AnonymityConfig) -> Vec<String> {
        let mut args = vec![
            "--SocksPort".to_string(),
            config.socks_port().to_string(),
            "--ControlPort".to_string(),
            config.control_port().to_string(),
            "--__OwningControllerProcess".to_string(),
            std::process::id().to_string(),
        ];
        if let Some(dir) = &config.data_directory {
            args.push("--DataDirectory".to_string());
            args.push(dir.display().to_string());
        }
        args
    }

    /// Spawn the process and wait until it reports bootstrap completion.
    ///
    /// If the launch timeout passes first the process is kept and the caller
    /// moves on to connecting; exiting early is an error.
    pub async fn launch(config: &AnonymityConfig) -> Result<Self> {
        let command = config.launch_command();
        let args = Self::launch_args(config);

        info!(
            "Launching anonymity process: {} (socks {}, control {})",
            command,
            config.socks_port(),
            config.control_port()
        );

        let mut child = Command::new(command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RotanetError::AnonymityProcess(format!("failed to spawn {}: {}", command, e))
            })?;

        let pid = child.id();
        let (ready_tx, ready_rx) = oneshot::channel();
        match child.stdout.take() {
            Some(stdout) => {
                tokio::spawn(monitor_output(stdout, ready_tx));
            }
            None => drop(ready_tx),
        }

        let mut process = Self { child, pid };
        process.wait_ready(ready_rx, config.launch_timeout).await?;
        Ok(process)
    }

    async fn wait_ready(
        &mut self,
        ready_rx: oneshot::Receiver<()>,
        launch_timeout: Duration,
    ) -> Result<()> {
        match timeout(launch_timeout, ready_rx).await {
            Ok(Ok(())) => {
                info!("Anonymity process ready (pid {:?})", self.pid);
                Ok(())
            }
            Ok(Err(_)) => {
                // Output closed without the marker; find out whether it died
                match timeout(Duration::from_secs(1), self.child.wait()).await {
                    Ok(Ok(status)) => Err(RotanetError::AnonymityProcess(format!(
                        "process exited before becoming ready: {}",
                        status
                    ))),
                    Ok(Err(e)) => Err(RotanetError::AnonymityProcess(format!(
                        "failed to query process status: {}",
                        e
                    ))),
                    Err(_) => {
                        warn!("Anonymity process closed its output but is still running");
                        Ok(())
                    }
                }
            }
            Err(_) => {
                warn!(
                    "Anonymity process not ready after {}s, continuing",
                    launch_timeout.as_secs()
                );
                Ok(())
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process and reap it
    pub async fn terminate(mut self) {
        info!("Terminating anonymity process (pid {:?})", self.pid);
        if let Err(e) = self.child.start_kill() {
            debug!("Kill failed, process likely already exited: {}", e);
        }
        match timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Anonymity process exited: {}", status),
            Ok(Err(e)) => warn!("Failed to reap anonymity process: {}", e),
            Err(_) => warn!(
                "Anonymity process did not exit within {}s",
                TERMINATE_TIMEOUT.as_secs()
            ),
        }
    }
}

/// Relay process output to the log and report the ready marker once
async fn monitor_output(stdout: ChildStdout, ready_tx: oneshot::Sender<()>) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.contains("[warn]") || line.contains("[err]") {
            warn!("anonymity process: {}", line);
        } else {
            debug!("anonymity process: {}", line);
        }

        if line.contains(READY_MARKER) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args_bind_ports() {
        let config = AnonymityConfig::enabled()
            .with_socks_port(9150)
            .with_control_port(9151);
        let args = AnonymityProcess::launch_args(&config);

        assert_eq!(&args[..4], ["--SocksPort", "9150", "--ControlPort", "9151"]);
        assert_eq!(args[4], "--__OwningControllerProcess");
        assert_eq!(args[5], std::process::id().to_string());
        assert!(!args.contains(&"--DataDirectory".to_string()));
    }

    #[test]
    fn test_launch_args_with_data_directory() {
        let mut config = AnonymityConfig::enabled();
        config.data_directory = Some("/tmp/rotanet-tor".into());
        let args = AnonymityProcess::launch_args(&config);
        assert_eq!(&args[6..], ["--DataDirectory", "/tmp/rotanet-tor"]);
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let config = AnonymityConfig::enabled()
            .with_launch_command("/nonexistent/rotanet-test-tor");
        let err = AnonymityProcess::launch(&config).await.unwrap_err();
        assert!(matches!(err, RotanetError::AnonymityProcess(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_process_exiting_early_fails() {
        // `false` ignores its arguments and exits non-zero without output.
        let config = AnonymityConfig::enabled().with_launch_command("false");
        let err = AnonymityProcess::launch(&config).await.unwrap_err();
        assert!(matches!(err, RotanetError::AnonymityProcess(_)));
    }
}
