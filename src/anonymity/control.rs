//! Control channel toward the anonymity process
//!
//! Only the handful of Tor control-protocol commands the session needs are
//! spoken here: `AUTHENTICATE`, `SIGNAL NEWNYM` and `QUIT`.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{Result, RotanetError};

/// Authenticated administrative connection to the anonymity process
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Authenticate, optionally with a password
    async fn authenticate(&mut self, password: Option<&str>) -> Result<()>;

    /// Ask for a fresh circuit; does not wait for it to be built
    async fn signal_new_identity(&mut self) -> Result<()>;

    /// Remaining time before a circuit requested now is guaranteed usable
    fn new_identity_wait(&self) -> Duration;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;
}

/// Check whether something accepts connections on the control address
pub async fn is_reachable(addr: SocketAddr, probe_timeout: Duration) -> bool {
    matches!(
        timeout(probe_timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// One reply from the control port: status code plus its text lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == 250
    }

    pub fn message(&self) -> String {
        self.lines.join(" ")
    }
}

/// Tor control-port connection
pub struct TorControlChannel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    last_new_identity: Option<Instant>,
    new_identity_interval: Duration,
    reply_timeout: Duration,
}

impl TorControlChannel {
    /// Connect to the control port within `connect_timeout`.
    ///
    /// Every later command must also be answered within `connect_timeout`.
    pub async fn connect(
        addr: SocketAddr,
        connect_timeout: Duration,
        new_identity_interval: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RotanetError::AnonymityProcess(format!(
                    "control port {} not reachable within {}s",
                    addr,
                    connect_timeout.as_secs_f64()
                ))
            })?
            .map_err(|e| {
                RotanetError::AnonymityProcess(format!(
                    "control port {} connect failed: {}",
                    addr, e
                ))
            })?;

        let (read_half, write_half) = stream.into_split();
        debug!("Control channel connected to {}", addr);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            last_new_identity: None,
            new_identity_interval,
            reply_timeout: connect_timeout,
        })
    }

    /// Send one command line and read its reply within the reply timeout
    async fn command(&mut self, line: &str) -> Result<Reply> {
        let reply_timeout = self.reply_timeout;
        let verb = line.split_whitespace().next().unwrap_or_default().to_string();
        timeout(reply_timeout, self.round_trip(line))
            .await
            .map_err(|_| {
                RotanetError::AnonymityProcess(format!(
                    "no reply to {} within {}s",
                    verb,
                    reply_timeout.as_secs_f64()
                ))
            })?
    }

    async fn round_trip(&mut self, line: &str) -> Result<Reply> {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let mut lines = Vec::new();
        loop {
            let mut raw = String::new();
            let n = self.reader.read_line(&mut raw).await?;
            if n == 0 {
                return Err(RotanetError::ControlProtocol(
                    "control channel closed mid-reply".into(),
                ));
            }

            let raw = raw.trim_end_matches(['\r', '\n']);
            let (status, separator, text) = parse_reply_line(raw)?;
            lines.push(text.to_string());

            // "250-" continues, "250+" starts a data block, "250 " ends
            match separator {
                ' ' => return Ok(Reply { status, lines }),
                '+' => self.skip_data_block().await?,
                _ => {}
            }
        }
    }

    async fn skip_data_block(&mut self) -> Result<()> {
        loop {
            let mut raw = String::new();
            if self.reader.read_line(&mut raw).await? == 0 {
                return Err(RotanetError::ControlProtocol(
                    "control channel closed inside data block".into(),
                ));
            }
            if raw.trim_end_matches(['\r', '\n']) == "." {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl ControlChannel for TorControlChannel {
    async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        let line = match password {
            Some(password) => format!("AUTHENTICATE {}", quote(password)),
            None => "AUTHENTICATE".to_string(),
        };

        let reply = self.command(&line).await?;
        if reply.is_ok() {
            debug!("Control channel authenticated");
            Ok(())
        } else {
            Err(RotanetError::AnonymityAuthFailed(format!(
                "{} {}",
                reply.status,
                reply.message()
            )))
        }
    }

    async fn signal_new_identity(&mut self) -> Result<()> {
        let reply = self.command("SIGNAL NEWNYM").await?;
        if !reply.is_ok() {
            return Err(RotanetError::ControlProtocol(format!(
                "SIGNAL NEWNYM rejected: {} {}",
                reply.status,
                reply.message()
            )));
        }
        self.last_new_identity = Some(Instant::now());
        Ok(())
    }

    fn new_identity_wait(&self) -> Duration {
        match self.last_new_identity {
            Some(at) => self.new_identity_interval.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    async fn close(&mut self) -> Result<()> {
        // The process may answer QUIT by hanging up first, or not at all
        let _ = self.command("QUIT").await;
        timeout(self.reply_timeout, self.writer.shutdown())
            .await
            .map_err(|_| RotanetError::ControlProtocol("control channel shutdown timed out".into()))??;
        Ok(())
    }
}

fn parse_reply_line(raw: &str) -> Result<(u16, char, &str)> {
    let malformed = || RotanetError::ControlProtocol(format!("malformed reply line: {:?}", raw));

    let bytes = raw.as_bytes();
    if bytes.len() < 4 || !matches!(bytes[3], b' ' | b'-' | b'+') {
        return Err(malformed());
    }
    let status: u16 = raw[..3].parse().map_err(|_| malformed())?;
    Ok((status, bytes[3] as char, &raw[4..]))
}

/// Quote a string per the control-protocol QuotedString rules
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// How the emulated control port behaves
    #[derive(Debug, Clone, Copy)]
    pub(crate) enum FakeControl {
        /// Answers every command; `AUTHENTICATE` checks the password
        Responsive(Option<&'static str>),
        /// Reads commands but never answers
        Silent,
        /// Accepts `AUTHENTICATE`, then stops answering
        SilentAfterAuth,
    }

    /// Minimal control-port emulator on an ephemeral port.
    ///
    /// Accepts connections forever, answers `AUTHENTICATE` according to
    /// `password`, and reports every received command on the channel.
    pub(crate) async fn spawn_fake_control_port(
        password: Option<&'static str>,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
        spawn_fake_control(FakeControl::Responsive(password)).await
    }

    pub(crate) async fn spawn_fake_control(
        behaviour: FakeControl,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (rx, task) = serve_fake_control(listener, behaviour);
        (addr, rx, task)
    }

    /// Run the emulator on an already-bound listener
    pub(crate) fn serve_fake_control(
        listener: TcpListener,
        behaviour: FakeControl,
    ) -> (mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = stream.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let _ = tx.send(line.clone());
                        let password = match behaviour {
                            FakeControl::Silent => continue,
                            FakeControl::SilentAfterAuth if !line.starts_with("AUTHENTICATE") => {
                                continue
                            }
                            FakeControl::SilentAfterAuth => None,
                            FakeControl::Responsive(password) => password,
                        };
                        let reply: &[u8] = if line.starts_with("AUTHENTICATE") {
                            let expected = match password {
                                Some(p) => format!("AUTHENTICATE {}", quote(p)),
                                None => "AUTHENTICATE".to_string(),
                            };
                            if line == expected || matches!(behaviour, FakeControl::SilentAfterAuth)
                            {
                                &b"250 OK\r\n"[..]
                            } else {
                                &b"515 Authentication failed: Password did not match\r\n"[..]
                            }
                        } else if line == "SIGNAL NEWNYM" {
                            &b"250 OK\r\n"[..]
                        } else if line == "QUIT" {
                            let _ = write_half.write_all(b"250 closing connection\r\n").await;
                            return;
                        } else {
                            &b"510 Unrecognized command\r\n"[..]
                        };
                        if write_half.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (rx, task)
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_parse_reply_line() {
        assert_eq!(parse_reply_line("250 OK").unwrap(), (250, ' ', "OK"));
        assert_eq!(
            parse_reply_line("250-version=0.4.8").unwrap(),
            (250, '-', "version=0.4.8")
        );
        assert!(parse_reply_line("25").is_err());
        assert!(parse_reply_line("abc OK").is_err());
        assert!(parse_reply_line("250?OK").is_err());
    }

    #[tokio::test]
    async fn test_authenticate_and_signal() {
        let (addr, mut seen, _server) = spawn_fake_control_port(Some("secret")).await;

        let mut channel = TorControlChannel::connect(
            addr,
            Duration::from_secs(1),
            Duration::from_millis(200),
        )
        .await
        .unwrap();
        assert_eq!(channel.new_identity_wait(), Duration::ZERO);

        channel.authenticate(Some("secret")).await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "AUTHENTICATE \"secret\"");

        channel.signal_new_identity().await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "SIGNAL NEWNYM");

        let wait = channel.new_identity_wait();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(200));

        channel.close().await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_authenticate_rejected() {
        let (addr, _seen, _server) = spawn_fake_control_port(Some("secret")).await;

        let mut channel =
            TorControlChannel::connect(addr, Duration::from_secs(1), Duration::from_secs(10))
                .await
                .unwrap();

        let err = channel.authenticate(Some("wrong")).await.unwrap_err();
        assert!(matches!(err, RotanetError::AnonymityAuthFailed(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_process_error() {
        // Grab a free port and release it so nothing listens there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(!is_reachable(addr, Duration::from_millis(200)).await);
        let err = TorControlChannel::connect(addr, Duration::from_secs(1), Duration::from_secs(10))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RotanetError::AnonymityProcess(_)));
    }

    #[tokio::test]
    async fn test_unanswered_command_times_out() {
        let (addr, mut seen, _server) = spawn_fake_control(FakeControl::Silent).await;

        let mut channel = TorControlChannel::connect(
            addr,
            Duration::from_millis(200),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        let started = Instant::now();
        let err = channel.authenticate(None).await.unwrap_err();
        assert!(matches!(err, RotanetError::AnonymityProcess(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(seen.recv().await.unwrap(), "AUTHENTICATE");

        let started = Instant::now();
        assert!(channel.close().await.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
