//! Blocking `ssh2` session bridged into the async world through a
//! dedicated `spawn_blocking` thread and a pair of `mpsc` channels.
//!
//! `ssh2` offers no async API, so the whole dial-handshake-auth-shell
//! sequence and the read/write loop run on a blocking thread exactly as
//! libssh2 expects; the relay talks to it only through channels.

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ssh2::Session;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(20);
const PTY_TERM: &str = "xterm-color";
const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 24;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub addr: IpAddr,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

/// A message from the gateway to the shell's stdin, or a terminal resize.
pub enum ShellInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum SshClientError {
    #[error("TCP connect to {0} failed: {1}")]
    Connect(SocketAddr, std::io::Error),
    #[error("SSH handshake failed: {0}")]
    Handshake(ssh2::Error),
    #[error("SSH authentication failed")]
    AuthFailed,
    #[error("failed to open interactive shell: {0}")]
    Shell(ssh2::Error),
    #[error("SSH session did not become ready within the timeout")]
    ReadyTimeout,
}

/// A running interactive shell over SSH. `output_rx` yields bytes read
/// from the remote PTY; `input_tx` carries bytes and resizes to it.
/// Dropping `input_tx` or calling `shutdown` ends the blocking I/O loop
/// and disconnects the session.
pub struct SshClient {
    input_tx: mpsc::UnboundedSender<ShellInput>,
    shutdown: Arc<AtomicBool>,
    io_task: JoinHandle<()>,
}

impl SshClient {
    /// Dial `target.addr` (never a hostname — the caller must have
    /// already resolved it through the host guard), authenticate, and
    /// request an interactive shell with an `xterm-color` PTY.
    pub async fn connect(
        target: SshTarget,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Vec<u8>>, mpsc::UnboundedReceiver<()>), SshClientError>
    {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_for_task = shutdown.clone();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let io_task = tokio::task::spawn_blocking(move || {
            let result = dial_and_auth(&target);
            let (mut session, mut channel) = match result {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            run_io_loop(&mut session, &mut channel, input_rx, output_tx, shutdown_for_task);
            let _ = closed_tx.send(());
        });

        match tokio::time::timeout(READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(SshClientError::ReadyTimeout),
            Err(_) => {
                shutdown.store(true, Ordering::SeqCst);
                return Err(SshClientError::ReadyTimeout);
            }
        }

        Ok((
            Self {
                input_tx,
                shutdown,
                io_task,
            },
            output_rx,
            closed_rx,
        ))
    }

    pub fn send(&self, data: Vec<u8>) {
        let _ = self.input_tx.send(ShellInput::Data(data));
    }

    pub fn resize(&self, cols: u32, rows: u32) {
        let _ = self.input_tx.send(ShellInput::Resize { cols, rows });
    }

    /// Idempotent: safe to call more than once, matching the
    /// closing-state teardown that may race with a natural SSH EOF.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn join(self) {
        let _ = self.io_task.await;
    }
}

fn dial_and_auth(target: &SshTarget) -> Result<(Session, ssh2::Channel), SshClientError> {
    let socket_addr = SocketAddr::new(target.addr, target.port);
    let tcp = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT)
        .map_err(|e| SshClientError::Connect(socket_addr, e))?;
    tcp.set_nodelay(true).ok();

    let mut session = Session::new().map_err(SshClientError::Handshake)?;
    session.set_tcp_stream(tcp);
    session.handshake().map_err(SshClientError::Handshake)?;

    let authenticated = match &target.auth {
        SshAuth::Password(password) => session
            .userauth_password(&target.username, password)
            .is_ok(),
        SshAuth::PrivateKey { key, passphrase } => {
            session_auth_key(&mut session, &target.username, key, passphrase.as_deref())
        }
    };

    if !authenticated || !session.authenticated() {
        return Err(SshClientError::AuthFailed);
    }

    let mut channel = session.channel_session().map_err(SshClientError::Shell)?;
    channel
        .request_pty(PTY_TERM, None, Some((DEFAULT_COLS, DEFAULT_ROWS, 0, 0)))
        .map_err(SshClientError::Shell)?;
    channel.shell().map_err(SshClientError::Shell)?;
    session.set_blocking(false);

    Ok((session, channel))
}

fn session_auth_key(
    session: &mut Session,
    username: &str,
    key: &str,
    passphrase: Option<&str>,
) -> bool {
    session
        .userauth_pubkey_memory(username, None, key, passphrase)
        .is_ok()
}

/// Runs on the blocking thread for the lifetime of the shell: drains
/// resize/data requests from `input_rx`, forwards remote bytes to
/// `output_tx`, and sends a keepalive on an interval. Mirrors the
/// non-blocking `WouldBlock`-tolerant poll loop pattern used by SSH
/// proxies built on libssh2.
fn run_io_loop(
    session: &mut Session,
    channel: &mut ssh2::Channel,
    mut input_rx: mpsc::UnboundedReceiver<ShellInput>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) {
    let mut last_keepalive = std::time::Instant::now();
    let mut buf = [0u8; 16 * 1024];

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        if channel.eof() {
            break;
        }

        match channel.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
                continue;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        while let Ok(msg) = input_rx.try_recv() {
            match msg {
                ShellInput::Data(bytes) => {
                    // A write failure alone is not a reason to close the
                    // session — the shell's own read loop (or eof/close
                    // detection above) is what ends it.
                    if let Err(e) = channel.write_all(&bytes) {
                        tracing::warn!(error = %e, "failed to write to SSH shell stdin");
                    }
                }
                ShellInput::Resize { cols, rows } => {
                    let cols = cols.max(1);
                    let rows = rows.max(1);
                    let _ = channel.request_pty_size(cols, rows, None, None);
                }
            }
        }

        if last_keepalive.elapsed() >= KEEPALIVE_INTERVAL {
            let _ = session.keepalive_send();
            last_keepalive = std::time::Instant::now();
        }

        std::thread::sleep(Duration::from_millis(10));
    }

    let _ = channel.close();
    let _ = channel.wait_close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn connect_to_closed_local_port_fails_with_connect_error() {
        let target = SshTarget {
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 1, // tcpmux, never listening in a test environment
            username: "nobody".to_string(),
            auth: SshAuth::Password("x".to_string()),
        };

        let result = SshClient::connect(target).await;
        assert!(matches!(result, Err(SshClientError::Connect(_, _))));
    }
}
