//! The per-socket state machine: `OPENED -> CONNECTING -> READY -> CLOSING -> CLOSED`.
//!
//! There is no fan-out registry here — each gateway WebSocket owns
//! exactly one SSH session, so the relay is a single task bridging one
//! socket to one `SshClient` rather than a broadcast hub serving many
//! subscribers.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use gateway_protocol::{AuthMethod, ClientMessage, ServerMessage};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, interval};

use crate::host_guard::HostGuard;
use crate::metrics::Metrics;
use crate::protection::ProtectionState;
use crate::ssh_client::{SshAuth, SshClient, SshClientError, SshTarget};
use crate::token::constant_time_eq;

const WS_PING_INTERVAL: Duration = Duration::from_secs(30);
const WS_PONG_TIMEOUT: Duration = Duration::from_secs(90);
const CLOSE_SUPERVISOR_SHUTDOWN: u16 = 1001;
const CLOSE_AUTH_FAILURE: u16 = 1008;

/// Resources owned by one relay invocation, released exactly once by
/// [`Connection::teardown`] regardless of which path triggers close.
struct Connection {
    client_ip: IpAddr,
    user_id: String,
    protection: Arc<ProtectionState>,
    ssh: Option<SshClient>,
    torn_down: AtomicBool,
}

impl Connection {
    /// Idempotent teardown: end the shell/SSH client, then decrement the
    /// per-IP counter exactly once (I4, P7). Safe to call from any close
    /// path, including twice.
    async fn teardown(&mut self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.ssh.take() {
            client.shutdown();
            client.join().await;
        }
        self.protection.decrement_ip(self.client_ip).await;
    }
}

/// Buffered resize request captured in OPENED, applied once the shell
/// is up in READY.
struct PendingResize {
    cols: u32,
    rows: u32,
}

/// Drive one accepted, already counter-incremented WebSocket through
/// the full relay lifecycle. Called by the upgrade handler after the
/// upgrade gate has validated session, token, and concurrency.
///
/// `expected_token` is the challenge token the upgrade gate already
/// consumed from the session; it is re-checked here in constant time
/// against the token carried on the `connect` frame itself as defense
/// in depth, so a frame forged after the upgrade handshake (but before
/// the gate's own check) cannot ride an already-validated socket.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    mut socket: WebSocket,
    client_ip: IpAddr,
    user_id: String,
    expected_token: String,
    host_guard: Arc<HostGuard>,
    protection: Arc<ProtectionState>,
    allowed_hosts: Option<Vec<IpAddr>>,
    idle_timeout: Duration,
    metrics: Arc<Metrics>,
    shutdown_rx: broadcast::Receiver<()>,
) {
    let mut conn = Connection {
        client_ip,
        user_id: user_id.clone(),
        protection: protection.clone(),
        ssh: None,
        torn_down: AtomicBool::new(false),
    };
    metrics.ws_opened();

    let opened = wait_for_connect(&mut socket).await;
    let (connect_msg, mut pending_resize) = match opened {
        OpenedOutcome::Connect(msg, resize) => (msg, resize),
        OpenedOutcome::Closed => {
            conn.teardown().await;
            metrics.ws_closed();
            return;
        }
    };

    if !constant_time_eq(connect_msg.token.as_bytes(), expected_token.as_bytes()) {
        close_auth_failure(&mut socket).await;
        conn.teardown().await;
        metrics.ws_closed();
        return;
    }

    if protection.is_throttled(&user_id).await {
        metrics.throttle_trip();
        send_error(&mut socket, "too many failed SSH attempts").await;
        close(&mut socket, None).await;
        conn.teardown().await;
        metrics.ws_closed();
        return;
    }

    if connect_msg.host.trim().is_empty() || connect_msg.username.trim().is_empty() {
        send_error(&mut socket, "host and username are required").await;
        close(&mut socket, None).await;
        conn.teardown().await;
        metrics.ws_closed();
        return;
    }

    let resolved = match host_guard.check(&connect_msg.host).await {
        Ok(addr) => addr,
        Err(e) => {
            metrics.ssrf_rejection();
            send_error(&mut socket, &format!("target rejected: {e}")).await;
            close(&mut socket, None).await;
            conn.teardown().await;
            metrics.ws_closed();
            return;
        }
    };

    if let Some(allow) = &allowed_hosts {
        if !allow.contains(&resolved) {
            metrics.ssrf_rejection();
            send_error(&mut socket, "target address is not on the allow-list").await;
            close(&mut socket, None).await;
            conn.teardown().await;
            metrics.ws_closed();
            return;
        }
    }

    // CONNECTING: dial SSH.
    let auth = match connect_msg.auth {
        AuthMethod::Password => match connect_msg.password {
            Some(p) => SshAuth::Password(p),
            None => {
                send_error(&mut socket, "password auth requires a password").await;
                close(&mut socket, None).await;
                conn.teardown().await;
                metrics.ws_closed();
                return;
            }
        },
        AuthMethod::Key => match connect_msg.private_key {
            Some(key) => SshAuth::PrivateKey {
                key,
                passphrase: connect_msg.passphrase,
            },
            None => {
                send_error(&mut socket, "key auth requires a private key").await;
                close(&mut socket, None).await;
                conn.teardown().await;
                metrics.ws_closed();
                return;
            }
        },
    };

    let target = SshTarget {
        addr: resolved,
        port: connect_msg.port,
        username: connect_msg.username,
        auth,
    };

    let (client, mut output_rx, mut closed_rx) = match SshClient::connect(target).await {
        Ok(triple) => triple,
        Err(e) => {
            protection.record_failure(&user_id).await;
            metrics.ssh_connect_failure();
            send_error(&mut socket, &ssh_error_message(&e)).await;
            close(&mut socket, None).await;
            conn.teardown().await;
            metrics.ws_closed();
            return;
        }
    };

    if let Some(resize) = pending_resize.take() {
        client.resize(resize.cols, resize.rows);
    }
    conn.ssh = Some(client);

    if socket
        .send(Message::Text(ServerMessage::Ready.to_json().into()))
        .await
        .is_err()
    {
        conn.teardown().await;
        metrics.ws_closed();
        return;
    }

    run_ready_loop(
        &mut socket,
        &mut conn,
        &mut output_rx,
        &mut closed_rx,
        idle_timeout,
        shutdown_rx,
    )
    .await;
    conn.teardown().await;
    metrics.ws_closed();
}

enum OpenedOutcome {
    Connect(gateway_protocol::ClientMessage, Option<PendingResize>),
    Closed,
}

#[allow(clippy::large_enum_variant)]
async fn wait_for_connect(socket: &mut WebSocket) -> OpenedOutcome {
    let mut pending_resize: Option<PendingResize> = None;
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Connect { .. }) => {
                    let ConnectHost { msg } = ConnectHost::from_json(&text);
                    return OpenedOutcome::Connect(msg, pending_resize);
                }
                Ok(ClientMessage::Resize { cols, rows }) => {
                    pending_resize = Some(PendingResize { cols, rows });
                }
                Err(_) => {
                    send_error(socket, "expected a connect or resize message").await;
                    close(socket, None).await;
                    return OpenedOutcome::Closed;
                }
            },
            Some(Ok(Message::Binary(_))) => {
                // Stray binary frames before connect are discarded.
                continue;
            }
            Some(Ok(Message::Close(_))) | None => return OpenedOutcome::Closed,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return OpenedOutcome::Closed,
        }
    }
}

/// Re-parses the connect message so callers get an owned `ClientMessage`
/// without fighting the borrow checker inside the `match` above.
struct ConnectHost {
    msg: ClientMessage,
}

impl ConnectHost {
    fn from_json(text: &str) -> Self {
        Self {
            msg: serde_json::from_str(text).expect("already validated as ClientMessage::Connect"),
        }
    }
}

async fn run_ready_loop(
    socket: &mut WebSocket,
    conn: &mut Connection,
    output_rx: &mut tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>,
    closed_rx: &mut tokio::sync::mpsc::UnboundedReceiver<()>,
    idle_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ping_interval = interval(WS_PING_INTERVAL);
    ping_interval.tick().await;
    let mut last_pong = Instant::now();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                close_supervisor_shutdown(socket).await;
                break;
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > WS_PONG_TIMEOUT {
                    tracing::debug!(user = %conn.user_id, "relay ping timeout, closing");
                    break;
                }
                if !idle_timeout.is_zero() && last_activity.elapsed() > idle_timeout {
                    tracing::debug!(user = %conn.user_id, "relay idle timeout, closing");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            Some(data) = output_rx.recv() => {
                last_activity = Instant::now();
                if socket.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            _ = closed_rx.recv() => {
                let _ = socket
                    .send(Message::Text(ServerMessage::SshClosed.to_json().into()))
                    .await;
                break;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = Instant::now();
                        if let Some(client) = &conn.ssh {
                            client.send(data.to_vec());
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        if let Ok(ClientMessage::Resize { cols, rows }) = serde_json::from_str(&text) {
                            if let Some(client) = &conn.ssh {
                                client.resize(cols, rows);
                            }
                        }
                        // Any other text message type is ignored per the READY contract.
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn send_error(socket: &mut WebSocket, message: &str) {
    let _ = socket
        .send(Message::Text(ServerMessage::error(message).to_json().into()))
        .await;
}

async fn close(socket: &mut WebSocket, code: Option<u16>) {
    let frame = code.map(|code| CloseFrame {
        code,
        reason: String::new().into(),
    });
    let _ = socket.send(Message::Close(frame)).await;
}

/// Close the WebSocket with the 1008 auth-failure code, used when the
/// defense-in-depth token re-check fails after the socket is already
/// accepted — the upgrade gate itself rejects with a plain HTTP 401
/// before ever accepting the socket.
async fn close_auth_failure(socket: &mut WebSocket) {
    close(socket, Some(CLOSE_AUTH_FAILURE)).await;
}

/// Close the WebSocket with the 1001 supervisor-shutdown code.
async fn close_supervisor_shutdown(socket: &mut WebSocket) {
    close(socket, Some(CLOSE_SUPERVISOR_SHUTDOWN)).await;
}

fn ssh_error_message(e: &SshClientError) -> String {
    match e {
        SshClientError::Connect(addr, _) => format!("could not reach {addr}"),
        SshClientError::Handshake(_) => "SSH handshake failed".to_string(),
        SshClientError::AuthFailed => "SSH authentication failed".to_string(),
        SshClientError::Shell(_) => "failed to open interactive shell".to_string(),
        SshClientError::ReadyTimeout => "SSH session timed out before becoming ready".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn teardown_decrements_ip_exactly_once() {
        let protection = Arc::new(ProtectionState::new(5, 5));
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        protection.increment_ip(ip).await;
        assert_eq!(protection.live_count(ip).await, 1);

        let mut conn = Connection {
            client_ip: ip,
            user_id: "u1".to_string(),
            protection: protection.clone(),
            ssh: None,
            torn_down: AtomicBool::new(false),
        };

        conn.teardown().await;
        assert_eq!(protection.live_count(ip).await, 0);

        // A second teardown must not underflow the counter.
        conn.teardown().await;
        assert_eq!(protection.live_count(ip).await, 0);
    }

    #[test]
    fn ssh_error_message_does_not_leak_io_details() {
        let addr = std::net::SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 22));
        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out");
        let message = ssh_error_message(&SshClientError::Connect(addr, io_err));
        assert_eq!(message, "could not reach 10.0.0.1:22");

        assert_eq!(
            ssh_error_message(&SshClientError::AuthFailed),
            "SSH authentication failed"
        );
        assert_eq!(
            ssh_error_message(&SshClientError::ReadyTimeout),
            "SSH session timed out before becoming ready"
        );
    }
}
