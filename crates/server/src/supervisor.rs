//! Process-wide background duties: periodic idle-state sweeping and
//! fanning a graceful-shutdown signal out to every live relay task.
//!
//! There is nothing to persist across a restart — every SSH session
//! dies with the process — so shutdown only needs to sweep idle
//! protection state and tell relays to close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::protection::ProtectionState;
use crate::token::TokenIssuer;

/// Token sweep cadence per spec §4.6 ("every 5 minutes"); also doubles as
/// a periodic backstop for the per-user attempt sweep, which is
/// otherwise triggered probabilistically from `record_failure`.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Shutdown broadcast handle. Each relay task subscribes with
/// `subscribe()` and selects on the receiver alongside its socket I/O;
/// closing is cooperative, there is no forced-abort registry.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Tell every subscribed relay task to close. Idempotent: a second
    /// call is a no-op once all receivers have already observed one.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the periodic sweeper that evicts idle per-user throttle
/// records and caps the token issuer's fast-path index. Runs for the
/// lifetime of the process; stops when `shutdown` fires.
pub fn spawn_sweeper(
    protection: Arc<ProtectionState>,
    tokens: Arc<TokenIssuer>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    protection.sweep_idle_attempts().await;
                    tokens.sweep_expired().await;
                }
                _ = shutdown.recv() => {
                    tracing::debug!("supervisor sweeper stopping");
                    break;
                }
            }
        }
    })
}
