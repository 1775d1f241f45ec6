//! Challenge-token issue/consume, the one-shot anti-automation gate that
//! sits between the verify endpoint and the WebSocket upgrade.
//!
//! Tokens live in the web session record (`session_store`); the
//! in-memory `fast_index` here is a cache over that record, never a
//! second source of truth — the session store stays authoritative so a
//! second process (or a restart) observes the same consume result.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::session_store::{ChallengeToken, SessionStore};

/// Reads `len` bytes of randomness from the OS CSPRNG and hex-encodes
/// them. Same approach as the rest of this codebase's token generators:
/// no userspace RNG, read straight from `/dev/urandom`.
fn random_hex(len: usize) -> String {
    use std::io::Read;
    let mut buf = vec![0u8; len];
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut buf))
        .expect("failed to read /dev/urandom");
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Constant-time comparison of two byte slices. Mismatched lengths fail
/// immediately without inspecting content; equal-length slices are
/// compared in full regardless of where the first difference falls, so
/// timing does not leak how many leading bytes matched.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Mints and consumes one-shot challenge tokens, bound to a session and
/// a client IP, persisted through a `SessionStore`.
pub struct TokenIssuer {
    store: Arc<dyn SessionStore>,
    ttl: Duration,
    /// Fast-index of tokens known to be outstanding, purely to short
    /// circuit the sweeper; consume() always re-checks the session store.
    fast_index: Mutex<HashSet<String>>,
}

impl TokenIssuer {
    pub fn new(store: Arc<dyn SessionStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            fast_index: Mutex::new(HashSet::new()),
        }
    }

    /// Mint a fresh token, bind it to `session_id` and `ip`, and persist
    /// it into the session record with this issuer's TTL.
    pub async fn issue(&self, session_id: &str, ip: IpAddr) -> (String, Duration) {
        let token = random_hex(24);

        let mut record = self.store.get(session_id).await.unwrap_or_default();
        record.challenge_token = Some(ChallengeToken {
            value: token.clone(),
            expires_at: std::time::Instant::now() + self.ttl,
            bound_ip: ip,
        });
        self.store.set(session_id, record, SESSION_TTL).await;

        self.fast_index.lock().await.insert(token.clone());
        (token, self.ttl)
    }

    /// Consume a presented token for `session_id` from `current_ip`.
    ///
    /// Reads the session, compares the stored token to the presented one
    /// in constant time, checks expiry and IP equality, and on success
    /// deletes the token from the session (one-shot: a second call with
    /// the same token fails because the record no longer holds it).
    ///
    /// The read-check-delete is held under `fast_index`'s lock for its
    /// whole duration rather than released between the `get` and the
    /// `set`: two upgrades racing on the same token must not both observe
    /// it present before either deletes it (I2/P1) — without a lock held
    /// across the round trip, both could pass the check and both return
    /// `true`.
    pub async fn consume(&self, session_id: &str, presented: &str, current_ip: IpAddr) -> bool {
        let mut index = self.fast_index.lock().await;

        let Some(mut record) = self.store.get(session_id).await else {
            return false;
        };
        let Some(stored) = record.challenge_token.clone() else {
            return false;
        };

        let matches = constant_time_eq(stored.value.as_bytes(), presented.as_bytes());
        let valid = matches && !stored.is_expired() && stored.bound_ip == current_ip;

        if valid {
            record.challenge_token = None;
            self.store.set(session_id, record, SESSION_TTL).await;
            index.remove(&stored.value);
        }

        valid
    }

    /// Drop fast-index entries for tokens that have since expired. The
    /// session store remains authoritative; this only keeps the index
    /// from growing without bound between sweeps.
    pub async fn sweep_expired(&self) {
        // The fast index holds no expiry of its own — it is rebuilt on
        // each issue/consume, so sweeping here just caps its size
        // against tokens whose sessions already evicted them.
        let mut index = self.fast_index.lock().await;
        if index.len() > 10_000 {
            tracing::warn!(size = index.len(), "Challenge-token fast index growing large");
            index.clear();
        }
    }
}

/// TTL for the session record itself, independent of the token's own
/// TTL — the session persists across multiple verify/consume cycles.
const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::MemorySessionStore;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(Arc::new(MemorySessionStore::new()), Duration::from_secs(30))
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn constant_time_eq_accepts_equal() {
        assert!(constant_time_eq(b"abcdef", b"abcdef"));
    }

    #[test]
    fn constant_time_eq_rejects_single_byte_diff() {
        assert!(!constant_time_eq(b"abcdef", b"abcdeg"));
    }

    #[tokio::test]
    async fn issue_then_consume_succeeds() {
        let issuer = issuer();
        let client_ip = ip("203.0.113.7");
        let (token, _ttl) = issuer.issue("sess-1", client_ip).await;
        assert!(issuer.consume("sess-1", &token, client_ip).await);
    }

    #[tokio::test]
    async fn consume_is_one_shot() {
        let issuer = issuer();
        let client_ip = ip("203.0.113.7");
        let (token, _ttl) = issuer.issue("sess-1", client_ip).await;
        assert!(issuer.consume("sess-1", &token, client_ip).await);
        assert!(!issuer.consume("sess-1", &token, client_ip).await);
    }

    #[tokio::test]
    async fn consume_rejects_wrong_token() {
        let issuer = issuer();
        let client_ip = ip("203.0.113.7");
        issuer.issue("sess-1", client_ip).await;
        assert!(!issuer.consume("sess-1", "not-the-token", client_ip).await);
    }

    #[tokio::test]
    async fn consume_rejects_ip_mismatch() {
        let issuer = issuer();
        let (token, _ttl) = issuer.issue("sess-1", ip("203.0.113.7")).await;
        assert!(!issuer.consume("sess-1", &token, ip("203.0.113.99")).await);
    }

    #[tokio::test]
    async fn consume_rejects_unknown_session() {
        let issuer = issuer();
        assert!(!issuer.consume("no-such-session", "x", ip("1.2.3.4")).await);
    }

    #[tokio::test]
    async fn consume_rejects_expired_token() {
        let issuer = TokenIssuer::new(
            Arc::new(MemorySessionStore::new()),
            Duration::from_millis(1),
        );
        let client_ip = ip("203.0.113.7");
        let (token, _ttl) = issuer.issue("sess-1", client_ip).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!issuer.consume("sess-1", &token, client_ip).await);
    }

    #[tokio::test]
    async fn token_is_48_hex_chars() {
        let issuer = issuer();
        let (token, _ttl) = issuer.issue("sess-1", ip("1.2.3.4")).await;
        assert_eq!(token.len(), 48); // 24 bytes hex-encoded
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn concurrent_consume_succeeds_exactly_once() {
        let issuer = Arc::new(issuer());
        let client_ip = ip("203.0.113.7");
        let (token, _ttl) = issuer.issue("sess-1", client_ip).await;

        let a = issuer.clone();
        let tok_a = token.clone();
        let b = issuer.clone();
        let tok_b = token.clone();

        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { a.consume("sess-1", &tok_a, client_ip).await }),
            tokio::spawn(async move { b.consume("sess-1", &tok_b, client_ip).await }),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        assert_ne!(r1, r2, "exactly one of two racing consumes must succeed");
    }

    #[tokio::test]
    async fn reissue_overwrites_previous_token() {
        let issuer = issuer();
        let client_ip = ip("1.2.3.4");
        let (first, _) = issuer.issue("sess-1", client_ip).await;
        let (second, _) = issuer.issue("sess-1", client_ip).await;
        assert_ne!(first, second);
        assert!(!issuer.consume("sess-1", &first, client_ip).await);
        assert!(issuer.consume("sess-1", &second, client_ip).await);
    }
}
