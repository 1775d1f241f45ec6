//! The web session record and the store that backs it.
//!
//! The real session store — Redis, a database, whatever the deployment
//! plugs in — is an external collaborator: this crate only depends on
//! the narrow `get`/`set` contract below. `MemorySessionStore` is a
//! working, TTL-respecting stand-in used for local development and for
//! every test in this crate; it is not meant to be the production store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use gateway_protocol::UserProfile;
use tokio::sync::RwLock;

/// The one-time challenge token record attached to a session by the
/// verify endpoint and consumed at WebSocket upgrade.
#[derive(Debug, Clone)]
pub struct ChallengeToken {
    pub value: String,
    pub expires_at: Instant,
    pub bound_ip: IpAddr,
}

impl ChallengeToken {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// A web session: the authenticated user (if any) plus at most one live
/// challenge token.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub user: Option<UserProfile>,
    pub challenge_token: Option<ChallengeToken>,
}

/// The external session store contract. `get` and `set` round-trip a
/// whole `SessionRecord` — the session record is the sole authority for
/// token state; any in-memory index callers keep (see `token.rs`) is a
/// cache over this store, never a second source of truth.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Option<SessionRecord>;
    async fn set(&self, session_id: &str, record: SessionRecord, ttl: Duration);
}

/// In-memory `SessionStore` used for local development and tests.
/// Entries past their TTL are treated as absent by `get` and swept
/// lazily; this is not a production-grade store.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (SessionRecord, Instant)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &str) -> Option<SessionRecord> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some((record, expires_at)) if Instant::now() < *expires_at => Some(record.clone()),
            _ => None,
        }
    }

    async fn set(&self, session_id: &str, record: SessionRecord, ttl: Duration) {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), (record, Instant::now() + ttl));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_on_unknown_session_is_none() {
        let store = MemorySessionStore::new();
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemorySessionStore::new();
        let record = SessionRecord {
            user: Some(UserProfile {
                id: "u1".to_string(),
                email: "u1@example.com".to_string(),
                display_name: "User One".to_string(),
            }),
            challenge_token: None,
        };
        store
            .set("sess-1", record.clone(), Duration::from_secs(60))
            .await;
        let fetched = store.get("sess-1").await.unwrap();
        assert_eq!(fetched.user.unwrap().id, "u1");
    }

    #[tokio::test]
    async fn expired_session_is_absent() {
        let store = MemorySessionStore::new();
        store
            .set("sess-1", SessionRecord::default(), Duration::from_millis(1))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("sess-1").await.is_none());
    }

    #[test]
    fn challenge_token_expiry() {
        let expired = ChallengeToken {
            value: "abc".to_string(),
            expires_at: Instant::now() - Duration::from_secs(1),
            bound_ip: "127.0.0.1".parse().unwrap(),
        };
        assert!(expired.is_expired());

        let live = ChallengeToken {
            value: "abc".to_string(),
            expires_at: Instant::now() + Duration::from_secs(30),
            bound_ip: "127.0.0.1".parse().unwrap(),
        };
        assert!(!live.is_expired());
    }
}
