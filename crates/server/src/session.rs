//! Web-session cookie glue.
//!
//! The OAuth identity provider and its callback dance are an external
//! collaborator (spec §1): by the time a request reaches this crate, an
//! authenticated user is either already present in the session record or
//! it isn't. This module only knows how to name a session via its
//! cookie and lazily create one on first contact — it never talks to an
//! identity provider.

use std::time::Duration;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use uuid::Uuid;

use crate::session_store::{SessionRecord, SessionStore};

pub const SESSION_COOKIE: &str = "gw_session";

/// How long a freshly-created session record lives in the store before
/// the caller refreshes it. Independent of the challenge token's own
/// (much shorter) TTL.
const SESSION_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// The session id carried by the request's cookie jar, if any.
pub fn session_id(jar: &CookieJar) -> Option<String> {
    jar.get(SESSION_COOKIE).map(|c| c.value().to_string())
}

/// Ensure the request carries a session cookie, minting a fresh session
/// id (and an empty record in `store`) when it doesn't. Returns the
/// (possibly updated) jar plus the session id this request should use.
///
/// Used by the two endpoints that may see a brand-new visitor
/// (`/turnstile-verify`, `/auth/status`); `GET /ssh` never creates a
/// session of its own — an upgrade with no existing session is simply
/// unauthenticated (I1).
pub async fn ensure_session(jar: CookieJar, store: &dyn SessionStore) -> (CookieJar, String) {
    if let Some(id) = session_id(&jar) {
        return (jar, id);
    }

    let id = Uuid::new_v4().to_string();
    store.set(&id, SessionRecord::default(), SESSION_RECORD_TTL).await;

    let cookie = Cookie::build((SESSION_COOKIE, id.clone()))
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .build();

    (jar.add(cookie), id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_store::MemorySessionStore;

    #[tokio::test]
    async fn ensure_session_creates_one_when_absent() {
        let store = MemorySessionStore::new();
        let jar = CookieJar::new();
        let (jar, id) = ensure_session(jar, &store).await;
        assert!(!id.is_empty());
        assert_eq!(session_id(&jar).as_deref(), Some(id.as_str()));
        assert!(store.get(&id).await.is_some());
    }

    #[tokio::test]
    async fn ensure_session_reuses_existing_cookie() {
        let store = MemorySessionStore::new();
        let jar = CookieJar::new().add(Cookie::new(SESSION_COOKIE, "existing-id"));
        let (_, id) = ensure_session(jar, &store).await;
        assert_eq!(id, "existing-id");
    }

    #[test]
    fn session_id_absent_without_cookie() {
        let jar = CookieJar::new();
        assert!(session_id(&jar).is_none());
    }
}
