//! Client for the external challenge-verification provider (spec §4.5).
//!
//! The provider is a third-party collaborator reached over HTTPS; this
//! module only knows how to POST a solved challenge to it and retry a
//! bounded number of times, with exponential backoff, on transport
//! failure or a 5xx response. A verified response
//! does not itself authenticate a *user* — it only proves "not a bot"
//! and earns the caller a one-shot connect token (minted by
//! [`crate::token::TokenIssuer`]), per the Open Question resolution in
//! the session-store ledger.

use std::time::Duration;

use gateway_protocol::{TurnstileConfig, TurnstileVerifyRequest, TurnstileVerifyResponse};

/// Initial delay before the first retry; doubled on each subsequent one.
/// `max_retries` is small (default 1), so this never grows large enough
/// to matter against `request_timeout_ms * (retries + 1)`.
const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(thiserror::Error, Debug)]
pub enum TurnstileError {
    /// Network-level failure reaching the provider (maps to 502, retried).
    #[error("challenge provider request failed: {0}")]
    Transport(reqwest::Error),
    /// Provider reached but replied with a 5xx status (maps to 502,
    /// retried — this is the provider's own failure, distinct from a
    /// 2xx/4xx body this side simply failed to parse).
    #[error("challenge provider returned server error: {0}")]
    ServerError(reqwest::StatusCode),
    /// Provider reached and returned a non-5xx status, but the body
    /// isn't a valid verify response (maps to 500, not retried — it
    /// isn't the provider being down, it's this side misreading it).
    #[error("challenge provider returned a malformed response: {0}")]
    Malformed(reqwest::Error),
    /// Provider actively rejected the attestation (maps to 400, not retried).
    #[error("challenge rejected: {0}")]
    Rejected(String),
}

impl TurnstileError {
    /// Only transport failures and 5xx responses are worth retrying —
    /// a malformed 2xx/4xx body or an explicit rejection will not
    /// change on a second attempt.
    fn is_retryable(&self) -> bool {
        matches!(self, TurnstileError::Transport(_) | TurnstileError::ServerError(_))
    }
}

pub struct TurnstileClient {
    http: reqwest::Client,
    config: TurnstileConfig,
}

impl TurnstileClient {
    pub fn new(config: TurnstileConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }

    /// False when the provider secret is missing from config — a
    /// misconfiguration the caller maps to 500, distinct from every
    /// other rejection `verify` returns.
    pub fn is_configured(&self) -> bool {
        self.config.secret.is_some()
    }

    /// Verify a solved challenge token against the provider, retrying
    /// transport failures and 5xx responses up to `max_retries` times
    /// with exponential backoff between attempts; a rejected attestation
    /// or a malformed non-5xx body returns immediately without retrying.
    pub async fn verify(&self, token: &str) -> Result<(), TurnstileError> {
        let body = TurnstileVerifyRequest {
            token: token.to_string(),
        };

        let mut last_err = None;
        let mut backoff = INITIAL_RETRY_BACKOFF;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }

            match self.send_once(&body).await {
                Ok(response) => {
                    return match response {
                        TurnstileVerifyResponse::Success { .. } => Ok(()),
                        TurnstileVerifyResponse::Failure { message, .. } => {
                            Err(TurnstileError::Rejected(message))
                        }
                    };
                }
                Err(e) => {
                    let retryable = e.is_retryable();
                    tracing::warn!(attempt, error = %e, retryable, "turnstile verify attempt failed");
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err.expect("loop runs at least once since max_retries + 1 >= 1"))
    }

    async fn send_once(&self, body: &TurnstileVerifyRequest) -> Result<TurnstileVerifyResponse, TurnstileError> {
        let response = self
            .http
            .post(&self.config.verify_url)
            .json(&serde_json::json!({
                "secret": self.config.secret.as_deref().unwrap_or_default(),
                "response": body.token,
            }))
            .send()
            .await
            .map_err(TurnstileError::Transport)?;

        if response.status().is_server_error() {
            return Err(TurnstileError::ServerError(response.status()));
        }

        response
            .json::<TurnstileVerifyResponse>()
            .await
            .map_err(TurnstileError::Malformed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_with_zero_retries_still_attempts_once() {
        let config = TurnstileConfig {
            verify_url: "https://example.invalid/verify".to_string(),
            secret: Some("s".to_string()),
            token_ttl_ms: 60_000,
            max_retries: 0,
            request_timeout_ms: 1_000,
        };
        // 0..=0 yields exactly one iteration.
        assert_eq!((0..=config.max_retries).count(), 1);
    }

    #[test]
    fn server_error_and_transport_are_retryable() {
        assert!(TurnstileError::ServerError(reqwest::StatusCode::BAD_GATEWAY).is_retryable());
    }

    #[test]
    fn rejected_is_not_retryable() {
        assert!(!TurnstileError::Rejected("no".to_string()).is_retryable());
    }
}
