use serde::{Deserialize, Serialize};

/// Authentication method requested for a `connect` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Key,
}

/// `port` may arrive as a JSON number or a numeric string; normalize both.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortForm {
        Number(u16),
        Text(String),
    }
    match PortForm::deserialize(deserializer)? {
        PortForm::Number(n) => Ok(n),
        PortForm::Text(s) => s.parse::<u16>().map_err(serde::de::Error::custom),
    }
}

/// Text-frame messages sent from the browser to the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Connect {
        host: String,
        #[serde(deserialize_with = "deserialize_port")]
        port: u16,
        username: String,
        auth: AuthMethod,
        password: Option<String>,
        #[serde(rename = "privateKey")]
        private_key: Option<String>,
        passphrase: Option<String>,
        token: String,
    },
    Resize {
        cols: u32,
        rows: u32,
    },
}

/// Text-frame messages sent from the relay to the browser.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ready,
    Error { message: String },
    SshClosed,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization error"}"#.to_string()
        })
    }
}

/// `POST /turnstile-verify` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct TurnstileVerifyRequest {
    pub token: String,
}

/// `POST /turnstile-verify` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnstileVerifyResponse {
    Success { ok: bool, token: String, ttl: u64 },
    Failure { ok: bool, message: String },
}

impl TurnstileVerifyResponse {
    pub fn success(token: String, ttl_ms: u64) -> Self {
        TurnstileVerifyResponse::Success {
            ok: true,
            token,
            ttl: ttl_ms,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        TurnstileVerifyResponse::Failure {
            ok: false,
            message: message.into(),
        }
    }
}

/// Authenticated-user profile as returned by `GET /auth/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
}

/// `GET /auth/status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthStatusResponse {
    pub authenticated: bool,
    pub user: Option<UserProfile>,
}
