use serde::{Deserialize, Serialize};

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub turnstile: TurnstileConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTPS port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated if absent)
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated if absent)
    pub tls_key: Option<String>,
    /// Require authentication for the /metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub metrics_require_auth: bool,
    /// If true, trust the first entry of `X-Forwarded-For` for the client IP.
    #[serde(default)]
    pub behind_proxy: bool,
    /// Optional allow-list of resolved target IPs. Empty means unrestricted.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

/// Protection-state limits: per-IP concurrency and per-user SSH throttling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    /// Maximum concurrent WebSockets per client IP.
    #[serde(default = "default_concurrent_per_ip")]
    pub concurrent_per_ip: u32,
    /// SSH authentication failures allowed per user before throttling.
    #[serde(default = "default_max_ssh_attempts")]
    pub max_ssh_attempts_per_user: u32,
    /// Hard deadline for the session-store fetch at upgrade time, in milliseconds.
    #[serde(default = "default_session_store_timeout_ms")]
    pub session_store_get_timeout_ms: u64,
}

/// Challenge-token provider (Turnstile-compatible) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Provider verification endpoint.
    #[serde(default = "default_turnstile_verify_url")]
    pub verify_url: String,
    /// Secret shared with the provider. Missing secret is a config error.
    pub secret: Option<String>,
    /// Lifetime of a minted server token, in milliseconds.
    #[serde(default = "default_token_ttl_ms")]
    pub token_ttl_ms: u64,
    /// Retries against the provider on a 5xx response.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout talking to the provider, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle timeout for a relay connection in seconds (0 = disabled).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            metrics_require_auth: true,
            behind_proxy: false,
            allowed_hosts: Vec::new(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            concurrent_per_ip: default_concurrent_per_ip(),
            max_ssh_attempts_per_user: default_max_ssh_attempts(),
            session_store_get_timeout_ms: default_session_store_timeout_ms(),
        }
    }
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            verify_url: default_turnstile_verify_url(),
            secret: None,
            token_ttl_ms: default_token_ttl_ms(),
            max_retries: default_max_retries(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        // --- TLS cert/key ---
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => {
                if !std::path::Path::new(cert).exists() {
                    issues.push(format!(
                        "ERROR: tls_cert '{}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes",
                        cert
                    ));
                }
                if !std::path::Path::new(key).exists() {
                    issues.push(format!(
                        "ERROR: tls_key '{}' does not exist. \
                         Generate with: openssl req -x509 -newkey rsa:4096 -keyout key.pem -out cert.pem -days 365 -nodes",
                        key
                    ));
                }
            }
            (Some(_), None) => {
                issues.push(
                    "WARNING: tls_cert is set but tls_key is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, Some(_)) => {
                issues.push(
                    "WARNING: tls_key is set but tls_cert is not. \
                     Both must be set for custom TLS, or omit both for auto-generated certificates."
                        .to_string(),
                );
            }
            (None, None) => {} // Fine — auto-generated
        }

        // --- Port ---
        if self.server.port == 0 {
            issues.push("ERROR: server.port must be between 1 and 65535, got 0.".to_string());
        }

        // --- allowed_hosts must parse as IP literals ---
        for host in &self.server.allowed_hosts {
            if host.parse::<std::net::IpAddr>().is_err() {
                issues.push(format!(
                    "ERROR: server.allowed_hosts entry '{}' is not a valid IP literal. \
                     allowed_hosts constrains resolved addresses, not hostnames.",
                    host
                ));
            }
        }

        // --- Protection limits ---
        if self.protection.concurrent_per_ip == 0 {
            issues.push("ERROR: protection.concurrent_per_ip must be >= 1.".to_string());
        }
        if self.protection.max_ssh_attempts_per_user == 0 {
            issues.push("ERROR: protection.max_ssh_attempts_per_user must be >= 1.".to_string());
        }
        if self.protection.session_store_get_timeout_ms == 0 {
            issues.push(
                "ERROR: protection.session_store_get_timeout_ms must be >= 1.".to_string(),
            );
        }

        // --- Turnstile ---
        if self.turnstile.secret.is_none() {
            issues.push(
                "WARNING: turnstile.secret is not set. The /turnstile-verify endpoint will \
                 return 500 for every request until a provider secret is configured."
                    .to_string(),
            );
        }
        if !self.turnstile.verify_url.starts_with("https://")
            && !self.turnstile.verify_url.starts_with("http://")
        {
            issues.push(format!(
                "ERROR: turnstile.verify_url '{}' must be an http(s) URL.",
                self.turnstile.verify_url
            ));
        }
        if self.turnstile.token_ttl_ms == 0 {
            issues.push("ERROR: turnstile.token_ttl_ms must be >= 1.".to_string());
        }
        if self.turnstile.request_timeout_ms == 0 {
            issues.push("ERROR: turnstile.request_timeout_ms must be >= 1.".to_string());
        }

        // --- Session ---
        if self.session.idle_timeout > 0 && self.session.idle_timeout < 5 {
            issues.push(format!(
                "WARNING: session.idle_timeout is {}s, which is unusually aggressive for an \
                 interactive shell. Values under 5s will disconnect users mid-keystroke.",
                self.session.idle_timeout
            ));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_true() -> bool {
    true
}
fn default_concurrent_per_ip() -> u32 {
    5
}
fn default_max_ssh_attempts() -> u32 {
    5
}
fn default_session_store_timeout_ms() -> u64 {
    2_000
}
fn default_turnstile_verify_url() -> String {
    "https://challenges.cloudflare.com/turnstile/v0/siteverify".to_string()
}
fn default_token_ttl_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    1
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_idle_timeout() -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: GatewayConfig =
            toml::from_str("").expect("empty string should deserialize to default config");

        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.port, 8443);
        assert!(config.server.tls_cert.is_none());
        assert!(config.server.tls_key.is_none());
        assert!(config.server.metrics_require_auth);
        assert!(!config.server.behind_proxy);
        assert!(config.server.allowed_hosts.is_empty());

        assert_eq!(config.protection.concurrent_per_ip, 5);
        assert_eq!(config.protection.max_ssh_attempts_per_user, 5);
        assert_eq!(config.protection.session_store_get_timeout_ms, 2_000);

        assert!(config.turnstile.secret.is_none());
        assert_eq!(config.turnstile.token_ttl_ms, 30_000);
        assert_eq!(config.turnstile.max_retries, 1);
        assert_eq!(config.turnstile.request_timeout_ms, 10_000);

        assert_eq!(config.session.idle_timeout, 0);
    }

    #[test]
    fn partial_config_only_protection_section() {
        let toml_str = r#"
[protection]
concurrent_per_ip = 10
"#;
        let config: GatewayConfig =
            toml::from_str(toml_str).expect("partial config should deserialize");
        assert_eq!(config.protection.concurrent_per_ip, 10);
        assert_eq!(config.protection.max_ssh_attempts_per_user, 5);
        assert_eq!(config.server.port, 8443);
    }

    fn valid_config() -> GatewayConfig {
        let mut config: GatewayConfig = toml::from_str("").expect("default config");
        config.turnstile.secret = Some("shh".to_string());
        config
    }

    fn validate_issues(config: &GatewayConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => vec![],
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("ERROR:") && i.contains(substring))
    }

    fn has_warning(issues: &[String], substring: &str) -> bool {
        issues
            .iter()
            .any(|i| i.starts_with("WARNING:") && i.contains(substring))
    }

    #[test]
    fn validate_default_config_passes() {
        let config = valid_config();
        assert!(config.validate().is_ok(), "default config should validate");
    }

    #[test]
    fn validate_missing_turnstile_secret_is_warning() {
        let config: GatewayConfig = toml::from_str("").unwrap();
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "turnstile.secret"));
    }

    #[test]
    fn validate_port_zero_is_error() {
        let mut config = valid_config();
        config.server.port = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "port"));
    }

    #[test]
    fn validate_concurrent_per_ip_zero_is_error() {
        let mut config = valid_config();
        config.protection.concurrent_per_ip = 0;
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "concurrent_per_ip"));
    }

    #[test]
    fn validate_allowed_hosts_rejects_hostnames() {
        let mut config = valid_config();
        config.server.allowed_hosts = vec!["example.com".to_string()];
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "allowed_hosts"));
    }

    #[test]
    fn validate_allowed_hosts_accepts_ip_literals() {
        let mut config = valid_config();
        config.server.allowed_hosts = vec!["8.8.8.8".to_string(), "::1".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_turnstile_bad_url_is_error() {
        let mut config = valid_config();
        config.turnstile.verify_url = "ftp://example.com".to_string();
        let issues = validate_issues(&config);
        assert!(has_error(&issues, "verify_url"));
    }

    #[test]
    fn validate_idle_timeout_small_is_warning() {
        let mut config = valid_config();
        config.session.idle_timeout = 3;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues, "idle_timeout"));
    }

    #[test]
    fn validate_idle_timeout_zero_disabled_is_ok() {
        let mut config = valid_config();
        config.session.idle_timeout = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_multiple_errors_collected() {
        let mut config = valid_config();
        config.server.port = 0;
        config.protection.concurrent_per_ip = 0;
        config.protection.max_ssh_attempts_per_user = 0;
        let issues = validate_issues(&config);
        assert!(issues.len() >= 3, "got {:?}", issues);
    }
}
