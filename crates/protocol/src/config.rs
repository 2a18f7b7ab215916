use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TalkwireConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ice: IceConfig,
    #[serde(default)]
    pub call: CallConfig,
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
    /// JWT secret (auto-generated and persisted if absent)
    pub jwt_secret: Option<String>,
}

/// ICE/TURN server configuration for WebRTC NAT traversal.
///
/// Without TURN, WebRTC fails behind symmetric NATs (~20% of enterprise networks).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs (default: Google's public STUN servers)
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    /// TURN server URLs (e.g., "turn:turn.example.com:3478")
    #[serde(default)]
    pub turn_urls: Vec<String>,
    /// TURN username (for long-term credential mechanism)
    pub turn_username: Option<String>,
    /// TURN credential/password
    pub turn_credential: Option<String>,
}

/// Tunables for call signaling and edge negotiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// Maximum ICE candidates buffered before the remote description is
    /// applied. Overflow drops the oldest entries: stale network-path
    /// candidates are the least likely to still be valid.
    #[serde(default = "default_candidate_buffer")]
    pub candidate_buffer: usize,
    /// Delay in milliseconds before the single ICE-restart check fires
    /// after the transport reports disconnected/failed.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    /// Maximum signaling message size in bytes (WebSocket frame limit).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            tls_cert: None,
            tls_key: None,
            jwt_secret: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            candidate_buffer: default_candidate_buffer(),
            restart_delay_ms: default_restart_delay_ms(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl TalkwireConfig {
    /// Validate configuration semantics beyond what serde can express.
    /// Returns a list of "ERROR:" / "WARNING:" issue strings; callers decide
    /// whether to abort on errors.
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
                    issues.push(format!("ERROR: tls_key '{}' does not exist.", key));
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

        // --- Candidate buffer ---
        if self.call.candidate_buffer == 0 {
            issues.push(
                "ERROR: call.candidate_buffer must be >= 1. Candidates arriving before \
                 the remote description would be dropped entirely."
                    .to_string(),
            );
        }

        // --- Restart delay ---
        if self.call.restart_delay_ms < 500 {
            issues.push(format!(
                "WARNING: call.restart_delay_ms is {} ms. Values under 500 ms fire the \
                 recovery check before transient ICE drops have a chance to self-heal.",
                self.call.restart_delay_ms
            ));
        }

        // --- Message size ---
        if self.call.max_message_size < 16 * 1024 {
            issues.push(format!(
                "ERROR: call.max_message_size must be at least 16384 bytes, got {}. \
                 SDP payloads regularly exceed smaller limits.",
                self.call.max_message_size
            ));
        }

        // --- STUN URLs ---
        for url in &self.ice.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!(
                    "ERROR: STUN URL '{}' must start with 'stun:' or 'stuns:'. \
                     Example: stun:stun.l.google.com:19302",
                    url
                ));
            }
        }

        // --- TURN URLs ---
        for url in &self.ice.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!(
                    "ERROR: TURN URL '{}' must start with 'turn:' or 'turns:'. \
                     Example: turn:turn.example.com:3478",
                    url
                ));
            }
        }
        if !self.ice.turn_urls.is_empty() && self.ice.turn_username.is_none() {
            issues.push(
                "WARNING: turn_urls configured without turn_username. Most TURN servers \
                 require long-term credentials."
                    .to_string(),
            );
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8443
}
fn default_candidate_buffer() -> usize {
    20
}
fn default_restart_delay_ms() -> u64 {
    2000
}
fn default_max_message_size() -> usize {
    256 * 1024 // SDP with many candidates can approach 100KB
}
fn default_stun_urls() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun1.l.google.com:19302".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config: TalkwireConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.call.candidate_buffer, 20);
        assert_eq!(config.call.restart_delay_ms, 2000);
        assert_eq!(config.ice.stun_urls.len(), 2);
        assert!(config.ice.turn_urls.is_empty());
        assert!(config.ice.turn_username.is_none());
    }

    #[test]
    fn validate_default_config_passes() {
        let config = TalkwireConfig::default();
        assert!(config.validate().is_ok(), "default config should validate");
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut config = TalkwireConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("ERROR:") && i.contains("port"))
        );
    }

    #[test]
    fn validate_rejects_zero_candidate_buffer() {
        let mut config = TalkwireConfig::default();
        config.call.candidate_buffer = 0;
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("ERROR:") && i.contains("candidate_buffer"))
        );
    }

    #[test]
    fn validate_warns_on_aggressive_restart_delay() {
        let mut config = TalkwireConfig::default();
        config.call.restart_delay_ms = 100;
        let issues = config.validate().unwrap_err();
        assert!(
            issues
                .iter()
                .any(|i| i.starts_with("WARNING:") && i.contains("restart_delay_ms"))
        );
    }

    #[test]
    fn validate_rejects_bad_stun_url() {
        let mut config = TalkwireConfig::default();
        config.ice.stun_urls = vec!["https://stun.example.com".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("STUN URL")));
    }

    #[test]
    fn validate_warns_on_turn_without_username() {
        let mut config = TalkwireConfig::default();
        config.ice.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("turn_username")));
    }

    #[test]
    fn config_parses_partial_toml() {
        let toml = r#"
[server]
port = 9000

[call]
restart_delay_ms = 3000
"#;
        let config: TalkwireConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.call.restart_delay_ms, 3000);
        // untouched sections keep defaults
        assert_eq!(config.call.candidate_buffer, 20);
        assert_eq!(config.ice.stun_urls.len(), 2);
    }
}
