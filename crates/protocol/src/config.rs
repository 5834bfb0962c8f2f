//! Configuration surface for the broadcast relay: the broker client, topic
//! routing, WebRTC ICE servers, and the HTTP bind address.

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicsConfig,
    #[serde(default)]
    pub webrtc: WebrtcConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: TopicsConfig::default(),
            webrtc: WebrtcConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_server")]
    pub server: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            server: default_broker_server(),
            client_id: default_client_id(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicsConfig {
    #[serde(default = "default_offer_topic")]
    pub offer: String,
    #[serde(default = "default_answer_prefix")]
    pub answer_prefix: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default)]
    pub retained: bool,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            offer: default_offer_topic(),
            answer_prefix: default_answer_prefix(),
            qos: default_qos(),
            retained: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebrtcConfig {
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerEntry>,
    #[serde(default)]
    pub enable_frontend: bool,
}

impl Default for WebrtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            enable_frontend: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_broker_server() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "broadcast-relay".to_string()
}

fn default_offer_topic() -> String {
    "/edge/livestream/signal/offer".to_string()
}

fn default_answer_prefix() -> String {
    "/edge/livestream/signal/answer".to_string()
}

fn default_qos() -> u8 {
    1
}

fn default_ice_servers() -> Vec<IceServerEntry> {
    vec![IceServerEntry {
        url: "stun:stun.l.google.com:19302".to_string(),
        username: String::new(),
        credential: String::new(),
    }]
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl RelayConfig {
    /// Collect `"ERROR: ..."` / `"WARNING: ..."` issue strings. An empty result means the
    /// config is safe to run with; any `"ERROR"` entry should abort startup.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push("ERROR: server.port must not be 0".to_string());
        }

        if self.broker.server.trim().is_empty() {
            issues.push("ERROR: broker.server must not be empty".to_string());
        }

        if self.topics.offer.trim().is_empty() {
            issues.push("ERROR: topics.offer must not be empty".to_string());
        }

        if self.topics.answer_prefix.trim().is_empty() {
            issues.push("WARNING: topics.answer_prefix is empty, answer topics will start with '/'".to_string());
        }

        if self.topics.qos > 2 {
            issues.push(format!(
                "WARNING: topics.qos={} is outside the valid MQTT range 0-2",
                self.topics.qos
            ));
        }

        for entry in &self.webrtc.ice_servers {
            let has_scheme = entry.url.starts_with("stun:")
                || entry.url.starts_with("turn:")
                || entry.url.starts_with("turns:");
            if !has_scheme {
                issues.push(format!(
                    "ERROR: webrtc.ice_servers url '{}' is missing a stun:/turn:/turns: scheme",
                    entry.url
                ));
            }
        }

        if issues.iter().any(|issue| issue.starts_with("ERROR")) {
            Err(issues)
        } else if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> RelayConfig {
        RelayConfig::default()
    }

    fn validate_issues(config: &RelayConfig) -> Vec<String> {
        match config.validate() {
            Ok(()) => Vec::new(),
            Err(issues) => issues,
        }
    }

    fn has_error(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("ERROR"))
    }

    fn has_warning(issues: &[String]) -> bool {
        issues.iter().any(|i| i.starts_with("WARNING"))
    }

    #[test]
    fn default_config_from_empty_string() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.topics.offer, "/edge/livestream/signal/offer");
    }

    #[test]
    fn default_trait_produces_valid_configs() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_only_broker_section() {
        let toml_str = r#"
            [broker]
            server = "tcp://broker.internal:1883"
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.broker.server, "tcp://broker.internal:1883");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 9443

            [topics]
            offer = "/custom/offer"
            qos = 2
            retained = true
        "#;
        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.topics.offer, "/custom/offer");
        assert!(config.topics.retained);
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(has_error(&validate_issues(&config)));
    }

    #[test]
    fn validate_rejects_empty_broker_server() {
        let mut config = valid_config();
        config.broker.server = String::new();
        assert!(has_error(&validate_issues(&config)));
    }

    #[test]
    fn validate_rejects_empty_offer_topic() {
        let mut config = valid_config();
        config.topics.offer = "   ".to_string();
        assert!(has_error(&validate_issues(&config)));
    }

    #[test]
    fn validate_warns_on_empty_answer_prefix() {
        let mut config = valid_config();
        config.topics.answer_prefix = String::new();
        let issues = validate_issues(&config);
        assert!(has_warning(&issues));
        assert!(!has_error(&issues));
    }

    #[test]
    fn validate_warns_on_out_of_range_qos() {
        let mut config = valid_config();
        config.topics.qos = 3;
        let issues = validate_issues(&config);
        assert!(has_warning(&issues));
        assert!(!has_error(&issues));
    }

    #[test]
    fn validate_rejects_ice_server_without_scheme() {
        let mut config = valid_config();
        config.webrtc.ice_servers = vec![IceServerEntry {
            url: "stun.l.google.com:19302".to_string(),
            username: String::new(),
            credential: String::new(),
        }];
        assert!(has_error(&validate_issues(&config)));
    }

    #[test]
    fn validate_accepts_turn_scheme() {
        let mut config = valid_config();
        config.webrtc.ice_servers.push(IceServerEntry {
            url: "turn:turn.example.com:3478".to_string(),
            username: "user".to_string(),
            credential: "pass".to_string(),
        });
        assert!(config.validate().is_ok());
    }
}
