//! Kafka settings for the job queue backend.
//!
//! [`KafkaConfig::from_env`] reads `KAFKA_*` variables over the defaults;
//! anything librdkafka supports beyond that goes through `extra_properties`.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Values accepted for librdkafka's `security.protocol`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    fn property(self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn has_sasl(self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            other => Err(ConfigError::Invalid {
                key: "KAFKA_SECURITY_PROTOCOL",
                reason: format!("unknown protocol '{other}'"),
            }),
        }
    }
}

/// How the client authenticates to the brokers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub protocol: SecurityProtocol,
    /// `PLAIN` when unset
    pub sasl_mechanism: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle used to verify the brokers
    pub ca_location: Option<String>,
}

/// Connection and tuning for the job topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    #[serde(default)]
    pub credentials: Credentials,
    /// Most messages handed out by one receive
    pub batch_size: usize,
    /// How long a receive waits to fill a batch
    pub receive_window_ms: u64,
    /// How long a send waits for the broker to confirm
    pub delivery_timeout_ms: u64,
    pub session_timeout_ms: u64,
    #[serde(default)]
    pub extra_properties: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "encore.audio.jobs".to_string(),
            group_id: "encore-audio-processor".to_string(),
            client_id: "encore-audio-processor".to_string(),
            credentials: Credentials::default(),
            batch_size: 10,
            receive_window_ms: 1_000,
            delivery_timeout_ms: 30_000,
            session_timeout_ms: 30_000,
            extra_properties: BTreeMap::new(),
        }
    }
}

fn parse_number<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
    })
}

impl KafkaConfig {
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Defaults overridden by `KAFKA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `KAFKA_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(brokers) = lookup("KAFKA_BROKERS").or_else(|| lookup("KAFKA_BOOTSTRAP_SERVERS")) {
            config.brokers = brokers;
        }
        if let Some(topic) = lookup("KAFKA_TOPIC") {
            config.topic = topic;
        }
        if let Some(group_id) = lookup("KAFKA_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(batch_size) = lookup("KAFKA_BATCH_SIZE") {
            config.batch_size = parse_number("KAFKA_BATCH_SIZE", &batch_size)?;
        }
        if let Some(window) = lookup("KAFKA_RECEIVE_WINDOW_MS") {
            config.receive_window_ms = parse_number("KAFKA_RECEIVE_WINDOW_MS", &window)?;
        }

        let credentials = &mut config.credentials;
        if let Some(protocol) = lookup("KAFKA_SECURITY_PROTOCOL") {
            credentials.protocol = protocol.parse()?;
        }
        credentials.sasl_mechanism = lookup("KAFKA_SASL_MECHANISM");
        credentials.username = lookup("KAFKA_SASL_USERNAME");
        credentials.password = lookup("KAFKA_SASL_PASSWORD");
        credentials.ca_location = lookup("KAFKA_SSL_CA_LOCATION");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.brokers.trim().is_empty() {
            return Err(ConfigError::Missing("brokers"));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Missing("topic"));
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Missing("group_id"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.credentials.protocol.has_sasl() && self.credentials.username.is_none() {
            return Err(ConfigError::Missing("SASL username"));
        }
        Ok(())
    }

    /// Settings shared by producer and consumer, with `extra_properties` last
    /// so they can override anything.
    fn client_config(&self, role: &[(&str, String)]) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("security.protocol", self.credentials.protocol.property());

        if let Some(ca) = &self.credentials.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if self.credentials.protocol.has_sasl() {
            config.set(
                "sasl.mechanism",
                self.credentials.sasl_mechanism.as_deref().unwrap_or("PLAIN"),
            );
            if let Some(username) = &self.credentials.username {
                config.set("sasl.username", username);
            }
            if let Some(password) = &self.credentials.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in role {
            config.set(*key, value);
        }
        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }
        config
    }

    /// Idempotent producer waiting on all in-sync replicas.
    pub fn producer_config(&self) -> ClientConfig {
        self.client_config(&[
            ("acks", "all".to_string()),
            ("enable.idempotence", "true".to_string()),
            ("message.timeout.ms", self.delivery_timeout_ms.to_string()),
        ])
    }

    /// Consumer that only commits explicitly, on acknowledge.
    pub fn consumer_config(&self) -> ClientConfig {
        self.client_config(&[
            ("group.id", self.group_id.clone()),
            ("auto.offset.reset", "earliest".to_string()),
            ("enable.auto.commit", "false".to_string()),
            ("session.timeout.ms", self.session_timeout_ms.to_string()),
        ])
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn receive_window(&self) -> Duration {
        Duration::from_millis(self.receive_window_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = KafkaConfig::default();
        assert_eq!(config.topic, "encore.audio.jobs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides_defaults() {
        let config = KafkaConfig::from_lookup(lookup(&[
            ("KAFKA_BOOTSTRAP_SERVERS", "kafka-1:9092,kafka-2:9092"),
            ("KAFKA_TOPIC", "jobs"),
            ("KAFKA_BATCH_SIZE", "25"),
        ]))
        .unwrap();

        assert_eq!(config.brokers, "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.topic, "jobs");
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.group_id, "encore-audio-processor");
    }

    #[test]
    fn test_lookup_rejects_bad_values() {
        assert!(matches!(
            KafkaConfig::from_lookup(lookup(&[("KAFKA_BATCH_SIZE", "many")])),
            Err(ConfigError::Invalid { key: "KAFKA_BATCH_SIZE", .. })
        ));
        assert!(matches!(
            KafkaConfig::from_lookup(lookup(&[("KAFKA_SECURITY_PROTOCOL", "carrier-pigeon")])),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            KafkaConfig::from_lookup(lookup(&[("KAFKA_SECURITY_PROTOCOL", "SASL_SSL")])),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_consumer_commits_manually() {
        let config = KafkaConfig::new("broker:9092").consumer_config();
        assert_eq!(config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("encore-audio-processor"));
    }

    #[test]
    fn test_sasl_settings_only_with_sasl_protocol() {
        let plain = KafkaConfig::default().producer_config();
        assert!(plain.get("sasl.mechanism").is_none());
        assert_eq!(plain.get("acks"), Some("all"));

        let mut config = KafkaConfig::default();
        config.credentials = Credentials {
            protocol: SecurityProtocol::SaslSsl,
            username: Some("encore".to_string()),
            password: Some("secret".to_string()),
            ..Credentials::default()
        };
        config
            .extra_properties
            .insert("acks".to_string(), "1".to_string());

        let producer = config.producer_config();
        assert_eq!(producer.get("sasl.mechanism"), Some("PLAIN"));
        assert_eq!(producer.get("sasl.username"), Some("encore"));
        assert_eq!(producer.get("acks"), Some("1"));
    }
}
