//! Kafka and worker configuration for the activity pipeline.
//!
//! `KafkaConfig` turns into rdkafka `ClientConfig`s for the producer, the
//! consumer and the admin client. `WorkerConfig` is the full configuration of
//! the `activity-worker` binary, layered with the `config` crate.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use vault_activity::config::ConfigError;
use vault_activity::{AggregationConfig, DatabaseConfig, RedisConfig};

/// Security protocol for Kafka connections
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    fn uses_sasl(&self) -> bool {
        matches!(
            self,
            SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl
        )
    }
}

/// SASL mechanism for authentication
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaslMechanism {
    #[default]
    Plain,
    ScramSha256,
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// SSL/TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    /// Path to CA certificate file
    pub ca_location: Option<String>,
    /// Path to client certificate file
    pub certificate_location: Option<String>,
    /// Path to client private key file
    pub key_location: Option<String>,
    /// Private key password
    pub key_password: Option<String>,
    /// Enable certificate verification
    #[serde(default = "default_true")]
    pub enable_verification: bool,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            ca_location: None,
            certificate_location: None,
            key_location: None,
            key_password: None,
            enable_verification: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// SASL authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Activity topic and how it is declared at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_activity_topic")]
    pub activity: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

fn default_activity_topic() -> String {
    "vault.activity".to_string()
}

fn default_partitions() -> i32 {
    6
}

fn default_replication_factor() -> i32 {
    1
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            activity: default_activity_topic(),
            partitions: default_partitions(),
            replication_factor: default_replication_factor(),
        }
    }
}

/// Consumer-side settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Consumer group shared by all workers
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Auto offset reset: earliest, latest, none
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Messages buffered locally per partition before the handler sees them
    #[serde(default = "default_prefetch")]
    pub prefetch: u32,
    /// Number of consumer loops in this process
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Pause after a requeue before the same partition is read again
    #[serde(default = "default_requeue_backoff_ms")]
    pub requeue_backoff_ms: u64,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,
    /// Maximum poll interval in milliseconds
    #[serde(default = "default_max_poll_interval")]
    pub max_poll_interval_ms: u64,
}

fn default_group_id() -> String {
    "vault-activity-aggregator".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_prefetch() -> u32 {
    16
}

fn default_workers() -> usize {
    1
}

fn default_requeue_backoff_ms() -> u64 {
    1000
}

fn default_session_timeout() -> u64 {
    30000
}

fn default_max_poll_interval() -> u64 {
    300000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            auto_offset_reset: default_auto_offset_reset(),
            prefetch: default_prefetch(),
            workers: default_workers(),
            requeue_backoff_ms: default_requeue_backoff_ms(),
            session_timeout_ms: default_session_timeout(),
            max_poll_interval_ms: default_max_poll_interval(),
        }
    }
}

/// Kafka connection, topic and consumer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Client ID for this connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security_protocol: SecurityProtocol,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub sasl: SaslConfig,
    /// Publish confirmation and admin request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Compression type: none, gzip, snappy, lz4, zstd
    #[serde(default = "default_compression")]
    pub compression_type: String,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Additional librdkafka properties
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_client_id() -> String {
    "vault-activity".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_compression() -> String {
    "lz4".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            client_id: default_client_id(),
            security_protocol: SecurityProtocol::default(),
            ssl: SslConfig::default(),
            sasl: SaslConfig::default(),
            request_timeout_ms: default_request_timeout_ms(),
            compression_type: default_compression(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    fn build_base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("client.id", &self.client_id);
        config.set("security.protocol", self.security_protocol.as_str());

        // SSL configuration
        if let Some(ref ca) = self.ssl.ca_location {
            config.set("ssl.ca.location", ca);
        }
        if let Some(ref cert) = self.ssl.certificate_location {
            config.set("ssl.certificate.location", cert);
        }
        if let Some(ref key) = self.ssl.key_location {
            config.set("ssl.key.location", key);
        }
        if let Some(ref password) = self.ssl.key_password {
            config.set("ssl.key.password", password);
        }
        if !self.ssl.enable_verification {
            config.set("enable.ssl.certificate.verification", "false");
        }

        // SASL configuration
        if self.security_protocol.uses_sasl() {
            config.set("sasl.mechanism", self.sasl.mechanism.as_str());
            if let Some(ref username) = self.sasl.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = self.sasl.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    /// Producer waits for all in-sync replicas and never duplicates on retry
    pub fn build_producer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("acks", "all");
        config.set("enable.idempotence", "true");
        config.set("message.timeout.ms", self.request_timeout_ms.to_string());
        config.set("request.timeout.ms", self.request_timeout_ms.to_string());
        config.set("compression.type", &self.compression_type);

        config
    }

    /// Consumer with manual commits, one commit per handled message
    pub fn build_consumer_config(&self) -> ClientConfig {
        let mut config = self.build_base_config();

        config.set("group.id", &self.consumer.group_id);
        config.set("auto.offset.reset", &self.consumer.auto_offset_reset);
        config.set("enable.auto.commit", "false");
        config.set("enable.auto.offset.store", "false");
        config.set("queued.min.messages", self.prefetch().to_string());
        config.set(
            "session.timeout.ms",
            self.consumer.session_timeout_ms.to_string(),
        );
        config.set(
            "max.poll.interval.ms",
            self.consumer.max_poll_interval_ms.to_string(),
        );

        config
    }

    pub fn build_admin_config(&self) -> ClientConfig {
        self.build_base_config()
    }

    /// Local prefetch; zero means one
    pub fn prefetch(&self) -> u32 {
        self.consumer.prefetch.max(1)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn requeue_backoff(&self) -> Duration {
        Duration::from_millis(self.consumer.requeue_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.bootstrap_servers".to_string(),
            ));
        }

        if self.consumer.group_id.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.consumer.group_id".to_string(),
            ));
        }

        if self.topics.activity.is_empty() {
            return Err(ConfigError::MissingRequired(
                "kafka.topics.activity".to_string(),
            ));
        }

        if self.consumer.workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "kafka.consumer.workers".to_string(),
                message: "at least one worker is required".to_string(),
            });
        }

        if self.topics.partitions <= 0 || self.topics.replication_factor <= 0 {
            return Err(ConfigError::InvalidValue {
                key: "kafka.topics".to_string(),
                message: "partitions and replication_factor must be positive".to_string(),
            });
        }

        if self.security_protocol.uses_sasl() && self.sasl.username.is_none() {
            return Err(ConfigError::MissingRequired(
                "kafka.sasl.username (required for SASL)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_service_name() -> String {
    "activity-worker".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

/// Full configuration of the activity worker
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub kafka: KafkaConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
}

impl WorkerConfig {
    /// Load from defaults, optional config files and `ACTIVITY__*` variables
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", default_service_name())?
            .set_default("service.log_level", default_log_level())?
            .set_default("service.metrics_port", default_metrics_port())?
            .add_source(config::File::with_name("config/activity-worker").required(false))
            .add_source(config::File::with_name("/etc/vault/activity-worker").required(false))
            // ACTIVITY__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("ACTIVITY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kafka.validate()?;
        self.database.validate()?;
        self.redis.validate()?;
        self.aggregation.validate()
    }
}
