//! Producer and consumer configuration.
//!
//! Configs are built in code with `new` plus `with_*` setters, or deserialized
//! from a service's config file. Durations are expressed in milliseconds in
//! serialized form (`*_ms` keys).

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::breaker::BreakerSettings;
use crate::error::{KafkaError, Result};

/// Acknowledgement level the producer waits for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredAcks {
    None,
    Leader,
    /// Wait for every in-sync replica. Required for financial events.
    #[default]
    All,
}

impl RequiredAcks {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "0",
            Self::Leader => "1",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }
}

/// Where a group starts reading a partition that has no committed offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Latest,
    Earliest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Earliest => "earliest",
        }
    }
}

/// Partition assignment strategy. Both are eager: every rebalance revokes the
/// whole assignment, which is what the generation model relies on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RebalanceStrategy {
    Range,
    #[default]
    RoundRobin,
}

impl RebalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Range => "range",
            Self::RoundRobin => "roundrobin",
        }
    }
}

/// Configuration for the Kafka producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducerConfig {
    /// Kafka bootstrap brokers.
    pub brokers: Vec<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub required_acks: RequiredAcks,

    /// Retries the client performs for a single send.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// How long the client batches before flushing.
    #[serde(
        default = "default_flush_interval",
        with = "duration_ms",
        rename = "flush_interval_ms"
    )]
    pub flush_interval: Duration,

    /// Messages per batch that trigger a flush.
    #[serde(default = "default_flush_messages")]
    pub flush_messages: u32,

    #[serde(default)]
    pub compression: Compression,

    /// Idempotent delivery. Requires `max_in_flight == 1` and `RequiredAcks::All`.
    #[serde(default = "default_true")]
    pub idempotent: bool,

    /// Unacknowledged requests per broker connection.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,

    /// Upper bound on one send, retries included.
    #[serde(
        default = "default_delivery_timeout",
        with = "duration_ms",
        rename = "delivery_timeout_ms"
    )]
    pub delivery_timeout: Duration,

    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Raw librdkafka properties applied last (security settings and the like).
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl ProducerConfig {
    /// Creates a producer configuration with the banking defaults: all-replica
    /// acks, idempotent single in-flight delivery, 5 retries, gzip, 100 ms /
    /// 100 message flushes.
    pub fn new<I>(brokers: I, client_id: impl Into<String>) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            client_id: client_id.into(),
            required_acks: RequiredAcks::All,
            retry_max: default_retry_max(),
            flush_interval: default_flush_interval(),
            flush_messages: default_flush_messages(),
            compression: Compression::default(),
            idempotent: true,
            max_in_flight: default_max_in_flight(),
            delivery_timeout: default_delivery_timeout(),
            breaker: BreakerSettings::default(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_required_acks(mut self, acks: RequiredAcks) -> Self {
        self.required_acks = acks;
        self
    }

    pub fn with_retry_max(mut self, retries: u32) -> Self {
        self.retry_max = retries;
        self
    }

    /// Sets the flush interval and batch size.
    pub fn with_flush(mut self, interval: Duration, messages: u32) -> Self {
        self.flush_interval = interval;
        self.flush_messages = messages;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Enables or disables idempotent delivery.
    pub fn with_idempotence(mut self, enabled: bool) -> Self {
        self.idempotent = enabled;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: u32) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    /// Sets a raw librdkafka property.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Checks the delivery invariants.
    ///
    /// # Errors
    ///
    /// Returns [`KafkaError::Config`] when no broker is set, when the batch
    /// size is zero, or when idempotence is enabled without a single in-flight
    /// request and all-replica acks.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(KafkaError::Config("producer needs at least one broker".into()));
        }
        if self.flush_messages == 0 {
            return Err(KafkaError::Config("flush_messages must be positive".into()));
        }
        if self.idempotent {
            if self.max_in_flight != 1 {
                return Err(KafkaError::Config(format!(
                    "idempotent delivery requires max_in_flight = 1, got {}",
                    self.max_in_flight
                )));
            }
            if self.required_acks != RequiredAcks::All {
                return Err(KafkaError::Config(
                    "idempotent delivery requires required_acks = all".into(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the rdkafka client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("client.id", &self.client_id)
            .set("acks", self.required_acks.as_str())
            .set("retries", self.retry_max.to_string())
            .set("linger.ms", self.flush_interval.as_millis().to_string())
            .set("batch.num.messages", self.flush_messages.to_string())
            .set("compression.type", self.compression.as_str())
            .set("enable.idempotence", self.idempotent.to_string())
            .set(
                "max.in.flight.requests.per.connection",
                self.max_in_flight.to_string(),
            )
            .set(
                "message.timeout.ms",
                self.delivery_timeout.as_millis().to_string(),
            );

        for (key, value) in &self.overrides {
            client_config.set(key, value);
        }
        client_config
    }
}

/// Configuration for the Kafka consumer group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Kafka bootstrap brokers.
    pub brokers: Vec<String>,

    /// Consumer group ID.
    pub group_id: String,

    /// Topics the group subscribes to.
    #[serde(default)]
    pub topics: Vec<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub offset_reset: OffsetReset,

    #[serde(default)]
    pub rebalance_strategy: RebalanceStrategy,

    #[serde(
        default = "default_session_timeout",
        with = "duration_ms",
        rename = "session_timeout_ms"
    )]
    pub session_timeout: Duration,

    /// First delay before rejoining after a failed join.
    #[serde(
        default = "default_initial_backoff",
        with = "duration_ms",
        rename = "initial_backoff_ms"
    )]
    pub initial_backoff: Duration,

    /// Cap for the rejoin and handler retry backoff.
    #[serde(
        default = "default_max_backoff",
        with = "duration_ms",
        rename = "max_backoff_ms"
    )]
    pub max_backoff: Duration,

    /// In-place retries of a failing handler before the message is left
    /// uncommitted. Zero disables retries.
    #[serde(default)]
    pub handler_retries: u32,

    /// Buffered messages per partition before that partition is paused.
    #[serde(default = "default_max_partition_backlog")]
    pub max_partition_backlog: usize,

    /// Raw librdkafka properties applied last.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

impl ConsumerConfig {
    /// Creates a new consumer configuration.
    ///
    /// # Arguments
    ///
    /// * `brokers` - Kafka bootstrap brokers
    /// * `group_id` - Consumer group ID
    pub fn new<I>(brokers: I, group_id: impl Into<String>) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            group_id: group_id.into(),
            topics: Vec::new(),
            client_id: default_client_id(),
            offset_reset: OffsetReset::default(),
            rebalance_strategy: RebalanceStrategy::default(),
            session_timeout: default_session_timeout(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            handler_retries: 0,
            max_partition_backlog: default_max_partition_backlog(),
            overrides: BTreeMap::new(),
        }
    }

    /// Sets the subscribed topics.
    pub fn with_topics<I>(mut self, topics: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.offset_reset = reset;
        self
    }

    pub fn with_rebalance_strategy(mut self, strategy: RebalanceStrategy) -> Self {
        self.rebalance_strategy = strategy;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets how many times a failing handler is retried in place.
    pub fn with_handler_retries(mut self, retries: u32) -> Self {
        self.handler_retries = retries;
        self
    }

    pub fn with_max_partition_backlog(mut self, backlog: usize) -> Self {
        self.max_partition_backlog = backlog;
        self
    }

    /// Sets a raw librdkafka property.
    pub fn with_override(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// # Errors
    ///
    /// Returns [`KafkaError::Config`] when brokers, group id or topics are
    /// missing.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() {
            return Err(KafkaError::Config("consumer needs at least one broker".into()));
        }
        if self.group_id.is_empty() {
            return Err(KafkaError::Config("consumer group id is empty".into()));
        }
        if self.topics.is_empty() {
            return Err(KafkaError::Config("consumer has no topics".into()));
        }
        if self.max_partition_backlog == 0 {
            return Err(KafkaError::Config("max_partition_backlog must be positive".into()));
        }
        Ok(())
    }

    /// Builds the rdkafka client configuration.
    ///
    /// Offsets are stored explicitly for handled messages only and committed
    /// in the background, so an unhandled message is never committed.
    pub fn to_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.group_id)
            .set("client.id", &self.client_id)
            .set("enable.auto.commit", "true")
            .set("auto.commit.interval.ms", "1000")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set(
                "partition.assignment.strategy",
                self.rebalance_strategy.as_str(),
            )
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false");

        for (key, value) in &self.overrides {
            client_config.set(key, value);
        }
        client_config
    }
}

fn default_client_id() -> String {
    "banking-kafka".to_string()
}

fn default_retry_max() -> u32 {
    5
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_flush_messages() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_max_in_flight() -> u32 {
    1
}

fn default_delivery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_session_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_max_partition_backlog() -> usize {
    1000
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_producer_config() {
        let cfg = ProducerConfig::new(["localhost:9092"], "test-client");

        assert_eq!(cfg.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(cfg.client_id, "test-client");
        assert_eq!(cfg.required_acks, RequiredAcks::All);
        assert_eq!(cfg.flush_interval, Duration::from_millis(100));
        assert_eq!(cfg.retry_max, 5);
        assert!(cfg.idempotent);
        assert_eq!(cfg.max_in_flight, 1);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_idempotence_requires_single_in_flight() {
        let cfg = ProducerConfig::new(["localhost:9092"], "c").with_max_in_flight(5);
        assert!(matches!(cfg.validate(), Err(KafkaError::Config(_))));

        let cfg = cfg.with_idempotence(false);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_idempotence_requires_all_acks() {
        let cfg = ProducerConfig::new(["localhost:9092"], "c").with_required_acks(RequiredAcks::Leader);
        assert!(matches!(cfg.validate(), Err(KafkaError::Config(_))));
    }

    #[test]
    fn test_producer_without_brokers_is_invalid() {
        let cfg = ProducerConfig::new(Vec::<String>::new(), "c");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_producer_client_config() {
        let cfg = ProducerConfig::new(["kafka-0:9092", "kafka-1:9092"], "payments")
            .with_compression(Compression::Zstd)
            .with_override("security.protocol", "ssl");
        let client = cfg.to_client_config();

        assert_eq!(client.get("bootstrap.servers"), Some("kafka-0:9092,kafka-1:9092"));
        assert_eq!(client.get("acks"), Some("all"));
        assert_eq!(client.get("enable.idempotence"), Some("true"));
        assert_eq!(client.get("max.in.flight.requests.per.connection"), Some("1"));
        assert_eq!(client.get("compression.type"), Some("zstd"));
        assert_eq!(client.get("linger.ms"), Some("100"));
        assert_eq!(client.get("security.protocol"), Some("ssl"));
    }

    #[test]
    fn test_producer_config_deserialize_defaults() {
        let cfg: ProducerConfig =
            serde_json::from_str(r#"{"brokers": ["kafka:9092"], "flush_interval_ms": 250}"#)
                .unwrap();
        assert_eq!(cfg.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.required_acks, RequiredAcks::All);
        assert_eq!(cfg.compression, Compression::Gzip);
        assert_eq!(cfg.breaker.name, "kafka-producer");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_consumer_config_validation() {
        let cfg = ConsumerConfig::new(["localhost:9092"], "ledger");
        assert!(matches!(cfg.validate(), Err(KafkaError::Config(_))));

        let cfg = cfg.with_topics(["banking.transactions.initiated"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_consumer_client_config() {
        let cfg = ConsumerConfig::new(["localhost:9092"], "ledger")
            .with_topics(["banking.audit.log"])
            .with_offset_reset(OffsetReset::Earliest)
            .with_rebalance_strategy(RebalanceStrategy::Range);
        let client = cfg.to_client_config();

        assert_eq!(client.get("group.id"), Some("ledger"));
        assert_eq!(client.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client.get("partition.assignment.strategy"), Some("range"));
        assert_eq!(client.get("enable.auto.offset.store"), Some("false"));
    }

    #[test]
    fn test_consumer_config_deserialize_defaults() {
        let json = r#"{"brokers": ["kafka:9092"], "group_id": "g", "topics": ["t"]}"#;
        let cfg: ConsumerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.offset_reset, OffsetReset::Latest);
        assert_eq!(cfg.rebalance_strategy, RebalanceStrategy::RoundRobin);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(100));
        assert_eq!(cfg.max_backoff, Duration::from_secs(30));
        assert_eq!(cfg.handler_retries, 0);
    }
}
