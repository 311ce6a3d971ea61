//! Broker Abstraction
//!
//! The core treats the broker as an abstract capability: durable queues,
//! topic subscriptions and per-message ACK/NACK. Two backends implement it:
//! an in-process `dev` hub used by tests and local development, and an MQTT
//! backend over rumqttc for real transports. Wire encoding stays behind
//! this boundary.

pub mod dev;
pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::message::AckHandle;

pub use topic::TopicFilter;

/// How a session behaves when the transport drops.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionStrategy {
    /// Keep retrying with the configured interval until the connection
    /// returns.
    #[default]
    ForeverRetry,

    /// Retry up to `retry_count` times, then give up and surface the
    /// failure.
    ParametrizedRetry,
}

/// Connection settings shared by every backend.
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerConnectionConfig {
    /// Backend selector: `dev` or `mqtt`.
    #[serde(default = "default_broker_type")]
    pub broker_type: String,

    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub vpn: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub reconnection_strategy: ReconnectionStrategy,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_retry_count")]
    pub retry_count: u32,

    #[serde(default)]
    pub trust_store_path: Option<String>,

    /// How many times a NACKed message is redelivered before the broker
    /// drops it.
    #[serde(default = "default_max_redelivery_count")]
    pub max_redelivery_count: u32,
}

impl Default for BrokerConnectionConfig {
    fn default() -> Self {
        Self {
            broker_type: default_broker_type(),
            url: default_url(),
            vpn: None,
            username: None,
            password: None,
            reconnection_strategy: ReconnectionStrategy::default(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_count: default_retry_count(),
            trust_store_path: None,
            max_redelivery_count: default_max_redelivery_count(),
        }
    }
}

const fn default_max_redelivery_count() -> u32 {
    3
}

fn default_broker_type() -> String {
    "dev".to_string()
}

fn default_url() -> String {
    "dev://local".to_string()
}

const fn default_retry_interval_ms() -> u64 {
    3000
}

const fn default_retry_count() -> u32 {
    10
}

/// A message delivered by the broker, with its one-shot settlement handle.
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub user_properties: Map<String, Value>,
    pub ack: AckHandle,
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// The capability surface the core consumes. All operations are keyed by
/// names, never by backend handles, so sessions stay trivially shareable
/// behind an `Arc`.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Create a queue; idempotent, may no-op for backends without queues.
    async fn create_queue(&self, name: &str, durable: bool) -> Result<(), ProcessingError>;

    /// Bind topic subscriptions to a queue.
    async fn bind_subscriptions(
        &self,
        queue: &str,
        topics: &[TopicFilter],
    ) -> Result<(), ProcessingError>;

    /// Receive the next message from a queue. Blocks until a message
    /// arrives or the session closes.
    async fn receive(&self, queue: &str) -> Result<ReceivedMessage, ProcessingError>;

    /// Publish raw bytes on a topic.
    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        user_properties: &Map<String, Value>,
    ) -> Result<(), ProcessingError>;

    /// Subscribe directly to a topic, bypassing queues; used by the
    /// request/response reply listeners.
    async fn subscribe(
        &self,
        topic: &TopicFilter,
    ) -> Result<flume::Receiver<ReceivedMessage>, ProcessingError>;

    /// Tear down the session, releasing queues and subscriptions it
    /// created.
    async fn close(&self) -> Result<(), ProcessingError>;
}

/// Open a session against the configured backend.
pub async fn connect(
    config: &BrokerConnectionConfig,
) -> anyhow::Result<Arc<dyn BrokerSession>> {
    match config.broker_type.as_str() {
        "dev" => {
            let session: Arc<dyn BrokerSession> = dev::DevSession::connect(config);
            Ok(session)
        }
        "mqtt" => mqtt::MqttSession::connect(config).await,
        other => Err(anyhow::anyhow!("unknown broker type '{}'", other)),
    }
}
