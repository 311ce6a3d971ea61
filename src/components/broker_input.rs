use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};

use crate::broker::{self, BrokerConnectionConfig, BrokerSession, TopicFilter};
use crate::components::component::{Component, StageContext};
use crate::components::factory::{ComponentMetadata, ConfigField};
use crate::config::ComponentConfig;
use crate::error::ProcessingError;
use crate::message::codec::{self, PayloadEncoding, PayloadFormat};
use crate::message::Message;

/// Typed configuration of the broker ingress.
#[derive(Clone, Debug)]
pub struct BrokerInputConfig {
    pub connection: BrokerConnectionConfig,
    pub queue_name: String,
    pub create_queue_on_start: bool,
    pub subscriptions: Vec<TopicFilter>,
    pub payload_encoding: PayloadEncoding,
    pub payload_format: PayloadFormat,
}

#[derive(Deserialize)]
struct RawBrokerInputConfig {
    #[serde(flatten)]
    connection: BrokerConnectionConfig,
    queue_name: String,
    #[serde(default = "default_true")]
    create_queue_on_start: bool,
    #[serde(default)]
    subscriptions: Vec<String>,
    #[serde(default)]
    payload_encoding: PayloadEncoding,
    #[serde(default)]
    payload_format: PayloadFormat,
}

const fn default_true() -> bool {
    true
}

impl ComponentConfig for BrokerInputConfig {
    fn from_component_config(config: &Map<String, Value>) -> anyhow::Result<Self> {
        let raw: RawBrokerInputConfig =
            serde_json::from_value(Value::Object(config.clone()))
                .map_err(|e| anyhow::anyhow!("broker_input configuration invalid: {}", e))?;
        let subscriptions = raw
            .subscriptions
            .iter()
            .map(|topic| TopicFilter::parse(topic).map_err(anyhow::Error::from))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let parsed = Self {
            connection: raw.connection,
            queue_name: raw.queue_name,
            create_queue_on_start: raw.create_queue_on_start,
            subscriptions,
            payload_encoding: raw.payload_encoding,
            payload_format: raw.payload_format,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.queue_name.is_empty() {
            return Err(anyhow::anyhow!("queue_name cannot be empty"));
        }
        Ok(())
    }
}

/// Broker ingress: binds a queue, receives deliveries, decodes payloads
/// and attaches the ACK pair that settles each delivery with the broker
/// once the pipeline is done with it.
pub struct BrokerInput {
    name: String,
    config: BrokerInputConfig,
    session: OnceLock<Arc<dyn BrokerSession>>,
    owns_session: bool,
}

impl BrokerInput {
    pub fn from_config(
        name: &str,
        config: &Map<String, Value>,
    ) -> anyhow::Result<Arc<dyn Component>> {
        let config = BrokerInputConfig::from_component_config(config)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            session: OnceLock::new(),
            owns_session: true,
        }))
    }

    /// Synthesis path: the simplified app shares its already-open session,
    /// and keeps ownership of it.
    pub fn with_session(
        name: &str,
        config: BrokerInputConfig,
        session: Arc<dyn BrokerSession>,
    ) -> Arc<Self> {
        let slot = OnceLock::new();
        let _ = slot.set(session);
        Arc::new(Self {
            name: name.to_string(),
            config,
            session: slot,
            owns_session: false,
        })
    }

    pub fn metadata() -> ComponentMetadata {
        ComponentMetadata {
            description: "broker ingress feeding a flow from a queue",
            config_schema: vec![
                ConfigField {
                    name: "queue_name",
                    field_type: "string",
                    required: true,
                    default: None,
                    description: "queue the flow consumes from",
                },
                ConfigField {
                    name: "create_queue_on_start",
                    field_type: "bool",
                    required: false,
                    default: Some(Value::Bool(true)),
                    description: "provision the queue at startup",
                },
                ConfigField {
                    name: "subscriptions",
                    field_type: "list[string]",
                    required: false,
                    default: None,
                    description: "topic subscriptions bound to the queue",
                },
            ],
            ..Default::default()
        }
    }

    fn session(&self) -> Result<&Arc<dyn BrokerSession>, ProcessingError> {
        self.session
            .get()
            .ok_or_else(|| ProcessingError::Broker("broker_input session not started".into()))
    }
}

#[async_trait]
impl Component for BrokerInput {
    async fn start(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        if self.session.get().is_none() {
            let session = broker::connect(&self.config.connection).await?;
            let _ = self.session.set(session);
        }
        let session = self.session.get().expect("session just set");

        if self.config.create_queue_on_start {
            session.create_queue(&self.config.queue_name, true).await?;
        }
        if !self.config.subscriptions.is_empty() {
            session
                .bind_subscriptions(&self.config.queue_name, &self.config.subscriptions)
                .await?;
        }
        tracing::info!(
            "broker_input '{}' bound to queue '{}' ({} subscription(s))",
            self.name,
            self.config.queue_name,
            self.config.subscriptions.len()
        );
        Ok(())
    }

    fn is_source(&self) -> bool {
        true
    }

    async fn produce(&self, _ctx: &StageContext) -> Result<Option<Message>, ProcessingError> {
        let session = self.session()?;
        let received = session.receive(&self.config.queue_name).await?;

        let payload = codec::decode_payload(
            &received.payload,
            self.config.payload_encoding,
            self.config.payload_format,
        );
        let mut message = Message::new(&received.topic, payload)
            .with_user_properties(received.user_properties);
        message.push_ack(received.ack);

        tracing::debug!("broker_input '{}' received on '{}'", self.name, message.topic);
        Ok(Some(message))
    }

    async fn invoke(
        &self,
        _ctx: &StageContext,
        _message: &mut Message,
        data: Value,
    ) -> Result<Option<Value>, ProcessingError> {
        // Sources are driven through `produce`; invoke is a plain forward.
        Ok(Some(data))
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.owns_session
            && let Some(session) = self.session.get()
        {
            session.close().await?;
        }
        Ok(())
    }
}
