use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, OnceLock};
use tokio::time::Duration;

use crate::broker::{self, BrokerConnectionConfig, BrokerSession};
use crate::components::component::{Component, StageContext};
use crate::components::factory::{ComponentMetadata, ConfigField};
use crate::config::ComponentConfig;
use crate::error::ProcessingError;
use crate::message::codec::{self, PayloadEncoding, PayloadFormat};
use crate::message::Message;

/// What happens to the upstream ACK when a publish keeps failing.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailurePolicy {
    /// Retry forever; the upstream ACK is held until the publish lands.
    Hold,

    /// After `publish_retry_count` failures, fail the message so its ACK
    /// callbacks resolve as failure (default).
    #[default]
    NackAfterN,

    /// After `publish_retry_count` failures, log and release the message
    /// as handled.
    DropAfterN,
}

#[derive(Clone, Debug)]
pub struct BrokerOutputConfig {
    pub connection: BrokerConnectionConfig,
    pub payload_encoding: PayloadEncoding,
    pub payload_format: PayloadFormat,
    pub propagate_acknowledgements: bool,
    pub publish_failure_policy: PublishFailurePolicy,
    pub publish_retry_count: u32,
    pub default_topic: Option<String>,
}

#[derive(Deserialize)]
struct RawBrokerOutputConfig {
    #[serde(flatten)]
    connection: BrokerConnectionConfig,
    #[serde(default)]
    payload_encoding: PayloadEncoding,
    #[serde(default)]
    payload_format: PayloadFormat,
    #[serde(default = "default_true")]
    propagate_acknowledgements: bool,
    #[serde(default)]
    publish_failure_policy: PublishFailurePolicy,
    #[serde(default = "default_publish_retry_count")]
    publish_retry_count: u32,
    #[serde(default)]
    default_topic: Option<String>,
}

const fn default_true() -> bool {
    true
}

const fn default_publish_retry_count() -> u32 {
    3
}

impl ComponentConfig for BrokerOutputConfig {
    fn from_component_config(config: &Map<String, Value>) -> anyhow::Result<Self> {
        let raw: RawBrokerOutputConfig =
            serde_json::from_value(Value::Object(config.clone()))
                .map_err(|e| anyhow::anyhow!("broker_output configuration invalid: {}", e))?;
        let parsed = Self {
            connection: raw.connection,
            payload_encoding: raw.payload_encoding,
            payload_format: raw.payload_format,
            propagate_acknowledgements: raw.propagate_acknowledgements,
            publish_failure_policy: raw.publish_failure_policy,
            publish_retry_count: raw.publish_retry_count,
            default_topic: raw.default_topic,
        };
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.publish_retry_count == 0
            && self.publish_failure_policy != PublishFailurePolicy::Hold
        {
            return Err(anyhow::anyhow!("publish_retry_count must be >= 1"));
        }
        Ok(())
    }
}

/// Broker egress: encodes its input and publishes it. The input is either
/// an object carrying `payload` / `topic` / `user_properties`, or a bare
/// value published on the configured default topic.
pub struct BrokerOutput {
    name: String,
    config: BrokerOutputConfig,
    session: OnceLock<Arc<dyn BrokerSession>>,
    owns_session: bool,
}

impl BrokerOutput {
    pub fn from_config(
        name: &str,
        config: &Map<String, Value>,
    ) -> anyhow::Result<Arc<dyn Component>> {
        let config = BrokerOutputConfig::from_component_config(config)?;
        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            session: OnceLock::new(),
            owns_session: true,
        }))
    }

    /// Synthesis path: share the simplified app's session.
    pub fn with_session(
        name: &str,
        config: BrokerOutputConfig,
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
            description: "broker egress publishing flow output",
            config_schema: vec![
                ConfigField {
                    name: "default_topic",
                    field_type: "string",
                    required: false,
                    default: None,
                    description: "topic used when the output names none",
                },
                ConfigField {
                    name: "propagate_acknowledgements",
                    field_type: "bool",
                    required: false,
                    default: Some(Value::Bool(true)),
                    description: "hold the upstream ACK until the publish lands",
                },
                ConfigField {
                    name: "publish_failure_policy",
                    field_type: "string",
                    required: false,
                    default: Some(Value::String("nack_after_n".into())),
                    description: "hold | nack_after_n | drop_after_n",
                },
                ConfigField {
                    name: "publish_retry_count",
                    field_type: "int",
                    required: false,
                    default: Some(Value::from(default_publish_retry_count())),
                    description: "publish attempts before the failure policy applies",
                },
            ],
            ..Default::default()
        }
    }

    fn session(&self) -> Result<&Arc<dyn BrokerSession>, ProcessingError> {
        self.session
            .get()
            .ok_or_else(|| ProcessingError::Broker("broker_output session not started".into()))
    }

    /// Split the stage input into the publish triple.
    fn resolve_output(
        &self,
        message: &Message,
        data: Value,
    ) -> Result<(Value, String, Map<String, Value>), ProcessingError> {
        if let Value::Object(mut object) = data {
            if let Some(Value::String(topic)) = object.remove("topic") {
                let payload = object.remove("payload").unwrap_or(Value::Null);
                let properties = match object.remove("user_properties") {
                    Some(Value::Object(map)) => map,
                    _ => message.user_properties.clone(),
                };
                return Ok((payload, topic, properties));
            }
            // No topic key: treat the whole object as the payload.
            let data = Value::Object(object);
            let topic = self.config.default_topic.clone().ok_or_else(|| {
                ProcessingError::invoke(&self.name, "output names no topic and no default_topic is configured")
            })?;
            return Ok((data, topic, message.user_properties.clone()));
        }

        let topic = self.config.default_topic.clone().ok_or_else(|| {
            ProcessingError::invoke(&self.name, "output names no topic and no default_topic is configured")
        })?;
        Ok((data, topic, message.user_properties.clone()))
    }

    async fn publish_with_policy(
        &self,
        topic: &str,
        bytes: &[u8],
        properties: &Map<String, Value>,
    ) -> Result<(), ProcessingError> {
        let session = self.session()?;
        let retry_pause = Duration::from_millis(self.config.connection.retry_interval_ms);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match session.publish(topic, bytes, properties).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    match self.config.publish_failure_policy {
                        PublishFailurePolicy::Hold => {
                            tracing::warn!(
                                "publish to '{topic}' failed (attempt {attempts}), holding: {error}"
                            );
                        }
                        PublishFailurePolicy::NackAfterN => {
                            if attempts >= self.config.publish_retry_count {
                                return Err(error);
                            }
                            tracing::warn!(
                                "publish to '{topic}' failed (attempt {attempts}/{}): {error}",
                                self.config.publish_retry_count
                            );
                        }
                        PublishFailurePolicy::DropAfterN => {
                            if attempts >= self.config.publish_retry_count {
                                tracing::warn!(
                                    "dropping output for '{topic}' after {attempts} failed publishes: {error}"
                                );
                                return Ok(());
                            }
                        }
                    }
                    tokio::time::sleep(retry_pause).await;
                }
            }
        }
    }
}

#[async_trait]
impl Component for BrokerOutput {
    async fn start(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        if self.session.get().is_none() {
            let session = broker::connect(&self.config.connection).await?;
            let _ = self.session.set(session);
        }
        tracing::info!("broker_output '{}' ready", self.name);
        Ok(())
    }

    async fn invoke(
        &self,
        _ctx: &StageContext,
        message: &mut Message,
        data: Value,
    ) -> Result<Option<Value>, ProcessingError> {
        let (payload, topic, properties) = self.resolve_output(message, data)?;
        let bytes = codec::encode_payload(
            &payload,
            self.config.payload_encoding,
            self.config.payload_format,
        )?;

        if !self.config.propagate_acknowledgements {
            // Release the upstream ACK immediately; the publish completes
            // in the background.
            let session = self.session()?.clone();
            let topic = topic.clone();
            tokio::spawn(async move {
                if let Err(error) = session.publish(&topic, &bytes, &properties).await {
                    tracing::error!("background publish to '{topic}' failed: {error}");
                }
            });
            return Ok(None);
        }

        self.publish_with_policy(&topic, &bytes, &properties).await?;
        tracing::debug!("broker_output '{}' published on '{topic}'", self.name);
        Ok(None)
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
