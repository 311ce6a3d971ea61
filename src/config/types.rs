//! Configuration Type Definitions
//!
//! The configuration tree for the connector. These types are deserialised
//! from TOML files and drive app construction: explicit apps list every
//! stage of every flow, simplified apps declare a broker block and a list
//! of user components and the engine synthesises the rest.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::broker::BrokerConnectionConfig;
use crate::error::ErrorPolicy;
use crate::expression::{InvokeSpec, TransformConfig};
use crate::message::codec::{PayloadEncoding, PayloadFormat};
use crate::request_reply::RequestReplySettings;

/// Root configuration for the whole process.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConnectorConfig {
    /// Logging hints; consumed by the logging module at startup.
    #[serde(default)]
    pub log: Option<LogConfig>,

    /// Tracing exporter settings; passed through to the tracing
    /// collaborator untouched.
    #[serde(default)]
    pub trace: Option<Value>,

    /// Shared anchors merged by the configuration preprocessor; resolved
    /// before the core reads the tree, carried only for round-tripping.
    #[serde(default)]
    pub shared_config: Option<Value>,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub level: Option<String>,
}

/// Readiness/liveness surface. The HTTP server exposing these paths is an
/// external collaborator; the connector only tracks the state behind them.
#[derive(Clone, Debug, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_health_port")]
    pub port: u16,

    #[serde(default = "default_liveness_path")]
    pub liveness_path: String,

    #[serde(default = "default_readiness_path")]
    pub readiness_path: String,

    #[serde(default = "default_check_period")]
    pub readiness_check_period_seconds: u64,

    #[serde(default = "default_startup_path")]
    pub startup_path: String,

    #[serde(default = "default_check_period")]
    pub startup_check_period_seconds: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
            liveness_path: default_liveness_path(),
            readiness_path: default_readiness_path(),
            readiness_check_period_seconds: default_check_period(),
            startup_path: default_startup_path(),
            startup_check_period_seconds: default_check_period(),
        }
    }
}

const fn default_health_port() -> u16 {
    8080
}

fn default_liveness_path() -> String {
    "/health/liveness".to_string()
}

fn default_readiness_path() -> String {
    "/health/readiness".to_string()
}

fn default_startup_path() -> String {
    "/health/startup".to_string()
}

const fn default_check_period() -> u64 {
    5
}

/// One app: either explicit (`flows`) or simplified (`broker` +
/// `components`).
#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub name: String,

    /// Replicates the whole app, each instance with independent broker
    /// handles.
    #[serde(default = "default_instances")]
    pub num_instances: usize,

    /// App-scoped configuration readable by every stage through the
    /// lookup chain.
    #[serde(default)]
    pub app_config: Map<String, Value>,

    /// Optional structural description of `app_config`; documentation
    /// only.
    #[serde(default)]
    pub app_schema: Option<Value>,

    #[serde(default)]
    pub broker: Option<BrokerBlockConfig>,

    #[serde(default)]
    pub flows: Vec<FlowConfig>,

    /// Simplified-app user components.
    #[serde(default)]
    pub components: Vec<StageConfig>,

    /// Name of the flow receiving synthetic error events.
    #[serde(default)]
    pub error_flow: Option<String>,

    /// Process-wide cap on routed error events per second.
    #[serde(default = "default_max_errors_per_second")]
    pub max_errors_per_second: u32,
}

const fn default_instances() -> usize {
    1
}

const fn default_max_errors_per_second() -> u32 {
    100
}

/// The broker block of a simplified app.
#[derive(Clone, Debug, Deserialize)]
pub struct BrokerBlockConfig {
    #[serde(flatten)]
    pub connection: BrokerConnectionConfig,

    #[serde(default = "default_true")]
    pub input_enabled: bool,

    #[serde(default = "default_true")]
    pub output_enabled: bool,

    #[serde(default)]
    pub request_reply_enabled: bool,

    #[serde(default)]
    pub queue_name: Option<String>,

    #[serde(default = "default_true")]
    pub create_queue_on_start: bool,

    #[serde(default)]
    pub payload_encoding: PayloadEncoding,

    #[serde(default)]
    pub payload_format: PayloadFormat,

    #[serde(default)]
    pub request_reply: RequestReplySettings,
}

impl Default for BrokerBlockConfig {
    fn default() -> Self {
        Self {
            connection: BrokerConnectionConfig::default(),
            input_enabled: true,
            output_enabled: true,
            request_reply_enabled: false,
            queue_name: None,
            create_queue_on_start: true,
            payload_encoding: PayloadEncoding::default(),
            payload_format: PayloadFormat::default(),
            request_reply: RequestReplySettings::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// An explicit flow: an ordered chain of stages.
#[derive(Clone, Debug, Deserialize)]
pub struct FlowConfig {
    pub name: String,
    pub components: Vec<StageConfig>,
}

/// One stage of a flow, or one user component of a simplified app.
#[derive(Clone, Debug, Deserialize)]
pub struct StageConfig {
    pub name: String,

    /// Component kind, resolved through the component registry.
    pub kind: String,

    /// Worker count for this stage.
    #[serde(default = "default_instances")]
    pub num_instances: usize,

    /// Input queue capacity; enqueue blocks when full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub component_config: Map<String, Value>,

    /// Simplified apps: topics routed to this component.
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,

    #[serde(default)]
    pub input_transforms: Vec<TransformConfig>,

    #[serde(default)]
    pub input_selection: Option<InputSelectionConfig>,

    /// Simplified apps: expression producing the egress topic for this
    /// component's output when the output itself names none.
    #[serde(default)]
    pub output_topic: Option<String>,

    #[serde(default)]
    pub on_error: Option<ErrorPolicyConfig>,

    /// What happens to messages still queued when the stage stops.
    #[serde(default)]
    pub drain_policy: DrainPolicy,
}

const fn default_queue_capacity() -> usize {
    100
}

/// Disposition of queued messages at shutdown.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Fail their ACK callbacks so the broker redelivers (default).
    #[default]
    Nack,

    /// Release them as handled without processing.
    Drop,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubscriptionConfig {
    pub topic: String,
}

/// A stage input selection: expression, literal or invoke record.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct InputSelectionConfig {
    #[serde(default)]
    pub source_expression: Option<String>,

    #[serde(default)]
    pub source_value: Option<Value>,

    #[serde(default)]
    pub invoke: Option<InvokeSpec>,
}

impl InputSelectionConfig {
    /// Compile into an evaluable source; `None` when nothing is declared,
    /// which defaults the stage input to `previous`.
    pub fn compile(
        &self,
    ) -> Result<Option<crate::expression::CompiledSource>, crate::error::ProcessingError> {
        use crate::expression::{CompiledSource, Expression, invoke};
        if let Some(expr) = &self.source_expression {
            return Ok(Some(CompiledSource::Expression(Expression::parse(expr)?)));
        }
        if let Some(value) = &self.source_value {
            return Ok(Some(CompiledSource::Literal(value.clone())));
        }
        if let Some(spec) = &self.invoke {
            return Ok(Some(CompiledSource::Invoke(invoke::compile(spec)?)));
        }
        Ok(None)
    }
}

/// Recovery policy for a failing stage: a default reaction plus per-kind
/// overrides keyed by error kind name.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ErrorPolicyConfig {
    #[serde(default)]
    pub default: ErrorPolicy,

    #[serde(default)]
    pub by_kind: HashMap<String, ErrorPolicy>,
}

impl ErrorPolicyConfig {
    pub fn policy_for(&self, kind: crate::error::ErrorKind) -> ErrorPolicy {
        self.by_kind
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_simplified_app_parses() {
        let toml = r#"
            [[apps]]
            name = "sample"

            [apps.broker]
            broker_type = "dev"
            url = "dev://test"
            queue_name = "q1"

            [[apps.components]]
            name = "passthrough"
            kind = "pass_through"

            [[apps.components.subscriptions]]
            topic = "my/topic1"
        "#;
        let config: ConnectorConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.apps.len(), 1);

        let app = &config.apps[0];
        assert_eq!(app.name, "sample");
        assert_eq!(app.num_instances, 1);

        let broker = app.broker.as_ref().unwrap();
        assert_eq!(broker.queue_name.as_deref(), Some("q1"));
        assert!(broker.input_enabled);
        assert!(!broker.request_reply_enabled);

        assert_eq!(app.components[0].subscriptions[0].topic, "my/topic1");
        assert_eq!(app.components[0].queue_capacity, 100);
    }

    #[test]
    fn explicit_flow_with_transforms_parses() {
        let toml = r#"
            [[apps]]
            name = "explicit"

            [[apps.flows]]
            name = "main"

            [[apps.flows.components]]
            name = "shape"
            kind = "pass_through"
            num_instances = 2

            [[apps.flows.components.input_transforms]]
            type = "copy"
            source_expression = "input.payload:a"
            dest_expression = "user_data.tmp:a"

            [apps.flows.components.input_selection]
            source_expression = "user_data.tmp"
        "#;
        let config: ConnectorConfig = toml::from_str(toml).unwrap();
        let stage = &config.apps[0].flows[0].components[0];
        assert_eq!(stage.num_instances, 2);
        assert_eq!(stage.input_transforms.len(), 1);
        assert!(stage.input_selection.is_some());
    }

    #[test]
    fn error_policy_lookup() {
        let policy: ErrorPolicyConfig = toml::from_str(
            r#"
            default = "drop"

            [by_kind]
            invoke = "nack"
        "#,
        )
        .unwrap();
        assert_eq!(
            policy.policy_for(crate::error::ErrorKind::Invoke),
            ErrorPolicy::Nack
        );
        assert_eq!(
            policy.policy_for(crate::error::ErrorKind::Expression),
            ErrorPolicy::Drop
        );
    }
}
