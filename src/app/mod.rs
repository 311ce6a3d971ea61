//! App Composition
//!
//! An app owns a set of flows, its shared broker handles and the services
//! its stages reach through their context. Explicit apps list every stage
//! of every flow; simplified apps declare a broker block and a list of
//! user components, and the app synthesises the rest:
//!
//! ```text
//! BrokerInput -> [SubscriptionRouter] -> user stage -> [BrokerOutput]
//! ```
//!
//! The router only exists when more than one user component is declared;
//! the request/response controller runs alongside when request/reply is
//! enabled. All user stages of a simplified app share one broker session,
//! one egress stage and one controller.

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::broker::{self, BrokerSession, TopicFilter};
use crate::components::component::{AppServices, ScopedConfig};
use crate::components::factory;
use crate::components::broker_input::{BrokerInput, BrokerInputConfig};
use crate::components::broker_output::{BrokerOutput, BrokerOutputConfig, PublishFailurePolicy};
use crate::config::{AppConfig, BrokerBlockConfig, StageConfig};
use crate::error::ProcessingError;
use crate::expression::{Expression, transform};
use crate::flow::{Flow, StageSpec, SubscriptionRouter};
use crate::message::Message;
use crate::request_reply::RequestReplyService;
use crate::runtime::{CacheService, TimerService};

pub struct App {
    name: String,
    instance: usize,
    /// Flows in logical order, ingress first; started in reverse.
    flows: Vec<Flow>,
    services: Arc<AppServices>,
    session: Option<Arc<dyn BrokerSession>>,
    started: bool,
}

impl App {
    /// Build one app instance from validated configuration.
    pub async fn build(
        config: &AppConfig,
        instance: usize,
        timer: Arc<TimerService>,
        cache: Arc<CacheService>,
    ) -> anyhow::Result<Self> {
        let app_config = Arc::new(config.app_config.clone());

        let simplified = !config.components.is_empty();
        if simplified {
            Self::build_simplified(config, instance, timer, cache, app_config).await
        } else {
            Self::build_explicit(config, instance, timer, cache, app_config).await
        }
    }

    async fn build_simplified(
        config: &AppConfig,
        instance: usize,
        timer: Arc<TimerService>,
        cache: Arc<CacheService>,
        app_config: Arc<Map<String, Value>>,
    ) -> anyhow::Result<Self> {
        let broker_block = config
            .broker
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("simplified app '{}' has no broker block", config.name))?;

        let session = broker::connect(&broker_block.connection).await?;

        let request_reply = if broker_block.request_reply_enabled {
            Some(
                RequestReplyService::start(
                    broker_block.connection.clone(),
                    broker_block.request_reply.clone(),
                    broker_block.payload_encoding,
                    broker_block.payload_format,
                )
                .await?,
            )
        } else {
            None
        };

        let services = AppServices::new(timer, cache, request_reply, config.max_errors_per_second);

        // Flows are kept ingress-first and egress-last, so the forward
        // stop order always winds down producers before their consumers.
        let mut flows: Vec<Flow> = Vec::new();

        // Shared egress stage, one per app; appended last.
        let mut egress_flow = None;
        let egress_sender = if broker_block.output_enabled {
            let spec = egress_spec(broker_block, session.clone(), &app_config);
            let egress = Flow::new(&config.name, &format!("{}-egress", config.name), vec![spec]);
            let sender = egress.first_sender().expect("egress flow has a stage");
            let _ = services.egress.set(sender.clone());
            egress_flow = Some(egress);
            Some(sender)
        } else {
            None
        };

        // One flow per user component.
        let mut user_senders: Vec<(String, flume::Sender<Message>)> = Vec::new();
        for stage_config in &config.components {
            let spec = build_stage_spec(stage_config, &app_config)?;
            let mut flow = Flow::new(&config.name, &stage_config.name, vec![spec]);
            if let Some(egress) = &egress_sender {
                flow.set_tail_next(egress.clone());
            }
            user_senders.push((
                stage_config.name.clone(),
                flow.first_sender().expect("user flow has a stage"),
            ));
            flows.push(flow);
        }

        // Ingress flow, with the router only when several user components
        // compete for the input.
        if broker_block.input_enabled {
            let input_spec = ingress_spec(broker_block, session.clone(), config, &app_config)?;
            let mut ingress_stages = vec![input_spec];

            if config.components.len() > 1 {
                let mut router = SubscriptionRouter::new();
                for (stage_config, (_, sender)) in
                    config.components.iter().zip(user_senders.iter())
                {
                    for subscription in &stage_config.subscriptions {
                        router.add_route(
                            TopicFilter::parse(&subscription.topic)?,
                            &stage_config.name,
                            sender.clone(),
                        );
                    }
                }
                let router_spec =
                    StageSpec::plain("router", "subscription_router", Arc::new(router));
                ingress_stages.push(router_spec);

                // The router forwards messages itself; no tail link.
                let ingress = Flow::new(
                    &config.name,
                    &format!("{}-input", config.name),
                    ingress_stages,
                );
                flows.insert(0, ingress);
            } else {
                let mut ingress = Flow::new(
                    &config.name,
                    &format!("{}-input", config.name),
                    ingress_stages,
                );
                if let Some((_, first_user)) = user_senders.first() {
                    ingress.set_tail_next(first_user.clone());
                }
                flows.insert(0, ingress);
            }
        }

        if let Some(egress) = egress_flow {
            flows.push(egress);
        }

        // Error routing targets a user component's flow by name.
        if let Some(error_flow) = &config.error_flow
            && let Some((_, sender)) = user_senders
                .iter()
                .find(|(name, _)| name == error_flow)
        {
            services.errors.set_target(sender.clone());
        }

        Ok(Self {
            name: config.name.clone(),
            instance,
            flows,
            services,
            session: Some(session),
            started: false,
        })
    }

    async fn build_explicit(
        config: &AppConfig,
        instance: usize,
        timer: Arc<TimerService>,
        cache: Arc<CacheService>,
        app_config: Arc<Map<String, Value>>,
    ) -> anyhow::Result<Self> {
        let request_reply = match &config.broker {
            Some(block) if block.request_reply_enabled => Some(
                RequestReplyService::start(
                    block.connection.clone(),
                    block.request_reply.clone(),
                    block.payload_encoding,
                    block.payload_format,
                )
                .await?,
            ),
            _ => None,
        };

        let services = AppServices::new(timer, cache, request_reply, config.max_errors_per_second);

        let mut flows = Vec::new();
        for flow_config in &config.flows {
            let specs = flow_config
                .components
                .iter()
                .map(|stage_config| build_stage_spec(stage_config, &app_config))
                .collect::<anyhow::Result<Vec<_>>>()?;
            flows.push(Flow::new(&config.name, &flow_config.name, specs));
        }

        if let Some(error_flow) = &config.error_flow
            && let Some(sender) = flows
                .iter()
                .find(|flow| flow.name() == error_flow)
                .and_then(Flow::first_sender)
        {
            services.errors.set_target(sender);
        }

        Ok(Self {
            name: config.name.clone(),
            instance,
            flows,
            services,
            session: None,
            started: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    pub fn services(&self) -> &Arc<AppServices> {
        &self.services
    }

    /// Producer handle into a flow, used by tests and embedders.
    pub fn flow_sender(&self, flow_name: &str) -> Option<flume::Sender<Message>> {
        self.flows
            .iter()
            .find(|flow| flow.name() == flow_name)
            .and_then(Flow::first_sender)
    }

    /// Producer handle into a specific stage's queue.
    pub fn stage_sender(
        &self,
        flow_name: &str,
        stage_name: &str,
    ) -> Option<flume::Sender<Message>> {
        self.flows
            .iter()
            .find(|flow| flow.name() == flow_name)
            .and_then(|flow| flow.stage_sender(stage_name))
    }

    /// Enqueue a message to the app's implicit egress.
    pub async fn send_message(
        &self,
        payload: Value,
        topic: &str,
        user_properties: Map<String, Value>,
    ) -> Result<(), ProcessingError> {
        let Some(egress) = self.services.egress.get() else {
            return Err(ProcessingError::Broker(
                "app has no egress (output_enabled is false)".into(),
            ));
        };
        let mut message = Message::new(topic, payload.clone());
        message.previous = serde_json::json!({
            "payload": payload,
            "topic": topic,
            "user_properties": Value::Object(user_properties),
        });
        egress
            .send_async(message)
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }

    /// Start every flow, consumers before producers: egress and user
    /// flows first, the ingress flow last.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        for flow in self.flows.iter_mut().rev() {
            flow.start(self.services.clone()).await?;
        }
        self.started = true;
        tracing::info!("app '{}' (instance {}) started", self.name, self.instance);
        Ok(())
    }

    /// Stop ingress-first so no new messages enter while the rest of the
    /// pipeline winds down, then close the shared broker session and the
    /// request/reply controllers.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        for flow in self.flows.iter_mut() {
            flow.stop().await;
        }
        if let Some(request_reply) = &self.services.request_reply {
            request_reply.stop().await;
        }
        if let Some(session) = &self.session {
            if let Err(e) = session.close().await {
                tracing::warn!("app '{}' session close failed: {e}", self.name);
            }
        }
        self.started = false;
        tracing::info!("app '{}' (instance {}) stopped", self.name, self.instance);
    }

    pub fn is_ready(&self) -> bool {
        self.started
    }

    pub fn is_startup_complete(&self) -> bool {
        self.started
    }
}

/// Compile one stage configuration into a runnable spec.
pub fn build_stage_spec(
    stage_config: &StageConfig,
    app_config: &Arc<Map<String, Value>>,
) -> anyhow::Result<StageSpec> {
    let component = factory::create_component(
        &stage_config.kind,
        &stage_config.name,
        &stage_config.component_config,
    )?;

    let transforms = transform::compile_all(&stage_config.input_transforms)
        .map_err(|e| anyhow::anyhow!("stage '{}': {}", stage_config.name, e))?;
    let input_selection = stage_config
        .input_selection
        .as_ref()
        .map(|selection| selection.compile())
        .transpose()
        .map_err(|e| anyhow::anyhow!("stage '{}': {}", stage_config.name, e))?
        .flatten();
    let output_topic = stage_config
        .output_topic
        .as_deref()
        .map(Expression::parse)
        .transpose()
        .map_err(|e| anyhow::anyhow!("stage '{}': {}", stage_config.name, e))?;

    Ok(StageSpec {
        name: stage_config.name.clone(),
        kind: stage_config.kind.clone(),
        component,
        worker_count: stage_config.num_instances,
        queue_capacity: stage_config.queue_capacity,
        transforms,
        input_selection,
        output_topic,
        error_policy: stage_config.on_error.clone().unwrap_or_default(),
        drain_policy: stage_config.drain_policy,
        config: ScopedConfig::new(
            stage_config.component_config.clone(),
            app_config.clone(),
            factory::component_defaults(&stage_config.kind),
        ),
    })
}

fn ingress_spec(
    broker_block: &BrokerBlockConfig,
    session: Arc<dyn BrokerSession>,
    config: &AppConfig,
    app_config: &Arc<Map<String, Value>>,
) -> anyhow::Result<StageSpec> {
    // The queue carries the union of every component's subscriptions; the
    // router (or the single component) narrows from there.
    let mut subscriptions = Vec::new();
    for stage_config in &config.components {
        for subscription in &stage_config.subscriptions {
            let filter = TopicFilter::parse(&subscription.topic)?;
            if !subscriptions.contains(&filter) {
                subscriptions.push(filter);
            }
        }
    }

    let input_config = BrokerInputConfig {
        connection: broker_block.connection.clone(),
        queue_name: broker_block
            .queue_name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("broker block has no queue_name"))?,
        create_queue_on_start: broker_block.create_queue_on_start,
        subscriptions,
        payload_encoding: broker_block.payload_encoding,
        payload_format: broker_block.payload_format,
    };

    let component = BrokerInput::with_session("broker_input", input_config, session);
    let mut spec = StageSpec::plain("broker_input", "broker_input", component);
    spec.config = ScopedConfig::new(
        Map::new(),
        app_config.clone(),
        factory::component_defaults("broker_input"),
    );
    Ok(spec)
}

fn egress_spec(
    broker_block: &BrokerBlockConfig,
    session: Arc<dyn BrokerSession>,
    app_config: &Arc<Map<String, Value>>,
) -> StageSpec {
    let output_config = BrokerOutputConfig {
        connection: broker_block.connection.clone(),
        payload_encoding: broker_block.payload_encoding,
        payload_format: broker_block.payload_format,
        propagate_acknowledgements: true,
        publish_failure_policy: PublishFailurePolicy::default(),
        publish_retry_count: 3,
        default_topic: None,
    };

    let component = BrokerOutput::with_session("broker_output", output_config, session);
    let mut spec = StageSpec::plain("broker_output", "broker_output", component);
    spec.config = ScopedConfig::new(
        Map::new(),
        app_config.clone(),
        factory::component_defaults("broker_output"),
    );
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::dev::DevSession;
    use crate::broker::BrokerConnectionConfig;
    use crate::config::{load_config_from_string, validate_config};
    use crate::connector::Connector;
    use crate::error::ProcessingError;
    use crate::message::AckHandle;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, timeout};

    fn dev_url() -> String {
        format!("dev://{}", uuid::Uuid::new_v4())
    }

    fn observer(url: &str) -> Arc<DevSession> {
        DevSession::connect(&BrokerConnectionConfig {
            url: url.to_string(),
            ..Default::default()
        })
    }

    async fn start_connector(toml: &str) -> Connector {
        let config = load_config_from_string(toml).unwrap();
        validate_config(&config).unwrap();
        let mut connector = Connector::new(config);
        connector.start().await.unwrap();
        connector
    }

    async fn recv(
        rx: &flume::Receiver<crate::broker::ReceivedMessage>,
    ) -> crate::broker::ReceivedMessage {
        timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("timed out waiting for a broker message")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn simplified_passthrough_routes_to_response_topic() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "s1"

            [apps.broker]
            url = "{url}"
            queue_name = "q1"

            [[apps.components]]
            name = "passthrough"
            kind = "pass_through"
            output_topic = "template:response/{{{{ text://input.topic }}}}"

            [[apps.components.subscriptions]]
            topic = "my/topic1"
        "#
        );
        let mut connector = start_connector(&toml).await;

        let observer = observer(&url);
        let responses = observer
            .subscribe(&TopicFilter::parse("response/>").unwrap())
            .await
            .unwrap();

        observer
            .publish("my/topic1", b"{\"value\":7}", &Map::new())
            .await
            .unwrap();

        let received = recv(&responses).await;
        assert_eq!(received.topic, "response/my/topic1");
        assert_eq!(
            serde_json::from_slice::<Value>(&received.payload).unwrap(),
            json!({"value": 7})
        );
        connector.stop().await;
    }

    #[tokio::test]
    async fn router_dispatches_first_match_in_declaration_order() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "s2"

            [apps.broker]
            url = "{url}"
            queue_name = "q2"

            [[apps.components]]
            name = "stage_a"
            kind = "pass_through"
            output_topic = "static:res/a"

            [[apps.components.subscriptions]]
            topic = "data/*/high"

            [[apps.components]]
            name = "stage_b"
            kind = "pass_through"
            output_topic = "static:res/b"

            [[apps.components.subscriptions]]
            topic = "data/>"
        "#
        );
        let mut connector = start_connector(&toml).await;

        let observer = observer(&url);
        let responses = observer
            .subscribe(&TopicFilter::parse("res/>").unwrap())
            .await
            .unwrap();

        // data/raw/high matches stage_a's pattern first.
        observer
            .publish("data/raw/high", b"{\"n\":1}", &Map::new())
            .await
            .unwrap();
        assert_eq!(recv(&responses).await.topic, "res/a");

        // data/raw/low only matches the catch-all of stage_b.
        observer
            .publish("data/raw/low", b"{\"n\":2}", &Map::new())
            .await
            .unwrap();
        assert_eq!(recv(&responses).await.topic, "res/b");

        connector.stop().await;
    }

    #[tokio::test]
    async fn router_releases_unmatched_messages_with_success() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "s2b"

            [apps.broker]
            url = "{url}"
            queue_name = "q"

            [[apps.components]]
            name = "stage_a"
            kind = "pass_through"
            output_topic = "static:res/a"

            [[apps.components.subscriptions]]
            topic = "data/*/high"

            [[apps.components]]
            name = "stage_b"
            kind = "pass_through"
            output_topic = "static:res/b"

            [[apps.components.subscriptions]]
            topic = "data/>"
        "#
        );
        let mut connector = start_connector(&toml).await;

        // Feed the router directly with a topic no subscription matches.
        let router = connector
            .app("s2b")
            .unwrap()
            .stage_sender("s2b-input", "router")
            .unwrap();

        let success = Arc::new(AtomicUsize::new(0));
        let mut message = Message::new("other/x", json!({}));
        let counter = success.clone();
        message.push_ack(AckHandle::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));
        router.send_async(message).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while success.load(Ordering::SeqCst) == 0 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        connector.stop().await;
    }

    #[tokio::test]
    async fn send_message_uses_the_implicit_egress() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "sender"

            [apps.broker]
            url = "{url}"
            queue_name = "q"
            input_enabled = false

            [[apps.components]]
            name = "noop"
            kind = "pass_through"
        "#
        );
        let mut connector = start_connector(&toml).await;

        let observer = observer(&url);
        let outgoing = observer
            .subscribe(&TopicFilter::parse("custom/>").unwrap())
            .await
            .unwrap();

        connector
            .app("sender")
            .unwrap()
            .send_message(json!({"hello": true}), "custom/topic", Map::new())
            .await
            .unwrap();

        let received = recv(&outgoing).await;
        assert_eq!(received.topic, "custom/topic");
        assert_eq!(
            serde_json::from_slice::<Value>(&received.payload).unwrap(),
            json!({"hello": true})
        );
        connector.stop().await;
    }

    #[tokio::test]
    async fn send_message_errors_when_output_disabled() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "no-egress"

            [apps.broker]
            url = "{url}"
            queue_name = "q"
            output_enabled = false

            [[apps.components]]
            name = "noop"
            kind = "pass_through"

            [[apps.components.subscriptions]]
            topic = "a/b"
        "#
        );
        let mut connector = start_connector(&toml).await;

        let result = connector
            .app("no-egress")
            .unwrap()
            .send_message(json!(1), "t", Map::new())
            .await;
        assert!(matches!(result, Err(ProcessingError::Broker(_))));
        connector.stop().await;
    }

    #[tokio::test]
    async fn app_num_instances_replicates_with_shared_queue() {
        let url = dev_url();
        let toml = format!(
            r#"
            [[apps]]
            name = "scaled"
            num_instances = 2

            [apps.broker]
            url = "{url}"
            queue_name = "shared-q"

            [[apps.components]]
            name = "echo"
            kind = "pass_through"
            output_topic = "static:scaled/out"

            [[apps.components.subscriptions]]
            topic = "work/>"
        "#
        );
        let mut connector = start_connector(&toml).await;
        assert_eq!(connector.apps().len(), 2);

        let observer = observer(&url);
        let outgoing = observer
            .subscribe(&TopicFilter::parse("scaled/>").unwrap())
            .await
            .unwrap();

        // Competing consumers: each message is processed exactly once.
        for n in 0..4 {
            observer
                .publish("work/item", format!("{{\"n\":{n}}}").as_bytes(), &Map::new())
                .await
                .unwrap();
        }
        for _ in 0..4 {
            recv(&outgoing).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(outgoing.is_empty(), "a message was delivered twice");

        connector.stop().await;
    }
}
