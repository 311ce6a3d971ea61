//! MQTT Broker Backend
//!
//! Maps the broker capability onto rumqttc. Queue semantics are emulated
//! in-session: every incoming publish is dispatched to the internal queues
//! whose bindings match, so competing consumers within the process share a
//! queue while direct subscriptions each get their own stream. Subscription
//! wildcards are translated (`*` to `+`, `>` to `#`) at this boundary.
//!
//! MQTT 3 carries no per-message metadata, so non-empty user properties
//! travel in a small JSON envelope around the payload; bare payloads stay
//! untouched on the wire.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

use crate::broker::{
    BrokerConnectionConfig, BrokerSession, ReceivedMessage, ReconnectionStrategy, TopicFilter,
};
use crate::error::ProcessingError;
use crate::message::{AckHandle, split_topic};

const ENVELOPE_MARKER: &str = "__gantry__";

struct MqttQueue {
    bindings: Vec<TopicFilter>,
    tx: flume::Sender<(String, Vec<u8>)>,
    rx: flume::Receiver<(String, Vec<u8>)>,
}

struct DirectSubscription {
    filter: TopicFilter,
    tx: flume::Sender<ReceivedMessage>,
}

#[derive(Default)]
struct Dispatch {
    queues: HashMap<String, MqttQueue>,
    direct: Vec<DirectSubscription>,
}

impl Dispatch {
    fn deliver(&mut self, topic: &str, payload: &[u8]) {
        let topic_levels = split_topic(topic);

        for queue in self.queues.values() {
            if queue.bindings.iter().any(|f| f.matches(&topic_levels)) {
                let _ = queue.tx.send((topic.to_string(), payload.to_vec()));
            }
        }

        self.direct.retain(|subscription| {
            if !subscription.filter.matches(&topic_levels) {
                return true;
            }
            let (bytes, user_properties) = open_envelope(payload);
            subscription
                .tx
                .send(ReceivedMessage {
                    topic: topic.to_string(),
                    payload: bytes,
                    user_properties,
                    ack: AckHandle::noop(),
                })
                .is_ok()
        });
    }
}

pub struct MqttSession {
    client: AsyncClient,
    dispatch: Arc<Mutex<Dispatch>>,
}

impl MqttSession {
    pub async fn connect(
        config: &BrokerConnectionConfig,
    ) -> anyhow::Result<Arc<dyn BrokerSession>> {
        let (host, port) = parse_url(&config.url)?;
        let client_id = format!("gantry_{}", uuid::Uuid::new_v4());

        let mut options = MqttOptions::new(&client_id, host, port);
        options.set_clean_session(false);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let dispatch: Arc<Mutex<Dispatch>> = Arc::new(Mutex::new(Dispatch::default()));

        // Background task drives the connection and feeds the dispatcher;
        // retry behaviour follows the configured reconnection strategy.
        let strategy = config.reconnection_strategy;
        let retry_interval = Duration::from_millis(config.retry_interval_ms);
        let retry_count = config.retry_count;
        let task_dispatch = dispatch.clone();
        tokio::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        failures = 0;
                        task_dispatch
                            .lock()
                            .expect("mqtt dispatch lock")
                            .deliver(&publish.topic, &publish.payload);
                    }
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        match strategy {
                            ReconnectionStrategy::ForeverRetry => {
                                tracing::error!("mqtt connection error ({failures}): {e}");
                            }
                            ReconnectionStrategy::ParametrizedRetry => {
                                if failures > retry_count {
                                    tracing::error!(
                                        "mqtt connection abandoned after {retry_count} retries: {e}"
                                    );
                                    break;
                                }
                                tracing::error!(
                                    "mqtt connection error ({failures}/{retry_count}): {e}"
                                );
                            }
                        }
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        });

        tracing::info!("mqtt session '{client_id}' connected to {}", config.url);
        Ok(Arc::new(Self { client, dispatch }))
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    async fn create_queue(&self, name: &str, _durable: bool) -> Result<(), ProcessingError> {
        let mut dispatch = self.dispatch.lock().expect("mqtt dispatch lock");
        dispatch.queues.entry(name.to_string()).or_insert_with(|| {
            let (tx, rx) = flume::unbounded();
            MqttQueue {
                bindings: Vec::new(),
                tx,
                rx,
            }
        });
        Ok(())
    }

    async fn bind_subscriptions(
        &self,
        queue: &str,
        topics: &[TopicFilter],
    ) -> Result<(), ProcessingError> {
        {
            let mut dispatch = self.dispatch.lock().expect("mqtt dispatch lock");
            let queue = dispatch
                .queues
                .get_mut(queue)
                .ok_or_else(|| ProcessingError::Broker(format!("queue '{queue}' does not exist")))?;
            for topic in topics {
                if !queue.bindings.contains(topic) {
                    queue.bindings.push(topic.clone());
                }
            }
        }

        for topic in topics {
            self.client
                .subscribe(topic.to_mqtt(), QoS::AtLeastOnce)
                .await
                .map_err(|e| {
                    ProcessingError::Broker(format!("subscribe to '{topic}' failed: {e}"))
                })?;
        }
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<ReceivedMessage, ProcessingError> {
        let rx = {
            let dispatch = self.dispatch.lock().expect("mqtt dispatch lock");
            dispatch
                .queues
                .get(queue)
                .map(|q| q.rx.clone())
                .ok_or_else(|| ProcessingError::Broker(format!("queue '{queue}' does not exist")))?
        };

        let (topic, raw) = rx
            .recv_async()
            .await
            .map_err(|_| ProcessingError::QueueClosed)?;
        let (payload, user_properties) = open_envelope(&raw);

        // QoS handshakes stay inside rumqttc; a NACK here only surfaces in
        // the log, redelivery is the upstream publisher's concern.
        let nack_topic = topic.clone();
        let ack = AckHandle::new(
            || {},
            move |error| {
                tracing::warn!("message on '{nack_topic}' failed: {error}");
            },
        );

        Ok(ReceivedMessage {
            topic,
            payload,
            user_properties,
            ack,
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        user_properties: &Map<String, Value>,
    ) -> Result<(), ProcessingError> {
        let bytes = seal_envelope(payload, user_properties);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, bytes)
            .await
            .map_err(|e| ProcessingError::Broker(format!("publish to '{topic}' failed: {e}")))
    }

    async fn subscribe(
        &self,
        topic: &TopicFilter,
    ) -> Result<flume::Receiver<ReceivedMessage>, ProcessingError> {
        let (tx, rx) = flume::unbounded();
        self.dispatch
            .lock()
            .expect("mqtt dispatch lock")
            .direct
            .push(DirectSubscription {
                filter: topic.clone(),
                tx,
            });
        self.client
            .subscribe(topic.to_mqtt(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ProcessingError::Broker(format!("subscribe to '{topic}' failed: {e}")))?;
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProcessingError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ProcessingError::Broker(format!("disconnect failed: {e}")))
    }
}

fn parse_url(url: &str) -> anyhow::Result<(String, u16)> {
    let stripped = url
        .strip_prefix("mqtt://")
        .or_else(|| url.strip_prefix("tcp://"))
        .unwrap_or(url);

    match stripped.split_once(':') {
        Some((host, port)) => Ok((
            host.to_string(),
            port.parse::<u16>()
                .map_err(|_| anyhow::anyhow!("invalid port in broker url '{}'", url))?,
        )),
        None => Ok((stripped.to_string(), 1883)),
    }
}

fn seal_envelope(payload: &[u8], user_properties: &Map<String, Value>) -> Vec<u8> {
    if user_properties.is_empty() {
        return payload.to_vec();
    }
    let envelope = serde_json::json!({
        ENVELOPE_MARKER: 1,
        "user_properties": user_properties,
        "payload": BASE64.encode(payload),
    });
    envelope.to_string().into_bytes()
}

fn open_envelope(raw: &[u8]) -> (Vec<u8>, Map<String, Value>) {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(raw)
        && map.contains_key(ENVELOPE_MARKER)
    {
        let user_properties = map
            .get("user_properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let payload = map
            .get("payload")
            .and_then(Value::as_str)
            .and_then(|b64| BASE64.decode(b64).ok())
            .unwrap_or_default();
        return (payload, user_properties);
    }
    (raw.to_vec(), Map::new())
}
