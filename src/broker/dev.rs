//! In-Process Dev Broker
//!
//! A broker backend living entirely inside the process: hubs keyed by
//! connection url, queues as MPMC channels, and the same topic-match
//! semantics the subscription router uses. NACKed messages are redelivered
//! up to the configured limit, then dropped with a warning. Tests and the
//! end-to-end scenarios run against this backend.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::broker::{BrokerConnectionConfig, BrokerSession, ReceivedMessage, TopicFilter};
use crate::error::ProcessingError;
use crate::message::{AckHandle, split_topic};

#[derive(Clone)]
struct StoredMessage {
    topic: String,
    payload: Vec<u8>,
    user_properties: Map<String, Value>,
    redelivery_count: u32,
}

struct DevQueue {
    bindings: Mutex<Vec<TopicFilter>>,
    tx: flume::Sender<StoredMessage>,
    rx: flume::Receiver<StoredMessage>,
}

impl DevQueue {
    fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            bindings: Mutex::new(Vec::new()),
            tx,
            rx,
        }
    }
}

struct DirectSubscription {
    id: u64,
    filter: TopicFilter,
    tx: flume::Sender<ReceivedMessage>,
}

/// One in-process broker, shared by every session opened on the same url.
struct DevHub {
    url: String,
    queues: Mutex<HashMap<String, Arc<DevQueue>>>,
    direct: Mutex<Vec<DirectSubscription>>,
    next_subscription_id: AtomicU64,
}

impl DevHub {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            queues: Mutex::new(HashMap::new()),
            direct: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    fn deliver(&self, message: StoredMessage) {
        let topic_levels = split_topic(&message.topic);

        // Queues first: each matching queue gets its own copy.
        let queues = self.queues.lock().expect("dev hub queue lock");
        for queue in queues.values() {
            let bound = queue
                .bindings
                .lock()
                .expect("dev queue binding lock")
                .iter()
                .any(|filter| filter.matches(&topic_levels));
            if bound {
                let _ = queue.tx.send(message.clone());
            }
        }
        drop(queues);

        // Then direct subscribers; these carry no settlement.
        let mut direct = self.direct.lock().expect("dev hub subscription lock");
        direct.retain(|subscription| {
            if !subscription.filter.matches(&topic_levels) {
                return true;
            }
            subscription
                .tx
                .send(ReceivedMessage {
                    topic: message.topic.clone(),
                    payload: message.payload.clone(),
                    user_properties: message.user_properties.clone(),
                    ack: AckHandle::noop(),
                })
                .is_ok()
        });
    }
}

fn hubs() -> &'static Mutex<HashMap<String, Arc<DevHub>>> {
    static HUBS: OnceLock<Mutex<HashMap<String, Arc<DevHub>>>> = OnceLock::new();
    HUBS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn hub_for(url: &str) -> Arc<DevHub> {
    let mut registry = hubs().lock().expect("dev hub registry lock");
    registry
        .entry(url.to_string())
        .or_insert_with(|| Arc::new(DevHub::new(url)))
        .clone()
}

/// A session on a dev hub. Queues and direct subscriptions created through
/// the session are removed again when it closes.
pub struct DevSession {
    hub: Arc<DevHub>,
    max_redelivery: u32,
    created_queues: Mutex<Vec<String>>,
    subscription_ids: Mutex<Vec<u64>>,
    closed: AtomicBool,
}

impl DevSession {
    pub fn connect(config: &BrokerConnectionConfig) -> Arc<Self> {
        let hub = hub_for(&config.url);
        tracing::debug!("dev session connected to hub '{}'", hub.url);
        Arc::new(Self {
            hub,
            max_redelivery: config.max_redelivery_count,
            created_queues: Mutex::new(Vec::new()),
            subscription_ids: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn queue(&self, name: &str) -> Result<Arc<DevQueue>, ProcessingError> {
        let queues = self.hub.queues.lock().expect("dev hub queue lock");
        queues
            .get(name)
            .cloned()
            .ok_or_else(|| ProcessingError::Broker(format!("queue '{name}' does not exist")))
    }
}

#[async_trait]
impl BrokerSession for DevSession {
    async fn create_queue(&self, name: &str, _durable: bool) -> Result<(), ProcessingError> {
        let mut queues = self.hub.queues.lock().expect("dev hub queue lock");
        if !queues.contains_key(name) {
            queues.insert(name.to_string(), Arc::new(DevQueue::new()));
            self.created_queues
                .lock()
                .expect("created queue lock")
                .push(name.to_string());
            tracing::debug!("dev queue '{name}' created on hub '{}'", self.hub.url);
        }
        Ok(())
    }

    async fn bind_subscriptions(
        &self,
        queue: &str,
        topics: &[TopicFilter],
    ) -> Result<(), ProcessingError> {
        let queue = self.queue(queue)?;
        let mut bindings = queue.bindings.lock().expect("dev queue binding lock");
        for topic in topics {
            if !bindings.contains(topic) {
                bindings.push(topic.clone());
            }
        }
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<ReceivedMessage, ProcessingError> {
        let queue = self.queue(queue)?;
        let stored = queue
            .rx
            .recv_async()
            .await
            .map_err(|_| ProcessingError::QueueClosed)?;

        // The NACK side re-enqueues for redelivery until the limit, at
        // which point the message is dropped like a broker moving it to a
        // dead-message queue we do not model.
        let redelivery_tx = queue.tx.clone();
        let redelivered = StoredMessage {
            redelivery_count: stored.redelivery_count + 1,
            ..stored.clone()
        };
        let max_redelivery = self.max_redelivery;
        let topic_for_log = stored.topic.clone();

        let ack = AckHandle::new(
            || {},
            move |error| {
                if redelivered.redelivery_count <= max_redelivery {
                    tracing::debug!(
                        "redelivering '{}' (attempt {}): {error}",
                        redelivered.topic,
                        redelivered.redelivery_count
                    );
                    let _ = redelivery_tx.send(redelivered);
                } else {
                    tracing::warn!(
                        "dropping '{topic_for_log}' after {max_redelivery} redeliveries: {error}"
                    );
                }
            },
        );

        Ok(ReceivedMessage {
            topic: stored.topic,
            payload: stored.payload,
            user_properties: stored.user_properties,
            ack,
        })
    }

    async fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        user_properties: &Map<String, Value>,
    ) -> Result<(), ProcessingError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProcessingError::Broker("session is closed".into()));
        }
        self.hub.deliver(StoredMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            user_properties: user_properties.clone(),
            redelivery_count: 0,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &TopicFilter,
    ) -> Result<flume::Receiver<ReceivedMessage>, ProcessingError> {
        let (tx, rx) = flume::unbounded();
        let id = self.hub.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.hub
            .direct
            .lock()
            .expect("dev hub subscription lock")
            .push(DirectSubscription {
                id,
                filter: topic.clone(),
                tx,
            });
        self.subscription_ids
            .lock()
            .expect("subscription id lock")
            .push(id);
        Ok(rx)
    }

    async fn close(&self) -> Result<(), ProcessingError> {
        self.closed.store(true, Ordering::SeqCst);

        let ids = std::mem::take(&mut *self.subscription_ids.lock().expect("subscription id lock"));
        self.hub
            .direct
            .lock()
            .expect("dev hub subscription lock")
            .retain(|subscription| !ids.contains(&subscription.id));

        let names = std::mem::take(&mut *self.created_queues.lock().expect("created queue lock"));
        let mut queues = self.hub.queues.lock().expect("dev hub queue lock");
        for name in names {
            queues.remove(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn fresh_config() -> BrokerConnectionConfig {
        BrokerConnectionConfig {
            url: format!("dev://{}", Uuid::new_v4()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publish_reaches_bound_queue() {
        let config = fresh_config();
        let session = DevSession::connect(&config);
        session.create_queue("q1", true).await.unwrap();
        session
            .bind_subscriptions("q1", &[TopicFilter::parse("my/>").unwrap()])
            .await
            .unwrap();

        session
            .publish("my/topic1", b"{\"value\":7}", &Map::new())
            .await
            .unwrap();

        let received = session.receive("q1").await.unwrap();
        assert_eq!(received.topic, "my/topic1");
        assert_eq!(
            serde_json::from_slice::<Value>(&received.payload).unwrap(),
            json!({"value": 7})
        );
        received.ack.succeed();
    }

    #[tokio::test]
    async fn unmatched_topic_is_not_queued() {
        let config = fresh_config();
        let session = DevSession::connect(&config);
        session.create_queue("q1", true).await.unwrap();
        session
            .bind_subscriptions("q1", &[TopicFilter::parse("only/this").unwrap()])
            .await
            .unwrap();

        session.publish("other/x", b"1", &Map::new()).await.unwrap();

        let queue = session.queue("q1").unwrap();
        assert!(queue.rx.is_empty());
    }

    #[tokio::test]
    async fn nack_redelivers_until_limit() {
        let mut config = fresh_config();
        config.max_redelivery_count = 1;
        let session = DevSession::connect(&config);
        session.create_queue("q1", true).await.unwrap();
        session
            .bind_subscriptions("q1", &[TopicFilter::parse(">").unwrap()])
            .await
            .unwrap();

        session.publish("a/b", b"x", &Map::new()).await.unwrap();

        // First delivery, nacked: should come back once.
        let first = session.receive("q1").await.unwrap();
        first.ack.fail(&ProcessingError::QueueClosed);
        let second = session.receive("q1").await.unwrap();
        second.ack.fail(&ProcessingError::QueueClosed);

        // Redelivery limit reached; the queue stays empty.
        let queue = session.queue("q1").unwrap();
        assert!(queue.rx.is_empty());
    }

    #[tokio::test]
    async fn direct_subscription_sees_matching_topics() {
        let config = fresh_config();
        let session = DevSession::connect(&config);
        let rx = session
            .subscribe(&TopicFilter::parse("reply/*").unwrap())
            .await
            .unwrap();

        session.publish("reply/abc", b"1", &Map::new()).await.unwrap();
        session.publish("other", b"2", &Map::new()).await.unwrap();

        let received = rx.recv_async().await.unwrap();
        assert_eq!(received.topic, "reply/abc");
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn sessions_share_a_hub_by_url() {
        let config = fresh_config();
        let consumer = DevSession::connect(&config);
        let producer = DevSession::connect(&config);

        consumer.create_queue("shared", true).await.unwrap();
        consumer
            .bind_subscriptions("shared", &[TopicFilter::parse("t/>").unwrap()])
            .await
            .unwrap();

        producer.publish("t/1", b"payload", &Map::new()).await.unwrap();
        let received = consumer.receive("shared").await.unwrap();
        assert_eq!(received.payload, b"payload");
    }

    #[tokio::test]
    async fn close_removes_session_resources() {
        let config = fresh_config();
        let session = DevSession::connect(&config);
        session.create_queue("mine", true).await.unwrap();
        session.close().await.unwrap();

        let other = DevSession::connect(&config);
        assert!(other.receive("mine").await.is_err());
    }
}
