//! Correlation Controller
//!
//! One controller = one reply path: a reply topic carrying the controller's
//! uuid, a reply queue bound to it, a listener task matching incoming
//! replies to registered waiters by correlation id, and a reaper task
//! timing out waiters whose deadline has passed. Late replies for unknown
//! correlation ids are logged and discarded, never errors.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::broker::{self, BrokerConnectionConfig, BrokerSession, TopicFilter};
use crate::error::ProcessingError;
use crate::expression::{self, Expression, builtins};
use crate::message::Message;
use crate::message::codec::{self, PayloadEncoding, PayloadFormat};
use crate::request_reply::{RequestReplySettings, stamp_properties};

pub const REPLY_TOPIC_PROPERTY: &str = "__reply_topic__";
pub const CORRELATION_ID_PROPERTY: &str = "__request_cid__";

/// An outgoing request.
#[derive(Debug)]
pub struct Request {
    pub topic: String,
    pub payload: Value,
    pub user_properties: Map<String, Value>,
}

impl Request {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            topic: topic.to_string(),
            payload,
            user_properties: Map::new(),
        }
    }
}

/// Per-call options for `do_request_response`.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// Expect many response chunks instead of exactly one.
    pub stream: bool,

    /// Evaluated against each reply chunk; truthy marks the last chunk.
    pub completion_expression: Option<String>,

    /// `false` turns the call into fire-and-forget.
    pub wait: bool,

    /// Waiter deadline; the controller default applies when absent.
    pub timeout_ms: Option<u64>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            stream: false,
            completion_expression: None,
            wait: true,
            timeout_ms: None,
        }
    }
}

/// One delivered response chunk and whether it is the last.
pub struct StreamChunk {
    pub message: Message,
    pub last: bool,
}

type WaiterItem = Result<StreamChunk, ProcessingError>;

struct Waiter {
    tx: flume::Sender<WaiterItem>,
    deadline: Instant,
    stream: bool,
    completion: Option<Expression>,
    timeout_ms: u64,
}

type WaiterMap = Arc<Mutex<HashMap<String, Waiter>>>;

/// The result of a request.
pub enum Response {
    /// Fire-and-forget: nothing to wait for.
    None,

    /// The single reply of a non-streaming request.
    Single(Message),

    /// A streaming reply; pull chunks with [`ResponseStream::next`].
    Stream(ResponseStream),
}

/// Receiver side of a streaming request.
pub struct ResponseStream {
    cid: String,
    rx: flume::Receiver<WaiterItem>,
    waiters: WaiterMap,
    done: bool,
}

impl ResponseStream {
    /// Next chunk and its last-flag; `Ok(None)` after the final chunk.
    pub async fn next(&mut self) -> Result<Option<(Message, bool)>, ProcessingError> {
        if self.done {
            return Ok(None);
        }
        match self.rx.recv_async().await {
            Ok(Ok(chunk)) => {
                if chunk.last {
                    self.done = true;
                }
                Ok(Some((chunk.message, chunk.last)))
            }
            Ok(Err(error)) => {
                self.done = true;
                Err(error)
            }
            // Listener dropped the sender without a terminator.
            Err(_) => {
                self.done = true;
                Err(ProcessingError::Timeout(0))
            }
        }
    }

    /// Abandon the stream; later replies for this correlation id are
    /// discarded.
    pub fn cancel(self) {
        self.waiters
            .lock()
            .expect("waiter map lock")
            .remove(&self.cid);
    }

    pub fn correlation_id(&self) -> &str {
        &self.cid
    }
}

pub struct RequestReplyController {
    id: String,
    session: Arc<dyn BrokerSession>,
    reply_topic: String,
    reply_queue: String,
    waiters: WaiterMap,
    default_timeout: Duration,
    insertion: Option<Expression>,
    encoding: PayloadEncoding,
    format: PayloadFormat,
    listener: Mutex<Option<JoinHandle<()>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RequestReplyController {
    /// Connect a dedicated broker session, set up the controller's reply
    /// resources and start its listener and reaper tasks.
    pub async fn start(
        connection: &BrokerConnectionConfig,
        settings: &RequestReplySettings,
        encoding: PayloadEncoding,
        format: PayloadFormat,
    ) -> anyhow::Result<Arc<Self>> {
        let id = uuid::Uuid::new_v4().to_string();
        let reply_topic = format!("{}/{}", settings.response_topic_prefix, id);
        let reply_queue = format!("{}-{}", settings.response_queue_prefix, id);

        let session = broker::connect(connection).await?;
        session.create_queue(&reply_queue, false).await?;
        let filter = TopicFilter::parse(&reply_topic)
            .map_err(|e| anyhow::anyhow!("reply topic invalid: {e}"))?;
        session.bind_subscriptions(&reply_queue, &[filter]).await?;

        let insertion = settings
            .response_topic_insertion_expression
            .as_deref()
            .map(Expression::parse)
            .transpose()
            .map_err(|e| anyhow::anyhow!("response topic insertion expression invalid: {e}"))?;

        let controller = Arc::new(Self {
            id: id.clone(),
            session,
            reply_topic,
            reply_queue,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            default_timeout: Duration::from_millis(settings.request_expiry_ms),
            insertion,
            encoding,
            format,
            listener: Mutex::new(None),
            reaper: Mutex::new(None),
        });

        controller.spawn_listener();
        controller.spawn_reaper();
        tracing::info!(
            "request/reply controller {id} listening on '{}'",
            controller.reply_topic
        );
        Ok(controller)
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    pub fn outstanding_requests(&self) -> usize {
        self.waiters.lock().expect("waiter map lock").len()
    }

    /// Perform a correlated request. Non-streaming calls block the calling
    /// worker until the reply or the deadline; streaming calls return the
    /// stream handle immediately.
    pub async fn do_request_response(
        &self,
        request: Request,
        options: RequestOptions,
    ) -> Result<Response, ProcessingError> {
        let cid = uuid::Uuid::new_v4().to_string();
        let timeout_ms = options
            .timeout_ms
            .unwrap_or(self.default_timeout.as_millis() as u64);

        // The reply topic travels either as a user property or inside the
        // payload, at the configured insertion expression.
        let mut payload = request.payload;
        let reply_topic_in_properties = match &self.insertion {
            Some(expr) => {
                let mut carrier = Message::new(&request.topic, payload);
                expression::write(
                    &mut carrier,
                    expr,
                    Value::String(self.reply_topic.clone()),
                )?;
                payload = carrier.payload;
                None
            }
            None => Some(self.reply_topic.as_str()),
        };
        let properties =
            stamp_properties(&request.user_properties, reply_topic_in_properties, &cid);

        let receiver = if options.wait {
            let completion = options
                .completion_expression
                .as_deref()
                .map(Expression::parse)
                .transpose()?;
            let capacity = if options.stream { None } else { Some(1) };
            let (tx, rx) = match capacity {
                Some(bound) => flume::bounded(bound),
                None => flume::unbounded(),
            };
            self.waiters.lock().expect("waiter map lock").insert(
                cid.clone(),
                Waiter {
                    tx,
                    deadline: Instant::now() + Duration::from_millis(timeout_ms),
                    stream: options.stream,
                    completion,
                    timeout_ms,
                },
            );
            Some(rx)
        } else {
            None
        };

        let bytes = codec::encode_payload(&payload, self.encoding, self.format)?;
        if let Err(error) = self.session.publish(&request.topic, &bytes, &properties).await {
            self.waiters.lock().expect("waiter map lock").remove(&cid);
            return Err(error);
        }

        let Some(rx) = receiver else {
            return Ok(Response::None);
        };

        if options.stream {
            return Ok(Response::Stream(ResponseStream {
                cid,
                rx,
                waiters: self.waiters.clone(),
                done: false,
            }));
        }

        match rx.recv_async().await {
            Ok(Ok(chunk)) => Ok(Response::Single(chunk.message)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ProcessingError::Timeout(timeout_ms)),
        }
    }

    /// Cancel an outstanding request; later replies for the id are
    /// discarded.
    pub fn cancel(&self, cid: &str) -> bool {
        self.waiters
            .lock()
            .expect("waiter map lock")
            .remove(cid)
            .is_some()
    }

    /// Fail every outstanding waiter, used when the controller goes away.
    pub fn fail_outstanding(&self, error: &ProcessingError) {
        let drained: Vec<Waiter> = {
            let mut waiters = self.waiters.lock().expect("waiter map lock");
            waiters.drain().map(|(_, waiter)| waiter).collect()
        };
        for waiter in drained {
            let _ = waiter.tx.try_send(Err(error.clone()));
        }
    }

    /// Tear down the controller: unsubscribe and delete the reply
    /// resources, fail outstanding waiters.
    pub async fn stop(&self, error: ProcessingError) {
        if let Some(task) = self.listener.lock().expect("listener lock").take() {
            task.abort();
        }
        if let Some(task) = self.reaper.lock().expect("reaper lock").take() {
            task.abort();
        }
        self.fail_outstanding(&error);
        if let Err(e) = self.session.close().await {
            tracing::warn!("request/reply session close failed: {e}");
        }
        tracing::info!("request/reply controller {} stopped", self.id);
    }

    fn spawn_listener(self: &Arc<Self>) {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match controller.session.receive(&controller.reply_queue).await {
                    Ok(received) => {
                        // Replies settle with the broker on receipt; the
                        // waiter channel takes over delivery from here.
                        let payload = codec::decode_payload(
                            &received.payload,
                            controller.encoding,
                            controller.format,
                        );
                        let reply = Message::new(&received.topic, payload)
                            .with_user_properties(received.user_properties);
                        received.ack.succeed();
                        controller.dispatch_reply(reply);
                    }
                    Err(ProcessingError::QueueClosed) => break,
                    Err(error) => {
                        tracing::error!("reply listener receive failed: {error}");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }
                }
            }
        });
        *self.listener.lock().expect("listener lock") = Some(task);
    }

    fn dispatch_reply(&self, reply: Message) {
        let Some(cid) = reply
            .user_properties
            .get(CORRELATION_ID_PROPERTY)
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            tracing::debug!("discarding reply without a correlation id");
            return;
        };

        let mut waiters = self.waiters.lock().expect("waiter map lock");
        let Some(waiter) = waiters.get(&cid) else {
            tracing::debug!("discarding late reply for unknown correlation id {cid}");
            return;
        };

        if waiter.deadline <= Instant::now() {
            let waiter = waiters.remove(&cid).expect("present under lock");
            let timeout_ms = waiter.timeout_ms;
            let _ = waiter.tx.try_send(Err(ProcessingError::Timeout(timeout_ms)));
            return;
        }

        if !waiter.stream {
            let waiter = waiters.remove(&cid).expect("present under lock");
            let _ = waiter.tx.try_send(Ok(StreamChunk {
                message: reply,
                last: true,
            }));
            return;
        }

        let last = match &waiter.completion {
            Some(expr) => {
                match expression::evaluate(expr, &expression::EvalContext::new(&reply)) {
                    Ok(value) => builtins::truthy(&value),
                    Err(error) => {
                        tracing::warn!("completion expression failed, closing stream: {error}");
                        true
                    }
                }
            }
            None => true,
        };

        let delivered = waiter
            .tx
            .send(Ok(StreamChunk {
                message: reply,
                last,
            }))
            .is_ok();
        if last || !delivered {
            waiters.remove(&cid);
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let waiters = self.waiters.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let expired: Vec<Waiter> = {
                    let mut waiters = waiters.lock().expect("waiter map lock");
                    let cids: Vec<String> = waiters
                        .iter()
                        .filter(|(_, waiter)| waiter.deadline <= now)
                        .map(|(cid, _)| cid.clone())
                        .collect();
                    cids.into_iter()
                        .filter_map(|cid| waiters.remove(&cid))
                        .collect()
                };
                for waiter in expired {
                    let timeout_ms = waiter.timeout_ms;
                    let _ = waiter.tx.try_send(Err(ProcessingError::Timeout(timeout_ms)));
                }
            }
        });
        *self.reaper.lock().expect("reaper lock") = Some(task);
    }
}
