//! Request/Response over the Broker
//!
//! A correlation engine letting any stage perform synchronous or streaming
//! request/reply while the rest of the pipeline keeps processing. Each
//! controller owns a reply topic and reply queue unique to itself; replies
//! are matched back to waiters by correlation id. A session manager layers
//! multiple independent controllers on top for components that need
//! separate broker identities.

pub mod controller;
pub mod session;

use serde::Deserialize;
use serde_json::{Map, Value};

pub use controller::{
    CORRELATION_ID_PROPERTY, REPLY_TOPIC_PROPERTY, Request, RequestOptions,
    RequestReplyController, Response, ResponseStream,
};
pub use session::{RequestReplyService, SessionStatus};

/// Request/reply sub-keys of the broker block.
#[derive(Clone, Debug, Deserialize)]
pub struct RequestReplySettings {
    #[serde(default = "default_response_topic_prefix")]
    pub response_topic_prefix: String,

    #[serde(default = "default_response_queue_prefix")]
    pub response_queue_prefix: String,

    /// Default waiter deadline in milliseconds.
    #[serde(default = "default_request_expiry_ms")]
    pub request_expiry_ms: u64,

    /// When set, the reply topic is written into the outgoing payload at
    /// this destination expression instead of travelling as a user
    /// property.
    #[serde(default)]
    pub response_topic_insertion_expression: Option<String>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for RequestReplySettings {
    fn default() -> Self {
        Self {
            response_topic_prefix: default_response_topic_prefix(),
            response_queue_prefix: default_response_queue_prefix(),
            request_expiry_ms: default_request_expiry_ms(),
            response_topic_insertion_expression: None,
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_response_topic_prefix() -> String {
    "reply".to_string()
}

fn default_response_queue_prefix() -> String {
    "reply-queue".to_string()
}

const fn default_request_expiry_ms() -> u64 {
    60_000
}

const fn default_max_sessions() -> usize {
    10
}

/// Helper building the outgoing request's user property map.
pub(crate) fn stamp_properties(
    base: &Map<String, Value>,
    reply_topic: Option<&str>,
    cid: &str,
) -> Map<String, Value> {
    let mut properties = base.clone();
    if let Some(topic) = reply_topic {
        properties.insert(REPLY_TOPIC_PROPERTY.into(), Value::String(topic.into()));
    }
    properties.insert(CORRELATION_ID_PROPERTY.into(), Value::String(cid.into()));
    properties
}
