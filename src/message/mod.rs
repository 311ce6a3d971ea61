pub mod codec;

use serde_json::{Map, Value};

use crate::error::ProcessingError;

/// One-shot acknowledgement pair bound at ingress.
///
/// Exactly one side runs, exactly once: resolving consumes the handle, and
/// the unused side is dropped. Ingress stages append one handle per broker
/// delivery; the runtime resolves all handles in reverse-append order when
/// the message reaches a terminal state.
pub struct AckHandle {
    on_success: Box<dyn FnOnce() + Send + Sync>,
    on_failure: Box<dyn FnOnce(&ProcessingError) + Send + Sync>,
}

impl AckHandle {
    pub fn new(
        on_success: impl FnOnce() + Send + Sync + 'static,
        on_failure: impl FnOnce(&ProcessingError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_failure: Box::new(on_failure),
        }
    }

    /// A handle that settles nowhere; used for replies and test fixtures.
    pub fn noop() -> Self {
        Self::new(|| {}, |_| {})
    }

    pub fn succeed(self) {
        (self.on_success)();
    }

    pub fn fail(self, error: &ProcessingError) {
        (self.on_failure)(error);
    }
}

impl std::fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AckHandle")
    }
}

/// Transient record exposed to expressions inside map/filter/reduce
/// transforms. Cleared before the message crosses a stage boundary.
#[derive(Debug, Clone, Default)]
pub struct IterationState {
    pub index: usize,
    pub current_value: Value,
    pub accumulated_value: Value,
    pub source_list: Value,
}

/// The unit traversing a flow.
///
/// A message is owned by exactly one worker at any time; handing it to the
/// successor queue transfers ownership. `Message` is deliberately not
/// `Clone`: the ACK handles it carries must resolve exactly once, and
/// single ownership is what enforces that.
#[derive(Debug)]
pub struct Message {
    pub payload: Value,
    pub topic: String,
    pub topic_levels: Vec<String>,
    pub user_properties: Map<String, Value>,
    pub user_data: Value,
    pub previous: Value,
    pub ack_callbacks: Vec<AckHandle>,
    pub iteration_state: Option<IterationState>,
}

impl Message {
    pub fn new(topic: &str, payload: Value) -> Self {
        Self {
            previous: payload.clone(),
            payload,
            topic: topic.to_string(),
            topic_levels: split_topic(topic),
            user_properties: Map::new(),
            user_data: Value::Object(Map::new()),
            ack_callbacks: Vec::new(),
            iteration_state: None,
        }
    }

    pub fn with_user_properties(mut self, user_properties: Map<String, Value>) -> Self {
        self.user_properties = user_properties;
        self
    }

    /// Attach an acknowledgement pair; only ingress stages do this.
    pub fn push_ack(&mut self, handle: AckHandle) {
        self.ack_callbacks.push(handle);
    }

    /// Terminal success: run every success callback in reverse-append order.
    pub fn resolve_success(self) {
        for handle in self.ack_callbacks.into_iter().rev() {
            handle.succeed();
        }
    }

    /// Terminal failure: run every failure callback in reverse-append order.
    pub fn resolve_failure(self, error: &ProcessingError) {
        for handle in self.ack_callbacks.into_iter().rev() {
            handle.fail(error);
        }
    }
}

/// Split a hierarchical topic into its levels.
pub fn split_topic(topic: &str) -> Vec<String> {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn topic_levels_follow_topic() {
        let msg = Message::new("data/raw/high", json!({"v": 1}));
        assert_eq!(msg.topic_levels, vec!["data", "raw", "high"]);
        assert_eq!(msg.previous, json!({"v": 1}));
    }

    #[test]
    fn ack_resolution_runs_each_pair_once() {
        let success = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(AtomicUsize::new(0));

        let mut msg = Message::new("t", Value::Null);
        for _ in 0..3 {
            let s = success.clone();
            let f = failure.clone();
            msg.push_ack(AckHandle::new(
                move || {
                    s.fetch_add(1, Ordering::SeqCst);
                },
                move |_| {
                    f.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }

        msg.resolve_success();
        assert_eq!(success.load(Ordering::SeqCst), 3);
        assert_eq!(failure.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ack_failure_runs_failure_side_only() {
        let success = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(AtomicUsize::new(0));

        let mut msg = Message::new("t", Value::Null);
        let s = success.clone();
        let f = failure.clone();
        msg.push_ack(AckHandle::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        ));

        msg.resolve_failure(&ProcessingError::QueueClosed);
        assert_eq!(success.load(Ordering::SeqCst), 0);
        assert_eq!(failure.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reverse_append_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut msg = Message::new("t", Value::Null);
        for i in 0..3 {
            let o = order.clone();
            msg.push_ack(AckHandle::new(move || o.lock().unwrap().push(i), |_| {}));
        }

        msg.resolve_success();
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }
}
