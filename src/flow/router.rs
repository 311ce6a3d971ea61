//! Subscription Router
//!
//! The implicit first-match dispatcher of a multi-component simplified
//! app. Routes are held in declaration order: components in the order they
//! appear in configuration, subscriptions in their listed order within
//! each component. The first matching route wins even when a later one is
//! strictly more specific; there is no retry and no second delivery. The
//! router runs with a single worker so first-match stays cheap and
//! deterministic.

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::TopicFilter;
#[cfg(test)]
use std::sync::Arc;
use crate::components::component::{Component, StageContext};
use crate::error::ProcessingError;
use crate::message::Message;

struct Route {
    filter: TopicFilter,
    target_name: String,
    target: flume::Sender<Message>,
}

pub struct SubscriptionRouter {
    routes: Vec<Route>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Append a route; call order defines match order.
    pub fn add_route(
        &mut self,
        filter: TopicFilter,
        target_name: &str,
        target: flume::Sender<Message>,
    ) {
        self.routes.push(Route {
            filter,
            target_name: target_name.to_string(),
            target,
        });
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for SubscriptionRouter {
    async fn invoke(
        &self,
        _ctx: &StageContext,
        message: &mut Message,
        _data: Value,
    ) -> Result<Option<Value>, ProcessingError> {
        for route in &self.routes {
            if !route.filter.matches(&message.topic_levels) {
                continue;
            }

            // Hand the message over wholesale: payload, state and the ACK
            // callbacks all move to the forwarded copy, leaving the
            // original empty so the runtime's success resolution below is
            // a no-op.
            let forwarded = Message {
                payload: message.payload.take(),
                topic: message.topic.clone(),
                topic_levels: std::mem::take(&mut message.topic_levels),
                user_properties: std::mem::take(&mut message.user_properties),
                user_data: message.user_data.take(),
                previous: message.previous.take(),
                ack_callbacks: std::mem::take(&mut message.ack_callbacks),
                iteration_state: None,
            };

            tracing::debug!(
                "routing '{}' to stage '{}'",
                message.topic,
                route.target_name
            );
            if let Err(flume::SendError(lost)) = route.target.send_async(forwarded).await {
                lost.resolve_failure(&ProcessingError::QueueClosed);
            }
            return Ok(None);
        }

        tracing::warn!("no subscription matches topic '{}', discarding", message.topic);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::component::{AppServices, ScopedConfig};
    use crate::runtime::{CacheService, TimerService};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_context() -> StageContext {
        let services = AppServices::new(
            Arc::new(TimerService::new()),
            Arc::new(CacheService::new()),
            None,
            10,
        );
        let (timer_tx, _) = flume::unbounded();
        let (cache_tx, _) = flume::unbounded();
        StageContext::new(
            "app",
            "flow",
            "router",
            ScopedConfig::default(),
            services,
            timer_tx,
            cache_tx,
        )
    }

    fn router_with_two_targets() -> (
        SubscriptionRouter,
        flume::Receiver<Message>,
        flume::Receiver<Message>,
    ) {
        let mut router = SubscriptionRouter::new();
        let (tx_a, rx_a) = flume::bounded(8);
        let (tx_b, rx_b) = flume::bounded(8);
        router.add_route(TopicFilter::parse("data/*/high").unwrap(), "stage_a", tx_a);
        router.add_route(TopicFilter::parse("data/>").unwrap(), "stage_b", tx_b);
        (router, rx_a, rx_b)
    }

    #[tokio::test]
    async fn first_match_wins() {
        let (router, rx_a, rx_b) = router_with_two_targets();
        let ctx = test_context();

        let mut high = Message::new("data/raw/high", json!({"v": 1}));
        router.invoke(&ctx, &mut high, Value::Null).await.unwrap();
        assert_eq!(rx_a.recv_async().await.unwrap().payload, json!({"v": 1}));
        assert!(rx_b.is_empty());

        let mut low = Message::new("data/raw/low", json!({"v": 2}));
        router.invoke(&ctx, &mut low, Value::Null).await.unwrap();
        assert_eq!(rx_b.recv_async().await.unwrap().payload, json!({"v": 2}));
        assert!(rx_a.is_empty());
    }

    #[tokio::test]
    async fn unmatched_topic_released_with_success() {
        let (router, rx_a, rx_b) = router_with_two_targets();
        let ctx = test_context();

        let acked = Arc::new(AtomicUsize::new(0));
        let mut message = Message::new("other/x", json!({}));
        let counter = acked.clone();
        message.push_ack(crate::message::AckHandle::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));

        let result = router.invoke(&ctx, &mut message, Value::Null).await.unwrap();
        assert!(result.is_none());
        assert!(rx_a.is_empty() && rx_b.is_empty());

        // The runtime resolves success on a None result; emulate it.
        message.resolve_success();
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ack_callbacks_travel_with_the_routed_message() {
        let (router, rx_a, _rx_b) = router_with_two_targets();
        let ctx = test_context();

        let acked = Arc::new(AtomicUsize::new(0));
        let mut message = Message::new("data/raw/high", json!({}));
        let counter = acked.clone();
        message.push_ack(crate::message::AckHandle::new(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
        ));

        router.invoke(&ctx, &mut message, Value::Null).await.unwrap();
        // Original carries no callbacks any more.
        message.resolve_success();
        assert_eq!(acked.load(Ordering::SeqCst), 0);

        // The forwarded message does.
        let forwarded = rx_a.recv_async().await.unwrap();
        forwarded.resolve_success();
        assert_eq!(acked.load(Ordering::SeqCst), 1);
    }
}
