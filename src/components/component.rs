//! Component Contract
//!
//! A component is the implementation behind a stage: it provides `invoke`
//! plus optional timer, cache-expiry and shutdown hooks. Components are
//! shared by every worker of their stage, so anything mutable they hold
//! must be guarded internally; configuration is immutable after
//! construction and freely shared.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use crate::error::{ErrorKind, NackReaction, ProcessingError};
use crate::message::Message;
use crate::request_reply::{Request, RequestOptions, RequestReplyService, Response};
use crate::runtime::{
    CacheExpiryEvent, CacheService, MissedTickPolicy, TimerEvent, TimerRequest, TimerService,
};

/// Configuration visible to a component, resolved through the lookup
/// chain: component scope, then app scope, then the component kind's
/// declared defaults.
#[derive(Clone, Default)]
pub struct ScopedConfig {
    component: Map<String, Value>,
    app: Arc<Map<String, Value>>,
    defaults: Map<String, Value>,
}

impl ScopedConfig {
    pub fn new(
        component: Map<String, Value>,
        app: Arc<Map<String, Value>>,
        defaults: Map<String, Value>,
    ) -> Self {
        Self {
            component,
            app,
            defaults,
        }
    }

    /// Resolve a key through the chain; never skips a level.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.component
            .get(key)
            .or_else(|| self.app.get(key))
            .or_else(|| self.defaults.get(key))
            .cloned()
    }

    pub fn get_or(&self, key: &str, default: Value) -> Value {
        self.get(key).unwrap_or(default)
    }
}

/// Routes synthetic error events to the app's designated error flow,
/// rate-limited so a failing stage cannot starve normal processing.
pub struct ErrorRouter {
    target: OnceLock<flume::Sender<Message>>,
    max_per_second: u32,
    window: Mutex<(Instant, u32)>,
    dropped: AtomicU64,
}

impl ErrorRouter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            target: OnceLock::new(),
            max_per_second,
            window: Mutex::new((Instant::now(), 0)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn set_target(&self, sender: flume::Sender<Message>) {
        let _ = self.target.set(sender);
    }

    pub fn has_target(&self) -> bool {
        self.target.get().is_some()
    }

    /// Try to route an error event. Never blocks: over-rate or full-queue
    /// events are dropped and counted.
    pub fn route(&self, event: Message) -> bool {
        let Some(target) = self.target.get() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        {
            let mut window = self.window.lock().expect("error rate window lock");
            let now = Instant::now();
            if now.duration_since(window.0).as_secs() >= 1 {
                *window = (now, 0);
            }
            if window.1 >= self.max_per_second {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            window.1 += 1;
        }

        if target.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Process- and app-level services reachable from any stage. Stages hold
/// the app by these services and by name only, never by a strong
/// back-pointer.
pub struct AppServices {
    pub timer: Arc<TimerService>,
    pub cache: Arc<CacheService>,
    pub request_reply: Option<Arc<RequestReplyService>>,
    /// Input queue of the app's implicit egress stage, when output is
    /// enabled.
    pub egress: OnceLock<flume::Sender<Message>>,
    pub errors: ErrorRouter,
}

impl AppServices {
    pub fn new(
        timer: Arc<TimerService>,
        cache: Arc<CacheService>,
        request_reply: Option<Arc<RequestReplyService>>,
        max_errors_per_second: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            timer,
            cache,
            request_reply,
            egress: OnceLock::new(),
            errors: ErrorRouter::new(max_errors_per_second),
        })
    }
}

/// Everything a component can reach while handling a message: its place
/// in the topology, its configuration chain and the app's services.
pub struct StageContext {
    pub app_name: String,
    pub flow_name: String,
    pub stage_name: String,
    pub config: ScopedConfig,
    pub services: Arc<AppServices>,
    timer_events: flume::Sender<TimerEvent>,
    cache_events: flume::Sender<CacheExpiryEvent>,
}

impl StageContext {
    pub fn new(
        app_name: &str,
        flow_name: &str,
        stage_name: &str,
        config: ScopedConfig,
        services: Arc<AppServices>,
        timer_events: flume::Sender<TimerEvent>,
        cache_events: flume::Sender<CacheExpiryEvent>,
    ) -> Self {
        Self {
            app_name: app_name.to_string(),
            flow_name: flow_name.to_string(),
            stage_name: stage_name.to_string(),
            config,
            services,
            timer_events,
            cache_events,
        }
    }

    /// Stable identifier for timer ownership and error events.
    pub fn stage_id(&self) -> String {
        format!("{}.{}.{}", self.app_name, self.flow_name, self.stage_name)
    }

    /// Resolve configuration through component scope, app scope, then
    /// component defaults.
    pub fn get_config(&self, key: &str) -> Option<Value> {
        self.config.get(key)
    }

    /// Request a timer; due events arrive at this stage's
    /// `handle_timer_event` between messages.
    pub fn add_timer(
        &self,
        delay_ms: u64,
        timer_id: &str,
        interval_ms: Option<u64>,
        payload: Option<Value>,
    ) {
        self.services.timer.add_timer(TimerRequest {
            owner: self.stage_id(),
            timer_id: timer_id.to_string(),
            delay: std::time::Duration::from_millis(delay_ms),
            interval: interval_ms.map(std::time::Duration::from_millis),
            payload,
            missed_tick_policy: MissedTickPolicy::CatchUp,
            dispatch: self.timer_events.clone(),
        });
    }

    pub fn cancel_timer(&self, timer_id: &str) {
        self.services.timer.cancel_timer(&self.stage_id(), timer_id);
    }

    pub fn cache(&self) -> &CacheService {
        &self.services.cache
    }

    /// Store a TTL cache entry whose expiry event comes back to this
    /// stage's `handle_cache_expiry`.
    pub fn cache_set_with_expiry(&self, key: &str, value: Value, ttl_ms: u64) {
        self.services.cache.set(
            key,
            value,
            Some(std::time::Duration::from_millis(ttl_ms)),
            Some(self.cache_events.clone()),
        );
    }

    /// Enqueue a message to the app's implicit egress; errors when output
    /// is disabled.
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

    pub fn request_reply(&self) -> Option<Arc<RequestReplyService>> {
        self.services.request_reply.clone()
    }

    /// Correlated request over the broker; errors when request/reply is
    /// not enabled for this app.
    pub async fn do_request_response(
        &self,
        request: Request,
        options: RequestOptions,
        session_id: Option<&str>,
    ) -> Result<Response, ProcessingError> {
        let service = self.services.request_reply.as_ref().ok_or_else(|| {
            ProcessingError::Broker("request/reply is not enabled for this app".into())
        })?;
        service.do_request_response(request, options, session_id).await
    }
}

/// The capability set a stage expects from its component.
#[async_trait]
pub trait Component: Send + Sync {
    /// Called once before any worker starts; broker components open their
    /// sessions here.
    async fn start(&self, _ctx: &StageContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Process one prepared input. Returning `None` stops propagation and
    /// resolves the message's ACK as success (filter semantics); a value
    /// becomes the message's `previous` for the next stage.
    async fn invoke(
        &self,
        ctx: &StageContext,
        message: &mut Message,
        data: Value,
    ) -> Result<Option<Value>, ProcessingError>;

    /// Source components produce messages instead of consuming a queue.
    fn is_source(&self) -> bool {
        false
    }

    /// Pull the next message from the source; only called when
    /// `is_source` is true.
    async fn produce(&self, _ctx: &StageContext) -> Result<Option<Message>, ProcessingError> {
        Ok(None)
    }

    async fn handle_timer_event(
        &self,
        _ctx: &StageContext,
        _event: TimerEvent,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    async fn handle_cache_expiry(
        &self,
        _ctx: &StageContext,
        _event: CacheExpiryEvent,
    ) -> Result<(), ProcessingError> {
        Ok(())
    }

    /// Override to choose between redelivery and discard for a given
    /// error kind; `None` defers to the stage's configured policy.
    fn nack_reaction(&self, _kind: ErrorKind) -> Option<NackReaction> {
        None
    }

    /// Point-in-time counters for monitoring surfaces.
    fn metrics(&self) -> Option<Value> {
        None
    }

    /// Called once after the stage's workers have stopped.
    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scoped_config_resolves_in_order() {
        let mut component = Map::new();
        component.insert("shared".into(), json!("component"));
        component.insert("component_only".into(), json!(1));

        let mut app = Map::new();
        app.insert("shared".into(), json!("app"));
        app.insert("app_only".into(), json!(2));

        let mut defaults = Map::new();
        defaults.insert("shared".into(), json!("default"));
        defaults.insert("default_only".into(), json!(3));

        let config = ScopedConfig::new(component, Arc::new(app), defaults);
        assert_eq!(config.get("shared"), Some(json!("component")));
        assert_eq!(config.get("component_only"), Some(json!(1)));
        assert_eq!(config.get("app_only"), Some(json!(2)));
        assert_eq!(config.get("default_only"), Some(json!(3)));
        assert_eq!(config.get("absent"), None);
    }

    #[test]
    fn error_router_rate_limits() {
        let router = ErrorRouter::new(2);
        let (tx, rx) = flume::bounded(16);
        router.set_target(tx);

        assert!(router.route(Message::new("e/1", json!(1))));
        assert!(router.route(Message::new("e/2", json!(2))));
        assert!(!router.route(Message::new("e/3", json!(3))));
        assert_eq!(router.dropped_count(), 1);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn error_router_without_target_drops() {
        let router = ErrorRouter::new(10);
        assert!(!router.route(Message::new("e", json!(null))));
        assert_eq!(router.dropped_count(), 1);
    }
}
