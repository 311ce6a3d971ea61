//! Stage Runtime
//!
//! A stage is one processing position in a flow: a bounded input queue, a
//! pool of identical workers and the component they drive. Workers pull a
//! message, apply the stage's input transforms, evaluate the input
//! selection, call the component's `invoke` and settle the message: null
//! output resolves the ACK as success, a value forwards to the successor
//! queue (blocking on back-pressure), errors go through the stage's error
//! policy. Source stages run the component's `produce` loop instead of
//! consuming a queue.

use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::components::component::{AppServices, Component, ScopedConfig, StageContext};
use crate::config::{DrainPolicy, ErrorPolicyConfig};
use crate::error::{ErrorPolicy, NackReaction, ProcessingError};
use crate::expression::transform::{self, CompiledTransform};
use crate::expression::{CompiledSource, EvalContext, Expression, evaluate};
use crate::message::Message;
use crate::runtime::{CacheExpiryEvent, TimerEvent};

/// Everything needed to build a stage, resolved at flow construction.
pub struct StageSpec {
    pub name: String,
    pub kind: String,
    pub component: Arc<dyn Component>,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub transforms: Vec<CompiledTransform>,
    pub input_selection: Option<CompiledSource>,
    /// Simplified apps: wraps bare output values with an egress topic.
    pub output_topic: Option<Expression>,
    pub error_policy: ErrorPolicyConfig,
    pub drain_policy: DrainPolicy,
    pub config: ScopedConfig,
}

impl StageSpec {
    pub fn plain(name: &str, kind: &str, component: Arc<dyn Component>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            component,
            worker_count: 1,
            queue_capacity: 100,
            transforms: Vec::new(),
            input_selection: None,
            output_topic: None,
            error_policy: ErrorPolicyConfig::default(),
            drain_policy: DrainPolicy::default(),
            config: ScopedConfig::default(),
        }
    }
}

// State shared by every worker of a stage.
struct WorkerShared {
    app_name: String,
    flow_name: String,
    stage_name: String,
    component: Arc<dyn Component>,
    transforms: Vec<CompiledTransform>,
    input_selection: Option<CompiledSource>,
    output_topic: Option<Expression>,
    error_policy: ErrorPolicyConfig,
    context: Arc<StageContext>,
    next: Option<flume::Sender<Message>>,
    input_rx: flume::Receiver<Message>,
    timer_rx: flume::Receiver<TimerEvent>,
    cache_rx: flume::Receiver<CacheExpiryEvent>,
}

pub struct Stage {
    app_name: String,
    flow_name: String,
    spec: StageSpec,
    input_tx: flume::Sender<Message>,
    input_rx: flume::Receiver<Message>,
    timer_tx: flume::Sender<TimerEvent>,
    timer_rx: flume::Receiver<TimerEvent>,
    cache_tx: flume::Sender<CacheExpiryEvent>,
    cache_rx: flume::Receiver<CacheExpiryEvent>,
    next: Option<flume::Sender<Message>>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Stage {
    pub fn new(app_name: &str, flow_name: &str, spec: StageSpec) -> Self {
        let (input_tx, input_rx) = flume::bounded(spec.queue_capacity);
        let (timer_tx, timer_rx) = flume::unbounded();
        let (cache_tx, cache_rx) = flume::unbounded();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            app_name: app_name.to_string(),
            flow_name: flow_name.to_string(),
            spec,
            input_tx,
            input_rx,
            timer_tx,
            timer_rx,
            cache_tx,
            cache_rx,
            next: None,
            shutdown_tx,
            workers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn worker_count(&self) -> usize {
        self.spec.worker_count
    }

    /// Producer handle for this stage's input queue; sending blocks when
    /// the queue is full.
    pub fn sender(&self) -> flume::Sender<Message> {
        self.input_tx.clone()
    }

    /// Wire the successor queue; managed by the owning flow.
    pub fn set_next(&mut self, next: flume::Sender<Message>) {
        self.next = Some(next);
    }

    pub async fn enqueue(&self, message: Message) -> Result<(), ProcessingError> {
        self.input_tx
            .send_async(message)
            .await
            .map_err(|_| ProcessingError::QueueClosed)
    }

    /// Start the component and spawn the worker pool.
    pub async fn start(&mut self, services: Arc<AppServices>) -> anyhow::Result<()> {
        let context = Arc::new(StageContext::new(
            &self.app_name,
            &self.flow_name,
            &self.spec.name,
            self.spec.config.clone(),
            services,
            self.timer_tx.clone(),
            self.cache_tx.clone(),
        ));

        self.spec
            .component
            .start(&context)
            .await
            .map_err(|e| anyhow::anyhow!("stage '{}' failed to start: {}", self.spec.name, e))?;

        let shared = Arc::new(WorkerShared {
            app_name: self.app_name.clone(),
            flow_name: self.flow_name.clone(),
            stage_name: self.spec.name.clone(),
            component: self.spec.component.clone(),
            transforms: self.spec.transforms.clone(),
            input_selection: self.spec.input_selection.clone(),
            output_topic: self.spec.output_topic.clone(),
            error_policy: self.spec.error_policy.clone(),
            context,
            next: self.next.clone(),
            input_rx: self.input_rx.clone(),
            timer_rx: self.timer_rx.clone(),
            cache_rx: self.cache_rx.clone(),
        });

        let source = self.spec.component.is_source();
        for worker in 0..self.spec.worker_count {
            let shared = shared.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let handle = if source {
                tokio::spawn(run_source_worker(shared, shutdown))
            } else {
                tokio::spawn(run_worker(shared, shutdown))
            };
            self.workers.push(handle);
            tracing::debug!(
                "stage '{}' worker {}/{} started",
                self.spec.name,
                worker + 1,
                self.spec.worker_count
            );
        }
        Ok(())
    }

    /// Stop this stage: signal shutdown, let workers finish their current
    /// message, then drain the queue per the configured policy.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        let mut drained = 0usize;
        while let Ok(message) = self.input_rx.try_recv() {
            drained += 1;
            match self.spec.drain_policy {
                DrainPolicy::Nack => message.resolve_failure(&ProcessingError::QueueClosed),
                DrainPolicy::Drop => message.resolve_success(),
            }
        }
        if drained > 0 {
            tracing::info!(
                "stage '{}' drained {drained} queued message(s) at shutdown",
                self.spec.name
            );
        }

        if let Err(e) = self.spec.component.stop().await {
            tracing::warn!("stage '{}' component stop failed: {e}", self.spec.name);
        }
        tracing::debug!("stage '{}' stopped", self.spec.name);
    }
}

async fn run_worker(shared: Arc<WorkerShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = shared.timer_rx.recv_async() => {
                if let Ok(event) = event {
                    dispatch_timer(&shared, event).await;
                }
            }
            event = shared.cache_rx.recv_async() => {
                if let Ok(event) = event {
                    dispatch_cache_expiry(&shared, event).await;
                }
            }
            message = shared.input_rx.recv_async() => match message {
                Ok(message) => process_message(&shared, message).await,
                Err(_) => break,
            }
        }
    }
}

async fn run_source_worker(shared: Arc<WorkerShared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            event = shared.timer_rx.recv_async() => {
                if let Ok(event) = event {
                    dispatch_timer(&shared, event).await;
                }
            }
            produced = shared.component.produce(&shared.context) => match produced {
                Ok(Some(message)) => forward(&shared, message).await,
                Ok(None) => {}
                Err(error) => {
                    tracing::error!(
                        "source stage '{}' produce failed: {error}",
                        shared.stage_name
                    );
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn dispatch_timer(shared: &Arc<WorkerShared>, event: TimerEvent) {
    if let Err(error) = shared
        .component
        .handle_timer_event(&shared.context, event)
        .await
    {
        tracing::error!("stage '{}' timer handler failed: {error}", shared.stage_name);
    }
}

async fn dispatch_cache_expiry(shared: &Arc<WorkerShared>, event: CacheExpiryEvent) {
    if let Err(error) = shared
        .component
        .handle_cache_expiry(&shared.context, event)
        .await
    {
        tracing::error!(
            "stage '{}' cache expiry handler failed: {error}",
            shared.stage_name
        );
    }
}

async fn process_message(shared: &Arc<WorkerShared>, mut message: Message) {
    // Input transforms, in declared order.
    if let Err(error) = transform::apply_all(&shared.transforms, &mut message) {
        return handle_error(shared, message, error).await;
    }

    // Input selection; the previous stage's output by default.
    let selected = match &shared.input_selection {
        Some(source) => match source.evaluate(&EvalContext::new(&message)) {
            Ok(value) => value,
            Err(error) => return handle_error(shared, message, error).await,
        },
        None => message.previous.clone(),
    };

    match shared
        .component
        .invoke(&shared.context, &mut message, selected)
        .await
    {
        // Null output: stop propagation, release the message as handled.
        Ok(None) => message.resolve_success(),
        Ok(Some(value)) => {
            message.previous = value;
            message.iteration_state = None;
            if let Some(expr) = &shared.output_topic
                && let Err(error) = wrap_output(&mut message, expr)
            {
                return handle_error(shared, message, error).await;
            }
            forward(shared, message).await;
        }
        Err(error) => handle_error(shared, message, error).await,
    }
}

async fn forward(shared: &Arc<WorkerShared>, message: Message) {
    match &shared.next {
        Some(next) => {
            // Blocks when the successor queue is full; this is the
            // back-pressure path that throttles the whole flow.
            if let Err(flume::SendError(message)) = next.send_async(message).await {
                message.resolve_failure(&ProcessingError::QueueClosed);
            }
        }
        None => message.resolve_success(),
    }
}

// A bare output value leaving a simplified-app user stage is wrapped with
// the egress topic so the shared broker output knows where to publish.
fn wrap_output(message: &mut Message, topic_expr: &Expression) -> Result<(), ProcessingError> {
    if message
        .previous
        .as_object()
        .is_some_and(|object| object.contains_key("topic"))
    {
        return Ok(());
    }
    let topic = evaluate(topic_expr, &EvalContext::new(message))?;
    message.previous = json!({
        "payload": message.previous,
        "topic": topic,
    });
    Ok(())
}

async fn handle_error(shared: &Arc<WorkerShared>, message: Message, error: ProcessingError) {
    tracing::error!(
        "stage '{}' failed a message: {error}",
        shared.stage_name
    );

    // Component override wins over the configured policy.
    if let Some(reaction) = shared.component.nack_reaction(error.kind()) {
        match reaction {
            NackReaction::Redeliver => message.resolve_failure(&error),
            NackReaction::Discard => message.resolve_success(),
        }
        return;
    }

    match shared.error_policy.policy_for(error.kind()) {
        ErrorPolicy::Nack => message.resolve_failure(&error),
        ErrorPolicy::Drop => message.resolve_success(),
        ErrorPolicy::ErrorFlow => {
            let event = error_event(shared, &message, &error);
            if !shared.context.services.errors.route(event) {
                tracing::warn!(
                    "error event from stage '{}' dropped",
                    shared.stage_name
                );
            }
            message.resolve_success();
        }
    }
}

fn error_event(shared: &Arc<WorkerShared>, message: &Message, error: &ProcessingError) -> Message {
    let topic = format!(
        "gantry/error/{}/{}/{}",
        shared.app_name, shared.flow_name, shared.stage_name
    );
    Message::new(
        &topic,
        json!({
            "error_kind": error.kind().as_str(),
            "error": error.to_string(),
            "message_snapshot": {
                "payload": message.payload,
                "topic": message.topic,
                "user_properties": Value::Object(message.user_properties.clone()),
                "user_data": message.user_data,
                "previous": message.previous,
            },
            "stage_id": shared.context.stage_id(),
            "flow_name": shared.flow_name,
            "app_name": shared.app_name,
        }),
    )
}
