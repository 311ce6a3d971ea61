//! Flow Composition
//!
//! An ordered chain of stages connected by their input queues. The flow
//! wires each stage's successor at construction, starts stages tail-first
//! so consumers exist before producers, and stops them head-first so every
//! in-flight message always has a live downstream while its stage winds
//! down.

use std::sync::Arc;

use crate::components::component::AppServices;
use crate::flow::stage::{Stage, StageSpec};
use crate::message::Message;

pub struct Flow {
    name: String,
    app_name: String,
    stages: Vec<Stage>,
    started: bool,
}

impl Flow {
    /// Build a flow from its stage specs and wire the chain.
    pub fn new(app_name: &str, name: &str, specs: Vec<StageSpec>) -> Self {
        let mut stages: Vec<Stage> = specs
            .into_iter()
            .map(|spec| Stage::new(app_name, name, spec))
            .collect();

        // Chain wiring: each stage forwards into its successor's queue.
        for index in (0..stages.len().saturating_sub(1)).rev() {
            let next = stages[index + 1].sender();
            stages[index].set_next(next);
        }

        Self {
            name: name.to_string(),
            app_name: app_name.to_string(),
            stages,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sum of worker counts across the flow's stages.
    pub fn thread_count(&self) -> usize {
        self.stages.iter().map(Stage::worker_count).sum()
    }

    /// Producer handle for the first stage's queue.
    pub fn first_sender(&self) -> Option<flume::Sender<Message>> {
        self.stages.first().map(Stage::sender)
    }

    pub fn stage_sender(&self, stage_name: &str) -> Option<flume::Sender<Message>> {
        self.stages
            .iter()
            .find(|stage| stage.name() == stage_name)
            .map(Stage::sender)
    }

    /// Forward the tail stage's output into an external queue, used when a
    /// synthesized flow feeds the app's shared egress.
    pub fn set_tail_next(&mut self, next: flume::Sender<Message>) {
        if let Some(tail) = self.stages.last_mut() {
            tail.set_next(next);
        }
    }

    pub async fn start(&mut self, services: Arc<AppServices>) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }
        // Tail-first, so every producer finds its consumer running.
        for stage in self.stages.iter_mut().rev() {
            stage.start(services.clone()).await?;
        }
        self.started = true;
        tracing::info!(
            "flow '{}/{}' started ({} stage(s), {} worker(s))",
            self.app_name,
            self.name,
            self.stages.len(),
            self.thread_count()
        );
        Ok(())
    }

    /// Stop head-first: each stage finishes its current message while its
    /// downstream is still consuming, then drains its queue.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        for stage in self.stages.iter_mut() {
            stage.stop().await;
        }
        self.started = false;
        tracing::info!("flow '{}/{}' stopped", self.app_name, self.name);
    }
}
