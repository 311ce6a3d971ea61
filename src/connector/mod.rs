//! Connector Lifecycle
//!
//! The process-wide owner: builds apps from configuration (replicating
//! app-level `num_instances` with independent broker handles), runs the
//! shared timer and cache services, and tracks the liveness/readiness
//! state behind the health-check surface. The HTTP server exposing that
//! surface is an external collaborator reading [`Connector::is_ready`] and
//! friends at the configured periods.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::app::App;
use crate::config::{ConnectorConfig, HealthCheckConfig};
use crate::runtime::{CacheService, TimerService};

#[derive(Default)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    startup_complete: AtomicBool,
}

pub struct Connector {
    config: ConnectorConfig,
    apps: Vec<App>,
    timer: Arc<TimerService>,
    cache: Arc<CacheService>,
    health: Arc<HealthState>,
    started: bool,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            apps: Vec::new(),
            timer: Arc::new(TimerService::new()),
            cache: Arc::new(CacheService::new()),
            health: Arc::new(HealthState::default()),
            started: false,
        }
    }

    pub fn health_config(&self) -> &HealthCheckConfig {
        &self.config.health_check
    }

    /// Start services, build every app instance and start them all.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.started {
            return Ok(());
        }

        self.timer.start();
        self.cache.start();
        self.health.live.store(true, Ordering::SeqCst);

        for app_config in &self.config.apps {
            for instance in 0..app_config.num_instances {
                let app =
                    App::build(app_config, instance, self.timer.clone(), self.cache.clone())
                        .await?;
                self.apps.push(app);
            }
        }

        for app in &mut self.apps {
            app.start().await?;
        }

        self.health.startup_complete.store(true, Ordering::SeqCst);
        self.health.ready.store(true, Ordering::SeqCst);
        self.started = true;
        tracing::info!("connector started with {} app instance(s)", self.apps.len());
        Ok(())
    }

    /// Stop apps in reverse start order, then the shared services.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.health.ready.store(false, Ordering::SeqCst);

        for app in self.apps.iter_mut().rev() {
            app.stop().await;
        }
        self.apps.clear();

        self.cache.stop();
        self.timer.stop().await;
        self.health.live.store(false, Ordering::SeqCst);
        self.started = false;
        tracing::info!("connector stopped");
    }

    /// Run until interrupted.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| anyhow::anyhow!("signal handler failed: {}", e))?;
        tracing::info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }

    pub fn is_live(&self) -> bool {
        self.health.live.load(Ordering::SeqCst)
    }

    pub fn is_startup_complete(&self) -> bool {
        self.health.startup_complete.load(Ordering::SeqCst)
    }

    /// Ready when startup finished and every app instance reports ready.
    pub fn is_ready(&self) -> bool {
        self.health.ready.load(Ordering::SeqCst)
            && self.apps.iter().all(App::is_ready)
    }

    pub fn apps(&self) -> &[App] {
        &self.apps
    }

    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.iter().find(|app| app.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_string;

    fn minimal_config() -> ConnectorConfig {
        let toml = format!(
            r#"
            [health_check]
            enabled = true

            [[apps]]
            name = "lifecycle"

            [apps.broker]
            url = "dev://{}"
            queue_name = "q"

            [[apps.components]]
            name = "noop"
            kind = "pass_through"

            [[apps.components.subscriptions]]
            topic = "a/b"
        "#,
            uuid::Uuid::new_v4()
        );
        load_config_from_string(&toml).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_flags_follow_start_and_stop() {
        let mut connector = Connector::new(minimal_config());
        assert!(!connector.is_live());
        assert!(!connector.is_ready());

        connector.start().await.unwrap();
        assert!(connector.is_live());
        assert!(connector.is_startup_complete());
        assert!(connector.is_ready());
        assert_eq!(connector.apps().len(), 1);
        assert!(connector.app("lifecycle").is_some());

        connector.stop().await;
        assert!(!connector.is_live());
        assert!(!connector.is_ready());
        assert!(connector.apps().is_empty());
    }

    #[tokio::test]
    async fn health_config_is_surfaced() {
        let connector = Connector::new(minimal_config());
        let health = connector.health_config();
        assert!(health.enabled);
        assert_eq!(health.readiness_path, "/health/readiness");
    }
}
