use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::components::component::{Component, StageContext};
use crate::components::factory::ComponentMetadata;
use crate::error::ProcessingError;
use crate::message::Message;

/// Forwards its prepared input unchanged; the identity stage. Useful for
/// routing-only pipelines and as the smallest possible user component.
pub struct PassThrough {
    name: String,
}

impl PassThrough {
    pub fn from_config(name: &str, _config: &Map<String, Value>) -> anyhow::Result<Arc<dyn Component>> {
        Ok(Arc::new(Self {
            name: name.to_string(),
        }))
    }

    pub fn metadata() -> ComponentMetadata {
        ComponentMetadata {
            description: "forwards input unchanged",
            ..Default::default()
        }
    }
}

#[async_trait]
impl Component for PassThrough {
    async fn invoke(
        &self,
        _ctx: &StageContext,
        _message: &mut Message,
        data: Value,
    ) -> Result<Option<Value>, ProcessingError> {
        tracing::trace!("pass_through '{}' forwarding", self.name);
        Ok(Some(data))
    }
}
