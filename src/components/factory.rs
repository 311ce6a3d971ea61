//! Component Factory
//!
//! A thread-safe registry mapping component kinds to constructors and
//! metadata, so flows are assembled from configuration without
//! compile-time knowledge of every component. Built-in kinds register on
//! first access; embedders add their own with [`register_component`] before
//! configuration is validated.
//!
//! Each registration carries a config schema used for the defaults level
//! of the configuration lookup chain and for `--list-components` output.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::components::broker_input::BrokerInput;
use crate::components::broker_output::BrokerOutput;
use crate::components::component::Component;
use crate::components::pass_through::PassThrough;

/// One field of a component's configuration schema.
#[derive(Clone, Debug)]
pub struct ConfigField {
    pub name: &'static str,
    pub field_type: &'static str,
    pub required: bool,
    pub default: Option<Value>,
    pub description: &'static str,
}

/// Metadata registered alongside a constructor.
#[derive(Clone, Debug, Default)]
pub struct ComponentMetadata {
    pub description: &'static str,
    pub config_schema: Vec<ConfigField>,
    /// Structural description of accepted input; documentation only, not
    /// enforced at runtime.
    pub input_schema: Option<Value>,
    pub output_schema: Option<Value>,
}

/// A component constructor: stage name and raw component configuration in,
/// shared component out.
pub type ComponentConstructor =
    Box<dyn Fn(&str, &Map<String, Value>) -> anyhow::Result<Arc<dyn Component>> + Send + Sync>;

struct RegisteredComponent {
    metadata: ComponentMetadata,
    constructor: ComponentConstructor,
}

type Registry = Mutex<HashMap<String, RegisteredComponent>>;

static COMPONENT_REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    COMPONENT_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register a component kind. Replaces any previous registration under the
/// same name.
pub fn register_component(
    kind: &str,
    metadata: ComponentMetadata,
    constructor: ComponentConstructor,
) {
    let mut registry = registry().lock().expect("component registry lock");
    registry.insert(
        kind.to_string(),
        RegisteredComponent {
            metadata,
            constructor,
        },
    );
}

pub fn component_exists(kind: &str) -> bool {
    ensure_default_components();
    registry()
        .lock()
        .expect("component registry lock")
        .contains_key(kind)
}

/// Kinds and their one-line descriptions, sorted by name.
pub fn list_components() -> Vec<(String, String)> {
    ensure_default_components();
    let registry = registry().lock().expect("component registry lock");
    let mut listed: Vec<(String, String)> = registry
        .iter()
        .map(|(kind, entry)| (kind.clone(), entry.metadata.description.to_string()))
        .collect();
    listed.sort();
    listed
}

/// The declared defaults of a kind's config schema, used as the last level
/// of the configuration lookup chain.
pub fn component_defaults(kind: &str) -> Map<String, Value> {
    ensure_default_components();
    let registry = registry().lock().expect("component registry lock");
    let mut defaults = Map::new();
    if let Some(entry) = registry.get(kind) {
        for field in &entry.metadata.config_schema {
            if let Some(default) = &field.default {
                defaults.insert(field.name.to_string(), default.clone());
            }
        }
    }
    defaults
}

/// Create a component instance of the given kind.
pub fn create_component(
    kind: &str,
    name: &str,
    config: &Map<String, Value>,
) -> anyhow::Result<Arc<dyn Component>> {
    ensure_default_components();
    tracing::debug!("creating component '{name}' of kind '{kind}'");
    let registry = registry().lock().expect("component registry lock");
    let entry = registry
        .get(kind)
        .ok_or_else(|| anyhow::anyhow!("component kind '{}' not found", kind))?;
    (entry.constructor)(name, config)
}

fn ensure_default_components() {
    static INITIALISED: OnceLock<()> = OnceLock::new();
    INITIALISED.get_or_init(|| {
        register_component(
            "pass_through",
            PassThrough::metadata(),
            Box::new(PassThrough::from_config),
        );
        register_component(
            "broker_input",
            BrokerInput::metadata(),
            Box::new(BrokerInput::from_config),
        );
        register_component(
            "broker_output",
            BrokerOutput::metadata(),
            Box::new(BrokerOutput::from_config),
        );
        tracing::debug!("default components registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::components::component::StageContext;
    use crate::error::ProcessingError;
    use crate::message::Message;

    struct Marker;

    #[async_trait]
    impl Component for Marker {
        async fn invoke(
            &self,
            _ctx: &StageContext,
            _message: &mut Message,
            data: Value,
        ) -> Result<Option<Value>, ProcessingError> {
            Ok(Some(data))
        }
    }

    #[test]
    fn builtins_are_listed() {
        let kinds: Vec<String> = list_components().into_iter().map(|(kind, _)| kind).collect();
        assert!(kinds.contains(&"pass_through".to_string()));
        assert!(kinds.contains(&"broker_input".to_string()));
        assert!(kinds.contains(&"broker_output".to_string()));
    }

    #[test]
    fn custom_registration_and_creation() {
        register_component(
            "marker_component",
            ComponentMetadata {
                description: "test marker",
                ..Default::default()
            },
            Box::new(|_, _| Ok(Arc::new(Marker))),
        );
        assert!(component_exists("marker_component"));
        assert!(create_component("marker_component", "m", &Map::new()).is_ok());
        assert!(create_component("ghost_component", "g", &Map::new()).is_err());
    }

    #[test]
    fn defaults_come_from_the_schema() {
        let defaults = component_defaults("broker_output");
        assert!(defaults.contains_key("propagate_acknowledgements"));
    }
}
