pub mod broker_input;
pub mod broker_output;
pub mod component;
pub mod factory;
pub mod pass_through;

pub use component::{AppServices, Component, ErrorRouter, ScopedConfig, StageContext};
pub use factory::{ComponentMetadata, ConfigField, create_component, list_components, register_component};
