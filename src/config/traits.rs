//! Configuration Traits
//!
//! Components convert the generic `component_config` map into their own
//! strongly typed configuration structure through this trait, extracting
//! parameters with [`crate::config::params`] helpers and validating the
//! result before the component is constructed.

use serde_json::{Map, Value};

/// Typed extraction and validation of a component's configuration.
///
/// Implementations extract their parameters in `from_component_config`,
/// call `validate` at the end and return errors that name the offending
/// parameter, e.g. "parameter 'queue_name' is required".
pub trait ComponentConfig: Sized {
    /// Build the typed configuration from the raw parameter map.
    fn from_component_config(config: &Map<String, Value>) -> anyhow::Result<Self>;

    /// Check parameter combinations and constraints. The default accepts
    /// everything; override when parameters relate to each other.
    fn validate(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
