//! Configuration Validation
//!
//! Structural checks run once after loading, before any app is built:
//! unique names, known component kinds, well-formed subscriptions, and a
//! compile pass over every expression, transform and invoke record so
//! unknown references fail at configuration time rather than message time.
//! User invoke functions must be registered before validation runs.

use std::collections::HashSet;

use crate::broker::TopicFilter;
use crate::components::factory;
use crate::config::types::{AppConfig, ConnectorConfig, StageConfig};
use crate::error::ConfigError;
use crate::expression::{Expression, invoke, transform};

/// Validate a loaded configuration.
pub fn validate_config(config: &ConnectorConfig) -> Result<(), ConfigError> {
    if config.apps.is_empty() {
        return Err(ConfigError::invalid("apps", "at least one app is required"));
    }

    let mut app_names = HashSet::new();
    for app in &config.apps {
        if !app_names.insert(app.name.as_str()) {
            return Err(ConfigError::Duplicate {
                location: "apps".to_string(),
                name: app.name.clone(),
            });
        }
        validate_app(app)?;
    }
    Ok(())
}

fn validate_app(app: &AppConfig) -> Result<(), ConfigError> {
    let location = format!("app '{}'", app.name);

    if app.num_instances == 0 {
        return Err(ConfigError::invalid(&location, "num_instances must be >= 1"));
    }

    let simplified = !app.components.is_empty();
    let explicit = !app.flows.is_empty();
    match (simplified, explicit) {
        (true, true) => {
            return Err(ConfigError::invalid(
                &location,
                "declare either 'components' (simplified) or 'flows' (explicit), not both",
            ));
        }
        (false, false) => {
            return Err(ConfigError::invalid(
                &location,
                "app declares neither 'components' nor 'flows'",
            ));
        }
        _ => {}
    }

    if simplified {
        let broker = app.broker.as_ref().ok_or_else(|| {
            ConfigError::MissingField {
                location: location.clone(),
                field: "broker".to_string(),
            }
        })?;
        if broker.input_enabled && broker.queue_name.is_none() {
            return Err(ConfigError::MissingField {
                location: format!("{location} broker"),
                field: "queue_name".to_string(),
            });
        }

        let mut component_names = HashSet::new();
        for stage in &app.components {
            if !component_names.insert(stage.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    location: location.clone(),
                    name: stage.name.clone(),
                });
            }
            validate_stage(stage, &location)?;
        }

        if let Some(error_flow) = &app.error_flow
            && !component_names.contains(error_flow.as_str())
        {
            return Err(ConfigError::BadReference {
                location: format!("{location} error_flow"),
                reference: error_flow.clone(),
            });
        }
    } else {
        let mut flow_names = HashSet::new();
        for flow in &app.flows {
            if !flow_names.insert(flow.name.as_str()) {
                return Err(ConfigError::Duplicate {
                    location: location.clone(),
                    name: flow.name.clone(),
                });
            }
            let flow_location = format!("{location} flow '{}'", flow.name);
            if flow.components.is_empty() {
                return Err(ConfigError::invalid(&flow_location, "flow has no components"));
            }

            let mut stage_names = HashSet::new();
            for stage in &flow.components {
                if !stage_names.insert(stage.name.as_str()) {
                    return Err(ConfigError::Duplicate {
                        location: flow_location.clone(),
                        name: stage.name.clone(),
                    });
                }
                validate_stage(stage, &flow_location)?;
            }
        }

        if let Some(error_flow) = &app.error_flow
            && !flow_names.contains(error_flow.as_str())
        {
            return Err(ConfigError::BadReference {
                location: format!("{location} error_flow"),
                reference: error_flow.clone(),
            });
        }
    }

    Ok(())
}

fn validate_stage(stage: &StageConfig, parent: &str) -> Result<(), ConfigError> {
    let location = format!("{parent} stage '{}'", stage.name);

    if !factory::component_exists(&stage.kind) {
        return Err(ConfigError::UnknownKind {
            stage: stage.name.clone(),
            kind: stage.kind.clone(),
        });
    }
    if stage.num_instances == 0 {
        return Err(ConfigError::invalid(&location, "num_instances must be >= 1"));
    }
    if stage.queue_capacity == 0 {
        return Err(ConfigError::invalid(&location, "queue_capacity must be >= 1"));
    }

    for subscription in &stage.subscriptions {
        TopicFilter::parse(&subscription.topic)?;
    }

    // Compile pass: every expression, transform and invoke must resolve
    // now, not while a message is in flight.
    transform::compile_all(&stage.input_transforms)
        .map_err(|e| ConfigError::invalid(&location, e.to_string()))?;

    if let Some(selection) = &stage.input_selection {
        if let Some(expr) = &selection.source_expression {
            Expression::parse(expr)
                .map_err(|e| ConfigError::invalid(&location, e.to_string()))?;
        }
        if let Some(spec) = &selection.invoke {
            invoke::compile(spec).map_err(|e| ConfigError::invalid(&location, e.to_string()))?;
        }
        let declared = [
            selection.source_expression.is_some(),
            selection.source_value.is_some(),
            selection.invoke.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if declared > 1 {
            return Err(ConfigError::invalid(
                &location,
                "input_selection declares more than one of source_expression, source_value, invoke",
            ));
        }
    }

    if let Some(output_topic) = &stage.output_topic {
        Expression::parse(output_topic)
            .map_err(|e| ConfigError::invalid(&location, e.to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config_from_string;

    fn validate(toml: &str) -> Result<(), ConfigError> {
        validate_config(&load_config_from_string(toml).unwrap())
    }

    #[test]
    fn valid_simplified_app_passes() {
        let result = validate(
            r#"
            [[apps]]
            name = "ok"

            [apps.broker]
            queue_name = "q"

            [[apps.components]]
            name = "c"
            kind = "pass_through"

            [[apps.components.subscriptions]]
            topic = "a/*/b"
        "#,
        );
        assert!(result.is_ok(), "{result:?}");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"

            [apps.broker]
            queue_name = "q"

            [[apps.components]]
            name = "c"
            kind = "no_such_kind"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::UnknownKind { .. })));
    }

    #[test]
    fn simplified_input_needs_a_queue() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"

            [apps.broker]
            broker_type = "dev"

            [[apps.components]]
            name = "c"
            kind = "pass_through"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn malformed_subscription_is_rejected() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"

            [apps.broker]
            queue_name = "q"

            [[apps.components]]
            name = "c"
            kind = "pass_through"

            [[apps.components.subscriptions]]
            topic = "a/>/b"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_invoke_function_fails_at_validation() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"

            [apps.broker]
            queue_name = "q"

            [[apps.components]]
            name = "c"
            kind = "pass_through"

            [[apps.components.input_transforms]]
            type = "filter"
            source_list_expression = "input.payload:xs"

            [apps.components.input_transforms.filter_function]
            function = "definitely_not_registered"
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_stage_names_are_rejected() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"

            [[apps.flows]]
            name = "f"

            [[apps.flows.components]]
            name = "same"
            kind = "pass_through"

            [[apps.flows.components]]
            name = "same"
            kind = "pass_through"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::Duplicate { .. })));
    }

    #[test]
    fn error_flow_must_reference_a_flow() {
        let result = validate(
            r#"
            [[apps]]
            name = "bad"
            error_flow = "ghost"

            [[apps.flows]]
            name = "real"

            [[apps.flows.components]]
            name = "c"
            kind = "pass_through"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::BadReference { .. })));
    }
}
