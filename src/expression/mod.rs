//! Expression & Transform Engine
//!
//! A small language for addressing and constructing values inside a
//! per-message state object. Expressions are compiled once at flow
//! construction (unknown functions and malformed templates fail there, not
//! at message time) and evaluated against a [`Message`] while it is being
//! prepared for a component's `invoke`.
//!
//! The grammar is `<data_type>[.<qualifier>][:<index-path>]`, where the
//! data type picks a root inside the message, the qualifier narrows it
//! (`input.payload`, `user_data.my_obj`), and the index-path walks into the
//! selected value. Reading a missing path yields null; writing auto-vivifies
//! mappings and null-extends sequences.

pub mod builtins;
pub mod invoke;
pub mod path;
pub mod template;
pub mod transform;

use serde_json::{Map, Value};

use crate::error::ProcessingError;
use crate::message::Message;

pub use invoke::{CompiledInvoke, InvokeSpec};
pub use path::Path;
pub use template::Template;
pub use transform::{CompiledTransform, TransformConfig};

/// Sub-selection of the `input` data type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputSelector {
    Payload,
    Topic,
    TopicLevels,
    UserProperties,
}

/// A parsed expression, ready to evaluate against a message.
#[derive(Clone, Debug)]
pub enum Expression {
    Input(InputSelector, Path),
    UserData { qualifier: Option<String>, path: Path },
    Previous(Path),
    Static(String),
    Template(Template),
    KeywordArgs(Path),
    Item(Path),
    Index,
    SourceList(Path),
    CurrentValue(Path),
    AccumulatedValue(Path),
    /// Component-specific ingress-supplied root; resolves against the
    /// message's `user_data` under the given name.
    Custom(String, Path),
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self, ProcessingError> {
        // The literal forms own everything after their first colon, so they
        // are peeled off before the generic head/path split.
        if let Some(literal) = text.strip_prefix("static:") {
            return Ok(Expression::Static(literal.to_string()));
        }
        if let Some(body) = text.strip_prefix("template:") {
            return Ok(Expression::Template(Template::parse(body)?));
        }

        let (head, path) = match text.split_once(':') {
            Some((head, rest)) => (head, Path::parse(rest)),
            None => (text, Path::root()),
        };

        let (data_type, qualifier) = match head.split_once('.') {
            Some((dt, q)) => (dt, Some(q)),
            None => (head, None),
        };

        match data_type {
            "input" => {
                let selector = match qualifier {
                    None | Some("payload") => InputSelector::Payload,
                    Some("topic") => InputSelector::Topic,
                    Some("topic_levels") => InputSelector::TopicLevels,
                    Some("user_properties") => InputSelector::UserProperties,
                    Some(other) => {
                        return Err(ProcessingError::Expression(format!(
                            "unknown input selector '{other}' in '{text}'"
                        )));
                    }
                };
                Ok(Expression::Input(selector, path))
            }
            "user_data" => Ok(Expression::UserData {
                qualifier: qualifier.map(str::to_string),
                path,
            }),
            "previous" => Ok(Expression::Previous(fold_qualifier(qualifier, path))),
            "keyword_args" => Ok(Expression::KeywordArgs(fold_qualifier(qualifier, path))),
            "item" => Ok(Expression::Item(fold_qualifier(qualifier, path))),
            "index" => Ok(Expression::Index),
            "source_list" => Ok(Expression::SourceList(fold_qualifier(qualifier, path))),
            "current_value" => Ok(Expression::CurrentValue(fold_qualifier(qualifier, path))),
            "accumulated_value" => {
                Ok(Expression::AccumulatedValue(fold_qualifier(qualifier, path)))
            }
            other if !other.is_empty() => {
                Ok(Expression::Custom(other.to_string(), fold_qualifier(qualifier, path)))
            }
            _ => Err(ProcessingError::Expression(format!(
                "cannot parse expression '{text}'"
            ))),
        }
    }
}

// A qualifier on a type without named subtrees is just the first path key.
fn fold_qualifier(qualifier: Option<&str>, path: Path) -> Path {
    match qualifier {
        Some(q) => path.prefixed(q),
        None => path,
    }
}

/// Everything an expression may read from during evaluation.
pub struct EvalContext<'a> {
    pub message: &'a Message,
    pub keyword_args: Option<&'a Map<String, Value>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(message: &'a Message) -> Self {
        Self {
            message,
            keyword_args: None,
        }
    }

    pub fn with_keyword_args(message: &'a Message, keyword_args: &'a Map<String, Value>) -> Self {
        Self {
            message,
            keyword_args: Some(keyword_args),
        }
    }
}

/// Evaluate an expression. Missing sources yield `Null`, never an error;
/// callers that require a value use [`evaluate_required`].
pub fn evaluate(expr: &Expression, ctx: &EvalContext) -> Result<Value, ProcessingError> {
    let message = ctx.message;
    let value = match expr {
        Expression::Input(selector, path) => match selector {
            InputSelector::Payload => read_or_null(path, &message.payload),
            InputSelector::Topic => {
                if path.is_root() {
                    Value::String(message.topic.clone())
                } else {
                    Value::Null
                }
            }
            InputSelector::TopicLevels => {
                let levels = Value::Array(
                    message
                        .topic_levels
                        .iter()
                        .map(|level| Value::String(level.clone()))
                        .collect(),
                );
                read_or_null(path, &levels)
            }
            InputSelector::UserProperties => {
                let props = Value::Object(message.user_properties.clone());
                read_or_null(path, &props)
            }
        },
        Expression::UserData { qualifier, path } => {
            let effective = match qualifier {
                Some(q) => path.clone().prefixed(q),
                None => path.clone(),
            };
            read_or_null(&effective, &message.user_data)
        }
        Expression::Previous(path) => read_or_null(path, &message.previous),
        Expression::Static(literal) => Value::String(literal.clone()),
        Expression::Template(template) => template.render(ctx)?,
        Expression::KeywordArgs(path) => match ctx.keyword_args {
            Some(args) => read_or_null(path, &Value::Object(args.clone())),
            None => Value::Null,
        },
        Expression::Index => match &message.iteration_state {
            Some(state) => Value::from(state.index),
            None => Value::Null,
        },
        Expression::Item(path) | Expression::CurrentValue(path) => {
            match &message.iteration_state {
                Some(state) => read_or_null(path, &state.current_value),
                None => Value::Null,
            }
        }
        Expression::SourceList(path) => match &message.iteration_state {
            Some(state) => read_or_null(path, &state.source_list),
            None => Value::Null,
        },
        Expression::AccumulatedValue(path) => match &message.iteration_state {
            Some(state) => read_or_null(path, &state.accumulated_value),
            None => Value::Null,
        },
        Expression::Custom(name, path) => {
            read_or_null(&path.clone().prefixed(name), &message.user_data)
        }
    };
    Ok(value)
}

/// Evaluate an expression whose consumer marked it required.
pub fn evaluate_required(
    expr: &Expression,
    ctx: &EvalContext,
    what: &str,
) -> Result<Value, ProcessingError> {
    let value = evaluate(expr, ctx)?;
    if value.is_null() {
        return Err(ProcessingError::Expression(format!(
            "required source '{what}' is missing"
        )));
    }
    Ok(value)
}

/// Write a value at a destination expression. Only message-owned state is
/// writable: `user_data`, `previous`, `input.payload` and
/// `input.user_properties`.
pub fn write(
    message: &mut Message,
    expr: &Expression,
    value: Value,
) -> Result<(), ProcessingError> {
    match expr {
        Expression::UserData { qualifier, path } => {
            let effective = match qualifier {
                Some(q) => path.clone().prefixed(q),
                None => path.clone(),
            };
            effective.write(&mut message.user_data, value);
            Ok(())
        }
        Expression::Previous(path) => {
            path.write(&mut message.previous, value);
            Ok(())
        }
        Expression::Input(InputSelector::Payload, path) => {
            path.write(&mut message.payload, value);
            Ok(())
        }
        Expression::Input(InputSelector::UserProperties, path) => {
            let mut props = Value::Object(std::mem::take(&mut message.user_properties));
            path.write(&mut props, value);
            message.user_properties = match props {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            Ok(())
        }
        Expression::Custom(name, path) => {
            path.clone()
                .prefixed(name)
                .write(&mut message.user_data, value);
            Ok(())
        }
        other => Err(ProcessingError::Expression(format!(
            "destination '{other:?}' is not writable"
        ))),
    }
}

fn read_or_null(path: &Path, root: &Value) -> Value {
    path.read(root).cloned().unwrap_or(Value::Null)
}

/// A config position that accepts an expression string, a literal value,
/// or an invoke record; compiled once at flow construction.
#[derive(Clone, Debug)]
pub enum CompiledSource {
    Expression(Expression),
    Literal(Value),
    Invoke(CompiledInvoke),
}

impl CompiledSource {
    pub fn evaluate(&self, ctx: &EvalContext) -> Result<Value, ProcessingError> {
        match self {
            CompiledSource::Expression(expr) => evaluate(expr, ctx),
            CompiledSource::Literal(value) => Ok(value.clone()),
            CompiledSource::Invoke(inv) => invoke::evaluate_invoke(inv, ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Message {
        let mut msg = Message::new("my/topic/one", json!({"value": 7, "nested": {"list": [1, 2]}}));
        msg.user_properties
            .insert("origin".into(), json!("sensor-4"));
        msg
    }

    #[test]
    fn input_payload_path() {
        let msg = sample();
        let expr = Expression::parse("input.payload:nested.list.1").unwrap();
        assert_eq!(evaluate(&expr, &EvalContext::new(&msg)).unwrap(), json!(2));
    }

    #[test]
    fn bare_input_defaults_to_payload() {
        let msg = sample();
        let expr = Expression::parse("input:value").unwrap();
        assert_eq!(evaluate(&expr, &EvalContext::new(&msg)).unwrap(), json!(7));
    }

    #[test]
    fn input_topic_and_levels() {
        let msg = sample();
        let topic = Expression::parse("input.topic").unwrap();
        assert_eq!(
            evaluate(&topic, &EvalContext::new(&msg)).unwrap(),
            json!("my/topic/one")
        );

        let level = Expression::parse("input.topic_levels:1").unwrap();
        assert_eq!(
            evaluate(&level, &EvalContext::new(&msg)).unwrap(),
            json!("topic")
        );
    }

    #[test]
    fn user_properties_read() {
        let msg = sample();
        let expr = Expression::parse("input.user_properties:origin").unwrap();
        assert_eq!(
            evaluate(&expr, &EvalContext::new(&msg)).unwrap(),
            json!("sensor-4")
        );
    }

    #[test]
    fn missing_path_reads_null() {
        let msg = sample();
        let expr = Expression::parse("input.payload:absent.deeper").unwrap();
        assert_eq!(
            evaluate(&expr, &EvalContext::new(&msg)).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn required_missing_is_an_error() {
        let msg = sample();
        let expr = Expression::parse("user_data.nothing:here").unwrap();
        let err = evaluate_required(&expr, &EvalContext::new(&msg), "nothing").unwrap_err();
        assert!(matches!(err, ProcessingError::Expression(_)));
    }

    #[test]
    fn static_literal_is_not_coerced() {
        let msg = sample();
        let expr = Expression::parse("static:42").unwrap();
        assert_eq!(evaluate(&expr, &EvalContext::new(&msg)).unwrap(), json!("42"));
    }

    #[test]
    fn static_keeps_colons() {
        let msg = sample();
        let expr = Expression::parse("static:mqtt://host:1883").unwrap();
        assert_eq!(
            evaluate(&expr, &EvalContext::new(&msg)).unwrap(),
            json!("mqtt://host:1883")
        );
    }

    #[test]
    fn write_read_round_trip_via_user_data() {
        let mut msg = sample();
        let dest = Expression::parse("user_data.temp:results.1.score").unwrap();
        write(&mut msg, &dest, json!(0.5)).unwrap();
        assert_eq!(
            msg.user_data,
            json!({"temp": {"results": [null, {"score": 0.5}]}})
        );
        assert_eq!(
            evaluate(&dest, &EvalContext::new(&msg)).unwrap(),
            json!(0.5)
        );
    }

    #[test]
    fn write_previous_root() {
        let mut msg = sample();
        let dest = Expression::parse("previous").unwrap();
        write(&mut msg, &dest, json!({"replaced": true})).unwrap();
        assert_eq!(msg.previous, json!({"replaced": true}));
    }

    #[test]
    fn write_to_readonly_root_fails() {
        let mut msg = sample();
        let dest = Expression::parse("input.topic").unwrap();
        assert!(write(&mut msg, &dest, json!("nope")).is_err());
    }
}
