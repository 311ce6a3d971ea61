//! Transform Steps
//!
//! Structural operations applied to a message, in declared order, before a
//! stage's input selection: copy, append, and the list-shaped map, filter
//! and reduce. List transforms expose the per-element iteration state
//! (`item`, `index`, `source_list`, `current_value`, `accumulated_value`)
//! to the expressions and invoke records they carry.

use serde::Deserialize;
use serde_json::Value;

use crate::error::ProcessingError;
use crate::expression::invoke::{self, CompiledInvoke, InvokeSpec};
use crate::expression::{EvalContext, Expression, Path, builtins, evaluate, evaluate_required, write};
use crate::message::{IterationState, Message};

/// The serialised form of a transform step.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformConfig {
    Copy {
        #[serde(default)]
        source_expression: Option<String>,
        #[serde(default)]
        source_value: Option<Value>,
        dest_expression: String,
        #[serde(default)]
        required: bool,
    },
    Append {
        #[serde(default)]
        source_expression: Option<String>,
        #[serde(default)]
        source_value: Option<Value>,
        dest_expression: String,
        #[serde(default)]
        required: bool,
    },
    Map {
        source_list_expression: String,
        source_expression: String,
        #[serde(default)]
        processing_function: Option<InvokeSpec>,
        dest_list_expression: String,
        #[serde(default)]
        dest_expression: Option<String>,
    },
    Filter {
        source_list_expression: String,
        filter_function: InvokeSpec,
        #[serde(default)]
        dest_list_expression: Option<String>,
    },
    Reduce {
        source_list_expression: String,
        accumulator_function: InvokeSpec,
        #[serde(default)]
        initial_value: Value,
        dest_expression: String,
    },
}

#[derive(Clone, Debug)]
enum SourceOperand {
    Expression(Expression),
    Literal(Value),
}

#[derive(Clone, Debug)]
pub enum CompiledTransform {
    Copy {
        source: SourceOperand,
        dest: Expression,
        required: bool,
    },
    Append {
        source: SourceOperand,
        dest: Expression,
        required: bool,
    },
    Map {
        source_list: Expression,
        source: Expression,
        processing: Option<CompiledInvoke>,
        dest_list: Expression,
        dest_path: Option<Path>,
    },
    Filter {
        source_list: Expression,
        filter: CompiledInvoke,
        dest_list: Option<Expression>,
    },
    Reduce {
        source_list: Expression,
        accumulator: CompiledInvoke,
        initial_value: Value,
        dest: Expression,
    },
}

fn compile_source(
    expression: &Option<String>,
    value: &Option<Value>,
) -> Result<SourceOperand, ProcessingError> {
    match (expression, value) {
        (Some(expr), None) => Ok(SourceOperand::Expression(Expression::parse(expr)?)),
        (None, Some(literal)) => Ok(SourceOperand::Literal(literal.clone())),
        (Some(_), Some(_)) => Err(ProcessingError::Expression(
            "transform declares both 'source_expression' and 'source_value'".into(),
        )),
        (None, None) => Err(ProcessingError::Expression(
            "transform needs a 'source_expression' or 'source_value'".into(),
        )),
    }
}

/// Compile a transform step, resolving expressions and invoke targets.
pub fn compile(config: &TransformConfig) -> Result<CompiledTransform, ProcessingError> {
    match config {
        TransformConfig::Copy {
            source_expression,
            source_value,
            dest_expression,
            required,
        } => Ok(CompiledTransform::Copy {
            source: compile_source(source_expression, source_value)?,
            dest: Expression::parse(dest_expression)?,
            required: *required,
        }),
        TransformConfig::Append {
            source_expression,
            source_value,
            dest_expression,
            required,
        } => Ok(CompiledTransform::Append {
            source: compile_source(source_expression, source_value)?,
            dest: Expression::parse(dest_expression)?,
            required: *required,
        }),
        TransformConfig::Map {
            source_list_expression,
            source_expression,
            processing_function,
            dest_list_expression,
            dest_expression,
        } => Ok(CompiledTransform::Map {
            source_list: Expression::parse(source_list_expression)?,
            source: Expression::parse(source_expression)?,
            processing: processing_function
                .as_ref()
                .map(invoke::compile)
                .transpose()?,
            dest_list: Expression::parse(dest_list_expression)?,
            dest_path: dest_expression.as_ref().map(|p| Path::parse(p)),
        }),
        TransformConfig::Filter {
            source_list_expression,
            filter_function,
            dest_list_expression,
        } => Ok(CompiledTransform::Filter {
            source_list: Expression::parse(source_list_expression)?,
            filter: invoke::compile(filter_function)?,
            dest_list: dest_list_expression
                .as_ref()
                .map(|e| Expression::parse(e))
                .transpose()?,
        }),
        TransformConfig::Reduce {
            source_list_expression,
            accumulator_function,
            initial_value,
            dest_expression,
        } => Ok(CompiledTransform::Reduce {
            source_list: Expression::parse(source_list_expression)?,
            accumulator: invoke::compile(accumulator_function)?,
            initial_value: initial_value.clone(),
            dest: Expression::parse(dest_expression)?,
        }),
    }
}

/// Compile an ordered list of transform steps.
pub fn compile_all(configs: &[TransformConfig]) -> Result<Vec<CompiledTransform>, ProcessingError> {
    configs.iter().map(compile).collect()
}

/// Apply one transform step. `step` is the position in the declared list,
/// reported in transform errors.
pub fn apply(
    transform: &CompiledTransform,
    message: &mut Message,
    step: usize,
) -> Result<(), ProcessingError> {
    let result = match transform {
        CompiledTransform::Copy {
            source,
            dest,
            required,
        } => {
            let value = read_operand(source, message, *required)?;
            write(message, dest, value)
        }
        CompiledTransform::Append {
            source,
            dest,
            required,
        } => {
            let value = read_operand(source, message, *required)?;
            let current = evaluate(dest, &EvalContext::new(message))?;
            let extended = match current {
                Value::Array(mut items) => {
                    items.push(value);
                    Value::Array(items)
                }
                Value::Null => Value::Array(vec![value]),
                other => {
                    return Err(transform_error(
                        step,
                        format!("append destination holds non-sequence value {other}"),
                    ));
                }
            };
            write(message, dest, extended)
        }
        CompiledTransform::Map {
            source_list,
            source,
            processing,
            dest_list,
            dest_path,
        } => {
            let items = read_list(source_list, message, step)?;
            let mut results = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                set_iteration(message, index, item.clone(), Value::Null, &items);
                let mut value = evaluate(source, &EvalContext::new(message))?;
                if let Some(function) = processing {
                    value = pass_through(function, value, message)?;
                }
                results.push(match dest_path {
                    Some(path) if !path.is_root() => {
                        let mut element = Value::Null;
                        path.write(&mut element, value);
                        element
                    }
                    _ => value,
                });
            }
            message.iteration_state = None;
            write(message, dest_list, Value::Array(results))
        }
        CompiledTransform::Filter {
            source_list,
            filter,
            dest_list,
        } => {
            let items = read_list(source_list, message, step)?;
            let mut retained = Vec::new();
            for (index, item) in items.iter().enumerate() {
                set_iteration(message, index, item.clone(), Value::Null, &items);
                let verdict =
                    invoke::evaluate_invoke(filter, &EvalContext::new(message))?;
                if builtins::truthy(&verdict) {
                    retained.push(item.clone());
                }
            }
            message.iteration_state = None;
            let dest = dest_list.as_ref().unwrap_or(source_list);
            write(message, dest, Value::Array(retained))
        }
        CompiledTransform::Reduce {
            source_list,
            accumulator,
            initial_value,
            dest,
        } => {
            let items = read_list(source_list, message, step)?;
            let mut accumulated = initial_value.clone();
            for (index, item) in items.iter().enumerate() {
                set_iteration(message, index, item.clone(), accumulated.clone(), &items);
                accumulated =
                    invoke::evaluate_invoke(accumulator, &EvalContext::new(message))?;
            }
            message.iteration_state = None;
            write(message, dest, accumulated)
        }
    };

    // Missing required sources stay expression errors (the copy/append
    // steps); anything that went wrong inside a list transform is a
    // transform error carrying the step index.
    result.map_err(|e| match (transform, e) {
        (_, err @ ProcessingError::Transform { .. }) => err,
        (
            CompiledTransform::Copy { .. } | CompiledTransform::Append { .. },
            err @ ProcessingError::Expression(_),
        ) => err,
        (_, other) => transform_error(step, other.to_string()),
    })
}

/// Apply every step in order; the message is left untouched past the first
/// failing step.
pub fn apply_all(
    transforms: &[CompiledTransform],
    message: &mut Message,
) -> Result<(), ProcessingError> {
    for (step, transform) in transforms.iter().enumerate() {
        apply(transform, message, step)?;
    }
    Ok(())
}

fn transform_error(step: usize, reason: String) -> ProcessingError {
    ProcessingError::Transform { step, reason }
}

fn read_operand(
    source: &SourceOperand,
    message: &Message,
    required: bool,
) -> Result<Value, ProcessingError> {
    match source {
        SourceOperand::Literal(value) => Ok(value.clone()),
        SourceOperand::Expression(expr) => {
            let ctx = EvalContext::new(message);
            if required {
                evaluate_required(expr, &ctx, &format!("{expr:?}"))
            } else {
                evaluate(expr, &ctx)
            }
        }
    }
}

fn read_list(
    expr: &Expression,
    message: &Message,
    step: usize,
) -> Result<Vec<Value>, ProcessingError> {
    match evaluate(expr, &EvalContext::new(message))? {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(transform_error(
            step,
            format!("source list expression yielded non-sequence value {other}"),
        )),
    }
}

fn set_iteration(
    message: &mut Message,
    index: usize,
    current: Value,
    accumulated: Value,
    items: &[Value],
) {
    message.iteration_state = Some(IterationState {
        index,
        current_value: current,
        accumulated_value: accumulated,
        source_list: Value::Array(items.to_vec()),
    });
}

// "Passed through" a processing function: the mapped value leads the
// declared positional parameters.
fn pass_through(
    function: &CompiledInvoke,
    value: Value,
    message: &Message,
) -> Result<Value, ProcessingError> {
    invoke::evaluate_with_leading(function, value, &EvalContext::new(message))
}
