//! Invoke Sub-Language
//!
//! An expression position may hold an `invoke` record instead of a string:
//! a call into the built-in function table or an explicitly registered user
//! function, with positional and keyword parameters. Parameters may embed
//! `evaluate_expression(<expression>[, <type>])` pseudo-calls, which are
//! replaced at evaluation time by the value of the expression, and nested
//! `invoke` records, which compose.
//!
//! Resolution is closed: unknown modules or functions fail when the record
//! is compiled at flow construction, never while a message is in flight.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::ProcessingError;
use crate::expression::{EvalContext, Expression, builtins, evaluate};

/// Signature for registered user functions.
pub type UserFunction =
    Arc<dyn Fn(&[Value], &Map<String, Value>) -> Result<Value, ProcessingError> + Send + Sync>;

type FunctionRegistry = Mutex<HashMap<String, UserFunction>>;
type AttributeRegistry = Mutex<HashMap<String, Value>>;

static FUNCTION_REGISTRY: OnceLock<FunctionRegistry> = OnceLock::new();
static ATTRIBUTE_REGISTRY: OnceLock<AttributeRegistry> = OnceLock::new();

fn function_registry() -> &'static FunctionRegistry {
    FUNCTION_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn attribute_registry() -> &'static AttributeRegistry {
    ATTRIBUTE_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn registry_key(module: Option<&str>, name: &str) -> String {
    match module {
        Some(module) => format!("{module}.{name}"),
        None => name.to_string(),
    }
}

/// Register a user function so `invoke` records can reach it. Registration
/// replaces any previous function under the same name.
pub fn register_function(
    module: Option<&str>,
    name: &str,
    function: impl Fn(&[Value], &Map<String, Value>) -> Result<Value, ProcessingError>
    + Send
    + Sync
    + 'static,
) {
    let mut registry = function_registry().lock().expect("function registry lock");
    registry.insert(registry_key(module, name), Arc::new(function));
}

/// Register a module attribute readable by `invoke` records.
pub fn register_attribute(module: &str, name: &str, value: Value) {
    let mut registry = attribute_registry().lock().expect("attribute registry lock");
    registry.insert(registry_key(Some(module), name), value);
}

fn resolve_function(module: Option<&str>, name: &str) -> Option<ResolvedFunction> {
    if module.is_none() && builtins::exists(name) {
        return Some(ResolvedFunction::Builtin(name.to_string()));
    }
    let registry = function_registry().lock().expect("function registry lock");
    registry
        .get(&registry_key(module, name))
        .cloned()
        .map(ResolvedFunction::User)
}

fn resolve_attribute(module: &str, name: &str) -> Option<Value> {
    let registry = attribute_registry().lock().expect("attribute registry lock");
    registry.get(&registry_key(Some(module), name)).cloned()
}

/// The serialised form of an `invoke` record as it appears in configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct InvokeSpec {
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default)]
    pub object: Option<Box<ObjectSpec>>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub params: InvokeParamsSpec,
}

/// Nested object position: another `invoke` record.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectSpec {
    pub invoke: InvokeSpec,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct InvokeParamsSpec {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub keyword: Map<String, Value>,
}

/// Scalar coercion requested by `evaluate_expression(expr, type)`.
/// Sequences and mappings ignore the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coercion {
    Int,
    Float,
    Bool,
    Str,
}

impl Coercion {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "int" => Some(Coercion::Int),
            "float" => Some(Coercion::Float),
            "bool" => Some(Coercion::Bool),
            "str" => Some(Coercion::Str),
            _ => None,
        }
    }

    fn apply(&self, value: Value) -> Value {
        if value.is_array() || value.is_object() {
            return value;
        }
        match self {
            Coercion::Int => match &value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map(Value::from)
                    .unwrap_or(value),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64))
                    .map(Value::from)
                    .unwrap_or(value),
                Value::Bool(b) => Value::from(if *b { 1 } else { 0 }),
                _ => value,
            },
            Coercion::Float => match &value {
                Value::Number(n) => n.as_f64().map(Value::from).unwrap_or(value),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .map(Value::from)
                    .unwrap_or(value),
                Value::Bool(b) => Value::from(if *b { 1.0 } else { 0.0 }),
                _ => value,
            },
            Coercion::Bool => Value::Bool(builtins::truthy(&value)),
            Coercion::Str => match value {
                Value::String(_) => value,
                Value::Null => Value::String(String::new()),
                other => Value::String(other.to_string()),
            },
        }
    }
}

enum ResolvedFunction {
    Builtin(String),
    User(UserFunction),
}

impl Clone for ResolvedFunction {
    fn clone(&self) -> Self {
        match self {
            ResolvedFunction::Builtin(name) => ResolvedFunction::Builtin(name.clone()),
            ResolvedFunction::User(f) => ResolvedFunction::User(f.clone()),
        }
    }
}

impl std::fmt::Debug for ResolvedFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedFunction::Builtin(name) => write!(f, "builtin:{name}"),
            ResolvedFunction::User(_) => f.write_str("user function"),
        }
    }
}

#[derive(Clone, Debug)]
enum InvokeTarget {
    Function(ResolvedFunction),
    /// Module attribute, resolved to its value at compile time.
    ModuleAttribute(Value),
    /// Attribute read on the evaluated `object`.
    ObjectAttribute(String),
}

#[derive(Clone, Debug)]
enum CompiledParam {
    Literal(Value),
    Eval {
        expr: Expression,
        coerce: Option<Coercion>,
    },
    Invoke(Box<CompiledInvoke>),
}

/// A fully resolved invoke record.
#[derive(Clone, Debug)]
pub struct CompiledInvoke {
    object: Option<Box<CompiledInvoke>>,
    target: InvokeTarget,
    positional: Vec<CompiledParam>,
    keyword: Vec<(String, CompiledParam)>,
}

/// Compile an invoke record, resolving every reachable function reference.
pub fn compile(spec: &InvokeSpec) -> Result<CompiledInvoke, ProcessingError> {
    if spec.module.is_some() && spec.object.is_some() {
        return Err(ProcessingError::Expression(
            "invoke record declares both 'module' and 'object'".into(),
        ));
    }

    let object = match &spec.object {
        Some(obj) => Some(Box::new(compile(&obj.invoke)?)),
        None => None,
    };

    let target = match (&spec.function, &spec.attribute) {
        (Some(_), Some(_)) => {
            return Err(ProcessingError::Expression(
                "invoke record declares both 'function' and 'attribute'".into(),
            ));
        }
        (Some(function), None) => {
            let resolved = resolve_function(spec.module.as_deref(), function).ok_or_else(|| {
                ProcessingError::Expression(format!(
                    "unknown function '{}'",
                    registry_key(spec.module.as_deref(), function)
                ))
            })?;
            InvokeTarget::Function(resolved)
        }
        (None, Some(attribute)) => match (&spec.module, &object) {
            (Some(module), None) => {
                let value = resolve_attribute(module, attribute).ok_or_else(|| {
                    ProcessingError::Expression(format!(
                        "unknown attribute '{module}.{attribute}'"
                    ))
                })?;
                InvokeTarget::ModuleAttribute(value)
            }
            (None, Some(_)) => InvokeTarget::ObjectAttribute(attribute.clone()),
            _ => {
                return Err(ProcessingError::Expression(
                    "attribute invoke needs either a 'module' or an 'object'".into(),
                ));
            }
        },
        (None, None) => {
            return Err(ProcessingError::Expression(
                "invoke record needs a 'function' or an 'attribute'".into(),
            ));
        }
    };

    let positional = spec
        .params
        .positional
        .iter()
        .map(compile_param)
        .collect::<Result<Vec<_>, _>>()?;
    let keyword = spec
        .params
        .keyword
        .iter()
        .map(|(key, value)| Ok((key.clone(), compile_param(value)?)))
        .collect::<Result<Vec<_>, ProcessingError>>()?;

    Ok(CompiledInvoke {
        object,
        target,
        positional,
        keyword,
    })
}

fn compile_param(raw: &Value) -> Result<CompiledParam, ProcessingError> {
    if let Value::String(text) = raw
        && let Some((expr_text, coerce)) = parse_evaluate_expression(text)?
    {
        return Ok(CompiledParam::Eval {
            expr: Expression::parse(expr_text)?,
            coerce,
        });
    }

    if let Value::Object(map) = raw
        && map.len() == 1
        && let Some(inner) = map.get("invoke")
    {
        let spec: InvokeSpec = serde_json::from_value(inner.clone()).map_err(|e| {
            ProcessingError::Expression(format!("malformed nested invoke record: {e}"))
        })?;
        return Ok(CompiledParam::Invoke(Box::new(compile(&spec)?)));
    }

    Ok(CompiledParam::Literal(raw.clone()))
}

/// Recognise `evaluate_expression(<expr>[, <type>])` parameter strings.
/// Returns the inner expression text and the optional coercion; `None`
/// when the string is an ordinary literal.
fn parse_evaluate_expression(
    text: &str,
) -> Result<Option<(&str, Option<Coercion>)>, ProcessingError> {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("evaluate_expression(") else {
        return Ok(None);
    };
    let Some(inner) = rest.strip_suffix(')') else {
        return Err(ProcessingError::Expression(format!(
            "unterminated evaluate_expression in '{text}'"
        )));
    };

    // The expression itself may contain commas, so only a trailing
    // ", <type-name>" is treated as the coercion argument.
    if let Some((expr_text, type_text)) = inner.rsplit_once(',') {
        let type_name = type_text.trim();
        if let Some(coerce) = Coercion::parse(type_name) {
            return Ok(Some((expr_text.trim(), Some(coerce))));
        }
    }
    Ok(Some((inner.trim(), None)))
}

fn evaluate_param(param: &CompiledParam, ctx: &EvalContext) -> Result<Value, ProcessingError> {
    match param {
        CompiledParam::Literal(value) => Ok(value.clone()),
        CompiledParam::Eval { expr, coerce } => {
            let value = evaluate(expr, ctx)?;
            Ok(match coerce {
                Some(coerce) => coerce.apply(value),
                None => value,
            })
        }
        CompiledParam::Invoke(inner) => evaluate_invoke(inner, ctx),
    }
}

/// Evaluate a compiled invoke record against a message.
pub fn evaluate_invoke(
    invoke: &CompiledInvoke,
    ctx: &EvalContext,
) -> Result<Value, ProcessingError> {
    evaluate_inner(invoke, None, ctx)
}

/// Evaluate a compiled invoke record with a leading positional argument,
/// as map transforms do when passing the mapped value through a
/// processing function.
pub fn evaluate_with_leading(
    invoke: &CompiledInvoke,
    leading: Value,
    ctx: &EvalContext,
) -> Result<Value, ProcessingError> {
    evaluate_inner(invoke, Some(leading), ctx)
}

fn evaluate_inner(
    invoke: &CompiledInvoke,
    leading: Option<Value>,
    ctx: &EvalContext,
) -> Result<Value, ProcessingError> {
    let object_value = match &invoke.object {
        Some(inner) => Some(evaluate_invoke(inner, ctx)?),
        None => None,
    };

    match &invoke.target {
        InvokeTarget::ModuleAttribute(value) => Ok(value.clone()),
        InvokeTarget::ObjectAttribute(name) => {
            let object = object_value.unwrap_or(Value::Null);
            Ok(object.get(name).cloned().unwrap_or(Value::Null))
        }
        InvokeTarget::Function(function) => {
            let mut args = Vec::with_capacity(invoke.positional.len() + 2);
            // An object invoke passes the resolved object as the leading
            // argument, mirroring a method call.
            if let Some(object) = object_value {
                args.push(object);
            }
            if let Some(leading) = leading {
                args.push(leading);
            }
            for param in &invoke.positional {
                args.push(evaluate_param(param, ctx)?);
            }
            let mut kwargs = Map::new();
            for (key, param) in &invoke.keyword {
                kwargs.insert(key.clone(), evaluate_param(param, ctx)?);
            }

            match function {
                ResolvedFunction::Builtin(name) => builtins::call(name, &args, &kwargs),
                ResolvedFunction::User(f) => f(&args, &kwargs),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    fn compile_json(spec: Value) -> CompiledInvoke {
        let spec: InvokeSpec = serde_json::from_value(spec).unwrap();
        compile(&spec).unwrap()
    }

    #[test]
    fn builtin_call_with_expression_params() {
        let msg = Message::new("t", json!({"a": 3, "b": 4}));
        let invoke = compile_json(json!({
            "function": "add",
            "params": {
                "positional": [
                    "evaluate_expression(input.payload:a)",
                    "evaluate_expression(input.payload:b)"
                ]
            }
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!(7)
        );
    }

    #[test]
    fn nested_invoke_composes() {
        let msg = Message::new("t", json!({"n": 5}));
        let invoke = compile_json(json!({
            "function": "multiply",
            "params": {
                "positional": [
                    { "invoke": {
                        "function": "add",
                        "params": { "positional": ["evaluate_expression(input.payload:n)", 1] }
                    }},
                    10
                ]
            }
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!(60)
        );
    }

    #[test]
    fn coercion_applies_to_scalars() {
        let msg = Message::new("t", json!({"n": "41"}));
        let invoke = compile_json(json!({
            "function": "add",
            "params": {
                "positional": ["evaluate_expression(input.payload:n, int)", 1]
            }
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!(42)
        );
    }

    #[test]
    fn unknown_function_fails_at_compile() {
        let spec: InvokeSpec = serde_json::from_value(json!({"function": "no_such_fn"})).unwrap();
        assert!(compile(&spec).is_err());
    }

    #[test]
    fn user_function_registration() {
        register_function(Some("test_mod"), "double", |args, _| {
            let n = args[0].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        let msg = Message::new("t", json!({"n": 21}));
        let invoke = compile_json(json!({
            "module": "test_mod",
            "function": "double",
            "params": { "positional": ["evaluate_expression(input.payload:n)"] }
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!(42)
        );
    }

    #[test]
    fn object_attribute_read() {
        let msg = Message::new("t", json!({}));
        register_attribute("creds", "region", json!({"name": "eu-west-1"}));
        let invoke = compile_json(json!({
            "object": { "invoke": { "module": "creds", "attribute": "region" } },
            "attribute": "name"
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!("eu-west-1")
        );
    }

    #[test]
    fn keyword_args_reach_user_functions() {
        register_function(None, "pick_kw", |_args, kwargs| {
            Ok(kwargs.get("choice").cloned().unwrap_or(Value::Null))
        });
        let msg = Message::new("t", json!({"x": "picked"}));
        let invoke = compile_json(json!({
            "function": "pick_kw",
            "params": { "keyword": { "choice": "evaluate_expression(input.payload:x)" } }
        }));
        assert_eq!(
            evaluate_invoke(&invoke, &EvalContext::new(&msg)).unwrap(),
            json!("picked")
        );
    }
}
