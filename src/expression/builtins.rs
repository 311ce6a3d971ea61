//! Built-in Invoke Functions
//!
//! The function table available to `invoke` records without naming a
//! module. Lookups happen at flow construction, so a misspelt name is a
//! configuration error rather than a message-time failure.

use serde_json::{Map, Value};

use crate::error::ProcessingError;

/// Truthiness used by `if_else`, `filter` transforms and stream-completion
/// expressions: null and empty containers are false, numbers compare
/// against zero.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn exists(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

pub fn names() -> &'static [&'static str] {
    BUILTIN_NAMES
}

const BUILTIN_NAMES: &[&str] = &[
    "add",
    "append",
    "subtract",
    "multiply",
    "divide",
    "modulus",
    "power",
    "equal",
    "not_equal",
    "greater_than",
    "greater_than_or_equal",
    "less_than",
    "less_than_or_equal",
    "and_op",
    "or_op",
    "not_op",
    "in_op",
    "negate",
    "empty_list",
    "empty_dict",
    "empty_string",
    "empty_set",
    "empty_tuple",
    "empty_float",
    "empty_int",
    "if_else",
    "uuid",
];

/// Call a built-in by name. Returns an error for unknown names; callers
/// check [`exists`] at construction so that path is never hit in a flow.
pub fn call(name: &str, args: &[Value], _kwargs: &Map<String, Value>) -> Result<Value, ProcessingError> {
    match name {
        "add" => binary(args, "add", add),
        "append" => binary(args, "append", append),
        "subtract" => numeric_binary(args, "subtract", |a, b| a - b, i64::checked_sub),
        "multiply" => numeric_binary(args, "multiply", |a, b| a * b, i64::checked_mul),
        "divide" => divide(args),
        "modulus" => modulus(args),
        "power" => power(args),
        "equal" => binary(args, "equal", |a, b| Ok(Value::Bool(loose_equal(a, b)))),
        "not_equal" => binary(args, "not_equal", |a, b| Ok(Value::Bool(!loose_equal(a, b)))),
        "greater_than" => comparison(args, "greater_than", |ord| ord.is_gt()),
        "greater_than_or_equal" => comparison(args, "greater_than_or_equal", |ord| ord.is_ge()),
        "less_than" => comparison(args, "less_than", |ord| ord.is_lt()),
        "less_than_or_equal" => comparison(args, "less_than_or_equal", |ord| ord.is_le()),
        "and_op" => binary(args, "and_op", |a, b| Ok(Value::Bool(truthy(a) && truthy(b)))),
        "or_op" => binary(args, "or_op", |a, b| Ok(Value::Bool(truthy(a) || truthy(b)))),
        "not_op" => {
            let value = arg(args, 0, "not_op")?;
            Ok(Value::Bool(!truthy(value)))
        }
        "in_op" => binary(args, "in_op", in_op),
        "negate" => negate(args),
        "empty_list" | "empty_set" | "empty_tuple" => Ok(Value::Array(Vec::new())),
        "empty_dict" => Ok(Value::Object(Map::new())),
        "empty_string" => Ok(Value::String(String::new())),
        "empty_float" => Ok(Value::from(0.0)),
        "empty_int" => Ok(Value::from(0)),
        "if_else" => {
            let cond = arg(args, 0, "if_else")?;
            let a = arg(args, 1, "if_else")?;
            let b = arg(args, 2, "if_else")?;
            Ok(if truthy(cond) { a.clone() } else { b.clone() })
        }
        "uuid" => Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        other => Err(ProcessingError::Expression(format!(
            "unknown function '{other}'"
        ))),
    }
}

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value, ProcessingError> {
    args.get(index).ok_or_else(|| {
        ProcessingError::Expression(format!(
            "'{name}' expects at least {} argument(s), got {}",
            index + 1,
            args.len()
        ))
    })
}

fn binary(
    args: &[Value],
    name: &str,
    op: impl Fn(&Value, &Value) -> Result<Value, ProcessingError>,
) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, name)?;
    let b = arg(args, 1, name)?;
    op(a, b)
}

fn add(a: &Value, b: &Value) -> Result<Value, ProcessingError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
        (Value::Array(x), Value::Array(y)) => {
            let mut joined = x.clone();
            joined.extend(y.iter().cloned());
            Ok(Value::Array(joined))
        }
        _ => numeric_pair(a, b, "add").map(|pair| match pair {
            NumericPair::Ints(x, y) => x
                .checked_add(y)
                .map(Value::from)
                .unwrap_or_else(|| Value::from(x as f64 + y as f64)),
            NumericPair::Floats(x, y) => Value::from(x + y),
        }),
    }
}

fn append(list: &Value, item: &Value) -> Result<Value, ProcessingError> {
    match list {
        Value::Array(existing) => {
            let mut extended = existing.clone();
            extended.push(item.clone());
            Ok(Value::Array(extended))
        }
        Value::Null => Ok(Value::Array(vec![item.clone()])),
        Value::String(s) => match item {
            Value::String(tail) => Ok(Value::String(format!("{s}{tail}"))),
            other => Ok(Value::String(format!("{s}{other}"))),
        },
        other => Err(ProcessingError::Expression(format!(
            "'append' target must be a sequence or string, got {other}"
        ))),
    }
}

enum NumericPair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn numeric_pair(a: &Value, b: &Value, name: &str) -> Result<NumericPair, ProcessingError> {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => Ok(NumericPair::Ints(x, y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => Ok(NumericPair::Floats(x, y)),
            _ => Err(ProcessingError::Expression(format!(
                "'{name}' expects numeric arguments, got {a} and {b}"
            ))),
        },
    }
}

fn numeric_binary(
    args: &[Value],
    name: &str,
    float_op: impl Fn(f64, f64) -> f64,
    int_op: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, name)?;
    let b = arg(args, 1, name)?;
    Ok(match numeric_pair(a, b, name)? {
        NumericPair::Ints(x, y) => int_op(x, y)
            .map(Value::from)
            .unwrap_or_else(|| Value::from(float_op(x as f64, y as f64))),
        NumericPair::Floats(x, y) => Value::from(float_op(x, y)),
    })
}

fn divide(args: &[Value]) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, "divide")?;
    let b = arg(args, 1, "divide")?;
    match numeric_pair(a, b, "divide")? {
        NumericPair::Ints(_, 0) => Err(ProcessingError::Expression("division by zero".into())),
        NumericPair::Ints(x, y) => Ok(Value::from(x as f64 / y as f64)),
        NumericPair::Floats(_, y) if y == 0.0 => {
            Err(ProcessingError::Expression("division by zero".into()))
        }
        NumericPair::Floats(x, y) => Ok(Value::from(x / y)),
    }
}

fn modulus(args: &[Value]) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, "modulus")?;
    let b = arg(args, 1, "modulus")?;
    match numeric_pair(a, b, "modulus")? {
        NumericPair::Ints(_, 0) => Err(ProcessingError::Expression("modulus by zero".into())),
        NumericPair::Ints(x, y) => Ok(Value::from(x % y)),
        NumericPair::Floats(_, y) if y == 0.0 => {
            Err(ProcessingError::Expression("modulus by zero".into()))
        }
        NumericPair::Floats(x, y) => Ok(Value::from(x % y)),
    }
}

fn power(args: &[Value]) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, "power")?;
    let b = arg(args, 1, "power")?;
    Ok(match numeric_pair(a, b, "power")? {
        NumericPair::Ints(x, y) if (0..=u32::MAX as i64).contains(&y) => x
            .checked_pow(y as u32)
            .map(Value::from)
            .unwrap_or_else(|| Value::from((x as f64).powf(y as f64))),
        NumericPair::Ints(x, y) => Value::from((x as f64).powf(y as f64)),
        NumericPair::Floats(x, y) => Value::from(x.powf(y)),
    })
}

fn comparison(
    args: &[Value],
    name: &str,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, ProcessingError> {
    let a = arg(args, 0, name)?;
    let b = arg(args, 1, name)?;
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => match numeric_pair(a, b, name)? {
            NumericPair::Ints(x, y) => x.cmp(&y),
            NumericPair::Floats(x, y) => x.partial_cmp(&y).ok_or_else(|| {
                ProcessingError::Expression(format!("'{name}' cannot order {a} and {b}"))
            })?,
        },
    };
    Ok(Value::Bool(accept(ordering)))
}

fn loose_equal(a: &Value, b: &Value) -> bool {
    // Cross-width numeric equality (1 == 1.0) on top of structural equality.
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

fn in_op(needle: &Value, haystack: &Value) -> Result<Value, ProcessingError> {
    let found = match haystack {
        Value::Array(items) => items.iter().any(|item| loose_equal(item, needle)),
        Value::String(s) => match needle {
            Value::String(sub) => s.contains(sub.as_str()),
            _ => false,
        },
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => {
            return Err(ProcessingError::Expression(format!(
                "'in_op' container must be a sequence, string or mapping, got {haystack}"
            )));
        }
    };
    Ok(Value::Bool(found))
}

fn negate(args: &[Value]) -> Result<Value, ProcessingError> {
    let value = arg(args, 0, "negate")?;
    if let Some(i) = value.as_i64() {
        return Ok(Value::from(-i));
    }
    if let Some(f) = value.as_f64() {
        return Ok(Value::from(-f));
    }
    Err(ProcessingError::Expression(format!(
        "'negate' expects a number, got {value}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call0(name: &str) -> Value {
        call(name, &[], &Map::new()).unwrap()
    }

    fn call2(name: &str, a: Value, b: Value) -> Value {
        call(name, &[a, b], &Map::new()).unwrap()
    }

    #[test]
    fn arithmetic() {
        assert_eq!(call2("add", json!(2), json!(3)), json!(5));
        assert_eq!(call2("add", json!("a"), json!("b")), json!("ab"));
        assert_eq!(call2("subtract", json!(2.5), json!(1)), json!(1.5));
        assert_eq!(call2("multiply", json!(4), json!(3)), json!(12));
        assert_eq!(call2("divide", json!(7), json!(2)), json!(3.5));
        assert_eq!(call2("modulus", json!(7), json!(3)), json!(1));
        assert_eq!(call2("power", json!(2), json!(10)), json!(1024));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(call("divide", &[json!(1), json!(0)], &Map::new()).is_err());
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(call2("equal", json!(1), json!(1.0)), json!(true));
        assert_eq!(call2("not_equal", json!("x"), json!("y")), json!(true));
        assert_eq!(call2("greater_than", json!(3), json!(2)), json!(true));
        assert_eq!(call2("less_than_or_equal", json!(2), json!(2)), json!(true));
        assert_eq!(call2("and_op", json!(1), json!("")), json!(false));
        assert_eq!(call2("or_op", json!(0), json!("x")), json!(true));
        assert_eq!(
            call("not_op", &[json!(null)], &Map::new()).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn membership() {
        assert_eq!(call2("in_op", json!(2), json!([1, 2, 3])), json!(true));
        assert_eq!(call2("in_op", json!("bc"), json!("abcd")), json!(true));
        assert_eq!(call2("in_op", json!("k"), json!({"k": 1})), json!(true));
        assert_eq!(call2("in_op", json!(9), json!([1, 2])), json!(false));
    }

    #[test]
    fn constructors() {
        assert_eq!(call0("empty_list"), json!([]));
        assert_eq!(call0("empty_dict"), json!({}));
        assert_eq!(call0("empty_string"), json!(""));
        assert_eq!(call0("empty_int"), json!(0));
        assert_eq!(call0("empty_float"), json!(0.0));
    }

    #[test]
    fn if_else_picks_by_truthiness() {
        assert_eq!(
            call("if_else", &[json!([1]), json!("a"), json!("b")], &Map::new()).unwrap(),
            json!("a")
        );
        assert_eq!(
            call("if_else", &[json!({}), json!("a"), json!("b")], &Map::new()).unwrap(),
            json!("b")
        );
    }

    #[test]
    fn uuid_is_fresh() {
        let a = call0("uuid");
        let b = call0("uuid");
        assert_ne!(a, b);
    }

    #[test]
    fn append_builds_sequences() {
        assert_eq!(call2("append", json!([1]), json!(2)), json!([1, 2]));
        assert_eq!(call2("append", json!(null), json!(1)), json!([1]));
    }
}
