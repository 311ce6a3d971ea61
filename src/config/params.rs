//! Parameter Extraction
//!
//! Typed extraction of component parameters from the generic
//! `Map<String, serde_json::Value>` carried by stage configurations.
//! Extraction is forgiving: a missing key or a value of the wrong shape
//! falls back to the supplied default, so components distinguish "not
//! configured" from "misconfigured" in their own `validate` step.

use serde_json::{Map, Value};

/// Extract a typed parameter, falling back to `default` when the key is
/// absent or the value cannot be deserialised to `T`.
///
/// ```ignore
/// let queue: String = extract_param(&config, "queue_name", String::new());
/// let retries: u32 = extract_param(&config, "retry_count", 3);
/// ```
pub fn extract_param<T>(params: &Map<String, Value>, key: &str, default: T) -> T
where
    T: serde::de::DeserializeOwned,
{
    params
        .get(key)
        .and_then(|value| serde_json::from_value(value.clone()).ok())
        .unwrap_or(default)
}

/// Extract a parameter that must be present; the error names the key so
/// configuration mistakes read well.
pub fn require_param<T>(params: &Map<String, Value>, key: &str) -> anyhow::Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let value = params
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("parameter '{}' is required", key))?;
    serde_json::from_value(value.clone())
        .map_err(|e| anyhow::anyhow!("parameter '{}' has the wrong shape: {}", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("factor".into(), json!(2.5));
        map.insert("count".into(), json!(7));
        map.insert("label".into(), json!("scaled"));
        map
    }

    #[test]
    fn typed_extraction_with_defaults() {
        let params = params();
        assert_eq!(extract_param(&params, "factor", 1.0), 2.5);
        assert_eq!(extract_param(&params, "count", 0_u32), 7);
        assert_eq!(
            extract_param(&params, "missing", "fallback".to_string()),
            "fallback"
        );
        // Wrong shape falls back too.
        assert_eq!(extract_param(&params, "label", 9_i64), 9);
    }

    #[test]
    fn required_parameter_errors_name_the_key() {
        let params = params();
        let err = require_param::<String>(&params, "absent").unwrap_err();
        assert!(err.to_string().contains("absent"));
        assert_eq!(
            require_param::<String>(&params, "label").unwrap(),
            "scaled"
        );
    }
}
