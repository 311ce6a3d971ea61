//! Payload Codecs
//!
//! Conversion between broker wire bytes and the structured payload model.
//! Ingress decodes with a fallback chain (structured format, then UTF-8
//! text, then base64) so malformed payloads still travel as strings rather
//! than being dropped at the door.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ProcessingError;

/// Structured format applied after the byte-level encoding.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Yaml,
    Text,
}

/// Byte-level encoding applied on the wire.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    Base64,
    None,
}

/// Decode broker bytes into a payload value.
pub fn decode_payload(bytes: &[u8], encoding: PayloadEncoding, format: PayloadFormat) -> Value {
    let decoded: Vec<u8> = match encoding {
        PayloadEncoding::Utf8 | PayloadEncoding::None => bytes.to_vec(),
        PayloadEncoding::Base64 => match BASE64.decode(bytes) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("payload is not valid base64 ({e}), passing bytes through");
                bytes.to_vec()
            }
        },
    };

    match format {
        PayloadFormat::Json => match serde_json::from_slice::<Value>(&decoded) {
            Ok(value) => value,
            Err(_) => fallback_string(&decoded),
        },
        PayloadFormat::Yaml => match serde_yaml::from_slice::<Value>(&decoded) {
            Ok(value) => value,
            Err(_) => fallback_string(&decoded),
        },
        PayloadFormat::Text => fallback_string(&decoded),
    }
}

/// Encode a payload value into broker bytes.
pub fn encode_payload(
    payload: &Value,
    encoding: PayloadEncoding,
    format: PayloadFormat,
) -> Result<Vec<u8>, ProcessingError> {
    let rendered = match format {
        PayloadFormat::Json => serde_json::to_vec(payload)
            .map_err(|e| ProcessingError::Broker(format!("payload serialisation failed: {e}")))?,
        PayloadFormat::Yaml => serde_yaml::to_string(payload)
            .map_err(|e| ProcessingError::Broker(format!("payload serialisation failed: {e}")))?
            .into_bytes(),
        PayloadFormat::Text => match payload {
            Value::String(s) => s.clone().into_bytes(),
            other => other.to_string().into_bytes(),
        },
    };

    Ok(match encoding {
        PayloadEncoding::Utf8 | PayloadEncoding::None => rendered,
        PayloadEncoding::Base64 => BASE64.encode(&rendered).into_bytes(),
    })
}

// Not structured data: keep it as text if it is valid UTF-8, otherwise as
// base64 so binary payloads survive the trip through the pipeline.
fn fallback_string(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_owned()),
        Err(_) => Value::String(BASE64.encode(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_json_payload() {
        let value = decode_payload(b"{\"value\":7}", PayloadEncoding::Utf8, PayloadFormat::Json);
        assert_eq!(value, json!({"value": 7}));
    }

    #[test]
    fn malformed_json_falls_back_to_text() {
        let value = decode_payload(b"not json", PayloadEncoding::Utf8, PayloadFormat::Json);
        assert_eq!(value, json!("not json"));
    }

    #[test]
    fn binary_falls_back_to_base64() {
        let raw = [0xff, 0xfe, 0x01];
        let value = decode_payload(&raw, PayloadEncoding::Utf8, PayloadFormat::Json);
        assert_eq!(value, json!(BASE64.encode(raw)));
    }

    #[test]
    fn encode_decode_round_trip() {
        let payload = json!({"a": [1, 2, 3], "b": "text"});
        let bytes =
            encode_payload(&payload, PayloadEncoding::Base64, PayloadFormat::Json).unwrap();
        let back = decode_payload(&bytes, PayloadEncoding::Base64, PayloadFormat::Json);
        assert_eq!(back, payload);
    }
}
