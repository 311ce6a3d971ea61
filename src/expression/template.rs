//! Templates
//!
//! `template:<text with {{ ... }} holes>` expressions. Each hole is
//! `<encoding>://<inner-expression>`; the inner expression is evaluated
//! recursively, formatted according to the encoding and concatenated with
//! the surrounding text in declaration order.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::error::ProcessingError;
use crate::expression::{EvalContext, Expression, evaluate};

#[derive(Clone, Debug)]
pub enum Encoding {
    Text,
    Json,
    Yaml,
    Base64,
    DataUri(String),
}

#[derive(Clone, Debug)]
pub enum TemplatePart {
    Text(String),
    Hole {
        encoding: Encoding,
        expr: Box<Expression>,
    },
}

#[derive(Clone, Debug)]
pub struct Template {
    parts: Vec<TemplatePart>,
}

fn hole_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{(.*?)\}\}").expect("hole pattern compiles"))
}

impl Template {
    pub fn parse(body: &str) -> Result<Self, ProcessingError> {
        let mut parts = Vec::new();
        let mut cursor = 0;

        for hole in hole_pattern().captures_iter(body) {
            let whole = hole.get(0).expect("match 0 always present");
            if whole.start() > cursor {
                parts.push(TemplatePart::Text(body[cursor..whole.start()].to_string()));
            }

            let inner = hole[1].trim();
            let (encoding_text, expr_text) = inner.split_once("://").ok_or_else(|| {
                ProcessingError::Expression(format!(
                    "template hole '{inner}' is missing an '<encoding>://' prefix"
                ))
            })?;

            let encoding = match encoding_text {
                "text" => Encoding::Text,
                "json" => Encoding::Json,
                "yaml" => Encoding::Yaml,
                "base64" => Encoding::Base64,
                other => match other.strip_prefix("datauri:") {
                    Some(mime) if !mime.is_empty() => Encoding::DataUri(mime.to_string()),
                    _ => {
                        return Err(ProcessingError::Expression(format!(
                            "unknown template encoding '{other}'"
                        )));
                    }
                },
            };

            parts.push(TemplatePart::Hole {
                encoding,
                expr: Box::new(Expression::parse(expr_text)?),
            });
            cursor = whole.end();
        }

        if cursor < body.len() {
            parts.push(TemplatePart::Text(body[cursor..].to_string()));
        }

        Ok(Self { parts })
    }

    pub fn render(&self, ctx: &EvalContext) -> Result<Value, ProcessingError> {
        let mut rendered = String::new();
        for part in &self.parts {
            match part {
                TemplatePart::Text(text) => rendered.push_str(text),
                TemplatePart::Hole { encoding, expr } => {
                    let value = evaluate(expr, ctx)?;
                    rendered.push_str(&format_hole(&value, encoding)?);
                }
            }
        }
        Ok(Value::String(rendered))
    }
}

fn format_hole(value: &Value, encoding: &Encoding) -> Result<String, ProcessingError> {
    match encoding {
        Encoding::Text => Ok(plain_text(value)),
        Encoding::Json => serde_json::to_string(value)
            .map_err(|e| ProcessingError::Expression(format!("json encoding failed: {e}"))),
        Encoding::Yaml => serde_yaml::to_string(value)
            .map(|s| s.trim_end_matches('\n').to_string())
            .map_err(|e| ProcessingError::Expression(format!("yaml encoding failed: {e}"))),
        Encoding::Base64 => Ok(BASE64.encode(plain_text(value).as_bytes())),
        Encoding::DataUri(mime) => Ok(format!(
            "data:{mime};base64,{}",
            BASE64.encode(plain_text(value).as_bytes())
        )),
    }
}

fn plain_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    fn sample() -> Message {
        Message::new("alerts/high", json!({"name": "probe", "level": 3}))
    }

    #[test]
    fn text_holes_concatenate_in_order() {
        let msg = sample();
        let template = Template::parse(
            "sensor {{ text://input.payload:name }} at level {{ text://input.payload:level }}!",
        )
        .unwrap();
        assert_eq!(
            template.render(&EvalContext::new(&msg)).unwrap(),
            json!("sensor probe at level 3!")
        );
    }

    #[test]
    fn json_encoding_serialises_the_value() {
        let msg = sample();
        let template = Template::parse("data={{ json://input.payload }}").unwrap();
        assert_eq!(
            template.render(&EvalContext::new(&msg)).unwrap(),
            json!(r#"data={"name":"probe","level":3}"#)
        );
    }

    #[test]
    fn base64_and_datauri_encodings() {
        let msg = sample();
        let template = Template::parse("{{ base64://input.payload:name }}").unwrap();
        assert_eq!(
            template.render(&EvalContext::new(&msg)).unwrap(),
            json!(BASE64.encode("probe"))
        );

        let datauri = Template::parse("{{ datauri:text/plain://input.payload:name }}").unwrap();
        assert_eq!(
            datauri.render(&EvalContext::new(&msg)).unwrap(),
            json!(format!("data:text/plain;base64,{}", BASE64.encode("probe")))
        );
    }

    #[test]
    fn hole_without_encoding_fails_at_parse() {
        assert!(Template::parse("{{ input.payload }}").is_err());
    }

    #[test]
    fn null_hole_renders_empty() {
        let msg = sample();
        let template = Template::parse("[{{ text://input.payload:absent }}]").unwrap();
        assert_eq!(
            template.render(&EvalContext::new(&msg)).unwrap(),
            json!("[]")
        );
    }
}
