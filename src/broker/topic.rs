//! Topic Subscriptions
//!
//! Subscription filters over hierarchical topics. Two wildcards exist:
//! `*` matches exactly one level, `>` matches one or more trailing levels
//! and may only appear as the last level.

use crate::error::ConfigError;
use crate::message::split_topic;

#[derive(Clone, Debug, PartialEq, Eq)]
enum FilterLevel {
    Literal(String),
    Single,
    Rest,
}

/// A parsed topic subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicFilter {
    text: String,
    levels: Vec<FilterLevel>,
}

impl TopicFilter {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let raw_levels = split_topic(text);
        if raw_levels.is_empty() {
            return Err(ConfigError::invalid(
                format!("subscription '{text}'"),
                "topic filter cannot be empty",
            ));
        }

        let mut levels = Vec::with_capacity(raw_levels.len());
        for (position, level) in raw_levels.iter().enumerate() {
            let parsed = match level.as_str() {
                "*" => FilterLevel::Single,
                ">" => {
                    if position != raw_levels.len() - 1 {
                        return Err(ConfigError::invalid(
                            format!("subscription '{text}'"),
                            "'>' may only appear as the last level",
                        ));
                    }
                    FilterLevel::Rest
                }
                literal => FilterLevel::Literal(literal.to_string()),
            };
            levels.push(parsed);
        }

        Ok(Self {
            text: text.to_string(),
            levels,
        })
    }

    /// Compare the filter against a message's parsed topic levels, left to
    /// right. `>` requires at least one trailing level.
    pub fn matches(&self, topic_levels: &[String]) -> bool {
        let mut remaining = topic_levels;
        for level in &self.levels {
            match level {
                FilterLevel::Rest => return !remaining.is_empty(),
                FilterLevel::Single => {
                    if remaining.is_empty() {
                        return false;
                    }
                    remaining = &remaining[1..];
                }
                FilterLevel::Literal(expected) => {
                    match remaining.first() {
                        Some(actual) if actual == expected => remaining = &remaining[1..],
                        _ => return false,
                    }
                }
            }
        }
        remaining.is_empty()
    }

    pub fn matches_topic(&self, topic: &str) -> bool {
        self.matches(&split_topic(topic))
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Render with MQTT wildcard spelling (`+` / `#`) for the rumqttc
    /// backend.
    pub fn to_mqtt(&self) -> String {
        self.levels
            .iter()
            .map(|level| match level {
                FilterLevel::Literal(text) => text.as_str(),
                FilterLevel::Single => "+",
                FilterLevel::Rest => "#",
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(filter: &str, topic: &str) -> bool {
        TopicFilter::parse(filter).unwrap().matches_topic(topic)
    }

    #[test]
    fn exact_match() {
        assert!(matches("my/topic1", "my/topic1"));
        assert!(!matches("my/topic1", "my/topic2"));
        assert!(!matches("my/topic1", "my/topic1/extra"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("data/*/high", "data/raw/high"));
        assert!(!matches("data/*/high", "data/high"));
        assert!(!matches("data/*/high", "data/raw/low"));
        assert!(!matches("data/*/high", "data/a/b/high"));
    }

    #[test]
    fn rest_wildcard_needs_a_trailing_level() {
        assert!(matches("data/>", "data/raw"));
        assert!(matches("data/>", "data/raw/low/extra"));
        assert!(!matches("data/>", "data"));
        assert!(!matches("data/>", "other/x"));
    }

    #[test]
    fn rest_must_be_last() {
        assert!(TopicFilter::parse("data/>/more").is_err());
        assert!(TopicFilter::parse(">").is_ok());
    }

    #[test]
    fn mqtt_spelling() {
        let filter = TopicFilter::parse("data/*/detail/>").unwrap();
        assert_eq!(filter.to_mqtt(), "data/+/detail/#");
    }
}
