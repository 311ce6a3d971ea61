//! Index-Path Addressing
//!
//! The part of an expression after the colon: a dot-separated path whose
//! segments are either sequence indices or mapping keys. Reads of missing
//! paths yield nothing; writes auto-vivify intermediate mappings and extend
//! intermediate sequences with null fillers.

use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed index-path. The empty path addresses the root value itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        if text.is_empty() {
            return Self::root();
        }

        let segments = text
            .split('.')
            .map(|segment| match segment.parse::<usize>() {
                Ok(index) => PathSegment::Index(index),
                Err(_) => PathSegment::Key(segment.to_string()),
            })
            .collect();

        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Prepend a mapping key, used when a qualifier folds into the path.
    pub fn prefixed(mut self, key: &str) -> Self {
        self.segments.insert(0, PathSegment::Key(key.to_string()));
        self
    }

    pub fn read<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match segment {
                PathSegment::Key(key) => current.as_object()?.get(key)?,
                PathSegment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating intermediate containers as
    /// needed: mappings for key segments, sequences (null-extended) for
    /// index segments. A non-container in the way is replaced.
    pub fn write(&self, root: &mut Value, value: Value) {
        let mut current = root;
        for segment in &self.segments {
            match segment {
                PathSegment::Key(key) => {
                    if !current.is_object() {
                        *current = Value::Object(serde_json::Map::new());
                    }
                    current = current
                        .as_object_mut()
                        .expect("just made an object")
                        .entry(key.clone())
                        .or_insert(Value::Null);
                }
                PathSegment::Index(index) => {
                    if !current.is_array() {
                        *current = Value::Array(Vec::new());
                    }
                    let array = current.as_array_mut().expect("just made an array");
                    while array.len() <= *index {
                        array.push(Value::Null);
                    }
                    current = &mut array[*index];
                }
            }
        }
        *current = value;
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match segment {
                PathSegment::Key(key) => f.write_str(key)?,
                PathSegment::Index(index) => write!(f, "{index}")?,
            }
        }
        Ok(())
    }
}
