// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dotted path access into JSON documents (`software.0.name`).
//!
//! Numeric segments index arrays. When `set` has to create an intermediate
//! container it creates an array if the following segment is numeric and an
//! object otherwise; arrays are padded with `null` up to the target index.

use serde_json::{Map, Value};
use thiserror::Error;

/// Path assignment errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,

    #[error("cannot descend into {kind} at '{segment}'")]
    NotAContainer { segment: String, kind: &'static str },

    #[error("array index '{0}' is not a number")]
    BadIndex(String),
}

/// JSON type name, for diagnostics.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn container_for(next: Option<&&str>) -> Value {
    match next {
        Some(segment) if segment.parse::<usize>().is_ok() => Value::Array(Vec::new()),
        _ => Value::Object(Map::new()),
    }
}

/// Look up a value by dotted path.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Assign `value` at the dotted path, creating intermediate containers.
pub fn set(root: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        let next = segments.get(i + 1);

        if current.is_null() {
            *current = container_for(Some(segment));
        }

        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), value);
                    return Ok(());
                }
                map.entry(segment.to_string())
                    .or_insert_with(|| container_for(next))
            }
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| PathError::BadIndex(segment.to_string()))?;
                if items.len() <= index {
                    items.resize(index + 1, Value::Null);
                }
                if last {
                    items[index] = value;
                    return Ok(());
                }
                let slot = &mut items[index];
                if slot.is_null() {
                    *slot = container_for(next);
                }
                slot
            }
            other => {
                return Err(PathError::NotAContainer {
                    segment: segment.to_string(),
                    kind: kind_of(other),
                })
            }
        };
    }

    Ok(())
}

/// Remove the value at the dotted path, returning it.
pub fn delete(root: &mut Value, path: &str) -> Option<Value> {
    let (parent, key) = match path.rsplit_once('.') {
        Some((parent, key)) => (get_mut(root, parent)?, key),
        None => (root, path),
    };
    match parent {
        Value::Object(map) => map.remove(key),
        _ => None,
    }
}

fn get_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_nested_object() {
        let mut doc = json!({});
        set(&mut doc, "a.b.c", json!(1)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_creates_arrays_for_numeric_segments() {
        let mut doc = json!({});
        set(&mut doc, "software.0.name", json!("a")).unwrap();
        set(&mut doc, "software.1.name", json!("b")).unwrap();
        set(&mut doc, "software.0.version", json!("1.0")).unwrap();
        assert_eq!(
            doc,
            json!({"software": [{"name": "a", "version": "1.0"}, {"name": "b"}]})
        );
    }

    #[test]
    fn test_set_pads_arrays() {
        let mut doc = json!({});
        set(&mut doc, "list.2", json!(true)).unwrap();
        assert_eq!(doc, json!({"list": [null, null, true]}));
    }

    #[test]
    fn test_set_into_scalar_fails() {
        let mut doc = json!({"a": "text"});
        let err = set(&mut doc, "a.b", json!(1)).unwrap_err();
        assert_eq!(
            err,
            PathError::NotAContainer {
                segment: "b".into(),
                kind: "string"
            }
        );
        assert_eq!(set(&mut doc, "", json!(1)), Err(PathError::Empty));
    }

    #[test]
    fn test_set_on_null_root() {
        let mut doc = Value::Null;
        set(&mut doc, "x", json!(2)).unwrap();
        assert_eq!(doc, json!({"x": 2}));
    }

    #[test]
    fn test_get_and_delete() {
        let mut doc = json!({"_ctx": {"lvl": 2, "other": "x"}, "items": [1, 2]});
        assert_eq!(get(&doc, "_ctx.lvl"), Some(&json!(2)));
        assert_eq!(get(&doc, "items.1"), Some(&json!(2)));
        assert_eq!(get(&doc, "items.5"), None);
        assert_eq!(get(&doc, "missing.path"), None);

        assert_eq!(delete(&mut doc, "_ctx.other"), Some(json!("x")));
        assert_eq!(delete(&mut doc, "_ctx"), Some(json!({"lvl": 2})));
        assert_eq!(delete(&mut doc, "_ctx"), None);
        assert_eq!(doc, json!({"items": [1, 2]}));
    }
}
