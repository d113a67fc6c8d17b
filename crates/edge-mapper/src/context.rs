// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routing context (`_ctx`) and the recursion guard.
//!
//! Every structured message that leaves a route carries a `_ctx` object whose
//! `lvl` counts the route evaluations since the first message without context.
//! The template step increments `lvl` once per evaluation; the guard only
//! reads and clamps it, so applying the guard twice is harmless.

use crate::error::MapperError;
use crate::message::OutputMessage;
use serde_json::{Map, Value};

/// Key of the routing context inside a message object.
pub const CONTEXT_KEY: &str = "_ctx";

/// Key of the depth counter inside the routing context.
pub const LEVEL_KEY: &str = "lvl";

/// Default maximum route chain depth.
pub const DEFAULT_MAX_DEPTH: u64 = 3;

/// Routing context carried between routes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingContext {
    /// Hop count.
    pub lvl: u64,

    /// Additional fields set by templates, passed along untouched.
    pub extra: Map<String, Value>,
}

impl RoutingContext {
    /// Read the context embedded in a payload. Missing or malformed context
    /// starts at `lvl = 0`.
    pub fn from_payload(payload: &Value) -> Self {
        match payload.get(CONTEXT_KEY) {
            Some(Value::Object(map)) => {
                let mut extra = map.clone();
                let lvl = extra.remove(LEVEL_KEY).as_ref().and_then(level_of).unwrap_or(0);
                Self { lvl, extra }
            }
            _ => Self::default(),
        }
    }

    /// Context for the output of one more route evaluation.
    pub fn next(&self) -> Self {
        Self {
            lvl: self.lvl.saturating_add(1),
            extra: self.extra.clone(),
        }
    }

    /// Render as a JSON object.
    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        map.insert(LEVEL_KEY.to_string(), Value::from(self.lvl));
        Value::Object(map)
    }

    /// Merge this context into an output message object.
    ///
    /// Fields already set by the template in `_ctx` are kept unless this
    /// context overrides them; `lvl` always comes from this context. Non
    /// object messages are left untouched.
    pub fn inject(&self, message: &mut Value) {
        if message.is_null() {
            *message = Value::Object(Map::new());
        }
        let Value::Object(map) = message else {
            return;
        };
        let mut ctx = match map.remove(CONTEXT_KEY) {
            Some(Value::Object(existing)) => existing,
            _ => Map::new(),
        };
        for (key, value) in &self.extra {
            ctx.insert(key.clone(), value.clone());
        }
        ctx.insert(LEVEL_KEY.to_string(), Value::from(self.lvl));
        map.insert(CONTEXT_KEY.to_string(), Value::Object(ctx));
    }
}

/// Remove the routing context from a payload, returning the rest.
pub fn strip(payload: &Value) -> Value {
    match payload {
        Value::Object(map) if map.contains_key(CONTEXT_KEY) => {
            let mut map = map.clone();
            map.remove(CONTEXT_KEY);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

/// Integer levels are taken as is. Fractional levels are truncated and
/// levels beyond `u64::MAX` saturate, so they still trip the guard.
fn level_of(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f.trunc() as u64))
}

/// Read `_ctx.lvl` from a payload, if present.
pub fn level(payload: &Value) -> Option<u64> {
    payload
        .get(CONTEXT_KEY)
        .and_then(|ctx| ctx.get(LEVEL_KEY))
        .and_then(level_of)
}

/// Depth guard applied after template evaluation and before dispatch.
#[derive(Debug, Clone, Copy)]
pub struct RecursionGuard {
    max_depth: u64,
}

impl Default for RecursionGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl RecursionGuard {
    /// Create a guard with the given maximum depth.
    pub fn new(max_depth: u64) -> Self {
        Self { max_depth }
    }

    /// Configured maximum depth.
    pub fn max_depth(&self) -> u64 {
        self.max_depth
    }

    /// Fail when the payload's depth exceeds the maximum. A payload without
    /// context passes.
    pub fn check(&self, payload: &Value) -> Result<(), MapperError> {
        match level(payload) {
            Some(lvl) if lvl > self.max_depth => Err(MapperError::RecursionLimitExceeded {
                lvl,
                max_depth: self.max_depth,
            }),
            _ => Ok(()),
        }
    }

    /// Check the output and apply its `end` and `context` flags to the
    /// outgoing message.
    pub fn apply(&self, output: &mut OutputMessage) -> Result<(), MapperError> {
        let Some(message) = output.message.as_mut() else {
            return Ok(());
        };
        self.check(message)?;

        if output.end {
            if let Value::Object(map) = message {
                let ctx = map
                    .entry(CONTEXT_KEY.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(ctx) = ctx {
                    ctx.insert(LEVEL_KEY.to_string(), Value::from(self.max_depth));
                }
            }
        }

        if output.context == Some(false) {
            if let Value::Object(map) = message {
                map.remove(CONTEXT_KEY);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn output(message: Value) -> OutputMessage {
        OutputMessage {
            topic: "out".into(),
            message: Some(message),
            ..Default::default()
        }
    }

    #[test]
    fn test_context_from_payload() {
        let ctx = RoutingContext::from_payload(&json!({"_ctx": {"lvl": 2, "otherdata": "x"}}));
        assert_eq!(ctx.lvl, 2);
        assert_eq!(ctx.extra.get("otherdata"), Some(&json!("x")));

        assert_eq!(RoutingContext::from_payload(&json!({"a": 1})).lvl, 0);
        assert_eq!(RoutingContext::from_payload(&json!("text")).lvl, 0);
        assert_eq!(RoutingContext::from_payload(&json!({"_ctx": "bad"})).lvl, 0);
        assert_eq!(RoutingContext::from_payload(&json!({"_ctx": {"lvl": 1.0}})).lvl, 1);
    }

    #[test]
    fn test_inject_merges_template_context() {
        let ctx = RoutingContext::from_payload(&json!({"_ctx": {"lvl": 2}})).next();
        let mut message = json!({"value": 1, "_ctx": {"otherdata": "templated", "lvl": 99}});
        ctx.inject(&mut message);
        assert_eq!(
            message,
            json!({"value": 1, "_ctx": {"otherdata": "templated", "lvl": 3}})
        );
    }

    #[test]
    fn test_inject_into_missing_message() {
        let mut message = Value::Null;
        RoutingContext::default().next().inject(&mut message);
        assert_eq!(message, json!({"_ctx": {"lvl": 1}}));

        let mut text = json!("raw");
        RoutingContext::default().next().inject(&mut text);
        assert_eq!(text, json!("raw"));
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip(&json!({"a": 1, "_ctx": {"lvl": 1}})), json!({"a": 1}));
        assert_eq!(strip(&json!([1, 2])), json!([1, 2]));
    }

    #[test]
    fn test_guard_limit() {
        let guard = RecursionGuard::new(2);
        assert!(guard.check(&json!({"_ctx": {"lvl": 2}})).is_ok());
        assert!(guard.check(&json!({"no": "context"})).is_ok());
        let err = guard.check(&json!({"_ctx": {"lvl": 3}})).unwrap_err();
        assert!(matches!(
            err,
            MapperError::RecursionLimitExceeded { lvl: 3, max_depth: 2 }
        ));
    }

    #[test]
    fn test_level_saturates() {
        let ctx = RoutingContext::from_payload(&json!({"_ctx": {"lvl": u64::MAX}}));
        assert_eq!(ctx.next().lvl, u64::MAX);
        assert_eq!(level(&json!({"_ctx": {"lvl": 1e300}})), Some(u64::MAX));
        assert_eq!(level(&json!({"_ctx": {"lvl": 2.7}})), Some(2));
        assert_eq!(level(&json!({"_ctx": {"lvl": -1}})), None);
    }

    #[test]
    fn test_guard_end_forces_max_depth() {
        let guard = RecursionGuard::default();
        for lvl in [0, 1, 3] {
            let mut out = output(json!({"_ctx": {"lvl": lvl}}));
            out.end = true;
            guard.apply(&mut out).unwrap();
            assert_eq!(level(out.message.as_ref().unwrap()), Some(3));
        }
    }

    #[test]
    fn test_guard_strips_context() {
        let guard = RecursionGuard::default();
        for message in [json!({"_ctx": {"lvl": 1}, "a": 1}), json!({"a": 1}), json!({})] {
            let mut out = output(message);
            out.context = Some(false);
            guard.apply(&mut out).unwrap();
            assert!(out.message.as_ref().unwrap().get(CONTEXT_KEY).is_none());
        }
    }

    #[test]
    fn test_guard_is_idempotent() {
        let guard = RecursionGuard::new(3);
        let mut out = output(json!({"_ctx": {"lvl": 2}}));
        guard.apply(&mut out).unwrap();
        guard.apply(&mut out).unwrap();
        assert_eq!(level(out.message.as_ref().unwrap()), Some(2));
    }
}
