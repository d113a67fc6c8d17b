// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Rhai template engine.
//!
//! A template is a Rhai script whose final expression is the output map:
//!
//! ```rhai
//! #{
//!     topic: "c8y/measurement/measurements/create",
//!     message: #{ type: "environment", temperature: message.temp }
//! }
//! ```
//!
//! The script sees the constants `topic`, `ctx`, `variables` and `meta`, and
//! the variable `message`. Returning `()` produces no output.

use crate::jsonpath;
use crate::template::{TemplateEngine, TemplateError, TemplateInput};
use regex::Regex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, Position, Scope, AST};
use serde_json::Value;

/// Compiled Rhai template.
pub struct RhaiTemplate {
    engine: Engine,
    ast: AST,
    meta: Dynamic,
}

impl std::fmt::Debug for RhaiTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RhaiTemplate").finish_non_exhaustive()
    }
}

impl RhaiTemplate {
    /// Compile a template. `meta` is exposed read-only to every evaluation.
    pub fn compile(source: &str, meta: &Value) -> Result<Self, TemplateError> {
        let engine = create_rhai_engine();
        let ast = engine
            .compile(source)
            .map_err(|e| TemplateError::Compile(e.to_string()))?;
        Ok(Self {
            engine,
            ast,
            meta: json_to_dynamic(meta),
        })
    }
}

impl TemplateEngine for RhaiTemplate {
    fn render(&self, input: &TemplateInput<'_>) -> Result<Option<Value>, TemplateError> {
        let mut scope = Scope::new();
        scope.push_constant("topic", input.topic.to_string());
        scope.push_dynamic("message", json_to_dynamic(input.message));
        scope.push_constant_dynamic("ctx", json_to_dynamic(&input.ctx.to_value()));
        scope.push_constant_dynamic("variables", json_to_dynamic(input.variables));
        scope.push_constant_dynamic("meta", self.meta.clone());

        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map_err(|e| TemplateError::Evaluation(e.to_string()))?;

        if result.is_unit() {
            return Ok(None);
        }
        match dynamic_to_json(&result) {
            Value::Object(map) => Ok(Some(Value::Object(map))),
            other => Err(TemplateError::InvalidOutput(jsonpath::kind_of(&other))),
        }
    }
}

/// Create a sandboxed Rhai engine with the template helpers registered.
pub fn create_rhai_engine() -> Engine {
    let mut engine = Engine::new();

    engine.set_max_expr_depths(64, 64);
    engine.set_max_operations(100_000);
    engine.set_max_modules(0);
    engine.set_max_string_size(1 << 20);

    engine.register_fn("now", || {
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    });
    engine.register_fn("id", || uuid::Uuid::new_v4().simple().to_string());
    engine.register_fn("replace_pattern", replace_pattern);
    engine.register_fn("get_path", |value: Dynamic, path: &str, default: Dynamic| {
        let json = dynamic_to_json(&value);
        match jsonpath::get(&json, path) {
            Some(found) if !found.is_null() => json_to_dynamic(found),
            _ => default,
        }
    });
    engine.register_fn("parse_json", |text: &str| {
        serde_json::from_str::<Value>(text)
            .map(|v| json_to_dynamic(&v))
            .unwrap_or(Dynamic::UNIT)
    });
    engine.register_fn("to_json", |value: Dynamic| dynamic_to_json(&value).to_string());

    engine
}

fn replace_pattern(
    value: &str,
    pattern: &str,
    replacement: &str,
) -> Result<String, Box<EvalAltResult>> {
    let re = Regex::new(pattern).map_err(|e| {
        Box::new(EvalAltResult::ErrorRuntime(
            format!("invalid pattern '{}': {}", pattern, e).into(),
            Position::NONE,
        ))
    })?;
    Ok(re.replace_all(value, replacement).into_owned())
}

/// Convert JSON value to Rhai Dynamic
pub fn json_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::UNIT
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(arr) => {
            let rhai_arr: Array = arr.iter().map(json_to_dynamic).collect();
            Dynamic::from(rhai_arr)
        }
        Value::Object(map) => {
            let mut rhai_map = rhai::Map::new();
            for (k, v) in map {
                rhai_map.insert(k.clone().into(), json_to_dynamic(v));
            }
            Dynamic::from(rhai_map)
        }
    }
}

/// Convert Rhai Dynamic to JSON value
pub fn dynamic_to_json(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(b) = value.clone().try_cast::<bool>() {
        return Value::Bool(b);
    }
    if let Some(i) = value.clone().try_cast::<i64>() {
        return Value::from(i);
    }
    if let Some(f) = value.clone().try_cast::<f64>() {
        return serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Some(s) = value.clone().try_cast::<String>() {
        return Value::String(s);
    }
    if let Some(c) = value.clone().try_cast::<char>() {
        return Value::String(c.to_string());
    }
    if let Some(arr) = value.clone().try_cast::<Array>() {
        return Value::Array(arr.iter().map(dynamic_to_json).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        let mut json_map = serde_json::Map::new();
        for (k, v) in map.iter() {
            json_map.insert(k.to_string(), dynamic_to_json(v));
        }
        return Value::Object(json_map);
    }
    Value::String(value.to_string())
}
