// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Template evaluation.
//!
//! A [`TemplateEngine`] computes a route's output document from the inbound
//! topic, message and variables. Engines are pluggable; [`RhaiTemplate`]
//! is the default.
//!
//! [`Evaluator`] wraps an engine and owns the routing context: the engine
//! never sees `_ctx` inside the message (it gets it separately as `ctx`),
//! and whatever it returns gets `message._ctx.lvl` set to the inbound level
//! plus one.
//!
//! [`RhaiTemplate`]: crate::script::RhaiTemplate

use crate::context::{self, RoutingContext};
use crate::jsonpath;
use crate::script::RhaiTemplate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Template errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template compilation failed: {0}")]
    Compile(String),

    #[error("Template evaluation failed: {0}")]
    Evaluation(String),

    #[error("Template output must be an object, got {0}")]
    InvalidOutput(&'static str),

    #[error("Unsupported template type '{0}'")]
    UnsupportedType(String),
}

impl TemplateError {
    /// Engine diagnostic text, as produced by the engine.
    pub fn diagnostic(&self) -> String {
        match self {
            TemplateError::Compile(text) | TemplateError::Evaluation(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Template declaration as found in a route file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Engine name.
    #[serde(rename = "type", default = "default_template_kind")]
    pub kind: String,

    /// Inline source.
    #[serde(default)]
    pub value: String,

    /// Source file, relative to the route file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

fn default_template_kind() -> String {
    "rhai".to_string()
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self {
            kind: default_template_kind(),
            value: String::new(),
            path: None,
        }
    }
}

impl TemplateSpec {
    /// Inline Rhai template.
    pub fn rhai(source: impl Into<String>) -> Self {
        Self {
            value: source.into(),
            ..Default::default()
        }
    }

    /// Compile the declared template.
    pub fn build(&self, meta: &Value) -> Result<Arc<dyn TemplateEngine>, TemplateError> {
        match self.kind.to_ascii_lowercase().as_str() {
            "rhai" => Ok(Arc::new(RhaiTemplate::compile(&self.value, meta)?)),
            other => Err(TemplateError::UnsupportedType(other.to_string())),
        }
    }
}

/// Inputs visible to a template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateInput<'a> {
    pub topic: &'a str,
    /// Inbound message without its routing context.
    pub message: &'a Value,
    pub ctx: &'a RoutingContext,
    pub variables: &'a Value,
}

/// Deterministic transformation from an inbound message to an output document.
pub trait TemplateEngine: Send + Sync {
    /// Render the output document, or `None` when the template produced nothing.
    fn render(&self, input: &TemplateInput<'_>) -> Result<Option<Value>, TemplateError>;
}

/// Context-injecting wrapper around a template engine.
#[derive(Clone)]
pub struct Evaluator {
    engine: Arc<dyn TemplateEngine>,
}

impl Evaluator {
    pub fn new(engine: Arc<dyn TemplateEngine>) -> Self {
        Self { engine }
    }

    /// Evaluate the template over a raw inbound payload.
    ///
    /// Payloads that are not valid JSON are handed to the template as a
    /// string.
    pub fn evaluate(
        &self,
        topic: &str,
        input: &str,
        variables: &Value,
    ) -> Result<Option<Value>, TemplateError> {
        let payload = serde_json::from_str::<Value>(input)
            .unwrap_or_else(|_| Value::String(input.to_string()));
        let ctx = RoutingContext::from_payload(&payload);
        let message = context::strip(&payload);

        let rendered = self.engine.render(&TemplateInput {
            topic,
            message: &message,
            ctx: &ctx,
            variables,
        })?;
        let Some(mut output) = rendered else {
            return Ok(None);
        };

        match &mut output {
            Value::Object(map) => {
                let message = map.entry("message".to_string()).or_insert(Value::Null);
                ctx.next().inject(message);
            }
            other => return Err(TemplateError::InvalidOutput(jsonpath::kind_of(other))),
        }
        Ok(Some(output))
    }
}

/// Empty variables document.
pub fn no_variables() -> Value {
    Value::Object(Map::new())
}
