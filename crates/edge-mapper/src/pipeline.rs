// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-route stream pipeline: preprocess, evaluate, guard.

use crate::context::RecursionGuard;
use crate::error::MapperError;
use crate::message::OutputMessage;
use crate::route::Route;
use crate::template::{Evaluator, TemplateEngine, TemplateError};
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;

/// A route bound to its compiled template.
pub struct StreamPipeline {
    route: Arc<Route>,
    evaluator: Evaluator,
    guard: RecursionGuard,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("route", &self.route.name)
            .field("max_depth", &self.guard.max_depth())
            .finish()
    }
}

impl StreamPipeline {
    /// Compile the route's template.
    pub fn new(route: Route, meta: &Value, guard: RecursionGuard) -> Result<Self, TemplateError> {
        let engine = route.template.build(meta)?;
        Ok(Self::with_engine(route, engine, guard))
    }

    /// Use an already built template engine.
    pub fn with_engine(route: Route, engine: Arc<dyn TemplateEngine>, guard: RecursionGuard) -> Self {
        Self {
            route: Arc::new(route),
            evaluator: Evaluator::new(engine),
            guard,
        }
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn guard(&self) -> RecursionGuard {
        self.guard
    }

    /// Check if this pipeline handles a topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        self.route.matches_topic(topic)
    }

    /// Run one inbound message through the route.
    ///
    /// Returns `Ok(None)` when the template produced nothing. The returned
    /// message has its routing context already adjusted for `end` and
    /// `context`.
    pub fn process(
        &self,
        topic: &str,
        raw_message: &str,
        variables: &Value,
    ) -> Result<Option<OutputMessage>, MapperError> {
        self.route.record_message();
        let result = self.run(topic, raw_message, variables);
        match &result {
            Ok(Some(_)) => {}
            Ok(None) => self.route.record_skipped(),
            Err(_) => self.route.record_error(),
        }
        result
    }

    fn run(
        &self,
        topic: &str,
        raw_message: &str,
        variables: &Value,
    ) -> Result<Option<OutputMessage>, MapperError> {
        let preprocessed;
        let input = match &self.route.preprocessor {
            Some(preprocessor) => {
                preprocessed = preprocessor.execute(raw_message).to_string();
                preprocessed.as_str()
            }
            None => raw_message,
        };

        let document = match self.evaluator.evaluate(topic, input, variables) {
            Ok(Some(document)) => document,
            Ok(None) => return Ok(None),
            Err(e) => {
                report_template_error(&self.route.name, &e);
                return Err(MapperError::TemplateException {
                    route: self.route.name.clone(),
                });
            }
        };

        let mut output = OutputMessage::from_value(document)?;
        self.guard.apply(&mut output)?;

        if output.context == Some(false)
            && output.is_publish()
            && self.route.matches_topic(&output.topic)
        {
            return Err(MapperError::UnsafeContextStrip {
                route: self.route.name.clone(),
                topic: output.topic,
            });
        }

        Ok(Some(output))
    }
}

/// Write the engine's diagnostic verbatim to stderr; engines pre-format them.
fn report_template_error(route: &str, error: &TemplateError) {
    tracing::error!("Template error in route '{}'", route);
    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "{}", error.diagnostic());
}

/// Build pipelines for every route, dropping routes whose template fails to
/// compile.
pub fn build_pipelines(routes: Vec<Route>, meta: &Value, guard: RecursionGuard) -> Vec<Arc<StreamPipeline>> {
    routes
        .into_iter()
        .filter_map(|route| {
            let name = route.name.clone();
            match StreamPipeline::new(route, meta, guard) {
                Ok(pipeline) => Some(Arc::new(pipeline)),
                Err(e) => {
                    tracing::warn!("Failed to register route '{}', it will be ignored: {}", name, e);
                    None
                }
            }
        })
        .collect()
}
