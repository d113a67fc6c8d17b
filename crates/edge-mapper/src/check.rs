// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Offline route checker.
//!
//! Runs a message through the routes without a broker. Published outputs are
//! queued and processed again, as the broker would deliver them back, until
//! the queue is empty. Everything runs in dry-run mode.

use crate::broker::MemoryBroker;
use crate::dispatch::Dispatcher;
use crate::error::MapperError;
use crate::message::OutputMessage;
use crate::pipeline::StreamPipeline;
use colored::Colorize;
use serde_json::Value;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::Arc;

/// One route evaluation.
#[derive(Debug, Clone)]
pub struct CheckStep {
    pub iteration: u64,
    pub route: String,
    pub route_topics: Vec<String>,
    pub input_topic: String,
    pub output: OutputMessage,
}

impl CheckStep {
    /// Whether the output stops the chain here.
    pub fn is_final(&self) -> bool {
        self.output.skip || self.output.end
    }
}

/// Dry-run route simulator.
pub struct Checker {
    pipelines: Vec<Arc<StreamPipeline>>,
    dispatcher: Dispatcher,
    variables: Arc<Value>,
    max_depth: u64,
}

impl Checker {
    pub fn new(pipelines: Vec<Arc<StreamPipeline>>, variables: Arc<Value>, max_depth: u64) -> Self {
        Self {
            pipelines,
            dispatcher: Dispatcher::new(Arc::new(MemoryBroker::new())).dry_run(true),
            variables,
            max_depth,
        }
    }

    /// Process `message` and everything it leads to. `on_step` sees each
    /// route output as it is produced. Returns the number of iterations.
    ///
    /// The first route error aborts the run.
    pub async fn run<F>(&self, topic: &str, message: &str, mut on_step: F) -> Result<u64, MapperError>
    where
        F: FnMut(&CheckStep),
    {
        let mut queue = VecDeque::from([(topic.to_string(), message.to_string())]);
        let mut iteration = 0;

        while let Some((topic, message)) = queue.pop_front() {
            if iteration > self.max_depth {
                return Err(MapperError::RecursionLimitExceeded {
                    lvl: iteration,
                    max_depth: self.max_depth,
                });
            }
            tracing::debug!("Checking for matching routes (iteration {})", iteration);

            let mut found = false;
            for pipeline in self.pipelines.iter().filter(|p| p.matches_topic(&topic)) {
                found = true;
                let route = pipeline.route();
                let Some(output) = pipeline.process(&topic, &message, &self.variables)? else {
                    continue;
                };
                let outcome = self.dispatcher.dispatch(route, &output).await?;

                let step = CheckStep {
                    iteration,
                    route: route.name.clone(),
                    route_topics: route.topics.clone(),
                    input_topic: topic.clone(),
                    output,
                };
                on_step(&step);

                if !step.is_final() && outcome.is_publish() {
                    let payload = step.output.payload()?;
                    queue.push_back((step.output.topic, payload));
                }
            }
            if !found {
                tracing::info!("No matching routes found for {}", topic);
            }
            iteration += 1;
        }
        Ok(iteration)
    }
}

/// Print a step in human readable form.
pub fn render_step<W: Write>(w: &mut W, step: &CheckStep, compact: bool, use_color: bool) -> io::Result<()> {
    let header = format!("Route: {} ({})", step.route, step.route_topics.join(", "));
    if use_color {
        writeln!(w, "{}", header.bold().on_cyan())?;
    } else {
        writeln!(w, "{}", header)?;
    }

    writeln!(w, "\nInput Message")?;
    writeln!(w, "  {:<10}{}", "topic:", step.input_topic)?;

    let output = &step.output;
    if output.skip {
        return Ok(());
    }

    let updates: Vec<_> = output.updates.iter().filter(|u| !u.skip).collect();
    if !updates.is_empty() {
        writeln!(w, "\nOutput Updates")?;
        for update in updates {
            if update.delay > 0.0 {
                writeln!(w, "  {:<10}{} (delayed: {:.1}s)", "topic:", update.topic, update.delay)?;
            } else {
                writeln!(w, "  {:<10}{}", "topic:", update.topic)?;
            }
            render_value(w, update.message.as_ref().unwrap_or(&Value::Null), compact)?;
        }
    }

    match &output.api {
        Some(api) => {
            writeln!(w, "\nOutput Message (api)")?;
            writeln!(w, "  {:<10}{} {}", "request:", api.method, api.path)?;
            render_value(w, api.body.as_ref().unwrap_or(&Value::Null), compact)?;
        }
        None => {
            writeln!(w, "\nOutput Message (mqtt)")?;
            writeln!(w, "  {:<10}{}", "topic:", output.topic)?;
            if output.end {
                writeln!(w, "  {:<10}{}", "end:", output.end)?;
            }
            match &output.raw_message {
                Some(raw) => writeln!(w, "{}", raw)?,
                None => render_value(w, output.message.as_ref().unwrap_or(&Value::Null), compact)?,
            }
        }
    }
    Ok(())
}

fn render_value<W: Write>(w: &mut W, value: &Value, compact: bool) -> io::Result<()> {
    if let Value::String(text) = value {
        return writeln!(w, "\n{}\n", text);
    }
    let text = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value).map(|s| s.replace('\n', "\n    "))
    }
    .map_err(io::Error::other)?;
    writeln!(w, "\n    {}\n", text)
}
