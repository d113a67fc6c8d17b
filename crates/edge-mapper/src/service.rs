// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Long-running mapper service.
//!
//! Inbound broker messages land in a bounded queue. A dispatcher loop takes
//! them off the queue and spawns one task per message, at most `workers` at
//! a time. Each task evaluates every matching route in registration order
//! and dispatches the results.
//!
//! Outputs published to topics the service subscribes to come back through
//! the broker and are processed again; the routing context carried in the
//! payload bounds these chains.

use crate::api::{parse_token_response, ApiClient};
use crate::broker::{Broker, InboundMessage};
use crate::config::MapperConfig;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::entity::{key_from_topic, Entity, EntityStore};
use crate::error::MapperError;
use crate::message::{Publication, Qos};
use crate::pipeline::StreamPipeline;
use crate::route::RouteStatsSnapshot;
use crate::topic;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

/// Filter for entity registration messages.
pub const REGISTRATION_FILTER: &str = "te/+/+/+/+";

const HEALTH_UP: &str = r#"{"status":"up"}"#;
const HEALTH_DOWN: &str = r#"{"status":"down"}"#;

/// Service registration topic.
pub fn service_topic(client_id: &str) -> String {
    format!("te/device/main/service/{}", client_id)
}

/// Service health topic.
pub fn health_topic(client_id: &str) -> String {
    format!("{}/status/health", service_topic(client_id))
}

/// Health message left by the broker when the connection drops.
pub fn last_will(client_id: &str) -> Publication {
    Publication::new(health_topic(client_id), HEALTH_DOWN)
        .qos(Qos::AtLeastOnce)
        .retain(true)
}

/// Result of one inbound message across all routes.
#[derive(Debug, Default)]
pub struct MessageReport {
    /// Routes whose topics matched.
    pub matched: usize,
    /// Routes whose output was sent (or would be, in dry-run).
    pub dispatched: usize,
    /// Per-route failures, in evaluation order.
    pub failures: Vec<(String, MapperError)>,
}

impl MessageReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Service settings derived from the configuration.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub client_id: String,
    pub workers: usize,
    pub queue_capacity: usize,
    pub stop_on_error: bool,
    pub registration_listener: bool,
    pub token_response_topic: Option<String>,
    pub stats_interval: Option<Duration>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&MapperConfig::default())
    }
}

impl ServiceSettings {
    pub fn from_config(config: &MapperConfig) -> Self {
        Self {
            name: config.name.clone(),
            client_id: config.broker.client_id.clone(),
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            stop_on_error: config.stop_on_error,
            registration_listener: config.registration_listener,
            token_response_topic: config
                .api
                .is_configured()
                .then(|| config.api.token_response_topic.clone()),
            stats_interval: (config.stats_interval_secs > 0)
                .then(|| Duration::from_secs(config.stats_interval_secs)),
        }
    }
}

struct Shared {
    pipelines: Vec<Arc<StreamPipeline>>,
    dispatcher: Dispatcher,
    entities: Arc<EntityStore>,
    api: Option<Arc<ApiClient>>,
    settings: ServiceSettings,
}

impl Shared {
    async fn handle_inbound(&self, message: InboundMessage) {
        if self.settings.registration_listener
            && topic::matches(REGISTRATION_FILTER, &message.topic)
        {
            self.register_entity(&message);
        }
        if let (Some(token_topic), Some(api)) = (&self.settings.token_response_topic, &self.api) {
            if message.topic == *token_topic {
                match parse_token_response(&message.payload) {
                    Some(token) => api.set_token(token),
                    None => tracing::debug!("Ignoring message on {}", token_topic),
                }
            }
        }

        let report = self.handle_message(&message.topic, &message.payload).await;
        for (route, error) in &report.failures {
            if error.is_recursion_limit() {
                tracing::warn!("Route '{}' stopped a message chain: {}", route, error);
            } else {
                tracing::error!("Route '{}' failed: {}", route, error);
            }
        }
    }

    async fn handle_message(&self, topic: &str, payload: &str) -> MessageReport {
        let mut report = MessageReport::default();
        let variables = self.entities.variables();

        for pipeline in self.pipelines.iter().filter(|p| p.matches_topic(topic)) {
            report.matched += 1;
            let route = pipeline.route();
            tracing::debug!("Route '{}' matched topic {}", route.name, topic);

            let result = match pipeline.process(topic, payload, &variables) {
                Ok(Some(output)) => self.dispatcher.dispatch(route, &output).await.map_err(|e| {
                    route.record_error();
                    e
                }),
                Ok(None) => Ok(DispatchOutcome::Skipped),
                Err(e) => Err(e),
            };

            match result {
                Ok(DispatchOutcome::Skipped | DispatchOutcome::NoTarget) => {}
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    report.failures.push((route.name.clone(), e));
                    if self.settings.stop_on_error {
                        break;
                    }
                }
            }
        }
        report
    }

    fn register_entity(&self, message: &InboundMessage) {
        let key = key_from_topic(&message.topic);
        if message.payload.trim().is_empty() {
            if self.entities.remove(&key).is_some() {
                tracing::info!("Entity '{}' removed", key);
            }
            return;
        }
        match Entity::from_slice(message.payload.as_bytes()) {
            Ok(entity) => {
                if let Err(e) = self.entities.set(&key, entity) {
                    tracing::warn!("Could not store entity '{}': {}", key, e);
                }
            }
            Err(e) => tracing::warn!("Invalid registration message on {}: {}", message.topic, e),
        }
    }
}

/// Handle to a running service.
pub struct ServiceHandle {
    running: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    shared: Arc<Shared>,
}

impl ServiceHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Per-route statistics.
    pub fn route_stats(&self) -> Vec<RouteStatsSnapshot> {
        self.shared
            .pipelines
            .iter()
            .map(|p| p.route().stats.snapshot())
            .collect()
    }

    /// Stop accepting messages, wait for in-flight work and report the
    /// service as down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!("Service task failed: {}", e);
        }
    }
}

/// Mapper service.
pub struct Service {
    shared: Arc<Shared>,
    broker: Arc<dyn Broker>,
    running: Arc<AtomicBool>,
    start_time: Option<Instant>,
}

impl Service {
    pub fn new(
        settings: ServiceSettings,
        pipelines: Vec<Arc<StreamPipeline>>,
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        api: Option<Arc<ApiClient>>,
        entities: Arc<EntityStore>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                pipelines,
                dispatcher,
                entities,
                api,
                settings,
            }),
            broker,
            running: Arc::new(AtomicBool::new(false)),
            start_time: None,
        }
    }

    pub fn entities(&self) -> &Arc<EntityStore> {
        &self.shared.entities
    }

    pub fn pipelines(&self) -> &[Arc<StreamPipeline>] {
        &self.shared.pipelines
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Evaluate one message against all routes and dispatch the results.
    pub async fn handle_message(&self, topic: &str, payload: &str) -> MessageReport {
        self.shared.handle_message(topic, payload).await
    }

    /// Topic filters the service subscribes to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut filters = Vec::new();
        for pipeline in &self.shared.pipelines {
            let route = pipeline.route();
            if route.skip {
                continue;
            }
            for filter in &route.topics {
                if seen.insert(filter.clone()) {
                    filters.push(filter.clone());
                } else {
                    tracing::info!(
                        "Route '{}' shares topic {} with another route",
                        route.name,
                        filter
                    );
                }
            }
        }

        let settings = &self.shared.settings;
        let extra = settings
            .registration_listener
            .then(|| REGISTRATION_FILTER.to_string())
            .into_iter()
            .chain(settings.token_response_topic.clone());
        for filter in extra {
            if seen.insert(filter.clone()) {
                filters.push(filter);
            }
        }
        filters
    }

    /// Announce the service, subscribe and start processing `inbound`.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) -> Result<ServiceHandle, MapperError> {
        if self.running.load(Ordering::Relaxed) {
            return Err(MapperError::AlreadyRunning);
        }

        let settings = self.shared.settings.clone();
        self.broker
            .publish(
                Publication::new(
                    service_topic(&settings.client_id),
                    r#"{"@type":"service","@parent":"device/main//"}"#,
                )
                .qos(Qos::AtLeastOnce)
                .retain(true),
            )
            .await?;
        self.broker
            .publish(
                Publication::new(health_topic(&settings.client_id), HEALTH_UP)
                    .qos(Qos::AtLeastOnce)
                    .retain(true),
            )
            .await?;

        for pipeline in &self.shared.pipelines {
            let route = pipeline.route();
            if route.skip {
                tracing::info!("Ignoring route marked as skip: '{}'", route.name);
            } else {
                tracing::info!("Registering route '{}' on {:?}", route.name, route.topics);
            }
        }
        self.broker
            .subscribe(&self.subscriptions(), Qos::AtLeastOnce)
            .await?;

        self.running.store(true, Ordering::Relaxed);
        self.start_time = Some(Instant::now());
        tracing::info!(
            "Service '{}' started with {} routes",
            settings.name,
            self.shared.pipelines.len()
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let broker = self.broker.clone();
        let running = self.running.clone();

        let task = tokio::spawn(async move {
            let workers = Arc::new(Semaphore::new(settings.workers));
            let mut stats_timer = settings.stats_interval.map(tokio::time::interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick(&mut stats_timer) => log_stats(&shared),
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        let Ok(permit) = workers.clone().acquire_owned().await else { break };
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            shared.handle_inbound(message).await;
                            drop(permit);
                        });
                    }
                }
            }

            inbound.close();
            // Waits for in-flight messages.
            let _ = workers.acquire_many(settings.workers as u32).await;
            running.store(false, Ordering::Relaxed);

            log_stats(&shared);
            let down = Publication::new(health_topic(&settings.client_id), HEALTH_DOWN)
                .qos(Qos::AtLeastOnce)
                .retain(true);
            if let Err(e) = broker.publish(down).await {
                tracing::warn!("Could not publish health status: {}", e);
            }
            tracing::info!("Service '{}' stopped", settings.name);
        });

        Ok(ServiceHandle {
            running: self.running.clone(),
            shutdown: shutdown_tx,
            task,
            shared: self.shared.clone(),
        })
    }
}

async fn tick(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn log_stats(shared: &Shared) {
    for pipeline in &shared.pipelines {
        let s = pipeline.route().stats.snapshot();
        tracing::info!(
            "Route '{}': {} processed, {} dispatched, {} skipped, {} errors ({:.2} msg/s)",
            s.name,
            s.messages_processed,
            s.messages_dispatched,
            s.messages_skipped,
            s.errors,
            s.messages_per_second()
        );
    }
}
