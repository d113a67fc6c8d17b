// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dispatch of pipeline results to the broker and the REST API.
//!
//! Order for one result: non-skipped updates, then the primary output (REST
//! call if it carries `api`, broker publish otherwise), then the post-message
//! delay. Per-message delays are scheduled on separate tasks. Dry-run logs
//! what would happen and performs no side effect.

use crate::api::{ApiClient, ApiError};
use crate::broker::Broker;
use crate::error::MapperError;
use crate::message::{OutputMessage, Publication};
use crate::route::Route;
use std::sync::Arc;
use std::time::Duration;

/// Default delay after each dispatched message.
pub const DEFAULT_POST_MESSAGE_DELAY: Duration = Duration::from_secs(2);

/// What happened to the primary output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The output was marked `skip`.
    Skipped,
    /// The output has neither a topic nor an API request.
    NoTarget,
    /// Broker publish.
    Published { dry_run: bool },
    /// REST call.
    ApiRequest { dry_run: bool },
}

impl DispatchOutcome {
    /// Whether the primary output went (or would go) to the broker.
    pub fn is_publish(&self) -> bool {
        matches!(self, DispatchOutcome::Published { .. })
    }
}

/// Turns pipeline results into side effects.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    api: Option<Arc<ApiClient>>,
    dry_run: bool,
    post_message_delay: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("api", &self.api)
            .field("dry_run", &self.dry_run)
            .field("post_message_delay", &self.post_message_delay)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            api: None,
            dry_run: false,
            post_message_delay: DEFAULT_POST_MESSAGE_DELAY,
        }
    }

    pub fn api_client(mut self, api: Option<Arc<ApiClient>>) -> Self {
        self.api = api;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn post_message_delay(mut self, delay: Duration) -> Self {
        self.post_message_delay = delay;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Dispatch one pipeline result.
    pub async fn dispatch(
        &self,
        route: &Route,
        output: &OutputMessage,
    ) -> Result<DispatchOutcome, MapperError> {
        for update in output.updates.iter().filter(|u| !u.skip) {
            if update.topic.is_empty() {
                tracing::warn!("Route '{}' produced an update without topic", route.name);
                continue;
            }
            let publication = Publication::try_from(update)?;
            if self.dry_run {
                tracing::info!(
                    "[dry-run] Route '{}' update to {}: {}",
                    route.name,
                    publication.topic,
                    publication.payload
                );
                continue;
            }
            self.publish(publication, update.delay()).await?;
        }

        if output.skip {
            route.record_skipped();
            return Ok(DispatchOutcome::Skipped);
        }

        let outcome = if let Some(request) = &output.api {
            let method = request.validate()?;
            if self.dry_run {
                tracing::info!(
                    "[dry-run] Route '{}' API request: {} {}",
                    route.name,
                    method,
                    request.path
                );
            } else {
                let client = self.api.clone().ok_or(ApiError::NoHost)?;
                match output.delay() {
                    Some(delay) => {
                        let request = request.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            if let Err(e) = client.send(&request, method).await {
                                tracing::warn!("Delayed API request failed: {}", e);
                            }
                        });
                    }
                    None => {
                        client.send(request, method).await?;
                    }
                }
                tracing::info!("Route '{}' API request: {} {}", route.name, method, request.path);
            }
            DispatchOutcome::ApiRequest {
                dry_run: self.dry_run,
            }
        } else if output.topic.is_empty() {
            route.record_skipped();
            return Ok(DispatchOutcome::NoTarget);
        } else {
            let publication = output.to_publication()?;
            if self.dry_run {
                tracing::info!(
                    "[dry-run] Route '{}' publish to {}: {}",
                    route.name,
                    publication.topic,
                    publication.payload
                );
            } else {
                self.publish(publication, output.delay()).await?;
            }
            DispatchOutcome::Published {
                dry_run: self.dry_run,
            }
        };

        route.record_dispatched();
        if !self.dry_run && !self.post_message_delay.is_zero() {
            tokio::time::sleep(self.post_message_delay).await;
        }
        Ok(outcome)
    }

    async fn publish(
        &self,
        publication: Publication,
        delay: Option<Duration>,
    ) -> Result<(), MapperError> {
        match delay {
            Some(delay) => {
                let broker = self.broker.clone();
                tracing::debug!("Scheduling publish to {} in {:?}", publication.topic, delay);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let topic = publication.topic.clone();
                    if let Err(e) = broker.publish(publication).await {
                        tracing::warn!("Delayed publish to {} failed: {}", topic, e);
                    }
                });
            }
            None => {
                tracing::debug!("Publishing to {}", publication.topic);
                self.broker.publish(publication).await?;
            }
        }
        Ok(())
    }
}
