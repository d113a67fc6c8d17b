// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Edge Message Mapper
//!
//! Template-driven MQTT message routing for edge devices.
//!
//! # Features
//!
//! - **Routes**: YAML files binding topic filters to a transformation template
//! - **Templates**: Rhai scripts producing MQTT messages, REST calls or both
//! - **Route Chains**: Outputs may feed other routes; a routing context
//!   carried in the payload bounds the chain depth
//! - **Preprocessing**: CSV payloads mapped to JSON before evaluation
//! - **Entities**: Registrations tracked and exposed to templates
//! - **Offline Check**: Simulate a message through the routes without a broker
//!
//! # Quick Start
//!
//! ```bash
//! # Serve routes from ./routes against a local broker
//! edge-mapper --dir routes --host localhost
//!
//! # Check what a message would produce
//! edge-mapper routes check -t 'c8y/s/ds' -m '524,device01,http://example.com,type'
//!
//! # Using config file
//! edge-mapper --config mapper.toml
//! ```
//!
//! # Route File
//!
//! ```yaml
//! routes:
//!   - name: temperature
//!     topics:
//!       - "sensors/+/temperature"
//!     template:
//!       type: rhai
//!       value: |
//!         #{ topic: "te/device/main///m/environment", message: #{ temperature: message.value } }
//! ```

pub mod api;
pub mod broker;
pub mod check;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod entity;
pub mod error;
pub mod jsonpath;
pub mod message;
pub mod meta;
pub mod pipeline;
pub mod preprocessor;
pub mod route;
pub mod script;
pub mod service;
pub mod template;
pub mod topic;

pub use api::{ApiClient, ApiClientConfig, ApiError, BrokerTokenRenewer, TokenRenewer};
pub use broker::{Broker, InboundMessage, MemoryBroker, MqttBroker, MqttSettings, TransportError};
pub use check::{CheckStep, Checker};
pub use config::{ConfigError, MapperConfig};
pub use context::{RecursionGuard, RoutingContext};
pub use dispatch::{DispatchOutcome, Dispatcher};
pub use entity::{Entity, EntityStore};
pub use error::MapperError;
pub use message::{ApiRequest, OutputMessage, Publication, Qos, UpdateMessage};
pub use pipeline::{build_pipelines, StreamPipeline};
pub use preprocessor::Preprocessor;
pub use route::{load_routes, Route, RouteStats, RouteStatsSnapshot};
pub use service::{MessageReport, Service, ServiceHandle, ServiceSettings};
pub use template::{Evaluator, TemplateEngine, TemplateError, TemplateSpec};
