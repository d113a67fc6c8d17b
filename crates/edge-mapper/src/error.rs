// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mapper error kinds.

use thiserror::Error;

/// Errors surfaced by the pipeline, the dispatcher and the service.
#[derive(Debug, Error)]
pub enum MapperError {
    #[error("Recursion limit exceeded: lvl {lvl} > max depth {max_depth}")]
    RecursionLimitExceeded { lvl: u64, max_depth: u64 },

    #[error("Context stripped on self-matching route '{route}' (topic {topic})")]
    UnsafeContextStrip { route: String, topic: String },

    #[error("Template exception in route '{route}'")]
    TemplateException { route: String },

    #[error("Invalid API request: {0}")]
    InvalidApiRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::broker::TransportError),

    #[error("API error: {0}")]
    Api(#[from] crate::api::ApiError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Mapper not running")]
    NotRunning,

    #[error("Mapper already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MapperError {
    /// Whether this error stops a recursive chain (as opposed to a broken route).
    pub fn is_recursion_limit(&self) -> bool {
        matches!(
            self,
            Self::RecursionLimitExceeded { .. } | Self::UnsafeContextStrip { .. }
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, MapperError>;
