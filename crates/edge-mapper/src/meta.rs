// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Meta bag passed read-only to every template.
//!
//! Built once at startup from, in increasing precedence:
//! configured defaults, the default device id, the host name, environment
//! variables with the route prefix (under `env`), and the thin-edge settings.
//! Settings come from `tedge config list` when the binary is available,
//! otherwise from `TEDGE_*` environment variables.

use crate::config::MetaConfig;
use serde_json::{Map, Value};
use std::process::Command;

/// Incremental meta builder.
#[derive(Debug, Default)]
pub struct MetaBuilder {
    values: Map<String, Value>,
    env: Map<String, Value>,
}

impl MetaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add default values; keys are normalized.
    pub fn defaults<'a, I>(mut self, defaults: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in defaults {
            self.insert(&normalize_key(key), value);
        }
        self
    }

    pub fn device_id(mut self, device_id: &str) -> Self {
        self.values
            .insert("device_id".into(), Value::String(device_id.to_string()));
        self
    }

    /// Host name, empty when unknown.
    pub fn hostname(mut self, hostname: Option<String>) -> Self {
        self.values
            .insert("hostname".into(), Value::String(hostname.unwrap_or_default()));
        self
    }

    /// Keep environment variables starting with `prefix`, unchanged, under `env`.
    pub fn env<I>(mut self, vars: I, prefix: &str) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key.starts_with(prefix) && !value.is_empty() {
                self.env.insert(key, Value::String(value));
            }
        }
        self
    }

    /// Parse `key=value` lines as printed by `tedge config list`.
    pub fn tedge_config_list(mut self, output: &str) -> Self {
        for line in output.lines() {
            if let Some((key, value)) = line.split_once('=') {
                self.insert(&key.trim().replace('.', "_"), value.trim());
            }
        }
        self
    }

    /// Use `TEDGE_*` environment variables as thin-edge settings.
    pub fn tedge_env<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix("TEDGE_") {
                self.insert(&normalize_key(name), &value);
            }
        }
        self
    }

    pub fn build(mut self) -> Value {
        self.values.insert("env".into(), Value::Object(self.env));
        Value::Object(self.values)
    }

    fn insert(&mut self, key: &str, value: &str) {
        if !key.is_empty() && !value.is_empty() {
            self.values
                .insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.replace('.', "_").to_lowercase()
}

/// Collect the meta bag from the running system.
pub fn collect(config: &MetaConfig) -> Value {
    let hostname = match hostname::get() {
        Ok(name) => Some(name.to_string_lossy().into_owned()),
        Err(e) => {
            tracing::warn!("Could not get hostname: {}", e);
            None
        }
    };

    let builder = MetaBuilder::new()
        .defaults(&config.defaults)
        .device_id(&config.device_id)
        .hostname(hostname)
        .env(std::env::vars(), &config.env_prefix);

    match run_tedge(&config.tedge_binary, &["config", "list"]) {
        Some(output) => builder.tedge_config_list(&output),
        None => builder.tedge_env(std::env::vars()),
    }
    .build()
}

/// Read one setting with `tedge config get`.
pub fn tedge_config_get(binary: &str, key: &str) -> Option<String> {
    run_tedge(binary, &["config", "get", key])
        .map(|output| output.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn run_tedge(binary: &str, args: &[&str]) -> Option<String> {
    match Command::new(binary).args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            tracing::warn!(
                "'{} {}' failed: {}",
                binary,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            None
        }
        Err(e) => {
            tracing::debug!("Could not run '{}': {}", binary, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_prefix_filter() {
        let meta = MetaBuilder::new()
            .env(
                vars(&[("ROUTE_A", "1"), ("ROUTE_EMPTY", ""), ("SECRET", "x")]),
                "ROUTE_",
            )
            .build();
        assert_eq!(meta["env"], json!({"ROUTE_A": "1"}));
    }

    #[test]
    fn test_tedge_env_normalized() {
        let meta = MetaBuilder::new()
            .tedge_env(vars(&[("TEDGE_C8Y_URL", "example.com"), ("OTHER", "x")]))
            .build();
        assert_eq!(meta["c8y_url"], json!("example.com"));
        assert!(meta.get("other").is_none());
    }

    #[test]
    fn test_tedge_config_list() {
        let meta = MetaBuilder::new()
            .tedge_config_list("device.id=dev01\nc8y.url=example.com\nempty.value=\nnoise\n")
            .build();
        assert_eq!(meta["device_id"], json!("dev01"));
        assert_eq!(meta["c8y_url"], json!("example.com"));
        assert!(meta.get("empty_value").is_none());
    }

    #[test]
    fn test_precedence() {
        let mut defaults = BTreeMap::new();
        defaults.insert("Device.Type".to_string(), "gateway".to_string());
        defaults.insert("device.id".to_string(), "from-defaults".to_string());

        let meta = MetaBuilder::new()
            .defaults(&defaults)
            .device_id("fallback")
            .hostname(None)
            .tedge_config_list("device.id=real")
            .build();
        assert_eq!(meta["device_type"], json!("gateway"));
        assert_eq!(meta["device_id"], json!("real"));
        assert_eq!(meta["hostname"], json!(""));
        assert_eq!(meta["env"], json!({}));
    }

    #[test]
    fn test_collect_without_tedge_binary() {
        let config = MetaConfig {
            device_id: "sim01".into(),
            tedge_binary: "/nonexistent/tedge-binary".into(),
            ..Default::default()
        };
        let meta = collect(&config);
        assert!(meta["hostname"].is_string());
        assert!(meta["env"].is_object());
        assert!(tedge_config_get("/nonexistent/tedge-binary", "c8y.http").is_none());
    }
}
