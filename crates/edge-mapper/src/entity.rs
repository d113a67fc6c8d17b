// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity store.
//!
//! Registered devices and services, keyed by an opaque identity (usually the
//! entity topic id, e.g. `te/device/main`). Templates receive the whole store
//! as their `variables` document. The serialized form is rebuilt on every
//! mutation while the write lock is held.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Entity store errors.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("entity key is empty")]
    EmptyKey,

    #[error("invalid entity document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("{} invalid entities: {}", .0.len(), format_failures(.0))]
    Invalid(Vec<(String, String)>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(key, error)| format!("{}: {}", key, error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Entity content item (measurement, property, command ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityContent {
    #[serde(rename = "@id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Value>,
}

/// A registered device or service descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "@id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    #[serde(rename = "@parent", default, skip_serializing_if = "String::is_empty")]
    pub parent: String,

    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub entity_type: String,

    #[serde(rename = "displayName", default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contents: Vec<EntityContent>,

    /// Fields not covered above, kept verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity {
    /// Parse an entity from a JSON payload.
    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug)]
struct Inner {
    entities: BTreeMap<String, Entity>,
    serialized: Arc<str>,
    variables: Arc<Value>,
}

impl Inner {
    fn refresh(&mut self) {
        let variables = match serde_json::to_value(&self.entities) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Could not serialize entity store: {}", e);
                Value::Object(Map::new())
            }
        };
        self.serialized = Arc::from(variables.to_string());
        self.variables = Arc::new(variables);
    }
}

/// Concurrent entity registry.
#[derive(Debug)]
pub struct EntityStore {
    inner: RwLock<Inner>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entities: BTreeMap::new(),
                serialized: Arc::from("{}"),
                variables: Arc::new(Value::Object(Map::new())),
            }),
        }
    }

    /// Get a copy of an entity.
    pub fn get(&self, key: &str) -> Option<Entity> {
        self.inner.read().entities.get(key).cloned()
    }

    /// Register or replace an entity.
    pub fn set(&self, key: &str, entity: Entity) -> Result<(), EntityError> {
        if key.is_empty() {
            return Err(EntityError::EmptyKey);
        }
        let mut inner = self.inner.write();
        inner.entities.insert(key.to_string(), entity);
        inner.refresh();
        Ok(())
    }

    /// Remove an entity.
    pub fn remove(&self, key: &str) -> Option<Entity> {
        let mut inner = self.inner.write();
        let removed = inner.entities.remove(key);
        if removed.is_some() {
            inner.refresh();
        }
        removed
    }

    /// Load a `{key: entity}` document.
    ///
    /// Entries are parsed one by one; valid entries are stored even when
    /// others are malformed. With `delete_existing` the store is replaced by
    /// the document's valid entries. Failures are returned as one combined
    /// error unless `ignore_errors` is set.
    pub fn set_from_json(
        &self,
        data: &[u8],
        delete_existing: bool,
        ignore_errors: bool,
    ) -> Result<(), EntityError> {
        let document: BTreeMap<String, Value> = serde_json::from_slice(data)?;

        let mut parsed = Vec::with_capacity(document.len());
        let mut failures = Vec::new();
        for (key, value) in document {
            if key.is_empty() {
                failures.push((key, EntityError::EmptyKey.to_string()));
                continue;
            }
            match serde_json::from_value::<Entity>(value) {
                Ok(entity) => parsed.push((key, entity)),
                Err(e) => failures.push((key, e.to_string())),
            }
        }

        {
            let mut inner = self.inner.write();
            if delete_existing {
                inner.entities.clear();
            }
            inner.entities.extend(parsed);
            inner.refresh();
        }

        for (key, error) in &failures {
            tracing::warn!("Ignoring invalid entity '{}': {}", key, error);
        }
        if failures.is_empty() || ignore_errors {
            Ok(())
        } else {
            Err(EntityError::Invalid(failures))
        }
    }

    /// Load a `{key: entity}` file.
    pub fn load_file<P: AsRef<Path>>(
        &self,
        path: P,
        delete_existing: bool,
        ignore_errors: bool,
    ) -> Result<(), EntityError> {
        let data = std::fs::read(path)?;
        self.set_from_json(&data, delete_existing, ignore_errors)
    }

    /// Cached JSON form of the whole store.
    pub fn serialized(&self) -> Arc<str> {
        self.inner.read().serialized.clone()
    }

    /// Cached structured form of the whole store.
    pub fn variables(&self) -> Arc<Value> {
        self.inner.read().variables.clone()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.read().entities.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entities.is_empty()
    }
}

/// Entity key for a registration topic: the non-empty levels joined by `/`.
pub fn key_from_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|level| !level.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
