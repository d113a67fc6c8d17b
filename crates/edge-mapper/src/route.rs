// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route definition, route files and statistics.
//!
//! Route files are YAML:
//!
//! ```yaml
//! disable: false
//! routes:
//!   - name: temperature to cloud
//!     topics: ["te/device/main///m/+"]
//!     template:
//!       type: rhai
//!       value: |
//!         #{ topic: "c8y/measurement/measurements/create", message: message }
//!   - name: legacy csv
//!     topics: ["legacy/software"]
//!     preprocessor:
//!       type: csv
//!       fields: [id, serial, software.*.name]
//!     template:
//!       path: templates/software.rhai
//! ```

use crate::preprocessor::{Preprocessor, PreprocessorSpec};
use crate::template::TemplateSpec;
use crate::topic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use walkdir::WalkDir;

/// Route loading errors.
#[derive(Debug, Error)]
pub enum RouteLoadError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("route '{0}' has no topics")]
    NoTopics(String),

    #[error("route '{route}' uses unsupported preprocessor '{kind}'")]
    UnsupportedPreprocessor { route: String, kind: String },
}

/// Route as declared in a route file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub topics: Vec<String>,

    /// Loaded but never subscribed or matched.
    #[serde(default)]
    pub skip: bool,

    /// Dropped at load.
    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub template: TemplateSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocessor: Option<PreprocessorSpec>,
}

/// Contents of a route file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteFile {
    /// A disabled file contributes no routes.
    #[serde(default)]
    pub disable: bool,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,
}

impl RouteFile {
    /// Parse a route file from YAML text.
    pub fn parse(content: &str, path: &Path) -> Result<Self, RouteLoadError> {
        serde_yaml::from_str(content).map_err(|source| RouteLoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read and parse a route file.
    pub fn from_file(path: &Path) -> Result<Self, RouteLoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| RouteLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Build the enabled routes of this file. Templates given by `path` are
    /// resolved relative to `base_dir`.
    pub fn into_routes(self, base_dir: Option<&Path>) -> Vec<Route> {
        if self.disable {
            return Vec::new();
        }
        self.routes
            .into_iter()
            .filter(|definition| {
                if definition.disable {
                    tracing::debug!("Route '{}' is disabled", definition.name);
                }
                !definition.disable
            })
            .filter_map(|definition| {
                let name = definition.name.clone();
                match Route::from_definition(definition, base_dir) {
                    Ok(route) => Some(route),
                    Err(e) => {
                        tracing::warn!("Failed to load route '{}', it will be ignored: {}", name, e);
                        None
                    }
                }
            })
            .collect()
    }
}

/// A named transformation rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,

    /// Subscription filters, in declaration order.
    pub topics: Vec<String>,

    /// Excluded from subscription and matching.
    pub skip: bool,

    pub template: TemplateSpec,

    pub preprocessor: Option<Preprocessor>,

    /// Route file this route came from.
    pub source: Option<PathBuf>,

    pub stats: Arc<RouteStats>,
}

impl Route {
    /// Create a route with an inline template.
    pub fn new(name: impl Into<String>, topics: Vec<String>, template: TemplateSpec) -> Self {
        let name = name.into();
        Self {
            stats: Arc::new(RouteStats::new(&name)),
            name,
            topics,
            skip: false,
            template,
            preprocessor: None,
            source: None,
        }
    }

    /// Attach a preprocessor.
    pub fn preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Set the skip flag.
    pub fn skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Create a route from its file definition.
    pub fn from_definition(
        definition: RouteDefinition,
        base_dir: Option<&Path>,
    ) -> Result<Self, RouteLoadError> {
        if definition.topics.is_empty() {
            return Err(RouteLoadError::NoTopics(definition.name));
        }

        let preprocessor = match &definition.preprocessor {
            Some(spec) => Some(Preprocessor::from_spec(spec).ok_or_else(|| {
                RouteLoadError::UnsupportedPreprocessor {
                    route: definition.name.clone(),
                    kind: spec.kind.clone(),
                }
            })?),
            None => None,
        };

        let mut template = definition.template;
        if template.value.is_empty() {
            if let Some(path) = &template.path {
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                template.value = std::fs::read_to_string(&path)
                    .map_err(|source| RouteLoadError::Io { path, source })?;
            }
        }

        let mut route = Route::new(definition.name, definition.topics, template).skip(definition.skip);
        route.preprocessor = preprocessor;
        Ok(route)
    }

    /// Check if this route handles a given topic.
    pub fn matches_topic(&self, topic: &str) -> bool {
        !self.skip && topic::matches_any(&self.topics, topic)
    }

    /// Record a processed message.
    pub fn record_message(&self) {
        self.stats.messages_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched output.
    pub fn record_dispatched(&self) {
        self.stats.messages_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped output.
    pub fn record_skipped(&self) {
        self.stats.messages_skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error.
    pub fn record_error(&self) {
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Load every enabled route from the given directories.
///
/// Directories are walked recursively in file name order; only `.yaml` and
/// `.yml` files are read. Unreadable files are logged and skipped.
pub fn load_routes<P: AsRef<Path>>(dirs: &[P]) -> Vec<Route> {
    let mut routes = Vec::new();

    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.exists() {
            tracing::warn!("Route directory {} does not exist", dir.display());
            continue;
        }

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Could not scan {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_route_file(entry.path()) {
                continue;
            }

            let path = entry.path();
            match RouteFile::from_file(path) {
                Ok(file) if file.disable => {
                    tracing::info!("Route file {} is disabled", path.display());
                }
                Ok(file) => {
                    let loaded = file.into_routes(path.parent());
                    tracing::debug!("Loaded {} routes from {}", loaded.len(), path.display());
                    routes.extend(loaded.into_iter().map(|mut route| {
                        route.source = Some(path.to_path_buf());
                        route
                    }));
                }
                Err(e) => tracing::warn!("Skipping route file: {}", e),
            }
        }
    }

    routes
}

fn is_route_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Statistics for a route.
#[derive(Debug)]
pub struct RouteStats {
    /// Route name.
    pub name: String,

    /// Messages evaluated.
    pub messages_processed: AtomicU64,

    /// Outputs handed to the dispatcher.
    pub messages_dispatched: AtomicU64,

    /// Outputs skipped or empty.
    pub messages_skipped: AtomicU64,

    /// Errors encountered.
    pub errors: AtomicU64,

    /// Route creation time.
    pub created: Instant,
}

impl RouteStats {
    /// Create new stats.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages_processed: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            messages_skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> RouteStatsSnapshot {
        RouteStatsSnapshot {
            name: self.name.clone(),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_skipped: self.messages_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

/// Snapshot of route statistics.
#[derive(Debug, Clone)]
pub struct RouteStatsSnapshot {
    pub name: String,
    pub messages_processed: u64,
    pub messages_dispatched: u64,
    pub messages_skipped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl RouteStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.messages_processed as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const ROUTES: &str = r#"
routes:
  - name: first
    topics: ["in/+"]
    template:
      type: rhai
      value: '#{ topic: "out" }'
  - name: skipped
    topics: ["in/#"]
    skip: true
    template:
      value: '#{}'
  - name: disabled
    disable: true
    topics: ["x"]
  - name: from file
    topics: ["csv"]
    preprocessor:
      type: csv
      fields: [a, b]
    template:
      path: templates/out.rhai
"#;

    #[test]
    fn test_route_matches_topic() {
        let route = Route::new("r", vec!["a/+".into(), "b".into()], TemplateSpec::rhai("#{}"));
        assert!(route.matches_topic("a/x"));
        assert!(route.matches_topic("b"));
        assert!(!route.matches_topic("c"));

        let skipped = route.clone().skip(true);
        assert!(!skipped.matches_topic("b"));
    }

    #[test]
    fn test_load_routes_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("templates")).unwrap();
        fs::write(dir.path().join("templates/out.rhai"), "#{ topic: \"csv/out\" }").unwrap();
        fs::write(dir.path().join("a.yaml"), ROUTES).unwrap();
        fs::write(dir.path().join("b.yml"), "disable: true\nroutes:\n  - name: off\n    topics: [z]\n").unwrap();
        fs::write(dir.path().join("c.yaml"), "routes: [not: valid: yaml").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let routes = load_routes(&[dir.path()]);
        let names: Vec<_> = routes.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["first", "skipped", "from file"]);

        assert!(routes[1].skip);
        assert_eq!(routes[2].template.value, "#{ topic: \"csv/out\" }");
        assert_eq!(routes[2].preprocessor.as_ref().unwrap().fields(), &["a", "b"]);
        assert_eq!(routes[0].source.as_deref(), Some(dir.path().join("a.yaml").as_path()));
    }

    #[test]
    fn test_missing_dir_is_ignored() {
        let routes = load_routes(&[Path::new("/nonexistent/routes")]);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_route_definition_errors() {
        let definition = RouteDefinition {
            name: "no topics".into(),
            ..Default::default()
        };
        assert!(matches!(
            Route::from_definition(definition, None),
            Err(RouteLoadError::NoTopics(_))
        ));

        let definition = RouteDefinition {
            name: "bad pp".into(),
            topics: vec!["t".into()],
            preprocessor: Some(PreprocessorSpec {
                kind: "xml".into(),
                fields: vec![],
            }),
            ..Default::default()
        };
        assert!(matches!(
            Route::from_definition(definition, None),
            Err(RouteLoadError::UnsupportedPreprocessor { .. })
        ));
    }

    #[test]
    fn test_route_stats() {
        let route = Route::new("r", vec!["a".into()], TemplateSpec::default());

        route.record_message();
        route.record_message();
        route.record_dispatched();
        route.record_skipped();
        route.record_error();

        let snapshot = route.stats.snapshot();
        assert_eq!(snapshot.name, "r");
        assert_eq!(snapshot.messages_processed, 2);
        assert_eq!(snapshot.messages_dispatched, 1);
        assert_eq!(snapshot.messages_skipped, 1);
        assert_eq!(snapshot.errors, 1);
    }
}
