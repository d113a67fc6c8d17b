// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Legacy delimited payload decoding.
//!
//! A route may declare a preprocessor that turns one CSV row into a JSON
//! object before the template runs:
//!
//! ```yaml
//! preprocessor:
//!   type: csv
//!   fields: [id, serial, software.*.name, software.*.version, software.*.url]
//! ```
//!
//! Fields before the first `*` name are assigned positionally. From the first
//! `*` name onwards the fields form a repeating group; the `*` is replaced by
//! the 0-based repetition index. The raw input is kept under `payload`.

use crate::jsonpath;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key holding the undecoded input.
pub const RAW_PAYLOAD_KEY: &str = "payload";

/// Preprocessor declaration as found in a route file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreprocessorSpec {
    /// Decoder type (only `csv` is supported).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,

    /// Declared field names.
    #[serde(default)]
    pub fields: Vec<String>,
}

fn default_kind() -> String {
    "csv".to_string()
}

/// A prepared CSV preprocessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preprocessor {
    fields: Vec<String>,
    fixed_fields: Vec<String>,
    variable_fields: Vec<String>,
}

impl Preprocessor {
    /// Split the declared fields into the fixed prefix and the repeating group.
    pub fn new(fields: Vec<String>) -> Self {
        let split = fields
            .iter()
            .position(|f| f.contains('*'))
            .unwrap_or(fields.len());
        let fixed_fields = fields[..split].to_vec();
        let variable_fields = fields[split..].to_vec();
        Self {
            fields,
            fixed_fields,
            variable_fields,
        }
    }

    /// Build from a route file declaration. Returns `None` for unknown types.
    pub fn from_spec(spec: &PreprocessorSpec) -> Option<Self> {
        if spec.kind.eq_ignore_ascii_case("csv") {
            Some(Self::new(spec.fields.clone()))
        } else {
            None
        }
    }

    /// Declared fields in their original order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Fields assigned positionally.
    pub fn fixed_fields(&self) -> &[String] {
        &self.fixed_fields
    }

    /// Repeating group.
    pub fn variable_fields(&self) -> &[String] {
        &self.variable_fields
    }

    /// Decode a single CSV row. Never fails: undecodable input gives `{}`,
    /// a short row gives fewer fields.
    pub fn execute(&self, raw: &str) -> Value {
        let mut output = Value::Object(Map::new());

        let Some(columns) = parse_row(raw) else {
            tracing::debug!("Preprocessor ignored undecodable payload");
            return output;
        };

        for (column, name) in columns.iter().zip(self.fixed_fields.iter()) {
            self.assign(&mut output, name, column);
        }

        let chunk = self.variable_fields.len();
        if chunk > 0 {
            for (j, column) in columns.iter().skip(self.fixed_fields.len()).enumerate() {
                let name =
                    self.variable_fields[j % chunk].replacen('*', &(j / chunk).to_string(), 1);
                self.assign(&mut output, &name, column);
            }
        }

        if let Value::Object(map) = &mut output {
            map.insert(RAW_PAYLOAD_KEY.to_string(), Value::String(raw.to_string()));
        }
        output
    }

    fn assign(&self, output: &mut Value, name: &str, column: &str) {
        if name.is_empty() || name == "-" {
            return;
        }
        if let Err(e) = jsonpath::set(output, name, Value::String(column.to_string())) {
            tracing::debug!("Preprocessor skipped field '{}': {}", name, e);
        }
    }
}

fn parse_row(raw: &str) -> Option<Vec<String>> {
    if raw.trim().is_empty() || !is_well_quoted(raw) {
        return None;
    }
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(raw.as_bytes());

    let record = reader.records().next()?.ok()?;
    Some(record.iter().map(str::to_string).collect())
}

/// Strict quoting check on the first record. A quote may only open a field,
/// close it before a delimiter or line end, or be doubled inside it.
fn is_well_quoted(raw: &str) -> bool {
    let mut chars = raw.chars().peekable();
    loop {
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    None => return false,
                    Some('"') => match chars.peek() {
                        Some('"') => {
                            chars.next();
                        }
                        Some(',') => {
                            chars.next();
                            break;
                        }
                        None | Some('\n') | Some('\r') => return true,
                        Some(_) => return false,
                    },
                    Some(_) => {}
                }
            }
        } else {
            loop {
                match chars.next() {
                    None | Some('\n') => return true,
                    Some(',') => break,
                    Some('"') => return false,
                    Some(_) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn software_preprocessor() -> Preprocessor {
        Preprocessor::new(
            ["id", "serial", "software.*.name", "software.*.version", "software.*.url"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    #[test]
    fn test_field_split() {
        let pp = software_preprocessor();
        assert_eq!(pp.fixed_fields(), &["id", "serial"]);
        assert_eq!(pp.variable_fields().len(), 3);
        let rebuilt: Vec<_> = pp
            .fixed_fields()
            .iter()
            .chain(pp.variable_fields())
            .cloned()
            .collect();
        assert_eq!(rebuilt, pp.fields());
    }

    #[test]
    fn test_repeating_group() {
        let raw = r#"510,mydevice,"hello world 1",1.0.0,http://hello.world.com,"hello world 2",2.0.0,http://hello.world2.com"#;
        let output = software_preprocessor().execute(raw);

        assert_eq!(output["id"], json!("510"));
        assert_eq!(output["serial"], json!("mydevice"));
        assert_eq!(
            output["software"],
            json!([
                {"name": "hello world 1", "version": "1.0.0", "url": "http://hello.world.com"},
                {"name": "hello world 2", "version": "2.0.0", "url": "http://hello.world2.com"}
            ])
        );
        assert_eq!(output[RAW_PAYLOAD_KEY], json!(raw));
    }

    #[test]
    fn test_skipped_names() {
        let pp = Preprocessor::new(vec!["id".into(), "-".into(), "".into(), "name".into()]);
        let output = pp.execute("1,2,3,4");
        assert_eq!(output, json!({"id": "1", "name": "4", "payload": "1,2,3,4"}));
    }

    #[test]
    fn test_short_row() {
        let output = software_preprocessor().execute("510");
        assert_eq!(output, json!({"id": "510", "payload": "510"}));

        let output = software_preprocessor().execute("510,dev,name-only");
        assert_eq!(output["software"], json!([{"name": "name-only"}]));
    }

    #[test]
    fn test_empty_input() {
        let output = software_preprocessor().execute("");
        assert_eq!(output, json!({}));
    }

    #[test]
    fn test_malformed_quoting_gives_empty_object() {
        let pp = Preprocessor::new(vec!["a".into(), "b".into()]);
        for raw in ["\"open", "a\"b,c", "x,\"y\"z", "x,\"y"] {
            assert_eq!(pp.execute(raw), json!({}), "{raw}");
        }
    }

    #[test]
    fn test_quoted_fields() {
        let pp = Preprocessor::new(vec!["a".into(), "b".into(), "c".into()]);
        let output = pp.execute(r#""say ""hi""","x,y","#);
        assert_eq!(output["a"], json!(r#"say "hi""#));
        assert_eq!(output["b"], json!("x,y"));
        assert_eq!(output["c"], json!(""));

        let output = pp.execute("\"multi\nline\",2\nignored,row");
        assert_eq!(output["a"], json!("multi\nline"));
        assert_eq!(output["b"], json!("2"));
        assert!(output.get("c").is_none());
    }

    #[test]
    fn test_conflicting_paths_are_skipped() {
        let pp = Preprocessor::new(vec!["a".into(), "a.b".into(), "c".into()]);
        let output = pp.execute("x,y,z");
        assert_eq!(output, json!({"a": "x", "c": "z", "payload": "x,y,z"}));
    }

    #[test]
    fn test_from_spec() {
        let spec = PreprocessorSpec {
            kind: "CSV".into(),
            fields: vec!["a".into()],
        };
        assert!(Preprocessor::from_spec(&spec).is_some());
        let spec = PreprocessorSpec {
            kind: "xml".into(),
            fields: vec![],
        };
        assert!(Preprocessor::from_spec(&spec).is_none());
    }
}
