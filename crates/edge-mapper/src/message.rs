// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Template output model.

use crate::error::MapperError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "f64", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<f64> for Qos {
    fn from(value: f64) -> Self {
        if value == 1.0 {
            Qos::AtLeastOnce
        } else if value == 2.0 {
            Qos::ExactlyOnce
        } else {
            Qos::AtMostOnce
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Secondary message published before the primary output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(default)]
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    #[serde(default)]
    pub skip: bool,

    /// Delay in seconds before publishing.
    #[serde(default)]
    pub delay: f64,

    #[serde(default)]
    pub retain: bool,

    #[serde(default)]
    pub qos: Qos,
}

impl UpdateMessage {
    /// Payload as published: strings verbatim, anything else as JSON.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        payload_of(self.message.as_ref())
    }

    /// Scheduling delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        delay_of(self.delay)
    }
}

/// Allowed REST verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
    Put,
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::Get => "GET",
            ApiMethod::Post => "POST",
            ApiMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound REST request requested by a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Overrides the configured API host for this call. Credentials are not
    /// sent to overridden hosts.
    #[serde(default)]
    pub host: String,

    #[serde(default)]
    pub method: String,

    #[serde(default)]
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Validate method and path. The method is case-insensitive.
    pub fn validate(&self) -> Result<ApiMethod, MapperError> {
        if self.path.is_empty() {
            return Err(MapperError::InvalidApiRequest("path is empty".into()));
        }
        if self.method.is_empty() {
            return Err(MapperError::InvalidApiRequest("method is empty".into()));
        }
        match self.method.to_ascii_uppercase().as_str() {
            "GET" => Ok(ApiMethod::Get),
            "POST" => Ok(ApiMethod::Post),
            "PUT" => Ok(ApiMethod::Put),
            other => Err(MapperError::InvalidApiRequest(format!(
                "method '{}' is not one of GET, POST, PUT",
                other
            ))),
        }
    }

    /// Request body as sent: strings verbatim, anything else as JSON.
    pub fn body(&self) -> Result<Option<String>, serde_json::Error> {
        match &self.body {
            None | Some(Value::Null) => Ok(None),
            Some(body) => payload_of(Some(body)).map(Some),
        }
    }
}

/// Result of one template evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(default)]
    pub topic: String,

    /// Structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    /// Raw payload, published verbatim. Wins over `message`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,

    /// Delay in seconds before the primary output is dispatched.
    #[serde(default)]
    pub delay: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<UpdateMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiRequest>,

    #[serde(default)]
    pub skip: bool,

    /// Terminate the route chain after this message.
    #[serde(default)]
    pub end: bool,

    /// `Some(false)` strips the routing context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<bool>,

    #[serde(default)]
    pub retain: bool,

    #[serde(default)]
    pub qos: Qos,
}

impl OutputMessage {
    /// Parse a template result.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Whether the primary output targets the REST API.
    pub fn is_api_request(&self) -> bool {
        self.api.is_some()
    }

    /// Whether the primary output is a broker publish.
    pub fn is_publish(&self) -> bool {
        self.api.is_none() && !self.topic.is_empty()
    }

    /// Payload as published.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        match &self.raw_message {
            Some(raw) => Ok(raw.clone()),
            None => payload_of(self.message.as_ref()),
        }
    }

    /// Scheduling delay, if any.
    pub fn delay(&self) -> Option<Duration> {
        delay_of(self.delay)
    }

    /// Broker publication for the primary output.
    pub fn to_publication(&self) -> Result<Publication, serde_json::Error> {
        Ok(Publication {
            topic: self.topic.clone(),
            payload: self.payload()?,
            qos: self.qos,
            retain: self.retain,
        })
    }
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub payload: String,
    pub qos: Qos,
    pub retain: bool,
}

impl Publication {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

impl TryFrom<&UpdateMessage> for Publication {
    type Error = serde_json::Error;

    fn try_from(update: &UpdateMessage) -> Result<Self, Self::Error> {
        Ok(Publication {
            topic: update.topic.clone(),
            payload: update.payload()?,
            qos: update.qos,
            retain: update.retain,
        })
    }
}

fn payload_of(message: Option<&Value>) -> Result<String, serde_json::Error> {
    match message {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(value) => serde_json::to_string(value),
        None => Ok(String::new()),
    }
}

fn delay_of(seconds: f64) -> Option<Duration> {
    if seconds.is_nan() || seconds <= 0.0 {
        return None;
    }
    match Duration::try_from_secs_f64(seconds) {
        Ok(delay) => Some(delay),
        Err(e) => {
            tracing::warn!("Ignoring delay of {}s: {}", seconds, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_full_output() {
        let out = OutputMessage::from_value(json!({
            "topic": "c8y/measurement",
            "message": {"temp": 20},
            "delay": 1.5,
            "retain": true,
            "qos": 2,
            "end": true,
            "context": false,
            "updates": [
                {"topic": "a", "message": "raw text", "delay": 5},
                {"topic": "b", "message": {"x": 1}, "skip": true, "qos": 1}
            ]
        }))
        .unwrap();

        assert_eq!(out.topic, "c8y/measurement");
        assert_eq!(out.qos, Qos::ExactlyOnce);
        assert!(out.retain && out.end);
        assert_eq!(out.context, Some(false));
        assert_eq!(out.delay(), Some(Duration::from_millis(1500)));
        assert_eq!(out.updates.len(), 2);
        assert_eq!(out.updates[0].payload().unwrap(), "raw text");
        assert_eq!(out.updates[0].delay(), Some(Duration::from_secs(5)));
        assert!(out.updates[1].skip);
        assert_eq!(out.updates[1].qos, Qos::AtLeastOnce);
        assert!(out.is_publish());
    }

    #[test]
    fn test_empty_output() {
        let out = OutputMessage::from_value(json!({})).unwrap();
        assert_eq!(out, OutputMessage::default());
        assert!(!out.is_publish());
        assert_eq!(out.delay(), None);
    }

    #[test]
    fn test_malformed_output() {
        assert!(OutputMessage::from_value(json!({"topic": 5})).is_err());
        assert!(OutputMessage::from_value(json!({"updates": "nope"})).is_err());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(Qos::from(0.0), Qos::AtMostOnce);
        assert_eq!(Qos::from(1.0), Qos::AtLeastOnce);
        assert_eq!(Qos::from(2.0), Qos::ExactlyOnce);
        assert_eq!(Qos::from(7.0), Qos::AtMostOnce);
        assert_eq!(serde_json::to_value(Qos::ExactlyOnce).unwrap(), json!(2));
    }

    #[test]
    fn test_raw_message_wins() {
        let out = OutputMessage {
            topic: "t".into(),
            message: Some(json!({"a": 1})),
            raw_message: Some("1,2,3".into()),
            ..Default::default()
        };
        assert_eq!(out.payload().unwrap(), "1,2,3");

        let out = OutputMessage {
            topic: "t".into(),
            message: Some(json!({"a": 1})),
            ..Default::default()
        };
        assert_eq!(out.payload().unwrap(), r#"{"a":1}"#);
    }

    #[test]
    fn test_api_request_validation() {
        let mut req = ApiRequest {
            method: "post".into(),
            path: "/inventory/managedObjects".into(),
            ..Default::default()
        };
        assert_eq!(req.validate().unwrap(), ApiMethod::Post);

        req.method = "DELETE".into();
        assert!(matches!(
            req.validate(),
            Err(MapperError::InvalidApiRequest(_))
        ));

        req.method = String::new();
        assert!(req.validate().is_err());

        req.method = "GET".into();
        req.path = String::new();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_api_request_body() {
        let mut req = ApiRequest::default();
        assert_eq!(req.body().unwrap(), None);
        req.body = Some(json!({"name": "x"}));
        assert_eq!(req.body().unwrap().as_deref(), Some(r#"{"name":"x"}"#));
        req.body = Some(json!("plain"));
        assert_eq!(req.body().unwrap().as_deref(), Some("plain"));
    }

    #[test]
    fn test_negative_delay_is_ignored() {
        let update = UpdateMessage {
            delay: -1.0,
            ..Default::default()
        };
        assert_eq!(update.delay(), None);
    }

    #[test]
    fn test_out_of_range_delay_is_ignored() {
        let out = OutputMessage::from_value(json!({
            "topic": "out",
            "message": {},
            "delay": 1e20,
            "updates": [{"topic": "u", "delay": 1e300}]
        }))
        .unwrap();
        assert_eq!(out.delay(), None);
        assert_eq!(out.updates[0].delay(), None);

        let update = UpdateMessage {
            delay: f64::INFINITY,
            ..Default::default()
        };
        assert_eq!(update.delay(), None);
        let update = UpdateMessage {
            delay: 0.25,
            ..Default::default()
        };
        assert_eq!(update.delay(), Some(Duration::from_millis(250)));
    }
}
