// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker transport.
//!
//! [`Broker`] abstracts the publish/subscribe primitives the mapper needs.
//! Inbound messages are delivered to the `mpsc::Sender` given at
//! construction; when that queue is full the message is dropped with a
//! warning.
//!
//! - [`MqttBroker`]: MQTT client (rumqttc).
//! - [`MemoryBroker`]: in-process broker for tests and offline runs. It echoes
//!   publications matching its subscriptions back to the inbound queue, as an
//!   MQTT broker does for a client subscribed to its own topics.

use crate::message::{Publication, Qos};
use crate::topic;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("broker disconnected")]
    Disconnected,
}

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message.
    async fn publish(&self, publication: Publication) -> Result<(), TransportError>;

    /// Subscribe to topic filters.
    async fn subscribe(&self, filters: &[String], qos: Qos) -> Result<(), TransportError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

fn forward(inbound: &mpsc::Sender<InboundMessage>, message: InboundMessage) {
    match inbound.try_send(message) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(message)) => {
            tracing::warn!("Inbound queue full, dropping message on {}", message.topic);
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::debug!("Inbound queue closed");
        }
    }
}

fn to_mqtt_qos(qos: Qos) -> rumqttc::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

/// MQTT connection settings.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// Retained message published by the broker if the connection is lost.
    pub last_will: Option<Publication>,
}

/// MQTT broker connection.
pub struct MqttBroker {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<(String, Qos)>>>,
}

impl MqttBroker {
    /// Connect and start the event loop task.
    pub fn connect(
        settings: &MqttSettings,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> (Self, JoinHandle<()>) {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(settings.clean_session);
        if let Some(will) = &settings.last_will {
            options.set_last_will(LastWill::new(
                &will.topic,
                will.payload.clone(),
                to_mqtt_qos(will.qos),
                will.retain,
            ));
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            subscriptions.clone(),
            inbound,
        ));

        tracing::info!(
            "MQTT client '{}' connecting to {}:{}",
            settings.client_id,
            settings.host,
            settings.port
        );
        (
            Self {
                client,
                subscriptions,
            },
            task,
        )
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Vec<(String, Qos)>>>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                forward(&inbound, InboundMessage::new(publish.topic, payload));
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                tracing::info!("MQTT connected");
                let subscriptions = subscriptions.lock().clone();
                for (filter, qos) in subscriptions {
                    if let Err(e) = client.try_subscribe(filter.as_str(), to_mqtt_qos(qos)) {
                        tracing::warn!("Resubscribe to {} failed: {}", filter, e);
                    }
                }
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                tracing::info!("MQTT disconnected");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if inbound.is_closed() {
                    break;
                }
                tracing::warn!("MQTT connection error: {}", e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn publish(&self, publication: Publication) -> Result<(), TransportError> {
        self.client
            .publish(
                publication.topic,
                to_mqtt_qos(publication.qos),
                publication.retain,
                publication.payload.into_bytes(),
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self, filters: &[String], qos: Qos) -> Result<(), TransportError> {
        for filter in filters {
            self.client.subscribe(filter.as_str(), to_mqtt_qos(qos)).await?;
            self.subscriptions.lock().push((filter.clone(), qos));
            tracing::info!("Subscribed to {}", filter);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

/// In-process broker.
#[derive(Debug)]
pub struct MemoryBroker {
    published: Mutex<Vec<Publication>>,
    subscriptions: Mutex<Vec<String>>,
    inbound: Option<mpsc::Sender<InboundMessage>>,
}

impl MemoryBroker {
    /// Broker that records publications without echoing them.
    pub fn new() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            inbound: None,
        }
    }

    /// Broker that echoes matching publications to `inbound`.
    pub fn with_inbound(inbound: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            inbound: Some(inbound),
            ..Self::new()
        }
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Publication> {
        self.published.lock().clone()
    }

    /// Publications on one topic.
    pub fn published_on(&self, topic: &str) -> Vec<Publication> {
        self.published
            .lock()
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Active subscriptions.
    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Deliver a message as if it came from the broker.
    pub fn inject(&self, message: InboundMessage) {
        if let Some(inbound) = &self.inbound {
            forward(inbound, message);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, publication: Publication) -> Result<(), TransportError> {
        let echo = {
            let subscriptions = self.subscriptions.lock();
            topic::matches_any(subscriptions.as_slice(), &publication.topic)
        };
        if echo {
            self.inject(InboundMessage::new(
                publication.topic.clone(),
                publication.payload.clone(),
            ));
        }
        self.published.lock().push(publication);
        Ok(())
    }

    async fn subscribe(&self, filters: &[String], _qos: Qos) -> Result<(), TransportError> {
        self.subscriptions.lock().extend(filters.iter().cloned());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_broker_records() {
        let broker = MemoryBroker::new();
        broker
            .publish(Publication::new("a/b", "x").qos(Qos::AtLeastOnce).retain(true))
            .await
            .unwrap();
        let published = broker.published_on("a/b");
        assert_eq!(published.len(), 1);
        assert!(published[0].retain);
        assert_eq!(published[0].qos, Qos::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_memory_broker_echoes_subscribed_topics() {
        let (tx, mut rx) = mpsc::channel(4);
        let broker = MemoryBroker::with_inbound(tx);
        broker
            .subscribe(&["sensors/+".to_string()], Qos::AtLeastOnce)
            .await
            .unwrap();

        broker.publish(Publication::new("sensors/t", "1")).await.unwrap();
        broker.publish(Publication::new("other", "2")).await.unwrap();

        assert_eq!(rx.recv().await, Some(InboundMessage::new("sensors/t", "1")));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        let broker = MemoryBroker::with_inbound(tx);
        broker.inject(InboundMessage::new("a", "1"));
        broker.inject(InboundMessage::new("a", "2"));
        assert_eq!(rx.recv().await.unwrap().payload, "1");
        assert!(rx.try_recv().is_err());
    }
}
