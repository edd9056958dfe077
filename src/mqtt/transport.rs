//! Transport adapter contract
//!
//! The session manager only talks to the broker through these two traits.
//! [`Transport::connect`] performs the handshake and hands back a live
//! [`Connection`]; asynchronous broker activity comes back as
//! [`TransportEvent`]s on the channel passed to `connect`, tagged with the
//! connection id the session assigned to that attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::config::{BrokerConfig, QosLevel};
use crate::error::BridgeError;

/// Identifies one connect attempt within a session
pub type ConnectionId = u64;

/// Events raised by a live connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    MessageReceived {
        connection: ConnectionId,
        message: InboundMessage,
    },
    /// May fire at any time, including while the handshake is still in flight
    ConnectionClosed {
        connection: ConnectionId,
        reason: String,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::MessageReceived { connection, .. } => *connection,
            TransportEvent::ConnectionClosed { connection, .. } => *connection,
        }
    }
}

/// A PUBLISH received from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload as lossy text, for logging
    pub fn preview(&self) -> String {
        let text = String::from_utf8_lossy(&self.payload);
        if text.chars().count() > 64 {
            format!("{}...", text.chars().take(64).collect::<String>())
        } else {
            text.into_owned()
        }
    }
}

/// Factory for broker connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens TCP/TLS and completes the MQTT CONNECT handshake.
    ///
    /// Fails with [`BridgeError::Certificate`] when certificate material cannot
    /// be loaded and [`BridgeError::Connect`] for network or handshake errors.
    async fn connect(
        &self,
        config: &BrokerConfig,
        connection: ConnectionId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Connection>, BridgeError>;
}

/// One established broker connection
#[async_trait]
pub trait Connection: Send + Sync {
    async fn subscribe(&self, topic: &str, qos: QosLevel) -> Result<(), BridgeError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), BridgeError>;

    /// Best effort; errors are logged by the caller and never fatal.
    async fn disconnect(&self) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;
}
