//! # MQTT Transport Module
//!
//! Everything that touches the broker connection itself. The session layer
//! only sees the [`transport::Transport`] / [`transport::Connection`] traits;
//! the rumqttc implementation and its TLS setup live behind them.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker connection parameters and QoS
//! ├── transport.rs     - Adapter traits and events
//! ├── mqtt_handler.rs  - rumqttc adapter (connect, event pump)
//! └── tls.rs           - CA / client certificate loading
//! ```

pub mod config;
pub mod mqtt_handler;
pub mod tls;
pub mod transport;

pub use config::{BrokerConfig, ProtocolVersion, QosLevel, SecurityMode};
pub use mqtt_handler::RumqttTransport;
pub use transport::{Connection, ConnectionId, InboundMessage, Transport, TransportEvent};
