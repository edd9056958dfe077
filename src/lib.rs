//! pointlink: bridges a process-control point database to MQTT brokers.
//!
//! Each broker is served by one session actor that connects, subscribes the
//! topics of its points and keeps retrying while the broker is unreachable.
//! Inbound payloads are coerced into typed point values and written to the
//! host; control values are published back to the point's topic.

pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod mqtt;
pub mod point;
pub mod session;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError, FieldError};
pub use host::{PointHost, TracingHost};
pub use point::{PointConfig, PointEntry, PointId, PointKind, PointValue, Quality};
pub use session::{BrokerStatus, LinkState, SessionHandle, PENDING_LIMIT};
