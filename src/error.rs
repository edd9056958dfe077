//! Error types shared by the session, dispatch and transport layers.
//!
//! Connect-phase failures ([`BridgeError::Certificate`], [`BridgeError::Connect`],
//! [`BridgeError::Subscribe`]) never escape the session: they abort the current
//! attempt and arm the retry timer. Message-level failures drop one message.
//! Configuration defects are reported to the operator through status.

use crate::point::{PointId, PointKind};
use thiserror::Error;

/// Errors raised while bridging points to a broker
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    /// A CA or client certificate (or key) file could not be read or parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Network, TLS or MQTT CONNECT handshake failure
    #[error("Connect error: {0}")]
    Connect(String),

    /// A topic filter could not be subscribed
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Two points claim the same topic in one session
    #[error("Duplicate topic '{topic}': already registered to point {existing}")]
    DuplicateTopic { topic: String, existing: PointId },

    /// Payload could not be converted into the point's native type
    #[error("Cannot convert payload '{payload}' to {kind}: {reason}")]
    Coercion {
        kind: PointKind,
        payload: String,
        reason: String,
    },

    /// The point kind has no outbound control path
    #[error("Control is not supported for {kind} point {point}")]
    UnsupportedControl { point: PointId, kind: PointKind },

    /// Control value does not match the point's declared kind
    #[error("Control value for point {point} must be {expected}")]
    ControlValueMismatch { point: PointId, expected: PointKind },

    /// Publishing to the broker failed
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// The broker session is not online
    #[error("Broker '{0}' is not connected")]
    NotConnected(String),

    /// No point with this id is configured
    #[error("Unknown point: {0}")]
    UnknownPoint(PointId),

    /// The session task is gone
    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl BridgeError {
    /// True for failures that abort a connect attempt and schedule a retry.
    pub fn is_connect_phase(&self) -> bool {
        matches!(
            self,
            BridgeError::Certificate(_) | BridgeError::Connect(_) | BridgeError::Subscribe { .. }
        )
    }

    /// True for configuration defects that need operator attention.
    pub fn is_config_defect(&self) -> bool {
        matches!(
            self,
            BridgeError::DuplicateTopic { .. }
                | BridgeError::UnsupportedControl { .. }
                | BridgeError::ControlValueMismatch { .. }
        )
    }
}

/// One field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Broker name or point id the error belongs to
    pub object: String,
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}: {}", self.object, self.field, self.message)
    }
}

/// Errors from loading or validating the bridge configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration ({} errors)", .0.len())]
    Invalid(Vec<FieldError>),

    #[error("No config directory available on this platform")]
    NoConfigDir,
}
