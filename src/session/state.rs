//! Link state, published status and the connect-in-progress guard

use chrono::{DateTime, Local};
use std::fmt;

const ALARM_TEXT_LIMIT: usize = 200;

/// Run-time connection state of a broker session
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No connection attempted yet, or torn down
    #[default]
    Idle,
    Connecting,
    Online,
    /// Disconnected; a retry is scheduled while the session runs
    Offline,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            LinkState::Idle => "Idle",
            LinkState::Connecting => "Connecting",
            LinkState::Online => "Online",
            LinkState::Offline => "Offline",
        };
        write!(f, "{}", text)
    }
}

/// Status of one broker session as reported to the host
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BrokerStatus {
    pub state: LinkState,
    /// Text of the last status change ("Connected.", "Not Connected. ...")
    pub last_error: String,
    /// Active communications alarm text
    pub alarm: Option<String>,
    pub retry_armed: bool,
    /// Topics currently registered
    pub subscriptions: usize,
    pub messages_received: u64,
    pub updates_written: u64,
    pub last_activity: Option<DateTime<Local>>,
}

impl BrokerStatus {
    pub fn is_online(&self) -> bool {
        self.state == LinkState::Online
    }

    pub(crate) fn connecting(&mut self) {
        self.state = LinkState::Connecting;
        self.last_error = "Connecting...".to_string();
    }

    /// Clears the alarm and records the successful connect.
    pub(crate) fn connected(&mut self, subscriptions: usize) {
        self.state = LinkState::Online;
        self.last_error = "Connected.".to_string();
        self.alarm = None;
        self.retry_armed = false;
        self.subscriptions = subscriptions;
    }

    /// Records the failure and raises the alarm unless it is already active.
    pub(crate) fn not_connected(&mut self, reason: &str) {
        self.state = LinkState::Offline;
        self.subscriptions = 0;
        self.last_error = if reason.is_empty() {
            "Not Connected.".to_string()
        } else {
            format!("Not Connected. {}", reason)
        };
        if self.alarm.is_none() {
            let text: String = self.last_error.chars().take(ALARM_TEXT_LIMIT).collect();
            self.alarm = Some(format!("MQTT Error: Offline, Alarm Active.{}", text));
        }
    }

    pub(crate) fn stopped(&mut self) {
        self.state = LinkState::Idle;
        self.last_error = "Disconnected.".to_string();
        self.alarm = None;
        self.retry_armed = false;
        self.subscriptions = 0;
    }
}

/// How a `ConnectionClosed` event is accounted for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosureAttribution {
    /// A connect attempt is in flight; the attempt absorbs the closure
    ConnectAttempt,
    /// The link dropped on its own
    Unsolicited,
}

/// Tracks the `connect_in_progress` and `disconnect_observed` flags.
///
/// A broker-side rejection during the handshake must be counted once, as a
/// failed attempt, and never also as an unsolicited disconnect.
#[derive(Debug, Default, Clone)]
pub struct ConnectGuard {
    connect_in_progress: bool,
    disconnect_observed: bool,
}

impl ConnectGuard {
    pub fn begin(&mut self) {
        self.connect_in_progress = true;
        self.disconnect_observed = false;
    }

    pub fn observe_closure(&mut self) -> ClosureAttribution {
        self.disconnect_observed = true;
        if self.connect_in_progress {
            ClosureAttribution::ConnectAttempt
        } else {
            ClosureAttribution::Unsolicited
        }
    }

    /// Ends the attempt; returns true if the link closed while it was running.
    pub fn finish(&mut self) -> bool {
        self.connect_in_progress = false;
        self.disconnect_observed
    }

    pub fn in_progress(&self) -> bool {
        self.connect_in_progress
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
