//! Host point database collaborator
//!
//! The host is the system of record for points. The bridge only pushes value
//! writes and status changes into it.

use tracing::{debug, info, warn};

use crate::point::{PointId, PointValue, Quality};
use crate::session::BrokerStatus;

/// Write sink and status receiver provided by the host database
pub trait PointHost: Send + Sync {
    /// Stores a changed value and quality for `point`.
    fn write_value(&self, point: PointId, value: &PointValue, quality: Quality);

    /// Pushes pending writes through to the host.
    fn flush(&self) {}

    fn status_changed(&self, _broker: &str, _status: &BrokerStatus) {}
}

/// Host that only logs, used by the standalone binary
#[derive(Debug, Default, Clone)]
pub struct TracingHost;

impl PointHost for TracingHost {
    fn write_value(&self, point: PointId, value: &PointValue, quality: Quality) {
        info!("Point {} = {} ({:?})", point, value, quality);
    }

    fn flush(&self) {
        debug!("Host flush");
    }

    fn status_changed(&self, broker: &str, status: &BrokerStatus) {
        match &status.alarm {
            Some(alarm) => warn!("[{}] {} | {}", broker, status.last_error, alarm),
            None => info!("[{}] {}", broker, status.last_error),
        }
    }
}
