//! Point configuration model
//!
//! A point is one subscribable or controllable unit of the host database. The
//! host owns the record; the bridge reads its configuration and writes its
//! value and quality.

pub mod entry;
pub mod kind;

pub use entry::{PointConfig, PointEntry, PointTable, Subscription};
pub use kind::{PointKind, PointValue, Quality};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a host point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PointId(pub u32);

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
