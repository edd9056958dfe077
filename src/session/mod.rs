//! Broker sessions
//!
//! A session owns one broker connection and the points scanned through it. It
//! runs as a single actor task; [`SessionHandle`] is the only way in.

mod actor;
pub mod dispatch;
mod handle;
pub mod registry;
pub mod state;

pub use actor::PENDING_LIMIT;
pub use handle::{SessionCommand, SessionHandle};
pub use registry::TopicRegistry;
pub use state::{BrokerStatus, LinkState};
