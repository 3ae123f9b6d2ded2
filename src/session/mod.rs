//! Supervised device sessions
//!
//! - `device`: per-resource session with a FIFO job queue and error counter
//! - `manager`: discovery loop, session registry and auto-reconnect
//! - `events`: lifecycle observers
//! - `filter`: which discovered resources get a session

pub mod device;
pub mod events;
pub mod filter;
pub mod manager;

pub use device::{DeviceSession, SessionState};
pub use events::{EventHandler, EventRegistry, SessionEvent, SessionEventKind, SubscriptionId};
pub use filter::ResourceFilter;
pub use manager::{ScanReport, SessionManager};
