//! Live transport-network monitor.
//!
//! Wires the STOMP client (upstream passenger-event feed), the STOMP
//! server (downstream quiet-route service), and the in-memory transport
//! network together, and owns their lifecycle.

pub mod config;
pub mod layout;
pub mod monitor;

pub use config::MonitorConfig;
pub use monitor::{MonitorError, TransitMonitor};
