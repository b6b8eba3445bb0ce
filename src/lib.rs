// src/lib.rs
//
// SocketCAN bridge: interface registry, send path with per-interface
// metrics, receive capture into bounded buffers, a health watchdog with
// bounded recovery, and status reporting.

pub mod announce;
#[cfg(feature = "cli")]
pub mod cli;
pub mod error;
pub mod io;
pub mod link_setup;
pub mod listener;
pub mod logging;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod sender;
pub mod service;
pub mod settings;
pub mod watchdog;

pub use error::{BridgeError, InterfaceFailure, Result};
pub use io::socketcan::{decode_frame, encode_frame, Frame, RawSocketProvider, SocketProvider};
pub use listener::{MessageListener, MessageLog};
pub use monitor::{HealthStatus, Monitor};
pub use registry::InterfaceRegistry;
pub use sender::{CanMessage, MessageSender};
pub use service::BridgeService;
pub use settings::BridgeConfig;
pub use watchdog::{RecoveryPhase, Watchdog};
