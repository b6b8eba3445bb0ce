// src/error.rs
//
// Error taxonomy shared by every bridge component.

use std::fmt;
use std::io;
use thiserror::Error;

/// One interface that failed during a bulk operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceFailure {
    pub interface: String,
    pub error: String,
}

impl fmt::Display for InterfaceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.interface, self.error)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Name is not part of the configured port set
    #[error("CAN interface {name} is not configured (configured: {})", .configured.join(", "))]
    UnconfiguredInterface {
        name: String,
        configured: Vec<String>,
    },

    /// Configured, but no live socket in the registry
    #[error("CAN interface {0} not initialized")]
    InterfaceNotInitialized(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Socket-level failure (create, resolve, bind, send, receive, close)
    #[error("{interface}: {operation} failed: {source}")]
    Transport {
        interface: String,
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to initialize {interface} after {attempts} attempts: {last_error}")]
    SetupExhausted {
        interface: String,
        attempts: u32,
        last_error: String,
    },

    #[error("failed to initialize any CAN interface: {}", join_failures(.0))]
    InitializationFailed(Vec<InterfaceFailure>),

    #[error("not listening on interface {0}")]
    NotListening(String),

    #[error("no message buffer for interface {0}")]
    NoMessageBuffer(String),

    #[error("errors during shutdown: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    #[error("link setup failed for {interface}: {message}")]
    LinkSetup { interface: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn transport(interface: &str, operation: &'static str, source: io::Error) -> Self {
        BridgeError::Transport {
            interface: interface.to_string(),
            operation,
            source,
        }
    }

    pub fn link(interface: &str, message: impl Into<String>) -> Self {
        BridgeError::LinkSetup {
            interface: interface.to_string(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        BridgeError::Config(message.into())
    }

    /// True for errors caused by the caller's input rather than the bus.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::UnconfiguredInterface { .. }
                | BridgeError::InterfaceNotInitialized(_)
                | BridgeError::InvalidFrame(_)
        )
    }
}

fn join_failures(failures: &[InterfaceFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, BridgeError>;
