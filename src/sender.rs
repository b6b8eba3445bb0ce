// src/sender.rs
//
// Send path: validate the request, then hand one frame to the device.
// No retries here; systemic failures are the watchdog's business.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{BridgeError, Result};
use crate::io::socketcan::{consts, Frame};
use crate::registry::InterfaceRegistry;

/// Outbound message as it arrives from the control plane.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanMessage {
    pub interface: String,
    pub id: u32,
    pub data: Vec<u8>,
}

impl CanMessage {
    pub fn new(interface: impl Into<String>, id: u32, data: Vec<u8>) -> Self {
        Self {
            interface: interface.into(),
            id,
            data,
        }
    }
}

#[derive(Clone)]
pub struct MessageSender {
    registry: Arc<InterfaceRegistry>,
}

impl MessageSender {
    pub fn new(registry: Arc<InterfaceRegistry>) -> Self {
        Self { registry }
    }

    /// Send one message. Returns the latency recorded into metrics.
    ///
    /// Check order: configured, registered, payload length. Nothing touches
    /// the socket until all three pass.
    pub fn send(&self, message: &CanMessage) -> Result<Duration> {
        self.ensure_configured(&message.interface)?;

        let device = self
            .registry
            .get_interface(&message.interface)
            .ok_or_else(|| BridgeError::InterfaceNotInitialized(message.interface.clone()))?;

        let frame = Frame::new(message.id, &message.data)?;
        let latency = device.send_frame(&frame)?;

        debug!(
            interface = %message.interface,
            id = message.id,
            len = message.data.len(),
            latency_us = latency.as_micros() as u64,
            "frame sent"
        );
        Ok(latency)
    }

    /// Send an already-built frame.
    pub fn send_frame(&self, interface: &str, frame: &Frame) -> Result<Duration> {
        self.send(&CanMessage::new(interface, frame.id(), frame.payload().to_vec()))
    }

    /// Stricter request check for the HTTP boundary: also rejects an empty
    /// interface name and an empty payload.
    pub fn validate(&self, message: &CanMessage) -> Result<()> {
        if message.interface.is_empty() {
            return Err(BridgeError::InvalidFrame(
                "interface name is required".to_string(),
            ));
        }
        self.ensure_configured(&message.interface)?;

        if message.data.is_empty() {
            return Err(BridgeError::InvalidFrame("data cannot be empty".to_string()));
        }
        if message.data.len() > consts::MAX_DATA_LEN {
            return Err(BridgeError::InvalidFrame(format!(
                "data too long: {} bytes (max {})",
                message.data.len(),
                consts::MAX_DATA_LEN
            )));
        }
        Ok(())
    }

    fn ensure_configured(&self, name: &str) -> Result<()> {
        if self.registry.is_configured(name) {
            return Ok(());
        }
        Err(BridgeError::UnconfiguredInterface {
            name: name.to_string(),
            configured: self.registry.configured_ports().to_vec(),
        })
    }
}
