// src/registry.rs
//
// Interface registry: interface name -> live raw socket + metrics.
//
// Lock layout:
//   - the map is behind an RwLock and only held for insert/remove/lookup;
//     lookups hand out an Arc<Device> and release the map lock immediately
//   - each Device has its own mutex, held across exactly one socket
//     operation (a send or a health probe)

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, InterfaceFailure, Result};
use crate::io::socketcan::{encode_frame, open_bound, CanSocket, Frame, SocketProvider};
use crate::metrics::InterfaceMetrics;

// ============================================================================
// Types and Configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Attempts per interface during initialization
    #[serde(default = "default_init_retries")]
    pub init_retries: u32,
    /// Fixed pause between attempts, in milliseconds
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,
    /// Identifier of the 1-byte health probe frame
    #[serde(default)]
    pub probe_id: u32,
}

fn default_init_retries() -> u32 {
    5
}

fn default_init_retry_delay_ms() -> u64 {
    2000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            init_retries: default_init_retries(),
            init_retry_delay_ms: default_init_retry_delay_ms(),
            probe_id: 0,
        }
    }
}

impl RegistryConfig {
    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_millis(self.init_retry_delay_ms)
    }
}

/// Outcome of a bulk initialization that brought up at least one interface.
#[derive(Clone, Debug, Default)]
pub struct InitReport {
    pub initialized: Vec<String>,
    pub failed: Vec<InterfaceFailure>,
}

// ============================================================================
// Device
// ============================================================================

/// One bound raw socket and its metrics.
pub struct Device {
    name: String,
    ifindex: u32,
    socket: Mutex<Option<Box<dyn CanSocket>>>,
    metrics: InterfaceMetrics,
}

impl Device {
    fn new(name: &str, ifindex: u32, socket: Box<dyn CanSocket>) -> Self {
        Self {
            name: name.to_string(),
            ifindex,
            socket: Mutex::new(Some(socket)),
            metrics: InterfaceMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    pub fn metrics(&self) -> &InterfaceMetrics {
        &self.metrics
    }

    pub fn is_open(&self) -> bool {
        self.socket.lock().is_some()
    }

    /// Transmit under the device lock and record the outcome.
    /// Returns the elapsed time of lock + encode + transmit.
    pub fn send_frame(&self, frame: &Frame) -> Result<Duration> {
        let started = Instant::now();
        let result = self.transmit(frame);
        let latency = started.elapsed();

        match result {
            Ok(()) => {
                self.metrics.record_success(latency);
                Ok(latency)
            }
            Err(e) => {
                let err = BridgeError::transport(&self.name, "send", e);
                self.metrics.record_error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Send the diagnostic probe. Shares the lock with real sends but
    /// leaves metrics alone.
    pub fn probe(&self, probe_id: u32) -> Result<()> {
        let frame = Frame::new(probe_id, &[0])?;
        self.transmit(&frame)
            .map_err(|e| BridgeError::transport(&self.name, "health probe", e))
    }

    fn transmit(&self, frame: &Frame) -> io::Result<()> {
        let guard = self.socket.lock();
        let buf = encode_frame(frame);
        match guard.as_ref() {
            Some(socket) => socket.send(&buf),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket closed",
            )),
        }
    }

    /// Close the socket. Later sends fail fast with a transport error.
    fn close(&self) -> io::Result<()> {
        match self.socket.lock().take() {
            Some(socket) => socket.close(),
            None => Ok(()),
        }
    }

    fn close_logged(&self) {
        if let Err(e) = self.close() {
            warn!(interface = %self.name, error = %e, "error closing socket");
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("ifindex", &self.ifindex)
            .field("open", &self.is_open())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Owns every live device. Shared by reference with the sender,
/// watchdog and monitor.
pub struct InterfaceRegistry {
    provider: Arc<dyn SocketProvider>,
    config: RegistryConfig,
    configured: Vec<String>,
    devices: RwLock<HashMap<String, Arc<Device>>>,
}

impl InterfaceRegistry {
    pub fn new(
        configured: Vec<String>,
        config: RegistryConfig,
        provider: Arc<dyn SocketProvider>,
    ) -> Self {
        Self {
            provider,
            config,
            configured,
            devices: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> Arc<dyn SocketProvider> {
        self.provider.clone()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn configured_ports(&self) -> &[String] {
        &self.configured
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.configured.iter().any(|p| p == name)
    }

    /// Initialize every configured port. Fails only if none came up.
    ///
    /// Blocks for the retry delays; call from a blocking context.
    pub fn initialize_all(&self) -> Result<InitReport> {
        let mut report = InitReport::default();

        for name in &self.configured {
            match self.initialize_single(name) {
                Ok(_) => report.initialized.push(name.clone()),
                Err(e) => {
                    warn!(interface = %name, error = %e, "skipping interface");
                    report.failed.push(InterfaceFailure {
                        interface: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.initialized.is_empty() {
            return Err(BridgeError::InitializationFailed(report.failed));
        }

        info!(
            initialized = report.initialized.len(),
            failed = report.failed.len(),
            "CAN interfaces initialized"
        );
        Ok(report)
    }

    /// Open, resolve and bind `name`, retrying with a fixed delay.
    /// Replaces (and closes) any device already registered under `name`.
    ///
    /// Blocks for the retry delays; call from a blocking context.
    pub fn initialize_single(&self, name: &str) -> Result<Arc<Device>> {
        let attempts = self.config.init_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.open_device(name) {
                Ok(device) => {
                    let device = Arc::new(device);
                    let previous = self
                        .devices
                        .write()
                        .insert(name.to_string(), device.clone());
                    if let Some(previous) = previous {
                        previous.close_logged();
                    }
                    info!(
                        interface = %name,
                        ifindex = device.ifindex(),
                        attempt,
                        "CAN interface initialized"
                    );
                    return Ok(device);
                }
                Err(e) => {
                    warn!(
                        interface = %name,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "CAN interface initialization attempt failed"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.config.init_retry_delay());
                    }
                }
            }
        }

        Err(BridgeError::SetupExhausted {
            interface: name.to_string(),
            attempts,
            last_error,
        })
    }

    fn open_device(&self, name: &str) -> Result<Device> {
        let (socket, ifindex) = open_bound(self.provider.as_ref(), name)?;
        Ok(Device::new(name, ifindex, socket))
    }

    /// Lookup only, no I/O.
    pub fn get_interface(&self, name: &str) -> Option<Arc<Device>> {
        self.devices.read().get(name).cloned()
    }

    /// Snapshot of every live device, sorted by name.
    pub fn interfaces(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by(|a, b| a.name().cmp(b.name()));
        devices
    }

    pub fn interface_count(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.devices.read().contains_key(name)
    }

    /// Close and forget `name`. Close errors are logged, not returned.
    pub fn remove_interface(&self, name: &str) -> Result<()> {
        let device = self
            .devices
            .write()
            .remove(name)
            .ok_or_else(|| BridgeError::InterfaceNotInitialized(name.to_string()))?;

        device.close_logged();
        info!(interface = %name, "CAN interface removed");
        Ok(())
    }

    /// Probe `name` with the diagnostic frame. Success is the health signal.
    pub fn check_health(&self, name: &str) -> bool {
        let Some(device) = self.get_interface(name) else {
            debug!(interface = %name, "health check on unregistered interface");
            return false;
        };

        match device.probe(self.config.probe_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(interface = %name, error = %e, "health check failed");
                false
            }
        }
    }

    /// Close every socket and empty the registry.
    pub fn cleanup(&self) {
        let devices: Vec<_> = self.devices.write().drain().collect();
        for (_, device) in &devices {
            device.close_logged();
        }
        info!(closed = devices.len(), "CAN interfaces cleaned up");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::socketcan::decode_frame;
    use crate::io::socketcan::mock::MockSocketProvider;

    pub(crate) fn fast_config() -> RegistryConfig {
        RegistryConfig {
            init_retries: 2,
            init_retry_delay_ms: 0,
            probe_id: 0,
        }
    }

    pub(crate) fn registry_with(
        ports: &[&str],
        mock: &MockSocketProvider,
    ) -> Arc<InterfaceRegistry> {
        Arc::new(InterfaceRegistry::new(
            ports.iter().map(|p| p.to_string()).collect(),
            fast_config(),
            Arc::new(mock.clone()),
        ))
    }

    #[test]
    fn test_initialize_all_partial_failure() {
        let mock = MockSocketProvider::new();
        mock.fail_resolve("can1");
        let registry = registry_with(&["can0", "can1"], &mock);

        let report = registry.initialize_all().unwrap();
        assert_eq!(report.initialized, vec!["can0".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].interface, "can1");
        assert!(registry.is_active("can0"));
        assert!(!registry.is_active("can1"));
    }

    #[test]
    fn test_initialize_all_total_failure() {
        let mock = MockSocketProvider::new();
        mock.fail_resolve("can0");
        mock.fail_bind("can1");
        let registry = registry_with(&["can0", "can1"], &mock);

        match registry.initialize_all() {
            Err(BridgeError::InitializationFailed(failures)) => {
                let names: Vec<_> = failures.iter().map(|f| f.interface.as_str()).collect();
                assert_eq!(names, vec!["can0", "can1"]);
            }
            other => panic!("expected aggregate failure, got {:?}", other.map(|r| r.initialized)),
        }
        assert_eq!(registry.interface_count(), 0);
    }

    #[test]
    fn test_initialize_single_retries_and_closes() {
        let mock = MockSocketProvider::new();
        mock.fail_resolve("can0");
        let registry = InterfaceRegistry::new(
            vec!["can0".into()],
            RegistryConfig {
                init_retries: 3,
                init_retry_delay_ms: 0,
                probe_id: 0,
            },
            Arc::new(mock.clone()),
        );

        match registry.initialize_single("can0") {
            Err(BridgeError::SetupExhausted {
                interface,
                attempts,
                last_error,
            }) => {
                assert_eq!(interface, "can0");
                assert_eq!(attempts, 3);
                assert!(last_error.contains("no such device"));
            }
            other => panic!("expected SetupExhausted, got {:?}", other),
        }
        // Every failed attempt closed its socket
        assert_eq!(mock.created(), 3);
        assert_eq!(mock.closed(), 3);
    }

    #[test]
    fn test_initialize_single_delays_between_attempts_only() {
        let mock = MockSocketProvider::new();
        mock.fail_resolve("can0");
        let registry = InterfaceRegistry::new(
            vec!["can0".into()],
            RegistryConfig {
                init_retries: 3,
                init_retry_delay_ms: 40,
                probe_id: 0,
            },
            Arc::new(mock.clone()),
        );

        let started = Instant::now();
        assert!(registry.initialize_single("can0").is_err());
        let elapsed = started.elapsed();

        // Two gaps for three attempts, none after the last
        assert!(elapsed >= Duration::from_millis(80), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(120), "elapsed {:?}", elapsed);
        assert_eq!(mock.created(), 3);
    }

    #[test]
    fn test_bind_failure_closes_socket() {
        let mock = MockSocketProvider::new();
        mock.fail_bind("can0");
        let registry = registry_with(&["can0"], &mock);

        assert!(registry.initialize_single("can0").is_err());
        assert_eq!(mock.created(), mock.closed());
    }

    #[test]
    fn test_create_failure_is_transport_error() {
        let mock = MockSocketProvider::new();
        mock.fail_create(true);
        let registry = registry_with(&["can0"], &mock);

        let err = registry.open_device("can0").unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Transport {
                operation: "create socket",
                ..
            }
        ));
    }

    #[test]
    fn test_reinitialize_closes_previous_socket() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);

        let first = registry.initialize_single("can0").unwrap();
        let second = registry.initialize_single("can0").unwrap();
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(mock.closed(), 1);
        assert_eq!(registry.interface_count(), 1);
    }

    #[test]
    fn test_remove_interface() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);
        registry.initialize_single("can0").unwrap();

        registry.remove_interface("can0").unwrap();
        assert!(registry.get_interface("can0").is_none());
        assert_eq!(mock.closed(), 1);

        assert!(matches!(
            registry.remove_interface("can0"),
            Err(BridgeError::InterfaceNotInitialized(_))
        ));
    }

    #[test]
    fn test_removed_device_fails_fast() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);
        let device = registry.initialize_single("can0").unwrap();
        registry.remove_interface("can0").unwrap();

        let frame = Frame::new(0x100, &[1]).unwrap();
        let err = device.send_frame(&frame).unwrap_err();
        assert!(matches!(err, BridgeError::Transport { .. }));
        assert_eq!(device.metrics().snapshot().total_errors, 1);
        assert_eq!(mock.sends_to("can0"), 0);
    }

    #[test]
    fn test_check_health_sends_probe() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);
        registry.initialize_single("can0").unwrap();

        assert!(registry.check_health("can0"));
        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        let probe = decode_frame(&sent[0].1).unwrap();
        assert_eq!(probe.id(), 0);
        assert_eq!(probe.payload(), &[0]);

        // Probes do not count as traffic
        assert_eq!(registry.get_interface("can0").unwrap().metrics().snapshot().total_sent, 0);
    }

    #[test]
    fn test_check_health_configurable_probe_id() {
        let mock = MockSocketProvider::new();
        let registry = InterfaceRegistry::new(
            vec!["can0".into()],
            RegistryConfig {
                probe_id: 0x7DF,
                ..fast_config()
            },
            Arc::new(mock.clone()),
        );
        registry.initialize_single("can0").unwrap();

        assert!(registry.check_health("can0"));
        assert_eq!(decode_frame(&mock.sent()[0].1).unwrap().id(), 0x7DF);
    }

    #[test]
    fn test_check_health_failures() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);
        assert!(!registry.check_health("can0"));

        registry.initialize_single("can0").unwrap();
        mock.fail_send("can0");
        assert!(!registry.check_health("can0"));
    }

    #[test]
    fn test_cleanup_closes_everything() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0", "can1"], &mock);
        registry.initialize_all().unwrap();

        registry.cleanup();
        assert_eq!(registry.interface_count(), 0);
        assert_eq!(mock.closed(), 2);
    }

    #[test]
    fn test_config_defaults() {
        let config: RegistryConfig = toml::from_str("").unwrap();
        assert_eq!(config, RegistryConfig::default());
        assert_eq!(config.init_retries, 5);
        assert_eq!(config.init_retry_delay(), Duration::from_secs(2));
        assert_eq!(config.probe_id, 0);
    }
}
