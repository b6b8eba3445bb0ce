// src/announce.rs
//
// LAN discovery beacon. Periodically broadcasts a JSON `DeviceInfo` datagram
// so tools on the local network can find the bridge.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

// ============================================================================
// Types and Configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnounceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_broadcast_addr")]
    pub broadcast_addr: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_model")]
    pub model: String,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_broadcast_addr() -> String {
    "255.255.255.255:9999".to_string()
}

fn default_device_name() -> String {
    "Can-Bridge".to_string()
}

fn default_model() -> String {
    "CAN Bridge".to_string()
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
            broadcast_addr: default_broadcast_addr(),
            device_name: default_device_name(),
            model: default_model(),
        }
    }
}

impl AnnounceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn target(&self) -> Result<SocketAddr> {
        self.broadcast_addr.parse().map_err(|e| {
            BridgeError::config(format!(
                "invalid broadcast address {:?}: {}",
                self.broadcast_addr, e
            ))
        })
    }
}

/// Beacon payload
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub ip: String,
    pub mac: String,
    pub model: String,
    pub version: String,
}

impl DeviceInfo {
    /// Describe this host using its first usable IPv4 interface.
    pub fn local(config: &AnnounceConfig) -> Self {
        let (ip, mac) = local_address();
        Self {
            name: config.device_name.clone(),
            ip,
            mac,
            model: config.model.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================================================
// Host Address Lookup
// ============================================================================

#[derive(Clone, Debug, Default)]
struct HostInterface {
    name: String,
    up: bool,
    loopback: bool,
    ipv4: Option<Ipv4Addr>,
    mac: Option<[u8; 6]>,
}

/// First non-loopback interface that is up and has an IPv4 address,
/// as `(ip, MAC)`. Empty strings when none qualifies.
fn select_address(interfaces: &[HostInterface]) -> (String, String) {
    interfaces
        .iter()
        .find(|i| i.up && !i.loopback && i.ipv4.is_some())
        .map(|i| {
            let ip = i.ipv4.map(|a| a.to_string()).unwrap_or_default();
            let mac = i.mac.map(|m| format_mac(&m)).unwrap_or_default();
            (ip, mac)
        })
        .unwrap_or_default()
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(target_os = "linux")]
fn host_interfaces() -> Vec<HostInterface> {
    use nix::net::if_::InterfaceFlags;
    use std::net::SocketAddrV4;

    let addrs = match nix::ifaddrs::getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(error = %e, "failed to enumerate network interfaces");
            return Vec::new();
        }
    };

    let mut interfaces: Vec<HostInterface> = Vec::new();
    for entry in addrs {
        let idx = match interfaces.iter().position(|i| i.name == entry.interface_name) {
            Some(idx) => idx,
            None => {
                interfaces.push(HostInterface {
                    name: entry.interface_name.clone(),
                    ..HostInterface::default()
                });
                interfaces.len() - 1
            }
        };
        let iface = &mut interfaces[idx];
        iface.up |= entry.flags.contains(InterfaceFlags::IFF_UP);
        iface.loopback |= entry.flags.contains(InterfaceFlags::IFF_LOOPBACK);

        let Some(address) = entry.address else {
            continue;
        };
        if let Some(sin) = address.as_sockaddr_in() {
            if iface.ipv4.is_none() {
                iface.ipv4 = Some(*SocketAddrV4::from(*sin).ip());
            }
        } else if let Some(link) = address.as_link_addr() {
            iface.mac = link.addr();
        }
    }
    interfaces
}

#[cfg(not(target_os = "linux"))]
fn host_interfaces() -> Vec<HostInterface> {
    Vec::new()
}

fn local_address() -> (String, String) {
    select_address(&host_interfaces())
}

// ============================================================================
// Broadcast Loop
// ============================================================================

/// Start broadcasting until `shutdown` flips to true.
pub async fn spawn_announcer(
    config: AnnounceConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let target = config.target()?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| BridgeError::transport("announce", "bind", e))?;
    socket
        .set_broadcast(true)
        .map_err(|e| BridgeError::transport("announce", "enable broadcast", e))?;

    let device = DeviceInfo::local(&config);
    let payload = serde_json::to_vec(&device)
        .map_err(|e| BridgeError::config(format!("failed to encode device info: {}", e)))?;
    let period = config.interval();

    info!(addr = %target, name = %device.name, ip = %device.ip, "announcing on LAN");

    Ok(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        debug!("announcer observed shutdown");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match socket.send_to(&payload, target).await {
                        Ok(_) => debug!(addr = %target, bytes = payload.len(), "announce sent"),
                        Err(e) => warn!(addr = %target, error = %e, "announce failed"),
                    }
                }
            }
        }
    }))
}
