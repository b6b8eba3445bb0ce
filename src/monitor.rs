// src/monitor.rs
//
// Read-only status aggregation over the registry, metrics and watchdog.
// The only side effect is one health probe per active interface per call,
// whose outcome feeds the per-interface health tracker.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::error::{BridgeError, Result};
use crate::metrics::InterfaceStats;
use crate::registry::InterfaceRegistry;
use crate::watchdog::{RecoveryPhase, Watchdog};

// ============================================================================
// Health Classification
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

/// >= 95% passed: healthy, >= 80%: warning, below: critical.
pub fn classify(passed: u64, failed: u64) -> HealthStatus {
    let total = passed + failed;
    if total == 0 {
        return HealthStatus::Unknown;
    }
    let ratio = passed as f64 / total as f64;
    if ratio >= 0.95 {
        HealthStatus::Healthy
    } else if ratio >= 0.80 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    }
}

#[derive(Clone, Debug, Default)]
struct HealthTracker {
    checks_passed: u64,
    checks_failed: u64,
    last_check: Option<DateTime<Utc>>,
    last_healthy: Option<DateTime<Utc>>,
}

impl HealthTracker {
    fn record(&mut self, healthy: bool) {
        let now = Utc::now();
        self.last_check = Some(now);
        if healthy {
            self.checks_passed += 1;
            self.last_healthy = Some(now);
        } else {
            self.checks_failed += 1;
        }
    }

    fn report(&self, active: bool) -> InterfaceHealth {
        InterfaceHealth {
            status: if active {
                classify(self.checks_passed, self.checks_failed)
            } else {
                HealthStatus::Critical
            },
            checks_passed: self.checks_passed,
            checks_failed: self.checks_failed,
            last_check: self.last_check,
            last_healthy: self.last_healthy,
        }
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceHealth {
    pub status: HealthStatus,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_healthy: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub name: String,
    pub active: bool,
    #[serde(flatten)]
    pub stats: Option<InterfaceStats>,
    /// Formatted as e.g. "99.50%"
    pub success_rate: String,
    pub health: InterfaceHealth,
    pub recovery_attempts: u32,
    pub recovery_phase: RecoveryPhase,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchdogStatus {
    pub running: bool,
    pub check_interval_secs: u64,
    pub recovery_enabled: bool,
    pub max_recovery_attempts: u32,
    pub recovery_attempts: BTreeMap<String, u32>,
    pub recovery_phases: BTreeMap<String, RecoveryPhase>,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub interfaces: BTreeMap<String, InterfaceStatus>,
    pub active_interfaces: usize,
    pub configured_ports: Vec<String>,
    pub available_interfaces: Vec<String>,
    pub watchdog: WatchdogStatus,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HealthDistribution {
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub unknown: usize,
}

impl HealthDistribution {
    fn add(&mut self, status: HealthStatus) {
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Warning => self.warning += 1,
            HealthStatus::Critical => self.critical += 1,
            HealthStatus::Unknown => self.unknown += 1,
        }
    }

    /// Worst tier present; unknown only when nothing else is.
    fn overall(&self) -> HealthStatus {
        if self.critical > 0 {
            HealthStatus::Critical
        } else if self.warning > 0 {
            HealthStatus::Warning
        } else if self.healthy > 0 {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unknown
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub overall_health: HealthStatus,
    pub total_interfaces: usize,
    pub active_interfaces: usize,
    pub health_distribution: HealthDistribution,
    pub uptime_secs: u64,
    pub watchdog_active: bool,
}

// ============================================================================
// Monitor
// ============================================================================

pub struct Monitor {
    registry: Arc<InterfaceRegistry>,
    watchdog: Arc<Watchdog>,
    started: Instant,
    trackers: Mutex<HashMap<String, HealthTracker>>,
}

impl Monitor {
    pub fn new(registry: Arc<InterfaceRegistry>, watchdog: Arc<Watchdog>) -> Self {
        Self {
            registry,
            watchdog,
            started: Instant::now(),
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Configured ports plus anything else currently registered.
    fn known_interfaces(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.registry.configured_ports().iter().cloned().collect();
        names.extend(self.registry.interfaces().iter().map(|d| d.name().to_string()));
        names
    }

    /// Probe `name` if it is active and return its health report.
    fn probe(&self, name: &str) -> (bool, InterfaceHealth) {
        let active = self.registry.is_active(name);
        if active {
            let healthy = self.registry.check_health(name);
            self.trackers
                .lock()
                .entry(name.to_string())
                .or_default()
                .record(healthy);
        }

        let report = self
            .trackers
            .lock()
            .get(name)
            .cloned()
            .unwrap_or_default()
            .report(active);
        (active, report)
    }

    fn build_interface_status(&self, name: &str) -> InterfaceStatus {
        let (active, health) = self.probe(name);
        let stats = self
            .registry
            .get_interface(name)
            .map(|device| device.metrics().snapshot());
        let success_rate = stats.as_ref().map(|s| s.success_rate()).unwrap_or(0.0);

        InterfaceStatus {
            name: name.to_string(),
            active,
            stats,
            success_rate: format!("{:.2}%", success_rate),
            health,
            recovery_attempts: self.watchdog.recovery_attempts(name),
            recovery_phase: self.watchdog.phase(name),
        }
    }

    fn watchdog_status(&self) -> WatchdogStatus {
        let config = self.watchdog.config();
        WatchdogStatus {
            running: self.watchdog.is_running(),
            check_interval_secs: config.check_interval_secs,
            recovery_enabled: config.recovery_enabled,
            max_recovery_attempts: config.max_recovery_attempts,
            recovery_attempts: self.watchdog.recovery_status(),
            recovery_phases: self.watchdog.phases(),
            last_check: self.watchdog.last_check(),
        }
    }

    pub fn get_system_status(&self) -> SystemStatus {
        let interfaces: BTreeMap<_, _> = self
            .known_interfaces()
            .into_iter()
            .map(|name| {
                let status = self.build_interface_status(&name);
                (name, status)
            })
            .collect();

        let available: Vec<String> = self
            .registry
            .interfaces()
            .iter()
            .map(|d| d.name().to_string())
            .collect();

        SystemStatus {
            active_interfaces: available.len(),
            interfaces,
            configured_ports: self.registry.configured_ports().to_vec(),
            available_interfaces: available,
            watchdog: self.watchdog_status(),
            uptime_secs: self.started.elapsed().as_secs(),
            timestamp: Utc::now(),
        }
    }

    pub fn get_interface_status(&self, name: &str) -> Result<InterfaceStatus> {
        if !self.registry.is_configured(name) && !self.registry.is_active(name) {
            return Err(BridgeError::UnconfiguredInterface {
                name: name.to_string(),
                configured: self.registry.configured_ports().to_vec(),
            });
        }
        Ok(self.build_interface_status(name))
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let names = self.known_interfaces();
        let mut distribution = HealthDistribution::default();
        let mut active = 0;

        for name in &names {
            let (is_active, health) = self.probe(name);
            if is_active {
                active += 1;
            }
            distribution.add(health.status);
        }

        HealthSummary {
            overall_health: distribution.overall(),
            total_interfaces: names.len(),
            active_interfaces: active,
            health_distribution: distribution,
            uptime_secs: self.started.elapsed().as_secs(),
            watchdog_active: self.watchdog.is_running(),
        }
    }

    pub fn reset_health_tracking(&self, name: &str) {
        self.trackers.lock().remove(name);
        info!(interface = %name, "health tracking reset");
    }

    pub fn reset_all_health_tracking(&self) {
        self.trackers.lock().clear();
        info!("health tracking reset for all interfaces");
    }
}

// ============================================================================
// Tests
// ============================================================================
