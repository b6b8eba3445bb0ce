// src/watchdog.rs
//
// Background supervisor for registered interfaces.
//
// Per interface: Nominal -> SuspectedDown -> Recovering -> Nominal | RecoveryExhausted
//
// Each tick probes only interfaces with a recent, unanswered send error.
// A failed probe tears the socket down and re-initializes it, up to a
// configured number of attempts. Exhausted interfaces stay parked until
// `reset_recovery`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::registry::{Device, InterfaceRegistry};

// ============================================================================
// Types and Configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchdogConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Errors older than this no longer trigger a probe
    #[serde(default = "default_error_threshold_secs")]
    pub error_threshold_secs: u64,
    #[serde(default = "default_recovery_enabled")]
    pub recovery_enabled: bool,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

fn default_check_interval_secs() -> u64 {
    10
}

fn default_error_threshold_secs() -> u64 {
    30
}

fn default_recovery_enabled() -> bool {
    true
}

fn default_max_recovery_attempts() -> u32 {
    3
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            error_threshold_secs: default_error_threshold_secs(),
            recovery_enabled: default_recovery_enabled(),
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

impl WatchdogConfig {
    /// Tick period, never shorter than one second
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn error_threshold(&self) -> Duration {
        Duration::from_secs(self.error_threshold_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryPhase {
    #[default]
    Nominal,
    SuspectedDown,
    Recovering,
    RecoveryExhausted,
}

#[derive(Clone, Debug, Default)]
struct RecoveryState {
    attempts: u32,
    phase: RecoveryPhase,
}

// ============================================================================
// Watchdog
// ============================================================================

struct WatchdogInner {
    registry: Arc<InterfaceRegistry>,
    config: RwLock<WatchdogConfig>,
    states: Mutex<HashMap<String, RecoveryState>>,
    running: AtomicBool,
    last_check: Mutex<Option<DateTime<Utc>>>,
}

struct WatchdogTask {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct Watchdog {
    inner: Arc<WatchdogInner>,
    task: Mutex<Option<WatchdogTask>>,
}

impl Watchdog {
    pub fn new(registry: Arc<InterfaceRegistry>, config: WatchdogConfig) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                registry,
                config: RwLock::new(config),
                states: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                last_check: Mutex::new(None),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the supervision loop. No-op if already running.
    ///
    /// The loop exits on `stop()` or when `shutdown` flips to true (or its
    /// sender is dropped). Must be called from within a tokio runtime.
    pub fn start(&self, mut shutdown: watch::Receiver<bool>) {
        let mut task = self.task.lock();
        if task.is_some() && self.inner.running.load(Ordering::SeqCst) {
            debug!("watchdog already running");
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let inner = self.inner.clone();
        let period = inner.config.read().check_interval();
        inner.running.store(true, Ordering::SeqCst);

        info!(
            interval_secs = period.as_secs(),
            recovery_enabled = inner.config.read().recovery_enabled,
            "watchdog started"
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => {
                        debug!("watchdog stop requested");
                        break;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            debug!("watchdog observed shutdown");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let cycle = inner.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || cycle.check_interfaces()).await {
                            error!(error = %e, "watchdog cycle panicked");
                        }
                    }
                }
            }

            inner.running.store(false, Ordering::SeqCst);
        });

        *task = Some(WatchdogTask { stop_tx, handle });
    }

    /// Stop the loop and wait for it to exit. No-op if not running.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return;
        };

        let _ = task.stop_tx.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "watchdog task ended abnormally");
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!("watchdog stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Run one supervision cycle on the calling thread.
    pub fn check_interfaces(&self) {
        self.inner.check_interfaces();
    }

    pub fn recovery_attempts(&self, name: &str) -> u32 {
        self.inner
            .states
            .lock()
            .get(name)
            .map(|s| s.attempts)
            .unwrap_or(0)
    }

    pub fn phase(&self, name: &str) -> RecoveryPhase {
        self.inner
            .states
            .lock()
            .get(name)
            .map(|s| s.phase)
            .unwrap_or_default()
    }

    /// Attempt counters for every interface the watchdog has touched.
    pub fn recovery_status(&self) -> BTreeMap<String, u32> {
        self.inner
            .states
            .lock()
            .iter()
            .map(|(name, s)| (name.clone(), s.attempts))
            .collect()
    }

    pub fn phases(&self) -> BTreeMap<String, RecoveryPhase> {
        self.inner
            .states
            .lock()
            .iter()
            .map(|(name, s)| (name.clone(), s.phase))
            .collect()
    }

    /// Manual reset. An interface that is no longer registered goes back to
    /// Recovering with a fresh budget so the next tick retries it.
    pub fn reset_recovery(&self, name: &str) {
        let mut states = self.inner.states.lock();
        if self.inner.registry.is_active(name) {
            states.remove(name);
        } else {
            states.insert(
                name.to_string(),
                RecoveryState {
                    attempts: 0,
                    phase: RecoveryPhase::Recovering,
                },
            );
        }
        info!(interface = %name, "recovery state reset");
    }

    pub fn config(&self) -> WatchdogConfig {
        self.inner.config.read().clone()
    }

    /// Replace the configuration. A new check interval applies from the
    /// next `start`.
    pub fn update_config(&self, config: WatchdogConfig) {
        info!(?config, "watchdog configuration updated");
        *self.inner.config.write() = config;
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        *self.inner.last_check.lock()
    }
}

impl WatchdogInner {
    fn check_interfaces(&self) {
        let config = self.config.read().clone();
        let now = Utc::now();
        *self.last_check.lock() = Some(now);

        let mut handled = HashSet::new();
        for device in self.registry.interfaces() {
            let name = device.name().to_string();
            if !should_check(&device, config.error_threshold(), now) {
                continue;
            }

            self.set_phase(&name, RecoveryPhase::SuspectedDown);
            debug!(interface = %name, "probing interface after recent send error");

            if self.registry.check_health(&name) {
                self.mark_healthy(&name);
            } else {
                self.handle_unhealthy(&name, &config);
            }
            handled.insert(name);
        }

        // Interfaces whose socket a failed recovery already tore down
        for name in self.pending_recoveries() {
            if handled.contains(&name) || self.registry.is_active(&name) {
                continue;
            }
            self.handle_unhealthy(&name, &config);
        }
    }

    fn handle_unhealthy(&self, name: &str, config: &WatchdogConfig) {
        if !config.recovery_enabled {
            warn!(interface = %name, "interface appears unhealthy, automatic recovery disabled");
            return;
        }

        let attempt = {
            let mut states = self.states.lock();
            let state = states.entry(name.to_string()).or_default();
            if state.attempts >= config.max_recovery_attempts {
                if state.phase != RecoveryPhase::RecoveryExhausted {
                    state.phase = RecoveryPhase::RecoveryExhausted;
                    error!(
                        interface = %name,
                        attempts = state.attempts,
                        "max recovery attempts reached, giving up"
                    );
                }
                return;
            }
            state.phase = RecoveryPhase::Recovering;
            state.attempts + 1
        };

        info!(
            interface = %name,
            attempt,
            max_attempts = config.max_recovery_attempts,
            "attempting interface recovery"
        );

        match self.recover(name) {
            Ok(()) => {
                self.states.lock().remove(name);
                info!(interface = %name, "interface recovered");
            }
            Err(e) => {
                let mut states = self.states.lock();
                let state = states.entry(name.to_string()).or_default();
                state.attempts += 1;
                if state.attempts >= config.max_recovery_attempts {
                    state.phase = RecoveryPhase::RecoveryExhausted;
                    error!(
                        interface = %name,
                        attempts = state.attempts,
                        error = %e,
                        "recovery failed, max attempts reached, giving up"
                    );
                } else {
                    state.phase = RecoveryPhase::Recovering;
                    error!(
                        interface = %name,
                        attempts = state.attempts,
                        error = %e,
                        "recovery attempt failed"
                    );
                }
            }
        }
    }

    fn recover(&self, name: &str) -> crate::error::Result<()> {
        if let Err(e) = self.registry.remove_interface(name) {
            debug!(interface = %name, error = %e, "nothing to remove before re-initialization");
        }
        self.registry.initialize_single(name).map(|_| ())
    }

    fn mark_healthy(&self, name: &str) {
        if let Some(previous) = self.states.lock().remove(name) {
            if previous.attempts > 0 {
                info!(interface = %name, "interface healthy again, recovery counter reset");
            }
        }
    }

    fn set_phase(&self, name: &str, phase: RecoveryPhase) {
        let mut states = self.states.lock();
        let state = states.entry(name.to_string()).or_default();
        if state.phase != RecoveryPhase::RecoveryExhausted {
            state.phase = phase;
        }
    }

    fn pending_recoveries(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .states
            .lock()
            .iter()
            .filter(|(_, s)| s.phase == RecoveryPhase::Recovering)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Probe only when the latest error is recent and no send has succeeded since.
fn should_check(device: &Device, threshold: Duration, now: DateTime<Utc>) -> bool {
    let (last_send, last_error) = device.metrics().activity();

    let Some(last_error) = last_error else {
        return false;
    };
    if matches!(last_send, Some(sent) if sent > last_error) {
        return false;
    }

    let age = (now - last_error).to_std().unwrap_or(Duration::ZERO);
    age <= threshold
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::socketcan::mock::MockSocketProvider;
    use crate::registry::tests::registry_with;
    use crate::sender::{CanMessage, MessageSender};

    fn setup(config: WatchdogConfig) -> (MockSocketProvider, Arc<InterfaceRegistry>, Watchdog) {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0", "can1"], &mock);
        registry.initialize_all().unwrap();
        let watchdog = Watchdog::new(registry.clone(), config);
        (mock, registry, watchdog)
    }

    fn fail_a_send(mock: &MockSocketProvider, registry: &Arc<InterfaceRegistry>, name: &str) {
        mock.fail_send(name);
        let sender = MessageSender::new(registry.clone());
        assert!(sender.send(&CanMessage::new(name, 0x100, vec![1])).is_err());
    }

    #[test]
    fn test_should_check_rules() {
        let mock = MockSocketProvider::new();
        let registry = registry_with(&["can0"], &mock);
        let device = registry.initialize_single("can0").unwrap();
        let threshold = Duration::from_secs(30);

        // No error yet
        assert!(!should_check(&device, threshold, Utc::now()));

        // Recent unanswered error
        device.metrics().record_error("network is down");
        assert!(should_check(&device, threshold, Utc::now()));

        // Stale error
        let later = Utc::now() + chrono::Duration::seconds(31);
        assert!(!should_check(&device, threshold, later));

        // Send succeeded after the error
        std::thread::sleep(Duration::from_millis(2));
        device.metrics().record_success(Duration::from_micros(50));
        assert!(!should_check(&device, threshold, Utc::now()));
    }

    #[test]
    fn test_quiet_interfaces_are_not_probed() {
        let (mock, _registry, watchdog) = setup(WatchdogConfig::default());
        watchdog.check_interfaces();
        assert!(mock.sent().is_empty());
        assert!(watchdog.last_check().is_some());
        assert!(watchdog.recovery_status().is_empty());
    }

    #[test]
    fn test_healthy_probe_resets_state() {
        let (mock, registry, watchdog) = setup(WatchdogConfig::default());
        registry
            .get_interface("can0")
            .unwrap()
            .metrics()
            .record_error("transient");

        watchdog.check_interfaces();

        // One probe, no recovery
        assert_eq!(mock.sends_to("can0"), 1);
        assert_eq!(mock.created(), 2);
        assert_eq!(watchdog.phase("can0"), RecoveryPhase::Nominal);
        assert_eq!(watchdog.recovery_attempts("can0"), 0);
    }

    #[test]
    fn test_failed_probe_reinitializes() {
        let (mock, registry, watchdog) = setup(WatchdogConfig::default());
        let before = registry.get_interface("can0").unwrap();
        fail_a_send(&mock, &registry, "can0");

        watchdog.check_interfaces();

        let after = registry.get_interface("can0").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!before.is_open());
        assert_eq!(watchdog.recovery_attempts("can0"), 0);
        assert_eq!(watchdog.phase("can0"), RecoveryPhase::Nominal);

        // Fresh device has no error history, so the next tick is quiet
        let created = mock.created();
        watchdog.check_interfaces();
        assert_eq!(mock.created(), created);
    }

    #[test]
    fn test_recovery_attempts_are_bounded() {
        let (mock, registry, watchdog) = setup(WatchdogConfig::default());
        fail_a_send(&mock, &registry, "can0");
        mock.fail_resolve("can0");

        for expected in 1..=3 {
            watchdog.check_interfaces();
            assert_eq!(watchdog.recovery_attempts("can0"), expected);
        }
        assert_eq!(watchdog.phase("can0"), RecoveryPhase::RecoveryExhausted);
        assert!(!registry.is_active("can0"));

        let created = mock.created();
        for _ in 0..5 {
            watchdog.check_interfaces();
        }
        assert_eq!(watchdog.recovery_attempts("can0"), 3);
        assert_eq!(mock.created(), created);

        // Neighbour untouched
        assert!(registry.is_active("can1"));
        assert_eq!(watchdog.phase("can1"), RecoveryPhase::Nominal);
    }

    #[test]
    fn test_reset_recovery_resumes() {
        let (mock, registry, watchdog) = setup(WatchdogConfig {
            max_recovery_attempts: 1,
            ..WatchdogConfig::default()
        });
        fail_a_send(&mock, &registry, "can0");
        mock.fail_resolve("can0");

        watchdog.check_interfaces();
        assert_eq!(watchdog.phase("can0"), RecoveryPhase::RecoveryExhausted);

        mock.heal_resolve("can0");
        watchdog.check_interfaces();
        assert!(!registry.is_active("can0"));

        watchdog.reset_recovery("can0");
        assert_eq!(watchdog.recovery_attempts("can0"), 0);
        watchdog.check_interfaces();
        assert!(registry.is_active("can0"));
        assert_eq!(watchdog.phase("can0"), RecoveryPhase::Nominal);
    }

    #[test]
    fn test_recovery_disabled_only_logs() {
        let (mock, registry, watchdog) = setup(WatchdogConfig {
            recovery_enabled: false,
            ..WatchdogConfig::default()
        });
        let before = registry.get_interface("can0").unwrap();
        fail_a_send(&mock, &registry, "can0");

        watchdog.check_interfaces();

        let after = registry.get_interface("can0").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(watchdog.recovery_attempts("can0"), 0);
        assert_eq!(mock.created(), 2);
    }

    #[test]
    fn test_update_config() {
        let (_mock, _registry, watchdog) = setup(WatchdogConfig::default());
        let config = WatchdogConfig {
            max_recovery_attempts: 7,
            ..WatchdogConfig::default()
        };
        watchdog.update_config(config.clone());
        assert_eq!(watchdog.config(), config);
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (_mock, _registry, watchdog) = setup(WatchdogConfig::default());
        let (_tx, rx) = watch::channel(false);

        watchdog.stop().await;
        assert!(!watchdog.is_running());

        watchdog.start(rx.clone());
        assert!(watchdog.is_running());
        watchdog.start(rx);
        assert!(watchdog.is_running());

        watchdog.stop().await;
        assert!(!watchdog.is_running());
        watchdog.stop().await;
        assert!(!watchdog.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_loop_ticks_and_obeys_shutdown() {
        let (_mock, _registry, watchdog) = setup(WatchdogConfig {
            check_interval_secs: 1,
            ..WatchdogConfig::default()
        });
        let (tx, rx) = watch::channel(false);

        watchdog.start(rx);
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert!(watchdog.last_check().is_some());

        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!watchdog.is_running());
        watchdog.stop().await;
    }

    #[test]
    fn test_config_defaults() {
        let config: WatchdogConfig = toml::from_str("").unwrap();
        assert_eq!(config, WatchdogConfig::default());
        assert_eq!(config.check_interval(), Duration::from_secs(10));
        assert_eq!(config.error_threshold(), Duration::from_secs(30));
        assert!(config.recovery_enabled);
        assert_eq!(config.max_recovery_attempts, 3);
    }
}
