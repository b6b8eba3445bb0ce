// src/service.rs
//
// Composition root. Builds every component from one `BridgeConfig` and runs
// the start/stop sequence around them. All background tasks share a single
// shutdown channel.

use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::announce::spawn_announcer;
use crate::error::{BridgeError, Result};
use crate::io::socketcan::SocketProvider;
use crate::link_setup::{setup_with_retry, LinkConfigurator};
use crate::listener::MessageListener;
use crate::monitor::Monitor;
use crate::registry::{InitReport, InterfaceRegistry};
use crate::sender::MessageSender;
use crate::settings::BridgeConfig;
use crate::watchdog::Watchdog;

pub struct BridgeService {
    config: BridgeConfig,
    registry: Arc<InterfaceRegistry>,
    sender: Arc<MessageSender>,
    listener: Arc<MessageListener>,
    watchdog: Arc<Watchdog>,
    monitor: Arc<Monitor>,
    link: Arc<dyn LinkConfigurator>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeService {
    pub fn new(
        config: BridgeConfig,
        provider: Arc<dyn SocketProvider>,
        link: Arc<dyn LinkConfigurator>,
    ) -> Self {
        let registry = Arc::new(InterfaceRegistry::new(
            config.can_ports.clone(),
            config.registry.clone(),
            provider.clone(),
        ));
        let sender = Arc::new(MessageSender::new(registry.clone()));
        let listener = Arc::new(MessageListener::new(provider, config.listener.clone()));
        let watchdog = Arc::new(Watchdog::new(registry.clone(), config.watchdog.clone()));
        let monitor = Arc::new(Monitor::new(registry.clone(), watchdog.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            registry,
            sender,
            listener,
            watchdog,
            monitor,
            link,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    pub fn sender(&self) -> &Arc<MessageSender> {
        &self.sender
    }

    pub fn listener(&self) -> &Arc<MessageListener> {
        &self.listener
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn link(&self) -> &Arc<dyn LinkConfigurator> {
        &self.link
    }

    /// Receiver that flips to `true` when `stop` begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Bring the bridge up. Individual interface or link failures are
    /// logged; the service still starts with whatever came up.
    pub async fn start(&self) -> Result<Option<InitReport>> {
        self.shutdown_tx.send_replace(false);

        if self.config.auto_setup {
            self.setup_links().await;
        }

        let registry = self.registry.clone();
        let report = match tokio::task::spawn_blocking(move || registry.initialize_all()).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                warn!(error = %e, "continuing without CAN interfaces");
                None
            }
            Err(e) => {
                return Err(BridgeError::transport(
                    "*",
                    "initialize",
                    io::Error::new(io::ErrorKind::Other, e.to_string()),
                ))
            }
        };

        self.watchdog.start(self.shutdown_tx.subscribe());

        if self.config.listener.listen_on_start {
            for device in self.registry.interfaces() {
                if let Err(e) = self.listener.start_listening(device.name()) {
                    warn!(interface = %device.name(), error = %e, "failed to start listener");
                }
            }
        }

        if self.config.announce.enabled {
            match spawn_announcer(self.config.announce.clone(), self.shutdown_tx.subscribe()).await {
                Ok(handle) => self.tasks.lock().push(handle),
                Err(e) => warn!(error = %e, "LAN announce disabled"),
            }
        }

        if self.config.status_interval_secs > 0 {
            let handle = self.spawn_status_logger(Duration::from_secs(self.config.status_interval_secs));
            self.tasks.lock().push(handle);
        }

        info!(
            configured = self.config.can_ports.len(),
            active = self.registry.interface_count(),
            "bridge started"
        );
        Ok(report)
    }

    async fn setup_links(&self) {
        let params = self.config.link.params();
        for port in &self.config.can_ports {
            match setup_with_retry(self.link.as_ref(), port, &params, &self.config.link).await {
                Ok(state) => debug!(
                    interface = %port,
                    bitrate = ?state.bitrate,
                    can_state = ?state.can_state,
                    "link ready"
                ),
                Err(e) => warn!(interface = %port, error = %e, "link setup failed"),
            }
        }
    }

    fn spawn_status_logger(&self, period: Duration) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let monitor = monitor.clone();
                        match tokio::task::spawn_blocking(move || monitor.get_health_summary()).await {
                            Ok(summary) => info!(
                                overall = ?summary.overall_health,
                                active = summary.active_interfaces,
                                total = summary.total_interfaces,
                                healthy = summary.health_distribution.healthy,
                                warning = summary.health_distribution.warning,
                                critical = summary.health_distribution.critical,
                                uptime_secs = summary.uptime_secs,
                                "bridge status"
                            ),
                            Err(e) => warn!(error = %e, "status check panicked"),
                        }
                    }
                }
            }
        })
    }

    /// Stop background work, close listeners and release every socket.
    pub async fn stop(&self) {
        info!("stopping bridge");
        self.shutdown_tx.send_replace(true);

        self.watchdog.stop().await;

        if let Err(e) = self.listener.shutdown().await {
            warn!(error = %e, "listener shutdown reported errors");
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.registry.cleanup();
        info!("bridge stopped");
    }
}
