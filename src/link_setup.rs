// src/link_setup.rs
//
// OS-level CAN link configuration through iproute2.
//
// Brings interfaces down/up, sets bitrate, sample point and automatic
// bus-off restart, and reads link state back from `ip -details` output.
// Commands go through `CommandExecutor` so the flow can be scripted in tests.
//
// Requires CAP_NET_ADMIN (or root) for anything other than reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

/// Bitrates accepted by the configuration layer
pub const STANDARD_BITRATES: [u32; 8] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 1_000_000,
];

/// Pause after bringing a link down before reconfiguring it
const SETTLE_DELAY: Duration = Duration::from_millis(500);

// ============================================================================
// Types and Configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LinkSetupConfig {
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_sample_point")]
    pub sample_point: String,
    /// Automatic bus-off restart delay (0 disables)
    #[serde(default = "default_restart_ms")]
    pub restart_ms: u32,
    /// Per-command timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_bitrate() -> u32 {
    1_000_000
}

fn default_sample_point() -> String {
    "0.75".to_string()
}

fn default_restart_ms() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for LinkSetupConfig {
    fn default() -> Self {
        Self {
            bitrate: default_bitrate(),
            sample_point: default_sample_point(),
            restart_ms: default_restart_ms(),
            timeout_secs: default_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl LinkSetupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn params(&self) -> LinkParams {
        LinkParams {
            bitrate: self.bitrate,
            sample_point: Some(self.sample_point.clone()).filter(|s| !s.is_empty()),
            restart_ms: Some(self.restart_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !STANDARD_BITRATES.contains(&self.bitrate) {
            return Err(BridgeError::config(format!(
                "invalid bitrate {}; valid values: {:?}",
                self.bitrate, STANDARD_BITRATES
            )));
        }
        if !self.sample_point.is_empty() {
            let sp: f64 = self.sample_point.parse().map_err(|_| {
                BridgeError::config(format!("invalid sample point {:?}", self.sample_point))
            })?;
            if sp <= 0.0 || sp >= 1.0 {
                return Err(BridgeError::config(format!(
                    "sample point must be between 0 and 1, got {}",
                    self.sample_point
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(BridgeError::config("link command timeout must be positive"));
        }
        if self.retry_attempts == 0 {
            return Err(BridgeError::config("link setup retry attempts must be positive"));
        }
        Ok(())
    }
}

/// Requested link parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkParams {
    pub bitrate: u32,
    pub sample_point: Option<String>,
    pub restart_ms: Option<u32>,
}

/// Link state as reported by `ip -details link show`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkState {
    pub name: String,
    pub is_up: bool,
    pub bitrate: Option<u32>,
    pub sample_point: Option<String>,
    pub oper_state: String,
    /// Controller state, e.g. ERROR-ACTIVE or BUS-OFF
    pub can_state: Option<String>,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub restart_ms: Option<u32>,
}

impl LinkState {
    /// BUS-OFF, or any ERROR-* state other than ERROR-ACTIVE.
    pub fn in_error_state(&self) -> bool {
        match self.can_state.as_deref() {
            Some("ERROR-ACTIVE") | None => false,
            Some(state) => state == "BUS-OFF" || state.starts_with("ERROR"),
        }
    }
}

// ============================================================================
// Command Execution
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `program` with `args`. Exceeding `timeout` is `TimedOut`.
    async fn execute(&self, program: &str, args: &[String], timeout: Duration)
        -> io::Result<CommandOutput>;
}

/// Runs real processes through tokio.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn execute(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> io::Result<CommandOutput> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, child).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} timed out after {:?}", program, timeout),
            )
        })??;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

// ============================================================================
// Configurator
// ============================================================================

#[async_trait]
pub trait LinkConfigurator: Send + Sync {
    async fn setup(&self, name: &str, params: &LinkParams) -> Result<LinkState>;
    async fn teardown(&self, name: &str) -> Result<()>;
    async fn reset(&self, name: &str) -> Result<()>;
    async fn get_state(&self, name: &str) -> Result<LinkState>;
    async fn list_available(&self) -> Result<Vec<String>>;
}

/// `LinkConfigurator` backed by the `ip` tool.
pub struct IpLinkConfigurator<E = SystemCommandExecutor> {
    executor: E,
    config: LinkSetupConfig,
    settle_delay: Duration,
}

impl IpLinkConfigurator<SystemCommandExecutor> {
    pub fn new(config: LinkSetupConfig) -> Self {
        Self::with_executor(config, SystemCommandExecutor)
    }
}

impl<E: CommandExecutor> IpLinkConfigurator<E> {
    pub fn with_executor(config: LinkSetupConfig, executor: E) -> Self {
        Self {
            executor,
            config,
            settle_delay: SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn config(&self) -> &LinkSetupConfig {
        &self.config
    }

    async fn exec(&self, name: &str, program: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        debug!(interface = %name, command = %format!("{} {}", program, args.join(" ")), "running");

        let output = self
            .executor
            .execute(program, &args, self.config.timeout())
            .await
            .map_err(|e| BridgeError::link(name, format!("{}: {}", program, e)))?;

        if !output.success {
            let detail = if !output.stderr.trim().is_empty() {
                output.stderr.trim().to_string()
            } else {
                output.stdout.trim().to_string()
            };
            return Err(BridgeError::link(
                name,
                format!("{} {} failed: {}", program, args.join(" "), detail),
            ));
        }
        Ok(output.stdout)
    }

    async fn bring_down(&self, name: &str) -> Result<()> {
        match self.exec(name, "ip", &["link", "set", name, "down"]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(interface = %name, error = %e, "ip link down failed, trying ifconfig");
                self.exec(name, "ifconfig", &[name, "down"]).await.map(|_| ())
            }
        }
    }

    async fn bring_up(&self, name: &str) -> Result<()> {
        self.exec(name, "ip", &["link", "set", name, "up"]).await.map(|_| ())
    }

    /// `setup` with the configured number of attempts and delay.
    pub async fn setup_with_retry(&self, name: &str, params: &LinkParams) -> Result<LinkState> {
        setup_with_retry(self, name, params, &self.config).await
    }
}

/// Run `link.setup` up to `config.retry_attempts` times, sleeping
/// `config.retry_delay()` between attempts.
pub async fn setup_with_retry(
    link: &dyn LinkConfigurator,
    name: &str,
    params: &LinkParams,
    config: &LinkSetupConfig,
) -> Result<LinkState> {
    let attempts = config.retry_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match link.setup(name, params).await {
            Ok(state) => return Ok(state),
            Err(e) => {
                warn!(interface = %name, attempt, max_attempts = attempts, error = %e, "link setup failed");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(config.retry_delay()).await;
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

#[async_trait]
impl<E: CommandExecutor> LinkConfigurator for IpLinkConfigurator<E> {
    async fn setup(&self, name: &str, params: &LinkParams) -> Result<LinkState> {
        self.exec(name, "ip", &["link", "show", name])
            .await
            .map_err(|_| BridgeError::link(name, "interface does not exist"))?;

        let current = self.get_state(name).await?;
        if current.is_up && current.bitrate == Some(params.bitrate) {
            info!(interface = %name, bitrate = params.bitrate, "link already configured");
            return Ok(current);
        }

        if current.is_up {
            self.bring_down(name).await?;
            tokio::time::sleep(self.settle_delay).await;
        }

        let bitrate = params.bitrate.to_string();
        let restart;
        let mut args = vec!["link", "set", name, "type", "can", "bitrate", bitrate.as_str()];
        if let Some(sp) = params.sample_point.as_deref() {
            args.extend(["sample-point", sp]);
        }
        if let Some(ms) = params.restart_ms {
            restart = ms.to_string();
            args.extend(["restart-ms", restart.as_str()]);
        }
        self.exec(name, "ip", &args).await?;
        self.bring_up(name).await?;

        let state = self.get_state(name).await?;
        if !state.is_up {
            return Err(BridgeError::link(name, "interface did not come up"));
        }
        if state.bitrate != Some(params.bitrate) {
            return Err(BridgeError::link(
                name,
                format!(
                    "bitrate mismatch: expected {}, got {:?}",
                    params.bitrate, state.bitrate
                ),
            ));
        }
        if state.in_error_state() {
            return Err(BridgeError::link(
                name,
                format!(
                    "controller in error state {}",
                    state.can_state.as_deref().unwrap_or_default()
                ),
            ));
        }

        info!(interface = %name, bitrate = params.bitrate, "link configured");
        Ok(state)
    }

    async fn teardown(&self, name: &str) -> Result<()> {
        self.bring_down(name).await?;
        info!(interface = %name, "link down");
        Ok(())
    }

    async fn reset(&self, name: &str) -> Result<()> {
        self.bring_down(name).await?;
        tokio::time::sleep(self.settle_delay).await;
        self.bring_up(name).await?;
        info!(interface = %name, "link reset");
        Ok(())
    }

    async fn get_state(&self, name: &str) -> Result<LinkState> {
        let output = self
            .exec(name, "ip", &["-details", "-statistics", "link", "show", name])
            .await?;
        Ok(parse_link_state(name, &output))
    }

    async fn list_available(&self) -> Result<Vec<String>> {
        let output = self
            .exec("*", "ip", &["link", "show", "type", "can"])
            .await?;
        Ok(parse_can_interfaces(&output))
    }
}

// ============================================================================
// Output Parsing
// ============================================================================

/// Parse `ip -details [-statistics] link show <name>` output.
pub fn parse_link_state(name: &str, output: &str) -> LinkState {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    let after = |i: usize| tokens.get(i + 1).copied();

    let mut state = LinkState {
        name: name.to_string(),
        ..LinkState::default()
    };
    let mut flags_up = false;
    let mut in_berr = false;

    for (i, token) in tokens.iter().enumerate() {
        match *token {
            t if t.starts_with('<') && t.ends_with('>') && state.oper_state.is_empty() => {
                flags_up = t
                    .trim_matches(|c| c == '<' || c == '>')
                    .split(',')
                    .any(|f| f == "UP");
            }
            "state" => {
                let value = after(i).map(|v| v.to_string());
                if i > 0 && tokens[i - 1] == "can" {
                    state.can_state = value;
                } else if state.oper_state.is_empty() {
                    state.oper_state = value.unwrap_or_default();
                }
            }
            "bitrate" if state.bitrate.is_none() => {
                state.bitrate = after(i).and_then(|v| v.parse().ok());
            }
            "sample-point" if state.sample_point.is_none() => {
                state.sample_point = after(i).map(|v| v.to_string());
            }
            "restart-ms" => {
                state.restart_ms = after(i).and_then(|v| v.parse().ok());
            }
            "(berr-counter" => in_berr = true,
            "tx" if in_berr => {
                state.tx_errors = after(i).and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            "rx" if in_berr => {
                state.rx_errors = after(i)
                    .and_then(|v| v.trim_end_matches(')').parse().ok())
                    .unwrap_or(0);
                in_berr = false;
            }
            _ => {}
        }
    }

    state.is_up = flags_up || state.oper_state == "UP";
    state
}

/// Interface names from `ip link show type can` output.
pub fn parse_can_interfaces(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let index = parts.next()?.trim();
            let name = parts.next()?.trim();
            if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) || name.is_empty() {
                return None;
            }
            Some(name.split('@').next().unwrap_or(name).to_string())
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};

    const CAN0_UP: &str = "\
3: can0: <NOARP,UP,LOWER_UP,ECHO> mtu 16 qdisc pfifo_fast state UP mode DEFAULT group default qlen 10
    link/can  promiscuity 0 minmtu 0 maxmtu 0
    can state ERROR-ACTIVE (berr-counter tx 3 rx 7) restart-ms 100
          bitrate 1000000 sample-point 0.750
          tq 12 prop-seg 29 phase-seg1 30 phase-seg2 20 sjw 1
    RX: bytes  packets  errors  dropped overrun mcast
    0          0        0       0       0       0
    TX: bytes  packets  errors  dropped carrier collsns
    0          0        0       0       0       0
";

    const CAN0_DOWN_500K: &str = "\
3: can0: <NOARP,ECHO> mtu 16 qdisc pfifo_fast state DOWN mode DEFAULT group default qlen 10
    link/can  promiscuity 0 minmtu 0 maxmtu 0
    can state STOPPED restart-ms 0
          bitrate 500000 sample-point 0.875
";

    const CAN0_BUS_OFF: &str = "\
3: can0: <NOARP,UP,LOWER_UP,ECHO> mtu 16 qdisc pfifo_fast state UP mode DEFAULT group default qlen 10
    can state BUS-OFF (berr-counter tx 255 rx 0) restart-ms 100
          bitrate 1000000 sample-point 0.750
";

    #[derive(Default)]
    struct ScriptedExecutor {
        responses: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        fn respond(&self, command: &str, success: bool, stdout: &str) {
            self.responses
                .lock()
                .entry(command.to_string())
                .or_default()
                .push_back(CommandOutput {
                    success,
                    stdout: stdout.to_string(),
                    stderr: if success { String::new() } else { "RTNETLINK answers: Operation not permitted".into() },
                });
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
        ) -> io::Result<CommandOutput> {
            let command = format!("{} {}", program, args.join(" "));
            self.calls.lock().push(command.clone());

            let mut responses = self.responses.lock();
            let queue = responses.get_mut(&command).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("unscripted: {}", command))
            })?;
            // The last scripted response repeats
            if queue.len() > 1 {
                Ok(queue.pop_front().unwrap_or_default())
            } else {
                Ok(queue.front().cloned().unwrap_or_default())
            }
        }
    }

    fn configurator(executor: ScriptedExecutor) -> IpLinkConfigurator<ScriptedExecutor> {
        IpLinkConfigurator::with_executor(
            LinkSetupConfig {
                retry_delay_ms: 0,
                ..LinkSetupConfig::default()
            },
            executor,
        )
        .with_settle_delay(Duration::ZERO)
    }

    const SHOW: &str = "ip link show can0";
    const DETAILS: &str = "ip -details -statistics link show can0";
    const CONFIGURE: &str = "ip link set can0 type can bitrate 1000000 sample-point 0.75 restart-ms 100";

    #[test]
    fn test_parse_link_state_up() {
        let state = parse_link_state("can0", CAN0_UP);
        assert!(state.is_up);
        assert_eq!(state.oper_state, "UP");
        assert_eq!(state.can_state.as_deref(), Some("ERROR-ACTIVE"));
        assert_eq!(state.bitrate, Some(1_000_000));
        assert_eq!(state.sample_point.as_deref(), Some("0.750"));
        assert_eq!(state.restart_ms, Some(100));
        assert_eq!(state.tx_errors, 3);
        assert_eq!(state.rx_errors, 7);
        assert!(!state.in_error_state());
    }

    #[test]
    fn test_parse_link_state_down() {
        let state = parse_link_state("can0", CAN0_DOWN_500K);
        assert!(!state.is_up);
        assert_eq!(state.oper_state, "DOWN");
        assert_eq!(state.can_state.as_deref(), Some("STOPPED"));
        assert_eq!(state.bitrate, Some(500_000));
        assert_eq!(state.restart_ms, Some(0));
        assert_eq!(state.tx_errors, 0);
    }

    #[test]
    fn test_bus_off_is_error_state() {
        let state = parse_link_state("can0", CAN0_BUS_OFF);
        assert!(state.in_error_state());
        assert_eq!(state.tx_errors, 255);
    }

    #[test]
    fn test_parse_can_interfaces() {
        let output = "\
3: can0: <NOARP,UP,LOWER_UP,ECHO> mtu 16 qdisc pfifo_fast state UP mode DEFAULT group default qlen 10
    link/can
4: can1: <NOARP,ECHO> mtu 16 qdisc noop state DOWN mode DEFAULT group default qlen 10
    link/can
7: vcan0@can1: <NOARP> mtu 72 qdisc noop state DOWN
";
        assert_eq!(parse_can_interfaces(output), vec!["can0", "can1", "vcan0"]);
        assert!(parse_can_interfaces("").is_empty());
    }

    #[tokio::test]
    async fn test_setup_skips_configured_link() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, true, CAN0_UP);
        executor.respond(DETAILS, true, CAN0_UP);

        let link = configurator(executor);
        let state = link.setup("can0", &link.config().params()).await.unwrap();
        assert!(state.is_up);
        assert_eq!(link.executor.calls(), vec![SHOW.to_string(), DETAILS.to_string()]);
    }

    #[tokio::test]
    async fn test_setup_full_flow() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, true, CAN0_UP);
        executor.respond(DETAILS, true, &CAN0_UP.replace("1000000", "500000"));
        executor.respond(DETAILS, true, CAN0_UP);
        executor.respond("ip link set can0 down", true, "");
        executor.respond(CONFIGURE, true, "");
        executor.respond("ip link set can0 up", true, "");

        let link = configurator(executor);
        let state = link.setup("can0", &link.config().params()).await.unwrap();
        assert_eq!(state.bitrate, Some(1_000_000));
        assert_eq!(
            link.executor.calls(),
            vec![
                SHOW.to_string(),
                DETAILS.to_string(),
                "ip link set can0 down".to_string(),
                CONFIGURE.to_string(),
                "ip link set can0 up".to_string(),
                DETAILS.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_setup_down_link_is_not_brought_down() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, true, CAN0_DOWN_500K);
        executor.respond(DETAILS, true, CAN0_DOWN_500K);
        executor.respond(DETAILS, true, CAN0_UP);
        executor.respond(CONFIGURE, true, "");
        executor.respond("ip link set can0 up", true, "");

        let link = configurator(executor);
        link.setup("can0", &link.config().params()).await.unwrap();
        assert!(!link.executor.calls().iter().any(|c| c.ends_with("down")));
    }

    #[tokio::test]
    async fn test_setup_rejects_bus_off() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, true, CAN0_DOWN_500K);
        executor.respond(DETAILS, true, CAN0_DOWN_500K);
        executor.respond(DETAILS, true, CAN0_BUS_OFF);
        executor.respond(CONFIGURE, true, "");
        executor.respond("ip link set can0 up", true, "");

        let link = configurator(executor);
        let err = link.setup("can0", &link.config().params()).await.unwrap_err();
        assert!(err.to_string().contains("BUS-OFF"));
    }

    #[tokio::test]
    async fn test_setup_missing_interface() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, false, "");

        let link = configurator(executor);
        let err = link.setup("can0", &link.config().params()).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[tokio::test]
    async fn test_teardown_falls_back_to_ifconfig() {
        let executor = ScriptedExecutor::default();
        executor.respond("ip link set can0 down", false, "");
        executor.respond("ifconfig can0 down", true, "");

        let link = configurator(executor);
        link.teardown("can0").await.unwrap();
        assert_eq!(link.executor.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_cycles_link() {
        let executor = ScriptedExecutor::default();
        executor.respond("ip link set can0 down", true, "");
        executor.respond("ip link set can0 up", true, "");

        let link = configurator(executor);
        link.reset("can0").await.unwrap();
        assert_eq!(
            link.executor.calls(),
            vec!["ip link set can0 down".to_string(), "ip link set can0 up".to_string()]
        );
    }

    #[tokio::test]
    async fn test_setup_with_retry_exhausts() {
        let executor = ScriptedExecutor::default();
        executor.respond(SHOW, false, "");

        let link = configurator(executor);
        match link.setup_with_retry("can0", &link.config().params()).await {
            Err(BridgeError::SetupExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected SetupExhausted, got {:?}", other),
        }
        assert_eq!(link.executor.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_list_available() {
        let executor = ScriptedExecutor::default();
        executor.respond("ip link show type can", true, CAN0_UP);

        let link = configurator(executor);
        assert_eq!(link.list_available().await.unwrap(), vec!["can0"]);
    }

    #[test]
    fn test_config_validation() {
        assert!(LinkSetupConfig::default().validate().is_ok());

        let bad_bitrate = LinkSetupConfig {
            bitrate: 333_333,
            ..LinkSetupConfig::default()
        };
        assert!(bad_bitrate.validate().is_err());

        for sp in ["0", "1.0", "abc", "-0.5"] {
            let config = LinkSetupConfig {
                sample_point: sp.to_string(),
                ..LinkSetupConfig::default()
            };
            assert!(config.validate().is_err(), "{}", sp);
        }

        let no_retry = LinkSetupConfig {
            retry_attempts: 0,
            ..LinkSetupConfig::default()
        };
        assert!(no_retry.validate().is_err());
    }

    #[test]
    fn test_params_from_config() {
        let params = LinkSetupConfig::default().params();
        assert_eq!(params.bitrate, 1_000_000);
        assert_eq!(params.sample_point.as_deref(), Some("0.75"));
        assert_eq!(params.restart_ms, Some(100));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_executor() {
        let executor = SystemCommandExecutor;
        let output = executor
            .execute("sh", &["-c".into(), "echo hello".into()], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");

        let err = executor
            .execute("sleep", &["5".into()], Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
