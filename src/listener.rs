// src/listener.rs
//
// Passive capture: one dedicated raw socket and one blocking capture loop per
// interface, draining inbound frames into a bounded ring buffer.
//
// Capture sockets are independent of the send-path devices in the registry,
// so inbound traffic never contends with outbound sends.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::io::socketcan::{
    consts, decode_frame, is_timeout, open_bound, CanSocket, Frame, SocketProvider,
};

// ============================================================================
// Types and Configuration
// ============================================================================

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListenerConfig {
    /// Ring buffer capacity per interface
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Start capturing on every active port when the service starts
    #[serde(default)]
    pub listen_on_start: bool,
}

fn default_buffer_size() -> usize {
    100
}

fn default_read_timeout_ms() -> u64 {
    1000
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_timeout_ms: default_read_timeout_ms(),
            listen_on_start: false,
        }
    }
}

impl ListenerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Rx,
    Tx,
}

/// One captured frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageLog {
    pub interface: String,
    pub id: u32,
    #[serde(serialize_with = "serialize_hex")]
    pub data: Vec<u8>,
    pub length: u8,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
}

impl MessageLog {
    pub fn received(interface: &str, frame: &Frame) -> Self {
        Self {
            interface: interface.to_string(),
            id: frame.id(),
            data: frame.payload().to_vec(),
            length: frame.len() as u8,
            timestamp: Utc::now(),
            direction: Direction::Rx,
        }
    }
}

fn serialize_hex<S: serde::Serializer>(data: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(data))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatistics {
    pub interface: String,
    pub total_received: u64,
    pub buffered_count: usize,
    pub max_buffer_size: usize,
    /// Buffered / capacity, in percent
    pub buffer_usage: f64,
}

// ============================================================================
// Ring Buffer
// ============================================================================

struct BufferInner {
    messages: VecDeque<MessageLog>,
    total_received: u64,
}

/// Bounded FIFO of captured messages. Reads return copies.
pub struct MessageBuffer {
    interface: String,
    capacity: usize,
    inner: Mutex<BufferInner>,
}

impl MessageBuffer {
    pub fn new(interface: &str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            interface: interface.to_string(),
            capacity,
            inner: Mutex::new(BufferInner {
                messages: VecDeque::with_capacity(capacity),
                total_received: 0,
            }),
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn add(&self, message: MessageLog) {
        let mut inner = self.inner.lock();
        if inner.messages.len() >= self.capacity {
            inner.messages.pop_front();
        }
        inner.messages.push_back(message);
        inner.total_received += 1;
    }

    pub fn messages(&self) -> Vec<MessageLog> {
        self.inner.lock().messages.iter().cloned().collect()
    }

    /// Last `count` messages, oldest first. Empty for `count <= 0`.
    pub fn recent(&self, count: i64) -> Vec<MessageLog> {
        if count <= 0 {
            return Vec::new();
        }
        let inner = self.inner.lock();
        let skip = inner.messages.len().saturating_sub(count as usize);
        inner.messages.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self) -> BufferStatistics {
        let inner = self.inner.lock();
        let buffered = inner.messages.len();
        BufferStatistics {
            interface: self.interface.clone(),
            total_received: inner.total_received,
            buffered_count: buffered,
            max_buffer_size: self.capacity,
            buffer_usage: buffered as f64 / self.capacity as f64 * 100.0,
        }
    }

    /// Drop every message and reset the received counter.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.messages.clear();
        inner.total_received = 0;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Listener
// ============================================================================

struct ListenerHandle {
    stop_flag: Arc<AtomicBool>,
    task: JoinHandle<io::Result<()>>,
}

pub struct MessageListener {
    provider: Arc<dyn SocketProvider>,
    config: ListenerConfig,
    buffers: RwLock<HashMap<String, Arc<MessageBuffer>>>,
    listeners: Mutex<HashMap<String, ListenerHandle>>,
    // Names whose capture socket is being opened
    starting: Mutex<HashSet<String>>,
    shutdown_flag: Arc<AtomicBool>,
}

impl MessageListener {
    pub fn new(provider: Arc<dyn SocketProvider>, config: ListenerConfig) -> Self {
        Self {
            provider,
            config,
            buffers: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            starting: Mutex::new(HashSet::new()),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// Open a capture socket on `name` and start draining it into a fresh
    /// buffer. No-op if a capture loop is already running there.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_listening(&self, name: &str) -> Result<()> {
        {
            let listeners = self.listeners.lock();
            if let Some(existing) = listeners.get(name) {
                if !existing.task.is_finished() {
                    info!(interface = %name, "already listening");
                    return Ok(());
                }
            }
            if !self.starting.lock().insert(name.to_string()) {
                info!(interface = %name, "listener already starting");
                return Ok(());
            }
        }

        let socket = match self.open_capture_socket(name) {
            Ok(socket) => socket,
            Err(e) => {
                self.starting.lock().remove(name);
                return Err(e);
            }
        };

        let buffer = Arc::new(MessageBuffer::new(name, self.config.buffer_size));
        self.buffers
            .write()
            .insert(name.to_string(), buffer.clone());

        let stop_flag = Arc::new(AtomicBool::new(false));
        let capture = CaptureLoop {
            interface: name.to_string(),
            socket,
            buffer,
            stop_flag: stop_flag.clone(),
            shutdown_flag: self.shutdown_flag.clone(),
            error_backoff: self.config.read_timeout(),
        };
        let task = tokio::task::spawn_blocking(move || capture.run());

        self.listeners
            .lock()
            .insert(name.to_string(), ListenerHandle { stop_flag, task });
        self.starting.lock().remove(name);
        info!(
            interface = %name,
            buffer_size = self.config.buffer_size,
            "started listening"
        );
        Ok(())
    }

    fn open_capture_socket(&self, name: &str) -> Result<Box<dyn CanSocket>> {
        let (socket, _ifindex) = open_bound(self.provider.as_ref(), name)?;
        if let Err(e) = socket.set_read_timeout(self.config.read_timeout()) {
            let err = BridgeError::transport(name, "set read timeout", e);
            if let Err(e) = socket.close() {
                debug!(interface = %name, error = %e, "error closing capture socket");
            }
            return Err(err);
        }
        Ok(socket)
    }

    /// Stop capturing on `name` and wait for its socket to close.
    /// The buffer stays queryable.
    pub async fn stop_listening(&self, name: &str) -> Result<()> {
        let handle = self
            .listeners
            .lock()
            .remove(name)
            .ok_or_else(|| BridgeError::NotListening(name.to_string()))?;

        handle.stop_flag.store(true, Ordering::SeqCst);
        join_capture(name, handle).await?;
        info!(interface = %name, "stopped listening");
        Ok(())
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners
            .lock()
            .get(name)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    pub fn listening_interfaces(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, h)| !h.task.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn buffer(&self, name: &str) -> Result<Arc<MessageBuffer>> {
        self.buffers
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::NoMessageBuffer(name.to_string()))
    }

    pub fn get_messages(&self, name: &str) -> Result<Vec<MessageLog>> {
        Ok(self.buffer(name)?.messages())
    }

    pub fn get_recent_messages(&self, name: &str, count: i64) -> Result<Vec<MessageLog>> {
        Ok(self.buffer(name)?.recent(count))
    }

    pub fn get_statistics(&self, name: &str) -> Result<BufferStatistics> {
        Ok(self.buffer(name)?.statistics())
    }

    pub fn clear(&self, name: &str) -> Result<()> {
        self.buffer(name)?.clear();
        info!(interface = %name, "message buffer cleared");
        Ok(())
    }

    pub fn all_messages(&self) -> BTreeMap<String, Vec<MessageLog>> {
        self.snapshot_buffers()
            .into_iter()
            .map(|(name, buffer)| (name, buffer.messages()))
            .collect()
    }

    pub fn all_statistics(&self) -> BTreeMap<String, BufferStatistics> {
        self.snapshot_buffers()
            .into_iter()
            .map(|(name, buffer)| (name, buffer.statistics()))
            .collect()
    }

    pub fn clear_all(&self) {
        for (_, buffer) in self.snapshot_buffers() {
            buffer.clear();
        }
        info!("all message buffers cleared");
    }

    fn snapshot_buffers(&self) -> Vec<(String, Arc<MessageBuffer>)> {
        self.buffers
            .read()
            .iter()
            .map(|(name, buffer)| (name.clone(), buffer.clone()))
            .collect()
    }

    /// Stop every capture loop. Failures are collected into one error.
    pub async fn shutdown(&self) -> Result<()> {
        let handles: Vec<_> = self.listeners.lock().drain().collect();
        self.shutdown_flag.store(true, Ordering::SeqCst);

        let mut errors = Vec::new();
        for (name, handle) in handles {
            handle.stop_flag.store(true, Ordering::SeqCst);
            if let Err(e) = join_capture(&name, handle).await {
                errors.push(e.to_string());
            }
        }
        self.shutdown_flag.store(false, Ordering::SeqCst);

        if errors.is_empty() {
            info!("all listeners stopped");
            Ok(())
        } else {
            Err(BridgeError::Shutdown(errors))
        }
    }
}

async fn join_capture(name: &str, handle: ListenerHandle) -> Result<()> {
    match handle.task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(BridgeError::transport(name, "close", e)),
        Err(e) => Err(BridgeError::transport(
            name,
            "capture loop",
            io::Error::new(io::ErrorKind::Other, e.to_string()),
        )),
    }
}

// ============================================================================
// Capture Loop
// ============================================================================

struct CaptureLoop {
    interface: String,
    socket: Box<dyn CanSocket>,
    buffer: Arc<MessageBuffer>,
    stop_flag: Arc<AtomicBool>,
    shutdown_flag: Arc<AtomicBool>,
    error_backoff: Duration,
}

impl CaptureLoop {
    fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst) || self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// Blocking receive loop. Closes the socket on exit.
    fn run(self) -> io::Result<()> {
        let mut buf = [0u8; consts::CLASSIC_FRAME_SIZE];
        let mut received: u64 = 0;

        while !self.should_stop() {
            match self.socket.recv(&mut buf) {
                Ok(n) if n < consts::CLASSIC_FRAME_SIZE => {
                    warn!(interface = %self.interface, bytes = n, "short read, skipped");
                }
                Ok(_) => match decode_frame(&buf) {
                    Ok(frame) => {
                        received += 1;
                        // First few frames, then every 100th
                        if received <= 10 || received % 100 == 0 {
                            debug!(
                                interface = %self.interface,
                                id = frame.id(),
                                len = frame.len(),
                                data = %hex::encode(frame.payload()),
                                received,
                                "frame received"
                            );
                        }
                        self.buffer.add(MessageLog::received(&self.interface, &frame));
                    }
                    Err(e) => {
                        warn!(interface = %self.interface, error = %e, "malformed frame, skipped");
                    }
                },
                Err(ref e) if is_timeout(e) => {
                    // Timeout - continue
                }
                Err(e) => {
                    warn!(interface = %self.interface, error = %e, "receive failed");
                    std::thread::sleep(self.error_backoff);
                }
            }
        }

        debug!(interface = %self.interface, received, "capture loop exiting");
        self.socket.close()
    }
}

// ============================================================================
// Tests
// ============================================================================
