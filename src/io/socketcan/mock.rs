// src/io/socketcan/mock.rs
//
// In-memory CAN transport for unit tests. Interfaces can be made to fail at
// any setup step or on send, and inbound frames can be scripted per name.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::codec::{encode_frame, Frame, RawFrame};
use super::socket::{CanSocket, SocketProvider};

#[derive(Default)]
pub(crate) struct MockState {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_create: AtomicBool,
    indices: Mutex<Vec<String>>,
    fail_resolve: Mutex<HashSet<String>>,
    fail_bind: Mutex<HashSet<String>>,
    fail_send: Mutex<HashSet<String>>,
    sent: Mutex<Vec<(String, RawFrame)>>,
    inbound: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    send_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockSocketProvider {
    state: Arc<MockState>,
}

impl MockSocketProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `name` unknown to the kernel (resolve fails).
    pub fn fail_resolve(&self, name: &str) {
        self.state.fail_resolve.lock().insert(name.to_string());
    }

    pub fn heal_resolve(&self, name: &str) {
        self.state.fail_resolve.lock().remove(name);
    }

    pub fn fail_bind(&self, name: &str) {
        self.state.fail_bind.lock().insert(name.to_string());
    }

    pub fn fail_send(&self, name: &str) {
        self.state.fail_send.lock().insert(name.to_string());
    }

    pub fn heal_send(&self, name: &str) {
        self.state.fail_send.lock().remove(name);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.state.send_delay.lock() = delay;
    }

    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.state.create_delay.lock() = delay;
    }

    pub fn push_raw(&self, name: &str, bytes: Vec<u8>) {
        self.state
            .inbound
            .lock()
            .entry(name.to_string())
            .or_default()
            .push_back(bytes);
    }

    pub fn push_frame(&self, name: &str, frame: &Frame) {
        self.push_raw(name, encode_frame(frame).to_vec());
    }

    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<(String, RawFrame)> {
        self.state.sent.lock().clone()
    }

    pub fn sends_to(&self, name: &str) -> usize {
        self.state.sent.lock().iter().filter(|(n, _)| n == name).count()
    }
}

impl SocketProvider for MockSocketProvider {
    fn create_socket(&self) -> io::Result<Box<dyn CanSocket>> {
        let delay = *self.state.create_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.state.fail_create.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "operation not permitted",
            ));
        }
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSocket {
            state: self.state.clone(),
            name: Mutex::new(None),
            read_timeout: Mutex::new(Duration::from_millis(5)),
        }))
    }
}

struct MockSocket {
    state: Arc<MockState>,
    name: Mutex<Option<String>>,
    read_timeout: Mutex<Duration>,
}

impl MockSocket {
    fn bound_name(&self) -> io::Result<String> {
        self.name
            .lock()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket not bound"))
    }
}

impl CanSocket for MockSocket {
    fn resolve_index(&self, name: &str) -> io::Result<u32> {
        if self.state.fail_resolve.lock().contains(name) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let mut indices = self.state.indices.lock();
        let index = match indices.iter().position(|n| n == name) {
            Some(pos) => pos,
            None => {
                indices.push(name.to_string());
                indices.len() - 1
            }
        };
        Ok(index as u32 + 1)
    }

    fn bind(&self, ifindex: u32) -> io::Result<()> {
        let name = self
            .state
            .indices
            .lock()
            .get((ifindex as usize).wrapping_sub(1))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such device"))?;
        if self.state.fail_bind.lock().contains(&name) {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "cannot assign requested address",
            ));
        }
        *self.name.lock() = Some(name);
        Ok(())
    }

    fn send(&self, frame: &RawFrame) -> io::Result<()> {
        let name = self.bound_name()?;
        let delay = *self.state.send_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.state.fail_send.lock().contains(&name) {
            return Err(io::Error::new(io::ErrorKind::Other, "network is down"));
        }
        self.state.sent.lock().push((name, *frame));
        Ok(())
    }

    fn recv(&self, buf: &mut RawFrame) -> io::Result<usize> {
        let name = self.bound_name()?;
        let next = self
            .state
            .inbound
            .lock()
            .get_mut(&name)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => {
                let timeout = *self.read_timeout.lock();
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }
    }

    fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
        *self.read_timeout.lock() = timeout;
        Ok(())
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
