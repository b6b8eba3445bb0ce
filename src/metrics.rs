// src/metrics.rs
//
// Per-interface send metrics: counters, last send/error timestamps and a
// moving average over the most recent send latencies.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of latency samples kept for the moving average
pub const LATENCY_WINDOW: usize = 100;

#[derive(Debug)]
struct MetricsInner {
    total_sent: u64,
    total_errors: u64,
    last_send_time: Option<DateTime<Utc>>,
    last_error_time: Option<DateTime<Utc>>,
    last_error_msg: Option<String>,
    latencies: VecDeque<Duration>,
    avg_latency: Duration,
}

/// Rolling metrics for one device. Only the send path writes.
#[derive(Debug)]
pub struct InterfaceMetrics {
    started: Instant,
    start_time: DateTime<Utc>,
    inner: RwLock<MetricsInner>,
}

/// Point-in-time copy of an interface's metrics
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStats {
    pub total_sent: u64,
    pub total_errors: u64,
    pub last_send_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub last_error_msg: Option<String>,
    #[serde(serialize_with = "serialize_micros", rename = "avgLatencyUs")]
    pub avg_latency: Duration,
    pub start_time: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs", rename = "uptimeSecs")]
    pub uptime: Duration,
}

impl InterfaceStats {
    /// Successful sends as a percentage of all attempts; 100 before any attempt.
    pub fn success_rate(&self) -> f64 {
        success_rate(self.total_sent, self.total_errors)
    }
}

fn success_rate(sent: u64, errors: u64) -> f64 {
    let attempts = sent + errors;
    if attempts == 0 {
        return 100.0;
    }
    sent as f64 / attempts as f64 * 100.0
}

fn serialize_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl Default for InterfaceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            start_time: Utc::now(),
            inner: RwLock::new(MetricsInner {
                total_sent: 0,
                total_errors: 0,
                last_send_time: None,
                last_error_time: None,
                last_error_msg: None,
                latencies: VecDeque::with_capacity(LATENCY_WINDOW),
                avg_latency: Duration::ZERO,
            }),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.write();
        inner.total_sent += 1;
        inner.last_send_time = Some(Utc::now());

        inner.latencies.push_back(latency);
        while inner.latencies.len() > LATENCY_WINDOW {
            inner.latencies.pop_front();
        }
        let total: Duration = inner.latencies.iter().sum();
        inner.avg_latency = total / inner.latencies.len() as u32;
    }

    pub fn record_error(&self, message: &str) {
        let mut inner = self.inner.write();
        inner.total_errors += 1;
        inner.last_error_time = Some(Utc::now());
        inner.last_error_msg = Some(message.to_string());
    }

    /// (last send, last error) timestamps, read under one lock.
    pub fn activity(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let inner = self.inner.read();
        (inner.last_send_time, inner.last_error_time)
    }

    pub fn success_rate(&self) -> f64 {
        let inner = self.inner.read();
        success_rate(inner.total_sent, inner.total_errors)
    }

    pub fn snapshot(&self) -> InterfaceStats {
        let inner = self.inner.read();
        InterfaceStats {
            total_sent: inner.total_sent,
            total_errors: inner.total_errors,
            last_send_time: inner.last_send_time,
            last_error_time: inner.last_error_time,
            last_error_msg: inner.last_error_msg.clone(),
            avg_latency: inner.avg_latency,
            start_time: self.start_time,
            uptime: self.started.elapsed(),
        }
    }
}
