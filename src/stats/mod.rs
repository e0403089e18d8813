//! Per-stream statistics
//!
//! The core reports events through the [`Collector`] trait; [`StreamStats`]
//! is the production implementation backed by atomics and shared between the
//! pull loop, the fan-out worker, and the HTTP status handlers.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use crate::hub::SubscriberId;
use crate::packet::PACKET_SIZE;

/// Write-only event sink consumed by the upstream client and the broadcaster
pub trait Collector: Send + Sync {
    /// The upstream transport delivered its first readable input
    fn source_connected(&self);
    /// The upstream transport failed or was closed
    fn source_disconnected(&self);
    /// One packet was read from the upstream and queued on intake
    fn packet_received(&self);
    /// A subscriber was admitted to the stream
    fn subscriber_added(&self);
    /// A subscriber left the stream
    fn subscriber_removed(&self);
    /// A packet was dropped for one subscriber whose queue was full
    fn packet_dropped(&self, subscriber: SubscriberId);
}

/// Collector that ignores every event; used in tests
#[derive(Debug, Default)]
pub struct NullCollector;

impl Collector for NullCollector {
    fn source_connected(&self) {}
    fn source_disconnected(&self) {}
    fn packet_received(&self) {}
    fn subscriber_added(&self) {}
    fn subscriber_removed(&self) {}
    fn packet_dropped(&self, _subscriber: SubscriberId) {}
}

/// Atomic counters for one configured stream
#[derive(Debug)]
pub struct StreamStats {
    /// Public serve path, used as the stream name in snapshots
    name: String,
    connected: AtomicBool,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    subscribers: AtomicU32,
    peak_subscribers: AtomicU32,
    started_at: Instant,
}

/// Point-in-time view of [`StreamStats`], serialized by `/stats`
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub connected: bool,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub bytes_received: u64,
    pub subscribers: u32,
    pub peak_subscribers: u32,
    /// Average ingest rate in bits per second since startup
    pub bitrate: u64,
    pub uptime_secs: u64,
}

impl StreamStats {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            packets_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            subscribers: AtomicU32::new(0),
            peak_subscribers: AtomicU32::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> u32 {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed) * PACKET_SIZE as u64
    }

    /// Average ingest rate in bits per second since startup
    pub fn bitrate(&self) -> u64 {
        let secs = self.started_at.elapsed().as_secs();
        if secs > 0 {
            self.bytes_received() * 8 / secs
        } else {
            0
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            name: self.name.clone(),
            connected: self.connected(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_received: self.bytes_received(),
            subscribers: self.subscribers(),
            peak_subscribers: self.peak_subscribers.load(Ordering::Relaxed),
            bitrate: self.bitrate(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Collector for StreamStats {
    fn source_connected(&self) {
        self.connected.store(true, Ordering::Relaxed);
    }

    fn source_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    fn subscriber_added(&self) {
        let now = self.subscribers.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_subscribers.fetch_max(now, Ordering::Relaxed);
    }

    fn subscriber_removed(&self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    fn packet_dropped(&self, _subscriber: SubscriberId) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }
}
