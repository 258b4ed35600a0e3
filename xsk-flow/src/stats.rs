//! # Service counters
//!
//! Process-wide atomic counters shared by every worker. Updates are
//! relaxed additions and snapshots are relaxed reads, so a snapshot is
//! not consistent across counters: `packets_received` may momentarily
//! exceed the sum of the outcome counters while a batch is in flight.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct StatsCollector {
    packets_received: AtomicU64,
    packets_transmitted: AtomicU64,
    packets_dropped: AtomicU64,
    packets_passed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_transmitted: AtomicU64,
    errors: AtomicU64,
    started: Instant,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        StatsCollector {
            packets_received: AtomicU64::new(0),
            packets_transmitted: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            packets_passed: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_transmitted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.packets_received.fetch_add(packets, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.packets_transmitted.fetch_add(packets, Ordering::Relaxed);
        self.bytes_transmitted.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, packets: u64) {
        self.packets_dropped.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn record_passed(&self, packets: u64) {
        self.packets_passed.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_transmitted: self.packets_transmitted.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_passed: self.packets_passed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_transmitted: self.bytes_transmitted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            elapsed: self.started.elapsed(),
        }
    }
}

/// A point-in-time copy of the counters plus the elapsed run time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_transmitted: u64,
    pub packets_dropped: u64,
    pub packets_passed: u64,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

impl StatsSnapshot {
    fn per_second(&self, count: u64) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        count as f64 / secs
    }

    pub fn rx_packets_per_sec(&self) -> f64 {
        self.per_second(self.packets_received)
    }

    pub fn tx_packets_per_sec(&self) -> f64 {
        self.per_second(self.packets_transmitted)
    }

    pub fn rx_bytes_per_sec(&self) -> f64 {
        self.per_second(self.bytes_received)
    }

    pub fn tx_bytes_per_sec(&self) -> f64 {
        self.per_second(self.bytes_transmitted)
    }

    /// Writes a one-line summary into the caller's sink.
    pub fn write_summary<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        write!(
            out,
            "rx {} pkts (",
            self.packets_received,
        )?;
        format_bytes(self.bytes_received, out)?;
        write!(
            out,
            "), tx {} pkts (",
            self.packets_transmitted,
        )?;
        format_bytes(self.bytes_transmitted, out)?;
        write!(
            out,
            "), dropped {}, passed {}, errors {}, {:.1}s",
            self.packets_dropped,
            self.packets_passed,
            self.errors,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Formats a byte count with a binary unit into the caller's sink.
pub fn format_bytes<W: fmt::Write>(bytes: u64, out: &mut W) -> fmt::Result {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        write!(out, "{bytes} B")
    } else {
        write!(out, "{value:.2} {}", UNITS[unit])
    }
}
