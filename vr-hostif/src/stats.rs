//! Datapath counters.
//!
//! Lock-free drop and traffic accounting. Every drop path in the datapath
//! ends in [`DropStats::record`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::DropReason;

/// Drop counters keyed by [`DropReason`].
#[repr(C, align(64))]
pub struct DropStats {
    counters: [AtomicU64; DropReason::COUNT],
}

impl Default for DropStats {
    fn default() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl DropStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn record(&self, reason: DropReason) {
        self.counters[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_n(&self, reason: DropReason, n: u64) {
        if n > 0 {
            self.counters[reason.index()].fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.counters[reason.index()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Non-zero counters, in reason order.
    pub fn snapshot(&self) -> Vec<(DropReason, u64)> {
        DropReason::ALL
            .iter()
            .map(|&r| (r, self.get(r)))
            .filter(|&(_, n)| n > 0)
            .collect()
    }
}

/// Per-interface packet/byte counters.
#[derive(Default)]
pub struct InterfaceCounters {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
}

impl InterfaceCounters {
    #[inline(always)]
    pub fn record_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InterfaceCountersSnapshot {
        InterfaceCountersSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCountersSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_stats_record_and_snapshot() {
        let stats = DropStats::new();
        stats.record(DropReason::InvalidLabel);
        stats.record(DropReason::InvalidLabel);
        stats.record_n(DropReason::QueueFull, 3);
        stats.record_n(DropReason::Misc, 0);

        assert_eq!(stats.get(DropReason::InvalidLabel), 2);
        assert_eq!(stats.get(DropReason::Misc), 0);
        assert_eq!(stats.total(), 5);
        assert_eq!(
            stats.snapshot(),
            vec![(DropReason::InvalidLabel, 2), (DropReason::QueueFull, 3)]
        );
    }

    #[test]
    fn test_interface_counters() {
        let counters = InterfaceCounters::default();
        counters.record_rx(100);
        counters.record_tx(60);
        counters.record_tx(40);

        let snap = counters.snapshot();
        assert_eq!(snap.rx_packets, 1);
        assert_eq!(snap.rx_bytes, 100);
        assert_eq!(snap.tx_packets, 2);
        assert_eq!(snap.tx_bytes, 100);
    }
}
