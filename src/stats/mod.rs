//! Statistics module for Sift
//!
//! Engine-wide atomic counters, plus the serializable report written when a
//! `--json` path is given. Counters are lock-free so the reader and every
//! worker can update them on the hot path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Engine-level packet accounting. For any finite run,
/// `total_packets == forwarded + dropped + malformed + discarded`.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub forwarded_packets: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub malformed_packets: AtomicU64,
    /// Fragmented packets are also counted in `discarded_packets`; this
    /// gauge exists for reporting only.
    pub fragmented_packets: AtomicU64,
    /// Non-IP, non-TCP/UDP, and fragmented packets never enqueued.
    pub discarded_packets: AtomicU64,
}

impl EngineStats {
    pub fn snapshot(&self) -> StatsSummary {
        StatsSummary {
            total_packets: self.total_packets.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            forwarded: self.forwarded_packets.load(Ordering::Relaxed),
            dropped: self.dropped_packets.load(Ordering::Relaxed),
            malformed: self.malformed_packets.load(Ordering::Relaxed),
            fragmented: self.fragmented_packets.load(Ordering::Relaxed),
            discarded: self.discarded_packets.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of the engine counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSummary {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub forwarded: u64,
    pub dropped: u64,
    #[serde(skip)]
    pub malformed: u64,
    #[serde(skip)]
    pub fragmented: u64,
    #[serde(skip)]
    pub discarded: u64,
}

/// Per-thread dispatch/processing counts for the JSON report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThreadReport {
    pub load_balancers: BTreeMap<String, u64>,
    pub fast_paths: BTreeMap<String, u64>,
}

/// The full JSON statistics document.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub summary: StatsSummary,
    pub applications: BTreeMap<String, u64>,
    pub threads: ThreadReport,
}

impl StatsReport {
    /// Serialize the report to pretty-printed JSON at `path`.
    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json: String = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = EngineStats::default();
        stats.total_packets.store(10, Ordering::Relaxed);
        stats.forwarded_packets.store(7, Ordering::Relaxed);
        stats.dropped_packets.store(2, Ordering::Relaxed);
        stats.malformed_packets.store(1, Ordering::Relaxed);

        let summary = stats.snapshot();
        assert_eq!(summary.total_packets, 10);
        assert_eq!(
            summary.total_packets,
            summary.forwarded + summary.dropped + summary.malformed + summary.discarded
        );
    }

    #[test]
    fn json_report_shape() {
        let mut applications = BTreeMap::new();
        applications.insert("YouTube".to_string(), 3u64);

        let mut threads = ThreadReport::default();
        threads.load_balancers.insert("lb0".to_string(), 5);
        threads.fast_paths.insert("fp0".to_string(), 5);

        let report = StatsReport {
            summary: StatsSummary {
                total_packets: 5,
                forwarded: 5,
                ..Default::default()
            },
            applications,
            threads,
        };

        let json: String = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"summary\""));
        assert!(json.contains("\"total_packets\":5"));
        assert!(json.contains("\"applications\""));
        assert!(json.contains("\"YouTube\":3"));
        assert!(json.contains("\"load_balancers\""));
        assert!(json.contains("\"lb0\":5"));
    }
}
