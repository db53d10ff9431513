//! Engine orchestrator for Sift
//!
//! Owns the whole pipeline for one capture run: the reader, N load
//! balancers, N x K fast-path workers, the output writer thread, the shared
//! rule manager, and the engine-wide counters. Start order is output
//! thread, workers, load balancers, reader; stop order is the reverse, with
//! a short drain grace after the reader finishes so in-flight jobs reach
//! the output file.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, error, info};

use crate::capture::reader::PcapReader;
use crate::capture::writer::PcapWriter;
use crate::capture::RawRecord;
use crate::config::SiftConfig;
use crate::core::flow::{ConnectionTracker, TrackerStats};
use crate::core::packet::{FiveTuple, PacketJob};
use crate::core::parser::{PacketParser, ParsedPacket};
use crate::pipeline::fast_path::FastPath;
use crate::pipeline::lb::LoadBalancer;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::POLL_INTERVAL;
use crate::rules::{RuleManager, RuleStats};
use crate::stats::{EngineStats, StatsReport, StatsSummary, ThreadReport};
use crate::utils::{format_bytes, format_duration};

/// Pause between the reader finishing and the pipeline being stopped, so
/// queued jobs drain through the workers.
const DRAIN_GRACE: Duration = Duration::from_millis(300);

/// The Sift engine: one instance processes one capture file.
pub struct SiftEngine {
    config: SiftConfig,
    rules: Arc<RuleManager>,
    stats: Arc<EngineStats>,
    stop_flag: Arc<AtomicBool>,
}

impl SiftEngine {
    pub fn new(config: SiftConfig) -> SiftEngine {
        let rules: Arc<RuleManager> = Arc::new(RuleManager::new());
        rules.set_strict_domain_matching(config.rules.strict_domain_matching);

        if let Some(rules_file) = &config.rules.rules_file {
            if let Err(e) = rules.load_rules(rules_file) {
                error!("Failed to load rules from {}: {}", rules_file, e);
            }
        }

        SiftEngine {
            config,
            rules,
            stats: Arc::new(EngineStats::default()),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shared rule manager, for the CLI control surface.
    pub fn rules(&self) -> Arc<RuleManager> {
        Arc::clone(&self.rules)
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        Arc::clone(&self.stats)
    }

    /// Handle that interrupts a running `process_file` (e.g. from a ctrl-c
    /// handler). Idempotent.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_flag)
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Run the full pipeline over `input`, writing forwarded packets to
    /// `output`. Only an unusable input or output file is fatal; packet
    /// level failures are counted and skipped.
    pub fn process_file(
        &self,
        input: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> anyhow::Result<EngineReport> {
        let started = Instant::now();

        let mut reader = PcapReader::open(input.as_ref())
            .with_context(|| format!("cannot open input capture {}", input.as_ref().display()))?;
        let writer: Arc<PcapWriter> = Arc::new(
            PcapWriter::create(
                output.as_ref(),
                reader.raw_global_header(),
                reader.needs_byte_swap(),
            )
            .with_context(|| format!("cannot open output capture {}", output.as_ref().display()))?,
        );

        info!(
            "Pipeline: {} load balancers, {} fast paths, queue capacity {}",
            self.config.pipeline.load_balancers,
            self.config.total_fps(),
            self.config.pipeline.queue_capacity
        );

        let queue_capacity: usize = self.config.pipeline.queue_capacity;
        let flow_timeout = Duration::from_secs(self.config.pipeline.flow_timeout_secs);
        let output_queue: Arc<BoundedQueue<PacketJob>> =
            Arc::new(BoundedQueue::new(queue_capacity));

        // Output thread starts first so forwarded jobs always have a consumer.
        let output_running = Arc::new(AtomicBool::new(true));
        let output_handle = self.spawn_output_thread(
            Arc::clone(&writer),
            Arc::clone(&output_queue),
            Arc::clone(&output_running),
        );

        let mut fps: Vec<FastPath> = (0..self.config.total_fps())
            .map(|id| {
                FastPath::new(
                    id,
                    queue_capacity,
                    self.config.pipeline.max_connections_per_fp,
                    flow_timeout,
                    Arc::clone(&self.rules),
                    Arc::clone(&output_queue),
                    Arc::clone(&self.stats),
                )
            })
            .collect();
        for fp in &mut fps {
            fp.start();
        }
        let fp_queues: Vec<Arc<BoundedQueue<PacketJob>>> =
            fps.iter().map(|fp| fp.input_queue()).collect();

        let fps_per_lb: usize = self.config.pipeline.fps_per_lb;
        let mut lbs: Vec<LoadBalancer> = (0..self.config.pipeline.load_balancers)
            .map(|id| {
                let slice: Vec<Arc<BoundedQueue<PacketJob>>> = fp_queues
                    [id * fps_per_lb..(id + 1) * fps_per_lb]
                    .iter()
                    .map(Arc::clone)
                    .collect();
                LoadBalancer::new(id, queue_capacity, slice)
            })
            .collect();
        for lb in &mut lbs {
            lb.start();
        }
        let lb_inputs: Vec<Arc<BoundedQueue<PacketJob>>> =
            lbs.iter().map(|lb| lb.input_queue()).collect();

        // This thread is the reader; it exclusively owns the input file.
        let mut packet_id: u64 = 0;
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                info!("Stop requested; ending input early");
                break;
            }

            match reader.next_record() {
                Ok(Some(record)) => self.ingest(record, &mut packet_id, &lb_inputs),
                Ok(None) => break,
                Err(e) => {
                    error!("Capture read failed: {}", e);
                    break;
                }
            }
        }
        info!("Reader finished: {} packets enqueued", packet_id);

        thread::sleep(DRAIN_GRACE);

        for lb in &mut lbs {
            lb.stop();
        }

        let mut trackers = Vec::new();
        for fp in &mut fps {
            if let Some(tracker) = fp.stop() {
                trackers.push(tracker);
            }
        }

        output_running.store(false, Ordering::SeqCst);
        output_queue.shutdown();
        if output_handle.join().is_err() {
            error!("Output thread panicked");
        }
        writer.flush().context("cannot flush output capture")?;

        let report: EngineReport = self.build_report(started.elapsed(), &lbs, &fps, &trackers);
        info!(
            "Run complete: {} forwarded, {} dropped",
            report.summary.forwarded, report.summary.dropped
        );
        Ok(report)
    }

    /// Parse one record and hand it to a load balancer by flow hash.
    /// Malformed, non-IP, non-TCP/UDP, and fragmented packets stop here.
    fn ingest(
        &self,
        record: RawRecord,
        packet_id: &mut u64,
        lb_inputs: &[Arc<BoundedQueue<PacketJob>>],
    ) {
        let stats = &self.stats;
        stats.total_packets.fetch_add(1, Ordering::Relaxed);
        stats
            .total_bytes
            .fetch_add(record.data.len() as u64, Ordering::Relaxed);

        let parsed: ParsedPacket = match PacketParser::parse(&record.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                stats.malformed_packets.fetch_add(1, Ordering::Relaxed);
                debug!("Malformed packet {}: {}", *packet_id, e);
                return;
            }
        };

        if parsed.is_fragmented {
            stats.fragmented_packets.fetch_add(1, Ordering::Relaxed);
            stats.discarded_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if !parsed.has_ip() || !parsed.has_transport() {
            stats.discarded_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if parsed.has_tcp {
            stats.tcp_packets.fetch_add(1, Ordering::Relaxed);
        } else {
            stats.udp_packets.fetch_add(1, Ordering::Relaxed);
        }

        let tuple = FiveTuple {
            src_ip: parsed.src_key,
            dst_ip: parsed.dst_key,
            src_port: parsed.src_port,
            dst_port: parsed.dst_port,
            protocol: parsed.protocol,
        };

        let job = PacketJob {
            id: *packet_id,
            tuple,
            eth_offset: 0,
            ip_offset: parsed.ip_offset,
            transport_offset: parsed.transport_offset,
            payload_offset: parsed.payload_offset,
            payload_len: parsed.payload_len,
            tcp_flags: parsed.tcp_flags,
            ts_sec: record.header.ts_sec,
            ts_usec: record.header.ts_usec,
            data: record.data,
        };
        *packet_id += 1;

        let index: usize = (tuple.flow_hash() % lb_inputs.len() as u64) as usize;
        if !lb_inputs[index].push(job) {
            debug!("LB{} queue shut down; job not enqueued", index);
        }
    }

    fn spawn_output_thread(
        &self,
        writer: Arc<PcapWriter>,
        queue: Arc<BoundedQueue<PacketJob>>,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::Builder::new()
            .name("sift-writer".to_string())
            .spawn(move || {
                // Keep draining after shutdown until the queue is empty.
                while running.load(Ordering::SeqCst) || !queue.is_empty() {
                    if let Some(job) = queue.pop_timeout(POLL_INTERVAL) {
                        if let Err(e) = writer.write_record(job.ts_sec, job.ts_usec, &job.data) {
                            error!("Failed to write output record: {}", e);
                        }
                    }
                }
            })
            .expect("failed to spawn output thread")
    }

    fn build_report(
        &self,
        elapsed: Duration,
        lbs: &[LoadBalancer],
        fps: &[FastPath],
        trackers: &[ConnectionTracker],
    ) -> EngineReport {
        let mut applications: BTreeMap<String, u64> = BTreeMap::new();
        let mut domains: BTreeMap<String, String> = BTreeMap::new();
        let mut connections = TrackerStats::default();

        for tracker in trackers {
            let tracker_stats: TrackerStats = tracker.stats();
            connections.active_connections += tracker_stats.active_connections;
            connections.total_connections_seen += tracker_stats.total_connections_seen;
            connections.classified_connections += tracker_stats.classified_connections;
            connections.blocked_connections += tracker_stats.blocked_connections;
            connections.evicted_connections += tracker_stats.evicted_connections;
            connections.closed_connections += tracker_stats.closed_connections;

            for conn in tracker.connections() {
                *applications.entry(conn.app.to_string()).or_insert(0) += 1;
                if !conn.server_name.is_empty() {
                    domains.insert(conn.server_name.clone(), conn.app.to_string());
                }
            }
        }

        EngineReport {
            summary: self.stats.snapshot(),
            applications,
            domains,
            lb_dispatched: lbs
                .iter()
                .map(|lb| lb.stats().packets_dispatched.load(Ordering::Relaxed))
                .collect(),
            fp_processed: fps
                .iter()
                .map(|fp| fp.stats().packets_processed.load(Ordering::Relaxed))
                .collect(),
            connections,
            rule_stats: self.rules.stats(),
            elapsed,
        }
    }
}

/// Everything one run produced, for the console report and the JSON file.
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub summary: StatsSummary,
    /// Live connections per application at the end of the run.
    pub applications: BTreeMap<String, u64>,
    /// Observed server names and what they classified as.
    pub domains: BTreeMap<String, String>,
    pub lb_dispatched: Vec<u64>,
    pub fp_processed: Vec<u64>,
    pub connections: TrackerStats,
    pub rule_stats: RuleStats,
    pub elapsed: Duration,
}

impl EngineReport {
    /// Shape the report for `--json` output.
    pub fn to_stats_report(&self) -> StatsReport {
        let mut threads = ThreadReport::default();
        for (i, dispatched) in self.lb_dispatched.iter().enumerate() {
            threads.load_balancers.insert(format!("lb{}", i), *dispatched);
        }
        for (i, processed) in self.fp_processed.iter().enumerate() {
            threads.fast_paths.insert(format!("fp{}", i), *processed);
        }

        StatsReport {
            summary: self.summary,
            applications: self.applications.clone(),
            threads,
        }
    }
}

impl fmt::Display for EngineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==================== sift run report ====================")?;
        writeln!(
            f,
            " Packets:     {} total ({})",
            self.summary.total_packets,
            format_bytes(self.summary.total_bytes)
        )?;
        writeln!(
            f,
            " Transport:   {} tcp, {} udp",
            self.summary.tcp_packets, self.summary.udp_packets
        )?;
        writeln!(f, " Forwarded:   {}", self.summary.forwarded)?;
        writeln!(f, " Dropped:     {}", self.summary.dropped)?;
        writeln!(
            f,
            " Skipped:     {} malformed, {} discarded ({} fragmented)",
            self.summary.malformed, self.summary.discarded, self.summary.fragmented
        )?;
        writeln!(
            f,
            " Connections: {} active, {} seen, {} classified, {} blocked, {} evicted, {} closed",
            self.connections.active_connections,
            self.connections.total_connections_seen,
            self.connections.classified_connections,
            self.connections.blocked_connections,
            self.connections.evicted_connections,
            self.connections.closed_connections
        )?;
        writeln!(
            f,
            " Rules:       {} checks, {} hits",
            self.rule_stats.total_block_checks, self.rule_stats.total_blocks_triggered
        )?;

        if !self.applications.is_empty() {
            writeln!(f, " Applications:")?;
            for (app, count) in &self.applications {
                writeln!(f, "   {:<15} {}", app, count)?;
            }
        }

        if !self.domains.is_empty() {
            writeln!(f, " Domains:")?;
            for (domain, app) in &self.domains {
                writeln!(f, "   {} -> {}", domain, app)?;
            }
        }

        writeln!(f, " Threads:")?;
        for (i, dispatched) in self.lb_dispatched.iter().enumerate() {
            writeln!(f, "   lb{} dispatched {}", i, dispatched)?;
        }
        for (i, processed) in self.fp_processed.iter().enumerate() {
            writeln!(f, "   fp{} processed {}", i, processed)?;
        }

        write!(f, " Elapsed:     {}", format_duration(self.elapsed))
    }
}
