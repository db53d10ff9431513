//! Fast-path worker stage for Sift
//!
//! Second pipeline stage: each worker owns a connection tracker outright
//! (no locks; affinity hashing makes cross-worker access impossible),
//! classifies flows by payload inspection, evaluates block rules, and
//! renders a forward/drop verdict per packet. Forwarded jobs move to the
//! shared output queue; the tracker is handed back to the engine when the
//! worker is stopped so its flows feed the final report.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::flow::{ConnectionState, ConnectionTracker};
use crate::core::packet::{protocol, FiveTuple, PacketAction, PacketJob};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::POLL_INTERVAL;
use crate::protocols::{dns, http, quic, tls, AppType};
use crate::rules::RuleManager;
use crate::stats::EngineStats;

/// Per-worker counters, shared with the engine for live status.
#[derive(Debug, Default)]
pub struct FpStats {
    pub packets_processed: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub sni_extractions: AtomicU64,
    pub classification_hits: AtomicU64,
}

/// One fast-path worker thread.
pub struct FastPath {
    id: usize,
    input: Arc<BoundedQueue<PacketJob>>,
    output: Arc<BoundedQueue<PacketJob>>,
    rules: Arc<RuleManager>,
    engine_stats: Arc<EngineStats>,
    stats: Arc<FpStats>,
    max_connections: usize,
    flow_timeout: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<ConnectionTracker>>,
}

impl FastPath {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        queue_capacity: usize,
        max_connections: usize,
        flow_timeout: Duration,
        rules: Arc<RuleManager>,
        output: Arc<BoundedQueue<PacketJob>>,
        engine_stats: Arc<EngineStats>,
    ) -> FastPath {
        FastPath {
            id,
            input: Arc::new(BoundedQueue::new(queue_capacity)),
            output,
            rules,
            engine_stats,
            stats: Arc::new(FpStats::default()),
            max_connections,
            flow_timeout,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn input_queue(&self) -> Arc<BoundedQueue<PacketJob>> {
        Arc::clone(&self.input)
    }

    pub fn stats(&self) -> Arc<FpStats> {
        Arc::clone(&self.stats)
    }

    pub fn max_queue_depth(&self) -> usize {
        self.input.max_depth()
    }

    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let id: usize = self.id;
        let input = Arc::clone(&self.input);
        let output = Arc::clone(&self.output);
        let rules = Arc::clone(&self.rules);
        let engine_stats = Arc::clone(&self.engine_stats);
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);
        let flow_timeout: Duration = self.flow_timeout;
        let max_connections: usize = self.max_connections;

        let handle = thread::Builder::new()
            .name(format!("sift-fp{}", id))
            .spawn(move || {
                debug!("FP{} started", id);
                let mut tracker = ConnectionTracker::new(id, max_connections);

                while running.load(Ordering::SeqCst) {
                    match input.pop_timeout(POLL_INTERVAL) {
                        Some(job) => {
                            handle_job(&mut tracker, &rules, &stats, &engine_stats, &output, job)
                        }
                        None => {
                            tracker.cleanup_stale(flow_timeout, Instant::now());
                        }
                    }
                }

                // Drain the input so queued jobs still get a verdict.
                while let Some(job) = input.try_pop() {
                    handle_job(&mut tracker, &rules, &stats, &engine_stats, &output, job);
                }

                debug!(
                    "FP{} exiting ({} processed)",
                    id,
                    stats.packets_processed.load(Ordering::Relaxed)
                );
                tracker
            })
            .expect("failed to spawn fast path thread");

        self.handle = Some(handle);
        info!("FP{} started", self.id);
    }

    /// Stop the worker and hand its connection tracker back for reporting.
    /// Idempotent; returns `None` after the first call.
    pub fn stop(&mut self) -> Option<ConnectionTracker> {
        self.running.store(false, Ordering::SeqCst);
        self.input.shutdown();

        let tracker = match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(tracker) => Some(tracker),
                Err(_) => {
                    warn!("FP{} thread panicked", self.id);
                    None
                }
            },
            None => None,
        };

        if tracker.is_some() {
            info!("FP{} stopped", self.id);
        }
        tracker
    }
}

impl Drop for FastPath {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_job(
    tracker: &mut ConnectionTracker,
    rules: &RuleManager,
    stats: &FpStats,
    engine_stats: &EngineStats,
    output: &BoundedQueue<PacketJob>,
    job: PacketJob,
) {
    stats.packets_processed.fetch_add(1, Ordering::Relaxed);

    let action: PacketAction = process_job(tracker, rules, stats, &job);

    match action {
        PacketAction::Forward => {
            stats.packets_forwarded.fetch_add(1, Ordering::Relaxed);
            engine_stats
                .forwarded_packets
                .fetch_add(1, Ordering::Relaxed);
            if !output.push(job) {
                debug!("output queue shut down; forwarded job not written");
            }
        }
        PacketAction::Drop => {
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
            engine_stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Per-packet decision procedure: track, update TCP state, classify on
/// first payload, then evaluate rules. Inspection failures are never fatal;
/// the packet falls through to the rule check and forwards on no match.
fn process_job(
    tracker: &mut ConnectionTracker,
    rules: &RuleManager,
    stats: &FpStats,
    job: &PacketJob,
) -> PacketAction {
    let now = Instant::now();
    let tuple = job.tuple;

    let (state, observed_close) = {
        let conn = tracker.get_or_create(tuple, now);
        conn.record_packet(job.frame_len(), true, now);

        if tuple.protocol == protocol::TCP {
            conn.apply_tcp_flags(job.tcp_flags);
        }
        (conn.state, conn.state == ConnectionState::Closed)
    };

    if state == ConnectionState::Blocked {
        return PacketAction::Drop;
    }

    if state != ConnectionState::Classified && job.payload_len > 0 {
        if let Some((app, name)) = inspect_payload(job, stats) {
            tracker.classify(&tuple, app, name);
        }
    }

    let verdict: PacketAction = check_rules(tracker, rules, &tuple);

    // An observed FIN+ACK or RST retires the record whatever the verdict;
    // the flow is done either way.
    if observed_close {
        tracker.close(&tuple);
    }

    verdict
}

/// Try the extractors in priority order and map the recovered server name
/// onto the application table. Port 80/443 flows with unreadable payloads
/// still classify as plain HTTP/HTTPS so inspection is not retried forever.
fn inspect_payload(job: &PacketJob, stats: &FpStats) -> Option<(AppType, String)> {
    let payload: &[u8] = job.payload();
    if payload.is_empty() {
        return None;
    }
    let tuple = &job.tuple;

    if tuple.dst_port == 443 || payload.len() >= 50 {
        if let Some(sni) = tls::extract_sni(payload) {
            stats.sni_extractions.fetch_add(1, Ordering::Relaxed);
            let app: AppType = named_app(&sni, AppType::Tls, stats);
            return Some((app, sni));
        }
    }

    if tuple.protocol == protocol::UDP && tuple.dst_port == 443 {
        if let Some(sni) = quic::extract_sni(payload) {
            stats.sni_extractions.fetch_add(1, Ordering::Relaxed);
            let app: AppType = named_app(&sni, AppType::Quic, stats);
            return Some((app, sni));
        }
    }

    if tuple.dst_port == 80 {
        if let Some(host) = http::extract_host(payload) {
            let app: AppType = named_app(&host, AppType::Http, stats);
            return Some((app, host));
        }
    }

    if tuple.dst_port == 53 || tuple.src_port == 53 {
        if let Some(query) = dns::extract_query(payload) {
            return Some((AppType::Dns, query));
        }
    }

    match tuple.dst_port {
        80 => Some((AppType::Http, String::new())),
        443 => Some((AppType::Https, String::new())),
        _ => None,
    }
}

/// Map a server name through the domain table, falling back to the generic
/// protocol classification when no service matches.
fn named_app(name: &str, fallback: AppType, stats: &FpStats) -> AppType {
    match AppType::from_server_name(name) {
        AppType::Unknown => fallback,
        app => {
            stats.classification_hits.fetch_add(1, Ordering::Relaxed);
            app
        }
    }
}

fn check_rules(
    tracker: &mut ConnectionTracker,
    rules: &RuleManager,
    tuple: &FiveTuple,
) -> PacketAction {
    let (app, name) = match tracker.get(tuple) {
        Some(conn) => (conn.app, conn.server_name.clone()),
        None => (AppType::Unknown, String::new()),
    };

    if let Some(reason) = rules.should_block(tuple.src_ip, tuple.dst_port, app, &name) {
        debug!(
            "Blocking {} ({} rule: {})",
            tuple, reason.kind, reason.detail
        );
        tracker.block(tuple);
        return PacketAction::Drop;
    }

    PacketAction::Forward
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::tcp_flags;
    use crate::protocols::tls::tests::client_hello_with_sni;

    fn tcp_job(src_port: u16, dst_port: u16, flags: u8, payload: &[u8]) -> PacketJob {
        let mut data: Vec<u8> = vec![0u8; 54];
        data.extend_from_slice(payload);
        PacketJob {
            id: 0,
            tuple: FiveTuple {
                src_ip: u32::from_be_bytes([10, 0, 0, 1]),
                dst_ip: u32::from_be_bytes([1, 2, 3, 4]),
                src_port,
                dst_port,
                protocol: protocol::TCP,
            },
            data,
            eth_offset: 0,
            ip_offset: 14,
            transport_offset: 34,
            payload_offset: 54,
            payload_len: payload.len(),
            tcp_flags: flags,
            ts_sec: 0,
            ts_usec: 0,
        }
    }

    fn udp_job(src_port: u16, dst_port: u16, payload: &[u8]) -> PacketJob {
        let mut job = tcp_job(src_port, dst_port, 0, payload);
        job.tuple.protocol = protocol::UDP;
        job.transport_offset = 34;
        job.payload_offset = 42;
        job.data = vec![0u8; 42];
        job.data.extend_from_slice(payload);
        job
    }

    fn worker_parts() -> (ConnectionTracker, Arc<RuleManager>, FpStats) {
        (
            ConnectionTracker::new(0, 1024),
            Arc::new(RuleManager::new()),
            FpStats::default(),
        )
    }

    #[test]
    fn client_hello_classifies_flow() {
        let (mut tracker, rules, stats) = worker_parts();
        let hello = client_hello_with_sni("www.youtube.com");
        let job = tcp_job(40000, 443, tcp_flags::ACK, &hello);

        let action = process_job(&mut tracker, &rules, &stats, &job);
        assert_eq!(action, PacketAction::Forward);

        let conn = tracker.get(&job.tuple).unwrap();
        assert_eq!(conn.state, ConnectionState::Classified);
        assert_eq!(conn.app, AppType::YouTube);
        assert_eq!(conn.server_name, "www.youtube.com");
        assert_eq!(stats.sni_extractions.load(Ordering::Relaxed), 1);
        assert_eq!(stats.classification_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blocked_app_drops_and_marks_connection() {
        let (mut tracker, rules, stats) = worker_parts();
        rules.block_app(AppType::YouTube);

        let hello = client_hello_with_sni("www.youtube.com");
        let job = tcp_job(40000, 443, tcp_flags::ACK, &hello);

        assert_eq!(
            process_job(&mut tracker, &rules, &stats, &job),
            PacketAction::Drop
        );
        assert_eq!(
            tracker.get(&job.tuple).unwrap().state,
            ConnectionState::Blocked
        );

        // Later packets of the flow drop without re-inspection.
        let later = tcp_job(40000, 443, tcp_flags::ACK, b"");
        assert_eq!(
            process_job(&mut tracker, &rules, &stats, &later),
            PacketAction::Drop
        );
    }

    #[test]
    fn dns_query_classifies_flow() {
        let (mut tracker, rules, stats) = worker_parts();
        let query = crate::protocols::dns::tests::query_for("example.com");
        let job = udp_job(5353, 53, &query);

        assert_eq!(
            process_job(&mut tracker, &rules, &stats, &job),
            PacketAction::Forward
        );
        let conn = tracker.get(&job.tuple).unwrap();
        assert_eq!(conn.app, AppType::Dns);
        assert_eq!(conn.server_name, "example.com");
    }

    #[test]
    fn unknown_sni_falls_back_to_tls() {
        let (mut tracker, rules, stats) = worker_parts();
        let hello = client_hello_with_sni("internal.corp.lan");
        let job = tcp_job(40000, 443, tcp_flags::ACK, &hello);

        process_job(&mut tracker, &rules, &stats, &job);
        let conn = tracker.get(&job.tuple).unwrap();
        assert_eq!(conn.app, AppType::Tls);
        assert_eq!(stats.classification_hits.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn opaque_https_payload_classifies_once() {
        let (mut tracker, rules, stats) = worker_parts();
        let job = tcp_job(40000, 443, tcp_flags::ACK, &[0xAA; 80]);

        process_job(&mut tracker, &rules, &stats, &job);
        let conn = tracker.get(&job.tuple).unwrap();
        assert_eq!(conn.app, AppType::Https);
        assert_eq!(conn.state, ConnectionState::Classified);
    }

    #[test]
    fn rst_retires_the_connection_record() {
        let (mut tracker, rules, stats) = worker_parts();
        let open = tcp_job(40000, 443, tcp_flags::SYN, b"");
        process_job(&mut tracker, &rules, &stats, &open);
        assert_eq!(tracker.active_count(), 1);

        let rst = tcp_job(40000, 443, tcp_flags::RST, b"");
        assert_eq!(
            process_job(&mut tracker, &rules, &stats, &rst),
            PacketAction::Forward
        );
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.closed_count(), 1);
    }

    #[test]
    fn rule_match_on_closing_packet_keeps_it_closed() {
        let (mut tracker, rules, stats) = worker_parts();
        rules.block_app(AppType::YouTube);

        // One packet carrying both the ClientHello and an RST: the rule
        // matches, but the close observed on the same packet wins.
        let hello = client_hello_with_sni("www.youtube.com");
        let job = tcp_job(40000, 443, tcp_flags::RST, &hello);

        assert_eq!(
            process_job(&mut tracker, &rules, &stats, &job),
            PacketAction::Drop
        );
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.closed_count(), 1);
        assert_eq!(tracker.stats().blocked_connections, 0);
    }

    #[test]
    fn worker_thread_forwards_to_output_queue() {
        let rules = Arc::new(RuleManager::new());
        let output: Arc<BoundedQueue<PacketJob>> = Arc::new(BoundedQueue::new(64));
        let engine_stats = Arc::new(EngineStats::default());

        let mut fp = FastPath::new(
            0,
            64,
            1024,
            Duration::from_secs(300),
            rules,
            Arc::clone(&output),
            Arc::clone(&engine_stats),
        );
        fp.start();

        let input = fp.input_queue();
        for _ in 0..3 {
            input.push(tcp_job(40000, 443, tcp_flags::ACK, b""));
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while fp.stats().packets_processed.load(Ordering::Relaxed) < 3 {
            assert!(Instant::now() < deadline, "worker timed out");
            thread::sleep(Duration::from_millis(5));
        }

        let tracker = fp.stop().expect("tracker returned on first stop");
        assert!(fp.stop().is_none());

        assert_eq!(tracker.active_count(), 1);
        assert_eq!(output.len(), 3);
        assert_eq!(engine_stats.forwarded_packets.load(Ordering::Relaxed), 3);
    }
}
