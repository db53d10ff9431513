//! Flow tracking module for Sift
//!
//! Per-worker connection cache. Each fast-path worker owns exactly one
//! tracker, so nothing in here takes a lock: affinity hashing guarantees
//! every packet of a flow reaches the same worker. Capacity pressure is
//! handled by least-recently-used eviction; an auxiliary map from tuple to
//! list slot keeps touch and evict O(1).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::core::packet::{tcp_flags, FiveTuple};
use crate::protocols::AppType;

/// Lifecycle state of a tracked connection.
///
/// Progression is monotone along New -> Established -> Classified; Blocked
/// and Closed absorb from any earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    New,
    Established,
    Classified,
    Blocked,
    Closed,
}

/// One tracked flow.
#[derive(Debug, Clone)]
pub struct Connection {
    pub tuple: FiveTuple,
    pub state: ConnectionState,
    pub app: AppType,
    /// Server identity from SNI, HTTP Host, or DNS query; empty until seen.
    pub server_name: String,

    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,

    pub syn_seen: bool,
    pub syn_ack_seen: bool,
    pub fin_seen: bool,
    pub rst_seen: bool,

    pub first_seen: Instant,
    pub last_seen: Instant,
    pub average_packet_size: f64,
}

impl Connection {
    fn new(tuple: FiveTuple, now: Instant) -> Connection {
        Connection {
            tuple,
            state: ConnectionState::New,
            app: AppType::Unknown,
            server_name: String::new(),
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            syn_seen: false,
            syn_ack_seen: false,
            fin_seen: false,
            rst_seen: false,
            first_seen: now,
            last_seen: now,
            average_packet_size: 0.0,
        }
    }

    /// Account one packet against this connection.
    pub fn record_packet(&mut self, size: usize, is_outbound: bool, now: Instant) {
        if is_outbound {
            self.packets_out += 1;
            self.bytes_out += size as u64;
        } else {
            self.packets_in += 1;
            self.bytes_in += size as u64;
        }
        self.last_seen = now;

        let total = (self.packets_in + self.packets_out) as f64;
        self.average_packet_size += (size as f64 - self.average_packet_size) / total;
    }

    /// Advance the TCP state machine with the flags of one segment.
    ///
    /// Blocked dominates every transition; Classified only upgrades to
    /// Closed on FIN+ACK or RST.
    pub fn apply_tcp_flags(&mut self, flags: u8) {
        if flags & tcp_flags::SYN != 0 {
            if flags & tcp_flags::ACK != 0 {
                self.syn_ack_seen = true;
            } else {
                self.syn_seen = true;
            }
        }

        if self.syn_seen
            && self.syn_ack_seen
            && flags & tcp_flags::ACK != 0
            && self.state == ConnectionState::New
        {
            self.state = ConnectionState::Established;
        }

        if flags & tcp_flags::FIN != 0 {
            self.fin_seen = true;
        }

        if flags & tcp_flags::RST != 0 {
            self.rst_seen = true;
            if self.state != ConnectionState::Blocked {
                self.state = ConnectionState::Closed;
            }
        }

        if self.fin_seen
            && flags & tcp_flags::ACK != 0
            && self.state != ConnectionState::Blocked
        {
            self.state = ConnectionState::Closed;
        }
    }
}

const NIL: usize = usize::MAX;

struct LruNode {
    tuple: FiveTuple,
    prev: usize,
    next: usize,
}

/// Intrusive doubly-linked recency list over a slot vector. Head is the
/// most recently used entry, tail the eviction candidate.
struct LruList {
    nodes: Vec<LruNode>,
    head: usize,
    tail: usize,
    free: Vec<usize>,
}

impl LruList {
    fn new() -> LruList {
        LruList {
            nodes: Vec::new(),
            head: NIL,
            tail: NIL,
            free: Vec::new(),
        }
    }

    fn push_front(&mut self, tuple: FiveTuple) -> usize {
        let node = LruNode {
            tuple,
            prev: NIL,
            next: self.head,
        };

        let slot: usize = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                slot
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
        slot
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn remove(&mut self, slot: usize) -> FiveTuple {
        self.unlink(slot);
        self.free.push(slot);
        self.nodes[slot].tuple
    }

    fn tail_tuple(&self) -> Option<FiveTuple> {
        if self.tail == NIL {
            None
        } else {
            Some(self.nodes[self.tail].tuple)
        }
    }
}

/// Snapshot of a tracker's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackerStats {
    pub active_connections: usize,
    pub total_connections_seen: u64,
    pub classified_connections: u64,
    pub blocked_connections: u64,
    pub evicted_connections: u64,
    pub closed_connections: u64,
    pub load_factor: f64,
}

/// Per-worker connection cache with LRU eviction.
pub struct ConnectionTracker {
    fp_id: usize,
    max_connections: usize,

    connections: HashMap<FiveTuple, Connection>,
    lru: LruList,
    lru_index: HashMap<FiveTuple, usize>,

    total_seen: u64,
    classified_count: u64,
    blocked_count: u64,
    evicted_count: u64,
    closed_count: u64,
}

impl ConnectionTracker {
    pub fn new(fp_id: usize, max_connections: usize) -> ConnectionTracker {
        ConnectionTracker {
            fp_id,
            max_connections: max_connections.max(1),
            connections: HashMap::new(),
            lru: LruList::new(),
            lru_index: HashMap::new(),
            total_seen: 0,
            classified_count: 0,
            blocked_count: 0,
            evicted_count: 0,
            closed_count: 0,
        }
    }

    pub fn fp_id(&self) -> usize {
        self.fp_id
    }

    /// Look a connection up and touch its recency, or create it, evicting
    /// the least-recently-used entry when the cache is at capacity.
    pub fn get_or_create(&mut self, tuple: FiveTuple, now: Instant) -> &mut Connection {
        if self.connections.contains_key(&tuple) {
            if let Some(&slot) = self.lru_index.get(&tuple) {
                self.lru.move_to_front(slot);
            }
            return self.connections.get_mut(&tuple).expect("checked above");
        }

        if self.connections.len() >= self.max_connections {
            self.evict_oldest();
        }

        self.total_seen += 1;
        let slot: usize = self.lru.push_front(tuple);
        self.lru_index.insert(tuple, slot);
        self.connections.insert(tuple, Connection::new(tuple, now));
        self.connections.get_mut(&tuple).expect("just inserted")
    }

    pub fn get(&self, tuple: &FiveTuple) -> Option<&Connection> {
        self.connections.get(tuple)
    }

    /// Record a classification result. The state only moves forward:
    /// already-classified, blocked, or closed connections keep their state.
    pub fn classify(&mut self, tuple: &FiveTuple, app: AppType, server_name: String) {
        if let Some(conn) = self.connections.get_mut(tuple) {
            conn.app = app;
            conn.server_name = server_name;
            if conn.state < ConnectionState::Classified {
                conn.state = ConnectionState::Classified;
            }
            self.classified_count += 1;
        }
    }

    /// Mark a connection blocked. Blocked and Closed are both terminal, so
    /// a connection that already reached either state keeps it.
    pub fn block(&mut self, tuple: &FiveTuple) {
        if let Some(conn) = self.connections.get_mut(tuple) {
            if conn.state < ConnectionState::Blocked {
                conn.state = ConnectionState::Blocked;
                self.blocked_count += 1;
            }
        }
    }

    /// Drop a connection that observed an explicit close.
    pub fn close(&mut self, tuple: &FiveTuple) {
        if self.connections.remove(tuple).is_some() {
            if let Some(slot) = self.lru_index.remove(tuple) {
                self.lru.remove(slot);
            }
            self.closed_count += 1;
        }
    }

    /// Remove every connection idle longer than `timeout`. Returns the
    /// number removed.
    pub fn cleanup_stale(&mut self, timeout: Duration, now: Instant) -> usize {
        let stale: Vec<FiveTuple> = self
            .connections
            .iter()
            .filter(|(_, conn)| now.duration_since(conn.last_seen) > timeout)
            .map(|(tuple, _)| *tuple)
            .collect();

        for tuple in &stale {
            self.close(tuple);
        }
        stale.len()
    }

    fn evict_oldest(&mut self) {
        if let Some(tuple) = self.lru.tail_tuple() {
            self.connections.remove(&tuple);
            if let Some(slot) = self.lru_index.remove(&tuple) {
                self.lru.remove(slot);
            }
            self.evicted_count += 1;
        }
    }

    pub fn active_count(&self) -> usize {
        self.connections.len()
    }

    pub fn evicted_count(&self) -> u64 {
        self.evicted_count
    }

    pub fn closed_count(&self) -> u64 {
        self.closed_count
    }

    pub fn load_factor(&self) -> f64 {
        self.connections.len() as f64 / self.max_connections as f64
    }

    pub fn is_near_capacity(&self, threshold: f64) -> bool {
        self.load_factor() >= threshold
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            active_connections: self.connections.len(),
            total_connections_seen: self.total_seen,
            classified_connections: self.classified_count,
            blocked_connections: self.blocked_count,
            evicted_connections: self.evicted_count,
            closed_connections: self.closed_count,
            load_factor: self.load_factor(),
        }
    }

    /// Iterate the live connections, for reports.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }
}
