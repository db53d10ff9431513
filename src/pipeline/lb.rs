//! Load balancer stage for Sift
//!
//! First pipeline stage: pops jobs off its input queue and forwards each to
//! one of its fast-path workers by flow-affinity hashing, so every packet
//! of a five-tuple lands on the same worker for the whole run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use crate::core::packet::PacketJob;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::POLL_INTERVAL;

/// Dispatch counters, shared with the engine for reporting.
#[derive(Debug)]
pub struct LbStats {
    pub packets_received: AtomicU64,
    pub packets_dispatched: AtomicU64,
    pub per_fp_packets: Vec<AtomicU64>,
}

impl LbStats {
    fn new(num_fps: usize) -> LbStats {
        LbStats {
            packets_received: AtomicU64::new(0),
            packets_dispatched: AtomicU64::new(0),
            per_fp_packets: (0..num_fps).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

/// One load balancer thread and its input queue.
pub struct LoadBalancer {
    id: usize,
    input: Arc<BoundedQueue<PacketJob>>,
    fp_queues: Vec<Arc<BoundedQueue<PacketJob>>>,
    stats: Arc<LbStats>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoadBalancer {
    pub fn new(
        id: usize,
        queue_capacity: usize,
        fp_queues: Vec<Arc<BoundedQueue<PacketJob>>>,
    ) -> LoadBalancer {
        let num_fps: usize = fp_queues.len();
        LoadBalancer {
            id,
            input: Arc::new(BoundedQueue::new(queue_capacity)),
            fp_queues,
            stats: Arc::new(LbStats::new(num_fps)),
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

    pub fn stats(&self) -> Arc<LbStats> {
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
        let fp_queues: Vec<Arc<BoundedQueue<PacketJob>>> =
            self.fp_queues.iter().map(Arc::clone).collect();
        let stats = Arc::clone(&self.stats);
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name(format!("sift-lb{}", id))
            .spawn(move || {
                debug!("LB{} started ({} workers)", id, fp_queues.len());

                while running.load(Ordering::SeqCst) {
                    match input.pop_timeout(POLL_INTERVAL) {
                        Some(job) => Self::dispatch(id, job, &fp_queues, &stats),
                        None => continue,
                    }
                }

                // Drain whatever arrived before shutdown so no job is lost.
                while let Some(job) = input.try_pop() {
                    Self::dispatch(id, job, &fp_queues, &stats);
                }

                debug!(
                    "LB{} exiting ({} dispatched)",
                    id,
                    stats.packets_dispatched.load(Ordering::Relaxed)
                );
            })
            .expect("failed to spawn load balancer thread");

        self.handle = Some(handle);
        info!("LB{} started", self.id);
    }

    fn dispatch(
        id: usize,
        job: PacketJob,
        fp_queues: &[Arc<BoundedQueue<PacketJob>>],
        stats: &LbStats,
    ) {
        stats.packets_received.fetch_add(1, Ordering::Relaxed);

        if fp_queues.is_empty() {
            return;
        }

        let index: usize = (job.tuple.flow_hash() % fp_queues.len() as u64) as usize;
        if fp_queues[index].push(job) {
            stats.packets_dispatched.fetch_add(1, Ordering::Relaxed);
            stats.per_fp_packets[index].fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("LB{} dropped a job: worker queue {} shut down", id, index);
        }
    }

    /// Stop the dispatcher: close the input queue, wake the thread, join.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.input.shutdown();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("LB{} thread panicked", self.id);
            }
            info!("LB{} stopped", self.id);
        }
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.stop();
    }
}
