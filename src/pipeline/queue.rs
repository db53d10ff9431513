//! Bounded job queue for Sift
//!
//! Multi-producer/multi-consumer FIFO with backpressure and cooperative
//! shutdown. Producers block while the queue is full; consumers block while
//! it is empty. Shutdown wakes every waiter, rejects further pushes, and
//! still lets consumers drain whatever is queued.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    shutdown: bool,
}

/// Blocking bounded MPMC queue.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,

    total_pushes: AtomicU64,
    total_pops: AtomicU64,
    max_depth: AtomicUsize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> BoundedQueue<T> {
        BoundedQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: capacity.max(1),
            total_pushes: AtomicU64::new(0),
            total_pops: AtomicU64::new(0),
            max_depth: AtomicUsize::new(0),
        }
    }

    /// Block until there is room or the queue shuts down. Returns whether
    /// the item was accepted.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        while inner.items.len() >= self.capacity && !inner.shutdown {
            self.not_full.wait(&mut inner);
        }
        if inner.shutdown {
            return false;
        }

        inner.items.push_back(item);
        self.record_push(inner.items.len());
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking push; rejected when full or shut down.
    pub fn try_push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.items.len() >= self.capacity || inner.shutdown {
            return false;
        }

        inner.items.push_back(item);
        self.record_push(inner.items.len());
        self.not_empty.notify_one();
        true
    }

    /// Block until an item is available or the queue shuts down empty.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.shutdown {
            self.not_empty.wait(&mut inner);
        }
        self.take(&mut inner)
    }

    /// Like `pop`, but gives up after `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline: Instant = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.items.is_empty() && !inner.shutdown {
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        self.take(&mut inner)
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        self.take(&mut inner)
    }

    fn take(&self, inner: &mut Inner<T>) -> Option<T> {
        let item = inner.items.pop_front();
        if item.is_some() {
            self.total_pops.fetch_add(1, Ordering::Relaxed);
            self.not_full.notify_one();
        }
        item
    }

    /// Idempotent: rejects future pushes, wakes every waiter, and leaves
    /// queued items for consumers to drain.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.shutdown = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_pushes(&self) -> u64 {
        self.total_pushes.load(Ordering::Relaxed)
    }

    pub fn total_pops(&self) -> u64 {
        self.total_pops.load(Ordering::Relaxed)
    }

    /// Highest queue depth observed at any push.
    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    fn record_push(&self, depth: usize) {
        self.total_pushes.fetch_add(1, Ordering::Relaxed);

        let mut prev: usize = self.max_depth.load(Ordering::Relaxed);
        while depth > prev {
            match self.max_depth.compare_exchange_weak(
                prev,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => prev = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order_and_counters() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(8);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));

        assert_eq!(queue.total_pushes(), 3);
        assert_eq!(queue.total_pops(), 3);
        assert_eq!(queue.max_depth(), 3);
    }

    #[test]
    fn try_push_rejects_when_full() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        assert!(queue.try_push(1));
        assert!(queue.try_push(2));
        assert!(!queue.try_push(3));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn pop_timeout_expires_on_empty_queue() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(2);
        let start = Instant::now();
        assert_eq!(queue.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn shutdown_wakes_blocked_consumer() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(consumer.join().unwrap(), None);

        // Idempotent, and pushes now fail.
        queue.shutdown();
        assert!(!queue.push(1));
        assert!(!queue.try_push(1));
    }

    #[test]
    fn shutdown_still_allows_draining() {
        let queue: BoundedQueue<u32> = BoundedQueue::new(4);
        queue.push(7);
        queue.push(8);
        queue.shutdown();

        assert_eq!(queue.pop(), Some(7));
        assert_eq!(queue.pop_timeout(Duration::from_millis(10)), Some(8));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn blocked_producer_resumes_after_pop() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        assert!(queue.push(1));

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop(), Some(1));
        assert!(producer.join().unwrap());
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn concurrent_producers_and_consumers() {
        let queue: Arc<BoundedQueue<u64>> = Arc::new(BoundedQueue::new(16));
        let mut handles = Vec::new();

        for t in 0..4u64 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    assert!(queue.push(t * 1000 + i));
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..2 {
            let queue = Arc::clone(&queue);
            consumers.push(thread::spawn(move || {
                let mut seen: u64 = 0;
                while queue.pop().is_some() {
                    seen += 1;
                }
                seen
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        // Let the consumers drain, then release them.
        while !queue.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        queue.shutdown();

        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 400);
        assert_eq!(queue.total_pops(), 400);
    }
}
