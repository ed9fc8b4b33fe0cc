//! Lossy read buffer.
//!
//! Gets push their key hash here instead of touching the policy directly;
//! stripes batch the hashes and hand full batches to the consumer. This is
//! the batching process described in the BP-Wrapper paper (section III
//! part A). Signals are best-effort: the sketch needs representative
//! frequencies, not exact counts, so a contended stripe or a full consumer
//! just drops the batch.

use std::sync::Arc;

use crate::metrics::{MetricType, Metrics};
use crate::pool::Pool;

/// Sink for full batches of key hashes. Returns false when the batch was
/// dropped instead of absorbed.
pub(crate) trait Consumer {
    fn push(&self, batch: Vec<u64>) -> bool;
}

/// A singular ring stripe. Not safe for concurrent use; the pool hands each
/// one to at most one producer at a time.
struct RingStripe {
    cons: Arc<dyn Consumer + Send + Sync>,
    data: Vec<u64>,
    capacity: usize,
}

impl RingStripe {
    fn new(cons: Arc<dyn Consumer + Send + Sync>, capacity: usize) -> Self {
        RingStripe {
            cons,
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item and drains to the consumer when full. The stripe is
    /// reset either way; a rejected batch is lost.
    fn push(&mut self, item: u64) {
        self.data.push(item);
        if self.data.len() >= self.capacity {
            let batch = std::mem::replace(&mut self.data, Vec::with_capacity(self.capacity));
            self.cons.push(batch);
        }
    }
}

/// Stripe pool distributing pushed hashes between producers to lower
/// contention.
pub(crate) struct RingBuffer {
    pool: Pool<RingStripe>,
    metrics: Option<Metrics>,
}

impl RingBuffer {
    pub(crate) fn new(
        cons: Arc<dyn Consumer + Send + Sync>,
        pool_capacity: usize,
        stripe_capacity: usize,
        metrics: Option<Metrics>,
    ) -> Self {
        RingBuffer {
            pool: Pool::new(pool_capacity, || {
                RingStripe::new(cons.clone(), stripe_capacity)
            }),
            metrics,
        }
    }

    /// Adds an element to one of the stripes, possibly draining it. If every
    /// stripe is checked out the signal is dropped and counted.
    pub(crate) fn push(&self, item: u64) {
        match self.pool.try_pull() {
            Some(mut stripe) => stripe.push(item),
            None => {
                if let Some(metrics) = self.metrics.as_ref() {
                    metrics.add(MetricType::DropGets, item, 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct TestConsumer {
        batches: Mutex<Vec<Vec<u64>>>,
        accept: bool,
    }

    impl Consumer for TestConsumer {
        fn push(&self, batch: Vec<u64>) -> bool {
            if self.accept {
                self.batches.lock().push(batch);
            }
            self.accept
        }
    }

    #[test]
    fn test_ring_drain() {
        let cons = Arc::new(TestConsumer {
            batches: Mutex::new(Vec::new()),
            accept: true,
        });
        let ring = RingBuffer::new(cons.clone(), 1, 4, None);

        for i in 0..16 {
            ring.push(i);
        }

        let batches = cons.batches.lock();
        assert_eq!(batches.len(), 4);
        for batch in batches.iter() {
            assert_eq!(batch.len(), 4);
        }
    }

    #[test]
    fn test_ring_lossy_on_rejected_batch() {
        let cons = Arc::new(TestConsumer {
            batches: Mutex::new(Vec::new()),
            accept: false,
        });
        let ring = RingBuffer::new(cons.clone(), 1, 4, None);

        for i in 0..16 {
            ring.push(i);
        }

        // Rejected batches disappear; the stripe keeps accepting pushes.
        assert!(cons.batches.lock().is_empty());
    }

    #[test]
    fn test_exhausted_pool_counts_drops() {
        let cons = Arc::new(TestConsumer {
            batches: Mutex::new(Vec::new()),
            accept: true,
        });
        let metrics = Metrics::new();
        // No stripes at all: every push is a counted drop.
        let ring = RingBuffer::new(cons.clone(), 0, 4, Some(metrics.clone()));

        for i in 0..8 {
            ring.push(i);
        }

        assert!(cons.batches.lock().is_empty());
        assert_eq!(metrics.gets_dropped(), 8);
    }
}
