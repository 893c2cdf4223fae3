use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
    Mutex,
    MutexGuard,
    PoisonError,
};

use anyhow::{anyhow, Result};
use crossbeam_queue::ArrayQueue;
use opentelemetry::KeyValue;
use tracing::{debug, trace};

use crate::{EmergencyBuffer, FlowControl, Sink};

/// Partitions a reservoir accepts: `partition & mask` must be one of `keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFilter {
    pub mask: i32,
    pub keys: Vec<i32>,
}

impl PartitionFilter {
    pub fn new(mask: i32, keys: Vec<i32>) -> Self {
        Self { mask, keys }
    }

    pub fn accepts(&self, partition: i32) -> bool {
        self.keys.contains(&(partition & self.mask))
    }
}

/// Bounded, single-sink tuple queue drained only by `sweep`.
///
/// One producer calls `offer` while one consumer calls `sweep`. Tuples that
/// do not fit go to the emergency buffer and are moved into the bounded
/// queue, in order, as sweeps free room. While `overflowing` is set the
/// producer never touches the bounded queue directly, so the emergency
/// buffer always holds the newest tuples.
pub struct Reservoir<T> {
    name: String,
    capacity: usize,
    filter: Option<PartitionFilter>,
    queue: ArrayQueue<T>,
    emergency: Mutex<EmergencyBuffer<T>>,
    /// Set by the producer under `emergency`, cleared by the consumer under
    /// `emergency` once it is empty.
    overflowing: AtomicBool,
    /// Tuples in the bounded queue plus the emergency buffer.
    resident: AtomicUsize,
    saturated: AtomicBool,
    sink: Mutex<Option<Box<dyn Sink<T>>>>,
    flow: Arc<FlowControl>,
    metrics: Arc<metrics::subscriber::Metrics>,
    labels: [KeyValue; 1],
}

fn lock<U>(mutex: &Mutex<U>) -> MutexGuard<'_, U> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<T: Send> Reservoir<T> {
    pub fn new(
        name: &str,
        capacity: usize,
        filter: Option<PartitionFilter>,
        flow: Arc<FlowControl>,
        metrics: Arc<metrics::subscriber::Metrics>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(anyhow!("reservoir {} needs a capacity of at least 1", name));
        }
        Ok(Self {
            name: name.to_string(),
            capacity,
            filter,
            queue: ArrayQueue::new(capacity),
            emergency: Mutex::new(EmergencyBuffer::new()),
            overflowing: AtomicBool::new(false),
            resident: AtomicUsize::new(0),
            saturated: AtomicBool::new(false),
            sink: Mutex::new(None),
            flow,
            metrics,
            labels: [KeyValue::new("sink", name.to_string())],
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn accepts(&self, partition: i32) -> bool {
        match &self.filter {
            Some(filter) => filter.accepts(partition),
            None => true,
        }
    }

    /// Tuples waiting for delivery, including overflow.
    pub fn len(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn emergency_len(&self) -> usize {
        lock(&self.emergency).len()
    }

    /// Binds the delivery target. Returns the previous sink, if any.
    pub fn attach_sink(&self, sink: Box<dyn Sink<T>>) -> Option<Box<dyn Sink<T>>> {
        debug!(sink = %self.name, "sink attached to reservoir");
        lock(&self.sink).replace(sink)
    }

    pub fn detach_sink(&self) -> Option<Box<dyn Sink<T>>> {
        lock(&self.sink).take()
    }

    /// Queues `tuple`, spilling into the emergency buffer when full. Never
    /// drops. Returns true when the reservoir is at or above capacity.
    pub fn offer(&self, tuple: T) -> bool {
        self.resident.fetch_add(1, Ordering::AcqRel);
        self.metrics.tuples_offered.add(1, &self.labels);

        let pushed = if self.overflowing.load(Ordering::Acquire) {
            Err(tuple)
        } else {
            self.queue.push(tuple)
        };
        if let Err(tuple) = pushed {
            self.overflow(tuple);
        }

        let at_capacity = self.len() >= self.capacity;
        if at_capacity &&
            self.saturated
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            trace!(sink = %self.name, "reservoir saturated");
            self.flow.saturate();
        }
        at_capacity
    }

    fn overflow(&self, tuple: T) {
        let mut emergency = lock(&self.emergency);
        let tuple = if self.overflowing.load(Ordering::Acquire) {
            tuple
        } else {
            // The consumer may have drained the queue since the failed push.
            match self.queue.push(tuple) {
                Ok(()) => return,
                Err(tuple) => tuple,
            }
        };
        emergency.push(tuple);
        self.overflowing.store(true, Ordering::Release);
        self.metrics.tuples_overflowed.add(1, &self.labels);
    }

    /// Delivers the tuples resident in the bounded queue at the start of the
    /// call to the sink, then refills the queue from the emergency buffer.
    /// Returns the number of tuples delivered; 0 when no sink is attached.
    pub fn sweep(&self) -> usize {
        let mut sink = lock(&self.sink);
        let Some(sink) = sink.as_mut() else {
            return 0;
        };

        let mut delivered = 0;
        for _ in 0..self.queue.len() {
            match self.queue.pop() {
                Some(tuple) => {
                    sink.put(tuple);
                    delivered += 1;
                }
                None => break,
            }
        }
        if delivered > 0 {
            self.resident.fetch_sub(delivered, Ordering::AcqRel);
            self.metrics
                .tuples_delivered
                .add(delivered as u64, &self.labels);
        }

        self.refill();

        if self.len() < self.capacity &&
            self.saturated
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            trace!(sink = %self.name, "reservoir drained below capacity");
            self.flow.relieve();
        }
        delivered
    }

    /// Gives up this reservoir's hold on the read side, used on teardown.
    pub(crate) fn release_flow(&self) {
        if self.saturated.swap(false, Ordering::AcqRel) {
            self.flow.relieve();
        }
    }

    /// Moves overflow into the bounded queue. The emergency lock is held only
    /// to split off a batch and to put back leftovers, never while pushing.
    fn refill(&self) {
        if !self.overflowing.load(Ordering::Acquire) {
            return;
        }
        // While overflowing the producer stays off the bounded queue, so the
        // room measured here is still free when the batch is pushed.
        let room = self.capacity - self.queue.len();
        let batch = lock(&self.emergency).take_front(room);

        let mut unplaced = Vec::new();
        for tuple in batch {
            if !unplaced.is_empty() {
                unplaced.push(tuple);
            } else if let Err(tuple) = self.queue.push(tuple) {
                unplaced.push(tuple);
            }
        }

        let mut emergency = lock(&self.emergency);
        for tuple in unplaced.into_iter().rev() {
            emergency.push_front(tuple);
        }
        if emergency.is_empty() {
            self.overflowing.store(false, Ordering::Release);
        }
    }
}
