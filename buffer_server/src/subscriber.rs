use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::{
    frame::parse_frame,
    EmergencyBuffer,
    FlowControl,
    FrameError,
    PartitionFilter,
    ReadControl,
    Reservoir,
    StreamCodec,
};

struct Backlog<T> {
    tuples: EmergencyBuffer<(i32, T)>,
    saturated: bool,
}

/// Receives frames from one buffer-server stream and routes the decoded
/// tuples to the reservoirs acquired by downstream sinks.
///
/// Tuples that arrive before any matching reservoir exists are parked in a
/// backlog and handed over when a reservoir that accepts them is acquired.
pub struct BufferServerSubscriber<C: StreamCodec> {
    id: String,
    codec: C,
    flow: Arc<FlowControl>,
    reservoirs: RwLock<Vec<Arc<Reservoir<C::Tuple>>>>,
    backlog: Mutex<Backlog<C::Tuple>>,
    backlog_capacity: usize,
    metrics: Arc<metrics::subscriber::Metrics>,
    labels: [KeyValue; 1],
}

impl<C: StreamCodec> BufferServerSubscriber<C> {
    pub fn new(
        id: &str,
        backlog_capacity: usize,
        codec: C,
        control: Arc<dyn ReadControl>,
    ) -> Result<Self> {
        if backlog_capacity == 0 {
            return Err(anyhow!(
                "subscriber {} needs a backlog capacity of at least 1",
                id
            ));
        }
        let metrics = Arc::new(metrics::subscriber::Metrics::new());
        Ok(Self {
            id: id.to_string(),
            codec,
            flow: Arc::new(FlowControl::new(id, control, metrics.clone())),
            reservoirs: RwLock::new(Vec::new()),
            backlog: Mutex::new(Backlog {
                tuples: EmergencyBuffer::new(),
                saturated: false,
            }),
            backlog_capacity,
            metrics,
            labels: [KeyValue::new("subscriber", id.to_string())],
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_read_suspended(&self) -> bool {
        self.flow.is_suspended()
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog<C::Tuple>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog().tuples.len()
    }

    pub fn reservoirs(&self) -> Vec<Arc<Reservoir<C::Tuple>>> {
        self.reservoirs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the reservoir for `name`, creating it if needed.
    pub fn acquire_reservoir(&self, name: &str, capacity: usize) -> Result<Arc<Reservoir<C::Tuple>>> {
        self.acquire(name, capacity, None)
    }

    /// Like `acquire_reservoir`, but the reservoir only receives tuples
    /// whose partition passes `filter`. The filter of an existing reservoir
    /// is left as it is.
    pub fn acquire_partitioned_reservoir(
        &self,
        name: &str,
        capacity: usize,
        filter: PartitionFilter,
    ) -> Result<Arc<Reservoir<C::Tuple>>> {
        self.acquire(name, capacity, Some(filter))
    }

    fn acquire(
        &self,
        name: &str,
        capacity: usize,
        filter: Option<PartitionFilter>,
    ) -> Result<Arc<Reservoir<C::Tuple>>> {
        let mut reservoirs = self
            .reservoirs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = reservoirs.iter().find(|r| r.name() == name) {
            return Ok(existing.clone());
        }

        let reservoir = Arc::new(Reservoir::new(
            name,
            capacity,
            filter,
            self.flow.clone(),
            self.metrics.clone(),
        )?);

        // Holding the write lock keeps new frames out until the backlog is
        // handed over, so the reservoir sees them in arrival order.
        let mut backlog = self.backlog();
        let handed_over = backlog
            .tuples
            .extract_if(|(partition, _)| reservoir.accepts(*partition));
        let count = handed_over.len();
        for (_, tuple) in handed_over {
            reservoir.offer(tuple);
        }
        if backlog.saturated && backlog.tuples.len() < self.backlog_capacity {
            backlog.saturated = false;
            self.flow.relieve();
        }
        drop(backlog);

        info!(
            subscriber = %self.id,
            sink = name,
            capacity,
            backlog = count,
            "acquired reservoir"
        );
        reservoirs.push(reservoir.clone());
        Ok(reservoir)
    }

    /// Handles one frame body from the network. Malformed frames are
    /// reported and dropped.
    pub fn on_message(&self, frame: &[u8]) {
        self.metrics.frames_received.add(1, &self.labels);
        match self.decode(frame) {
            Ok((partition, tuple)) => self.route(partition, tuple),
            Err(err) => {
                warn!(subscriber = %self.id, "dropping frame: {}", err);
                self.metrics.decode_errors.add(1, &self.labels);
            }
        }
    }

    pub fn decode(&self, frame: &[u8]) -> Result<(i32, C::Tuple), FrameError> {
        let frame = parse_frame(frame)?;
        let tuple = self
            .codec
            .decode(frame.payload)
            .map_err(FrameError::Codec)?;
        Ok((self.codec.partition(&tuple), tuple))
    }

    fn route(&self, partition: i32, tuple: C::Tuple) {
        let reservoirs = self
            .reservoirs
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut targets = reservoirs.iter().filter(|r| r.accepts(partition));
        let Some(first) = targets.next() else {
            self.park(partition, tuple);
            return;
        };
        for reservoir in targets {
            reservoir.offer(tuple.clone());
        }
        first.offer(tuple);
    }

    fn park(&self, partition: i32, tuple: C::Tuple) {
        let mut backlog = self.backlog();
        backlog.tuples.push((partition, tuple));
        self.metrics.tuples_overflowed.add(1, &self.labels);
        if !backlog.saturated && backlog.tuples.len() >= self.backlog_capacity {
            backlog.saturated = true;
            debug!(subscriber = %self.id, "backlog saturated");
            self.flow.saturate();
        }
    }

    /// Drops every reservoir and backlogged tuple.
    pub fn teardown(&self) {
        let mut reservoirs = self
            .reservoirs
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut backlog = self.backlog();
        let discarded = backlog.tuples.len() + reservoirs.iter().map(|r| r.len()).sum::<usize>();
        if discarded > 0 {
            warn!(subscriber = %self.id, discarded, "tearing down with undelivered tuples");
        }
        backlog.tuples.clear();
        if backlog.saturated {
            backlog.saturated = false;
            self.flow.relieve();
        }
        for reservoir in reservoirs.drain(..) {
            reservoir.release_flow();
        }
        info!(subscriber = %self.id, "subscriber torn down");
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use bytes::Bytes;

    use super::*;
    use crate::{
        payload_frame,
        test_support::{CollectSink, CountingControl},
        BytesCodec,
    };

    fn subscriber(backlog: usize) -> (BufferServerSubscriber<BytesCodec>, Arc<CountingControl>) {
        let control = Arc::new(CountingControl::default());
        let subscriber =
            BufferServerSubscriber::new("subscriber", backlog, BytesCodec, control.clone()).unwrap();
        (subscriber, control)
    }

    fn sweep_all<T: Send>(reservoir: &Reservoir<T>) {
        loop {
            reservoir.sweep();
            if reservoir.is_empty() {
                break;
            }
        }
    }

    #[test]
    fn test_emergency_sinks() {
        let (subscriber, control) = subscriber(5);
        let reservoir = subscriber.acquire_reservoir("unbufferedSink", 3).unwrap();
        let (sink, received) = CollectSink::new();
        reservoir.attach_sink(Box::new(sink));

        for i in 1..=10u8 {
            subscriber.on_message(&payload_frame(0, &[i]));
        }
        assert_eq!(control.suspends(), 1);
        assert_eq!(control.resumes(), 0);

        sweep_all(&reservoir);
        let received: Vec<Bytes> = received.lock().unwrap().clone();
        assert_eq!(
            received,
            (1..=10u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>()
        );
        assert_eq!(control.suspends(), 1);
        assert_eq!(control.resumes(), 1);
    }

    #[test]
    fn test_acquire_is_idempotent_and_rejects_zero_capacity() {
        let (subscriber, _control) = subscriber(5);
        let first = subscriber.acquire_reservoir("sink", 3).unwrap();
        let second = subscriber.acquire_reservoir("sink", 10).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 3);
        assert!(subscriber.acquire_reservoir("other", 0).is_err());
        assert_eq!(subscriber.reservoirs().len(), 1);
        assert!(BufferServerSubscriber::new(
            "subscriber",
            0,
            BytesCodec,
            Arc::new(CountingControl::default())
        )
        .is_err());
    }

    #[test]
    fn test_malformed_frames_are_skipped() {
        let (subscriber, _control) = subscriber(5);
        let reservoir = subscriber.acquire_reservoir("sink", 8).unwrap();
        subscriber.on_message(&payload_frame(0, b"a"));
        subscriber.on_message(&[]);
        subscriber.on_message(&[9, 0, 0, 0, 0, 1]);
        subscriber.on_message(&[1, 0]);
        subscriber.on_message(&payload_frame(0, b"b"));

        let (sink, received) = CollectSink::new();
        reservoir.attach_sink(Box::new(sink));
        sweep_all(&reservoir);
        assert_eq!(
            *received.lock().unwrap(),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
    }

    struct Utf8Codec;

    impl StreamCodec for Utf8Codec {
        type Tuple = String;

        fn decode(&self, payload: &[u8]) -> Result<String> {
            match std::str::from_utf8(payload) {
                Ok(s) => Ok(s.to_string()),
                Err(err) => bail!("not utf-8: {}", err),
            }
        }

        fn encode(&self, tuple: &String) -> Bytes {
            Bytes::copy_from_slice(tuple.as_bytes())
        }

        fn partition(&self, tuple: &String) -> i32 {
            tuple.len() as i32
        }
    }

    #[test]
    fn test_codec_errors_are_skipped() {
        let subscriber =
            BufferServerSubscriber::new("subscriber", 5, Utf8Codec, Arc::new(CountingControl::default()))
                .unwrap();
        assert!(matches!(
            subscriber.decode(&payload_frame(0, &[0xff, 0xfe])),
            Err(FrameError::Codec(_))
        ));
        let reservoir = subscriber.acquire_reservoir("sink", 4).unwrap();
        subscriber.on_message(&payload_frame(0, &[0xff]));
        subscriber.on_message(&payload_frame(0, "ok".as_bytes()));
        assert_eq!(reservoir.len(), 1);
    }

    #[test]
    fn test_backlog_handed_over_on_acquire() {
        let (subscriber, control) = subscriber(4);
        for i in 0..6u8 {
            subscriber.on_message(&payload_frame(0, &[i]));
        }
        assert_eq!(subscriber.backlog_len(), 6);
        assert_eq!(control.suspends(), 1);

        let reservoir = subscriber.acquire_reservoir("late", 16).unwrap();
        assert_eq!(subscriber.backlog_len(), 0);
        assert_eq!(control.resumes(), 1);

        subscriber.on_message(&payload_frame(0, &[6]));
        let (sink, received) = CollectSink::new();
        reservoir.attach_sink(Box::new(sink));
        sweep_all(&reservoir);
        assert_eq!(
            *received.lock().unwrap(),
            (0..7u8).map(|i| Bytes::from(vec![i])).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_partitioned_fan_out() {
        let subscriber =
            BufferServerSubscriber::new("subscriber", 8, Utf8Codec, Arc::new(CountingControl::default()))
                .unwrap();
        let odd = subscriber
            .acquire_partitioned_reservoir("odd", 8, PartitionFilter::new(1, vec![1]))
            .unwrap();
        let all = subscriber.acquire_reservoir("all", 8).unwrap();

        for word in ["a", "bb", "ccc", "dddd"] {
            subscriber.on_message(&payload_frame(0, word.as_bytes()));
        }

        let (odd_sink, odd_received) = CollectSink::new();
        odd.attach_sink(Box::new(odd_sink));
        let (all_sink, all_received) = CollectSink::new();
        all.attach_sink(Box::new(all_sink));
        sweep_all(&odd);
        sweep_all(&all);
        assert_eq!(*odd_received.lock().unwrap(), vec!["a", "ccc"]);
        assert_eq!(*all_received.lock().unwrap(), vec!["a", "bb", "ccc", "dddd"]);
        assert_eq!(subscriber.backlog_len(), 0);
    }

    #[test]
    fn test_unmatched_partitions_wait_for_a_matching_reservoir() {
        let subscriber =
            BufferServerSubscriber::new("subscriber", 8, Utf8Codec, Arc::new(CountingControl::default()))
                .unwrap();
        let even = subscriber
            .acquire_partitioned_reservoir("even", 8, PartitionFilter::new(1, vec![0]))
            .unwrap();
        for word in ["a", "bb", "ccc"] {
            subscriber.on_message(&payload_frame(0, word.as_bytes()));
        }
        assert_eq!(even.len(), 1);
        assert_eq!(subscriber.backlog_len(), 2);

        let odd = subscriber
            .acquire_partitioned_reservoir("odd", 8, PartitionFilter::new(1, vec![1]))
            .unwrap();
        assert_eq!(odd.len(), 2);
        assert_eq!(subscriber.backlog_len(), 0);
    }

    #[test]
    fn test_teardown_clears_state() {
        let (subscriber, control) = subscriber(2);
        for i in 0..3u8 {
            subscriber.on_message(&payload_frame(0, &[i]));
        }
        let reservoir = subscriber
            .acquire_partitioned_reservoir("none", 1, PartitionFilter::new(1, vec![1]))
            .unwrap();
        reservoir.offer(Bytes::from_static(b"x"));
        assert!(subscriber.is_read_suspended());
        assert_eq!(control.suspends(), 1);
        subscriber.teardown();
        assert_eq!(subscriber.backlog_len(), 0);
        assert!(subscriber.reservoirs().is_empty());
        assert!(!subscriber.is_read_suspended());
        assert_eq!(control.resumes(), 1);
    }
}
