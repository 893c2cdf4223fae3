use std::time::{Duration, Instant};

use opentelemetry::{metrics::Histogram, KeyValue};

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the time between its creation and drop into `metric`.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod subscriber {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub frames_received: Counter<u64>,
        pub decode_errors: Counter<u64>,
        pub tuples_offered: Counter<u64>,
        pub tuples_overflowed: Counter<u64>,
        pub tuples_delivered: Counter<u64>,
        pub read_suspensions: Counter<u64>,
        pub read_resumptions: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("streamgrid-subscriber");
            let frames_received = meter
                .u64_counter("streamgrid.subscriber.frames_received")
                .with_description("number of frames received from the buffer server")
                .build();
            let decode_errors = meter
                .u64_counter("streamgrid.subscriber.decode_errors")
                .with_description("number of frames dropped because they could not be decoded")
                .build();
            let tuples_offered = meter
                .u64_counter("streamgrid.subscriber.tuples_offered")
                .with_description("number of tuples offered to reservoirs")
                .build();
            let tuples_overflowed = meter
                .u64_counter("streamgrid.subscriber.tuples_overflowed")
                .with_description("number of tuples parked in an emergency buffer")
                .build();
            let tuples_delivered = meter
                .u64_counter("streamgrid.subscriber.tuples_delivered")
                .with_description("number of tuples swept into sinks")
                .build();
            let read_suspensions = meter
                .u64_counter("streamgrid.subscriber.read_suspensions")
                .with_description("number of times network reads were suspended")
                .build();
            let read_resumptions = meter
                .u64_counter("streamgrid.subscriber.read_resumptions")
                .with_description("number of times network reads were resumed")
                .build();
            Metrics {
                frames_received,
                decode_errors,
                tuples_offered,
                tuples_overflowed,
                tuples_delivered,
                read_suspensions,
                read_resumptions,
            }
        }
    }
}

pub mod journal {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub records_written: Counter<u64>,
        pub records_replayed: Counter<u64>,
        pub records_skipped: Counter<u64>,
        pub writes: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("streamgrid-journal");
            let records_written = meter
                .u64_counter("streamgrid.journal.records_written")
                .with_description("number of container state records appended")
                .build();
            let records_replayed = meter
                .u64_counter("streamgrid.journal.records_replayed")
                .with_description("number of container state records applied during recovery")
                .build();
            let records_skipped = meter
                .u64_counter("streamgrid.journal.records_skipped")
                .with_description("number of journal entries skipped during recovery")
                .build();
            let writes = meter
                .f64_histogram("streamgrid.journal.writes")
                .with_description("journal append latencies in seconds")
                .build();
            Metrics {
                records_written,
                records_replayed,
                records_skipped,
                writes,
            }
        }
    }
}
