//! Buffer-server subscriber side: frames read off the network are decoded,
//! routed to per-sink reservoirs and handed to consumers only when they sweep.

pub mod codec;
pub mod emergency;
pub mod flow;
pub mod frame;
pub mod reservoir;
pub mod subscriber;
pub mod transport;

pub use codec::{BytesCodec, StreamCodec};
pub use emergency::EmergencyBuffer;
pub use flow::FlowControl;
pub use frame::{payload_frame, FrameError, MessageType};
pub use reservoir::{PartitionFilter, Reservoir};
pub use subscriber::BufferServerSubscriber;
pub use transport::{FrameReader, ReadGate};

/// Delivery target of a reservoir, owned by the consumer.
pub trait Sink<T>: Send {
    fn put(&mut self, tuple: T);

    /// Number of tuples received so far, optionally restarting the count.
    fn count(&mut self, reset: bool) -> usize;
}

/// Hooks implemented by the network transport feeding a subscriber.
pub trait ReadControl: Send + Sync {
    fn suspend_read(&self);
    fn resume_read(&self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    };

    use super::{ReadControl, Sink};

    #[derive(Default)]
    pub struct CountingControl {
        pub suspends: AtomicUsize,
        pub resumes: AtomicUsize,
    }

    impl CountingControl {
        pub fn suspends(&self) -> usize {
            self.suspends.load(Ordering::SeqCst)
        }

        pub fn resumes(&self) -> usize {
            self.resumes.load(Ordering::SeqCst)
        }
    }

    impl ReadControl for CountingControl {
        fn suspend_read(&self) {
            self.suspends.fetch_add(1, Ordering::SeqCst);
        }

        fn resume_read(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Sink collecting into a list the test keeps a handle to.
    pub struct CollectSink<T> {
        pub tuples: Arc<Mutex<Vec<T>>>,
        count: usize,
    }

    impl<T> CollectSink<T> {
        pub fn new() -> (Self, Arc<Mutex<Vec<T>>>) {
            let tuples = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    tuples: tuples.clone(),
                    count: 0,
                },
                tuples,
            )
        }
    }

    impl<T: Send> Sink<T> for CollectSink<T> {
        fn put(&mut self, tuple: T) {
            self.tuples.lock().unwrap().push(tuple);
            self.count += 1;
        }

        fn count(&mut self, reset: bool) -> usize {
            let count = self.count;
            if reset {
                self.count = 0;
            }
            count
        }
    }
}
