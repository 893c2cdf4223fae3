use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opentelemetry::KeyValue;
use tracing::debug;

use crate::ReadControl;

#[derive(Debug, Default)]
struct FlowState {
    saturated: usize,
    suspended: bool,
}

/// Edge-triggered read suspension shared by everything a subscriber buffers.
///
/// Reads are suspended when the first buffer saturates and resumed once the
/// last saturated buffer drains below capacity. The transport hooks fire
/// only on those transitions.
pub struct FlowControl {
    state: Mutex<FlowState>,
    control: Arc<dyn ReadControl>,
    metrics: Arc<metrics::subscriber::Metrics>,
    labels: [KeyValue; 1],
}

impl FlowControl {
    pub fn new(
        subscriber: &str,
        control: Arc<dyn ReadControl>,
        metrics: Arc<metrics::subscriber::Metrics>,
    ) -> Self {
        Self {
            state: Mutex::new(FlowState::default()),
            control,
            metrics,
            labels: [KeyValue::new("subscriber", subscriber.to_string())],
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlowState> {
        // Counters stay consistent even if a hook panicked.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn saturate(&self) {
        let mut state = self.lock();
        state.saturated += 1;
        if !state.suspended {
            state.suspended = true;
            debug!(saturated = state.saturated, "suspending buffer server reads");
            self.control.suspend_read();
            self.metrics.read_suspensions.add(1, &self.labels);
        }
    }

    pub fn relieve(&self) {
        let mut state = self.lock();
        state.saturated = state.saturated.saturating_sub(1);
        if state.saturated == 0 && state.suspended {
            state.suspended = false;
            debug!("resuming buffer server reads");
            self.control.resume_read();
            self.metrics.read_resumptions.add(1, &self.labels);
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }
}
