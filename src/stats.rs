use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

/// `InferStats` - per-request statistics collector. One instance accompanies
/// each request through the scheduler and is shared with whoever reports the
/// request's outcome.
#[derive(Debug)]
pub struct InferStats {
    /// Name of the model the request targets
    model_name: String,
    /// Model executions attributed to this request. Requests executed
    /// together in one batch count a single execution between them.
    model_execution_count: AtomicU64,
    /// Time the request spent queued before execution
    queue_duration: Mutex<Option<Duration>>,
}

impl InferStats {
    /// Constructor
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            model_execution_count: AtomicU64::new(0),
            queue_duration: Mutex::new(None),
        }
    }

    /// Getter for `model_name`
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Attributes `count` model executions to this request.
    pub fn set_model_execution_count(&self, count: u64) {
        self.model_execution_count.store(count, Ordering::SeqCst);
    }

    /// Getter for `model_execution_count`
    pub fn model_execution_count(&self) -> u64 {
        self.model_execution_count.load(Ordering::SeqCst)
    }

    /// Starts the queue timer for this request. The returned timer records
    /// the elapsed time into these stats when dropped.
    pub fn start_queue_timer(self: &Arc<Self>) -> QueueTimer {
        QueueTimer {
            start: Instant::now(),
            stats: Arc::clone(self),
        }
    }

    /// Time the request spent queued, recorded once its timer is dropped.
    pub fn queue_duration(&self) -> Option<Duration> {
        *self
            .queue_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn record_queue_duration(&self, duration: Duration) {
        let mut guard = self
            .queue_duration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(duration);

        let queue_time_histogram = metrics::histogram!("sequence-batcher-queue-time");
        queue_time_histogram.record(duration.as_secs_f32());
    }
}

/// `QueueTimer` - scoped timer covering a request's life in the scheduler
/// queues. Records into its stats handle on drop.
#[derive(Debug)]
pub struct QueueTimer {
    start: Instant,
    stats: Arc<InferStats>,
}

impl Drop for QueueTimer {
    fn drop(&mut self) {
        self.stats.record_queue_duration(self.start.elapsed());
    }
}
