use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    request::{RequestProvider, ResponseProvider},
    stats::{InferStats, QueueTimer},
};

/// Errors surfaced through request completion callbacks or at scheduler
/// construction. Cloneable since one failure fans out to every payload of
/// a batch.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SchedulerError {
    /// The request itself is malformed and was never queued
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The model runner failed while executing a batch
    #[error("runtime error: {0}")]
    Runtime(String),
    /// The scheduler detected an inconsistency in its own state
    #[error("internal error: {0}")]
    Internal(String),
}

/// Terminal status delivered to completion callbacks.
pub type Status = Result<(), SchedulerError>;

/// Completion callback for a single request.
pub type CompletionFunc = Box<dyn FnOnce(Status) + Send>;

/// Callback through which a runner hands an executed batch back, together
/// with the batch-wide status. Per-payload outcomes go into each payload's
/// `compute_status` before the hand-back.
pub type BatchCompleteFunc = Box<dyn FnOnce(Vec<Payload>, Status) + Send>;

/// Runner callback that executes one assembled batch on the identified
/// batcher. The runner owns the payloads for the duration of the execution
/// and must eventually invoke the completion function exactly once.
pub type StandardRunFunc = Arc<dyn Fn(u32, Vec<Payload>, BatchCompleteFunc) + Send + Sync>;

/// `Payload` - one queued unit of work: the request and response providers,
/// the statistics handles, and the completion callback. Payloads are single
/// consumer: once dequeued for a batch they are never re-queued.
pub struct Payload {
    /// Timer covering the payload's time in the scheduler queues
    pub queue_timer: Option<QueueTimer>,
    /// Statistics handle, absent on stand-in payloads
    pub stats: Option<Arc<InferStats>>,
    /// The request to execute
    pub request: Arc<dyn RequestProvider>,
    /// Sink for the request's outputs, absent on stand-in payloads
    pub response: Option<Arc<dyn ResponseProvider>>,
    /// Completion callback, taken exactly once; absent on stand-in payloads
    pub on_complete: Option<CompletionFunc>,
    /// Status assigned while the payload was queued or assembled
    pub status: Status,
    /// Status assigned by the runner during execution
    pub compute_status: Status,
}

impl Payload {
    /// Constructor
    pub fn new(
        queue_timer: Option<QueueTimer>,
        stats: Option<Arc<InferStats>>,
        request: Arc<dyn RequestProvider>,
        response: Option<Arc<dyn ResponseProvider>>,
        on_complete: Option<CompletionFunc>,
    ) -> Self {
        Self {
            queue_timer,
            stats,
            request,
            response,
            on_complete,
            status: Ok(()),
            compute_status: Ok(()),
        }
    }

    /// A stand-in payload filling an empty batch slot. Carries no stats,
    /// no response sink and no completion callback.
    pub fn null(request: Arc<dyn RequestProvider>) -> Self {
        Self::new(None, None, request, None, None)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = self.request.request_header();
        f.debug_struct("Payload")
            .field("correlation_id", &header.correlation_id)
            .field("flags", &header.flags)
            .field("has_on_complete", &self.on_complete.is_some())
            .field("status", &self.status)
            .field("compute_status", &self.compute_status)
            .finish()
    }
}

/// `Scheduler` - the backend-generic scheduling interface. A model backend
/// holds one scheduler and feeds every inference request through it; all
/// outcomes, including rejections, are reported through `on_complete`.
pub trait Scheduler: Send + Sync {
    /// Schedules one request for execution.
    fn enqueue(
        &self,
        stats: Arc<InferStats>,
        request: Arc<dyn RequestProvider>,
        response: Arc<dyn ResponseProvider>,
        on_complete: CompletionFunc,
    );
}
