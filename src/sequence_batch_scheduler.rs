use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use thiserror::Error;
use tracing::{error, info, info_span, instrument, trace, warn, Span};

use crate::{
    config::{ConfigError, ModelConfig},
    control::ControlOverrides,
    request::{CorrelationId, RequestFlags, RequestProvider, ResponseProvider},
    scheduler::{CompletionFunc, Payload, Scheduler, SchedulerError, StandardRunFunc},
    sequence_batch::SequenceBatch,
    stats::InferStats,
};

/// Environment variable holding the per-batcher debug delay threshold.
const DELAY_SCHEDULER_ENV: &str = "TRTSERVER_DELAY_SCHEDULER";

/// Environment variable holding the backlog debug delay threshold.
const BACKLOG_DELAY_SCHEDULER_ENV: &str = "TRTSERVER_BACKLOG_DELAY_SCHEDULER";

/// `BatchSlot` - one position inside a batcher's fixed-width batch,
/// exclusively bound to at most one sequence at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BatchSlot {
    batcher_idx: u32,
    slot: u32,
}

impl BatchSlot {
    /// Constructor
    pub fn new(batcher_idx: u32, slot: u32) -> Self {
        Self { batcher_idx, slot }
    }

    /// Getter for `batcher_idx`
    pub fn batcher_idx(&self) -> u32 {
        self.batcher_idx
    }

    /// Getter for `slot`
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// `SchedulerDelays` - debug thresholds that hold back batch assembly until
/// enough work has accumulated. Zero disables a threshold. The environment
/// is the default source; tests pass explicit values.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerDelays {
    /// Hold each batcher's assembly until its own queues hold this many payloads
    pub delay_scheduler: usize,
    /// Additionally hold assembly until the backlog holds this many payloads
    pub backlog_delay_scheduler: usize,
}

impl SchedulerDelays {
    /// Reads both thresholds from the environment. Unset or unparsable
    /// variables leave the threshold disabled.
    pub fn from_env() -> Self {
        Self {
            delay_scheduler: env_threshold(DELAY_SCHEDULER_ENV),
            backlog_delay_scheduler: env_threshold(BACKLOG_DELAY_SCHEDULER_ENV),
        }
    }
}

fn env_threshold(name: &str) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// One pending sequence awaiting a batch slot. The queue id is stable for
/// the queue's lifetime so `sequence_to_backlog` can address it while the
/// backlog reorders around it.
struct BacklogQueue {
    id: u64,
    payloads: VecDeque<Payload>,
}

/// State shared between the scheduler facade and its batcher workers,
/// guarded by the scheduler mutex.
pub(crate) struct SchedulerCore {
    model_name: String,
    /// Debug threshold on total backlogged payloads, zero when disabled
    backlog_delay_cnt: usize,
    state: Mutex<SchedulerState>,
}

struct SchedulerState {
    /// In-flight sequences with an assigned batch slot
    sequence_to_batch_slot: HashMap<CorrelationId, BatchSlot>,
    /// Sequences currently being appended to in the backlog
    sequence_to_backlog: HashMap<CorrelationId, u64>,
    /// Pending sequences in arrival order, head is next to be promoted
    backlog_queues: VecDeque<BacklogQueue>,
    /// Slots not bound to any sequence, popped most recent first
    ready_batch_slots: Vec<BatchSlot>,
    /// Per-batcher queued payload counts reported through the delay gate
    queue_request_cnts: Vec<usize>,
    next_backlog_id: u64,
}

impl SchedulerCore {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Releases a slot whose sequence has ended. If a backlogged sequence is
    /// waiting, its queue is handed back to the caller for transplanting into
    /// the slot; otherwise the slot returns to the ready pool and `None` is
    /// returned.
    pub(crate) fn release_batch_slot(&self, batch_slot: BatchSlot) -> Option<VecDeque<Payload>> {
        let mut state = self.lock_state();

        if let Some(backlog) = state.backlog_queues.pop_front() {
            // Should never be empty...
            if let Some(last) = backlog.payloads.back() {
                let header = last.request.request_header();
                let correlation_id = header.correlation_id;

                // If the last queued entry is not an END request then the
                // sequence continues beyond the backlog. Redirect future
                // requests for it to the batch slot.
                if !header.flags.contains(RequestFlags::SEQUENCE_END) {
                    if state.sequence_to_batch_slot.contains_key(&correlation_id) {
                        error!(
                            "internal: backlog sequence {correlation_id} conflicts with in-flight sequence for model '{}'",
                            self.model_name
                        );
                    }

                    state.sequence_to_backlog.remove(&correlation_id);
                    state
                        .sequence_to_batch_slot
                        .insert(correlation_id, batch_slot);
                }

                metrics::counter!("sequence-batcher-backlog-promotions").increment(1);
                return Some(backlog.payloads);
            }
        }

        state.ready_batch_slots.push(batch_slot);
        None
    }

    /// Debug gate: records `cnt` queued payloads for `batcher_idx` and
    /// reports whether assembly should keep waiting for more work.
    pub(crate) fn delay_scheduler(&self, batcher_idx: u32, cnt: usize, total: usize) -> bool {
        let mut state = self.lock_state();
        state.queue_request_cnts[batcher_idx as usize] = cnt;

        let seen: usize = state.queue_request_cnts.iter().sum();
        if seen < total {
            return true;
        }

        if self.backlog_delay_cnt > 0 {
            let backlog_seen: usize = state
                .backlog_queues
                .iter()
                .map(|queue| queue.payloads.len())
                .sum();
            if backlog_seen < self.backlog_delay_cnt {
                return true;
            }
        }

        false
    }
}

/// `SequenceBatchScheduler` - multiplexes sequences of correlated requests
/// onto a fixed pool of batchers. Every request of a sequence is delivered
/// to the same batch slot in submission order for the life of the sequence;
/// sequences that find no free slot wait in a backlog and are promoted as
/// slots are released.
pub struct SequenceBatchScheduler {
    core: Arc<SchedulerCore>,
    batchers: Vec<Arc<SequenceBatch>>,
    worker_handles: Vec<JoinHandle<()>>,
    span: Span,
}

impl SequenceBatchScheduler {
    /// Creates a scheduler with `runner_cnt` batchers, each driving
    /// `on_schedule` with batches of the model's maximum batch size. Debug
    /// delay thresholds are read from the environment.
    pub fn new(
        config: &ModelConfig,
        runner_cnt: u32,
        on_schedule: StandardRunFunc,
    ) -> Result<Self, SequenceBatchSchedulerError> {
        Self::with_delays(config, runner_cnt, SchedulerDelays::from_env(), on_schedule)
    }

    /// Creates a scheduler with explicit debug delay thresholds.
    pub fn with_delays(
        config: &ModelConfig,
        runner_cnt: u32,
        delays: SchedulerDelays,
        on_schedule: StandardRunFunc,
    ) -> Result<Self, SequenceBatchSchedulerError> {
        let span = info_span!("sequence-batch-scheduler");
        let overrides = ControlOverrides::from_config(config)?;

        // The batch size to allow for each runner. At least 1 even if the
        // model does not support batching.
        let batch_size = config.max_batch_size.max(1);

        if delays.backlog_delay_scheduler > 0 {
            info!(
                "Delaying scheduler until {} backlog queued payloads",
                delays.backlog_delay_scheduler
            );
        }

        // All slots are initially ready for a new sequence. Seeded in
        // reverse so the pool pops the lowest batcher and slot first.
        let mut ready_batch_slots = Vec::with_capacity(runner_cnt as usize * batch_size);
        for batcher_idx in (0..runner_cnt).rev() {
            for slot in (0..batch_size as u32).rev() {
                ready_batch_slots.push(BatchSlot::new(batcher_idx, slot));
            }
        }

        let core = Arc::new(SchedulerCore {
            model_name: config.name.clone(),
            backlog_delay_cnt: delays.backlog_delay_scheduler,
            state: Mutex::new(SchedulerState {
                sequence_to_batch_slot: HashMap::new(),
                sequence_to_backlog: HashMap::new(),
                backlog_queues: VecDeque::new(),
                ready_batch_slots,
                queue_request_cnts: vec![0; runner_cnt as usize],
                next_backlog_id: 0,
            }),
        });

        let nice = config.priority.nice_level();
        let mut batchers = Vec::with_capacity(runner_cnt as usize);
        let mut worker_handles = Vec::with_capacity(runner_cnt as usize);
        for batcher_idx in 0..runner_cnt {
            let spawned = SequenceBatch::spawn(
                batcher_idx,
                batch_size,
                config.name.clone(),
                nice,
                delays.delay_scheduler,
                Arc::clone(&core),
                overrides.clone(),
                Arc::clone(&on_schedule),
            );
            match spawned {
                Ok((batcher, handle)) => {
                    batchers.push(batcher);
                    worker_handles.push(handle);
                }
                Err(err) => {
                    // Workers already started must be stopped before the
                    // error surfaces, since no scheduler exists to do it.
                    for batcher in &batchers {
                        batcher.request_exit();
                    }
                    for handle in worker_handles.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            core,
            batchers,
            worker_handles,
            span,
        })
    }
}

impl Scheduler for SequenceBatchScheduler {
    /// Routes one request to its sequence's batch slot, or into the backlog
    /// when no slot is free. Precondition failures are reported through
    /// `on_complete` without mutating any state.
    ///
    /// An END request unbinds its correlation ID here, at routing time,
    /// while the slot itself stays occupied until the worker processes the
    /// END payload. A new START for the same correlation ID inside that
    /// window is legal and binds independently.
    #[instrument(skip_all)]
    fn enqueue(
        &self,
        stats: Arc<InferStats>,
        request: Arc<dyn RequestProvider>,
        response: Arc<dyn ResponseProvider>,
        on_complete: CompletionFunc,
    ) {
        let _enter = self.span.enter();

        // Queue timer starts at the beginning of the queueing and
        // scheduling process.
        let queue_timer = stats.start_queue_timer();
        let header = request.request_header();
        let correlation_id = header.correlation_id;
        let batch_size = header.batch_size;
        let seq_start = header.flags.contains(RequestFlags::SEQUENCE_START);
        let seq_end = header.flags.contains(RequestFlags::SEQUENCE_END);

        trace!(
            "Enqueuing sequence inference request for model '{}'",
            request.model_name()
        );

        // Requests must have batch-size 1 since the sequence batcher does
        // not support statically batched requests.
        if batch_size != 1 {
            on_complete(Err(SchedulerError::InvalidArgument(format!(
                "inference request to model '{}' must specify batch-size 1 due to requirements of sequence batcher",
                request.model_name()
            ))));
            return;
        }

        // A zero correlation ID indicates the request has none.
        if correlation_id == 0 {
            on_complete(Err(SchedulerError::InvalidArgument(format!(
                "inference request to model '{}' must specify a non-zero correlation ID",
                request.model_name()
            ))));
            return;
        }

        let mut payload = Payload::new(
            Some(queue_timer),
            Some(stats),
            Arc::clone(&request),
            Some(response),
            Some(on_complete),
        );

        let target = {
            let mut state = self.core.lock_state();

            let assigned_slot = state.sequence_to_batch_slot.get(&correlation_id).copied();
            let backlog_id = state.sequence_to_backlog.get(&correlation_id).copied();

            // A request that is not starting a sequence must have a known
            // correlation ID with a target in either a slot or the backlog.
            // Otherwise the sequence was not started correctly or there is
            // a correlation ID conflict.
            if !seq_start && assigned_slot.is_none() && backlog_id.is_none() {
                drop(state);
                if let Some(on_complete) = payload.on_complete.take() {
                    on_complete(Err(SchedulerError::InvalidArgument(format!(
                        "inference request for sequence {correlation_id} to model '{}' must specify the START flag on the first request of the sequence",
                        request.model_name()
                    ))));
                }
                return;
            }

            // A start on an in-progress correlation ID means the previous
            // sequence did not end correctly. Continue the new sequence in
            // the existing target; a slot may carry multiple starts as long
            // as it has a single end.
            if seq_start && (assigned_slot.is_some() || backlog_id.is_some()) {
                warn!(
                    "sequence {correlation_id} for model '{}' has a conflict; the previous sequence did not end before this sequence start and will be terminated early",
                    request.model_name()
                );
            }

            metrics::counter!("sequence-batcher-enqueued-requests").increment(1);

            let target = if let Some(slot) = assigned_slot {
                // The sequence already has an assigned slot.
                slot
            } else if let Some(backlog_id) = backlog_id {
                // The sequence already has a queue in the backlog.
                match state
                    .backlog_queues
                    .iter_mut()
                    .find(|queue| queue.id == backlog_id)
                {
                    Some(queue) => queue.payloads.push_back(payload),
                    None => {
                        // Should never happen, the map only holds live queues.
                        error!(
                            "internal: backlog queue for sequence {correlation_id} of model '{}' is missing",
                            request.model_name()
                        );
                        let mut payloads = VecDeque::new();
                        payloads.push_back(payload);
                        state.backlog_queues.push_back(BacklogQueue {
                            id: backlog_id,
                            payloads,
                        });
                    }
                }

                // An ending sequence no longer collects in this queue. A
                // later sequence with the same correlation ID gets a new one.
                if seq_end {
                    state.sequence_to_backlog.remove(&correlation_id);
                }
                return;
            } else if let Some(slot) = state.ready_batch_slots.pop() {
                // The sequence is starting and a slot is free.
                state
                    .sequence_to_batch_slot
                    .insert(correlation_id, slot);
                slot
            } else {
                // Last option, collect the sequence in a new backlog queue.
                let id = state.next_backlog_id;
                state.next_backlog_id += 1;
                let mut payloads = VecDeque::new();
                payloads.push_back(payload);
                state.backlog_queues.push_back(BacklogQueue { id, payloads });
                if !seq_end {
                    state.sequence_to_backlog.insert(correlation_id, id);
                }
                return;
            };

            // The request is assigned to a slot. An ending sequence stops
            // being tracked now even though the slot stays occupied until
            // the worker processes the END payload.
            if seq_end {
                state.sequence_to_batch_slot.remove(&correlation_id);
            }

            target
        };

        // No need to hold the scheduler lock while enqueuing into a
        // specific batcher.
        trace!(
            "Enqueuing sequence inference request for model '{}' into batcher {}, slot {}",
            request.model_name(),
            target.batcher_idx(),
            target.slot()
        );

        self.batchers[target.batcher_idx() as usize].enqueue(target.slot(), correlation_id, payload);
    }
}

impl Drop for SequenceBatchScheduler {
    fn drop(&mut self) {
        for batcher in &self.batchers {
            batcher.request_exit();
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Error)]
pub enum SequenceBatchSchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to spawn batcher thread: {0}")]
    SpawnThread(#[from] std::io::Error),
}

#[cfg(test)]
impl SequenceBatchScheduler {
    pub(crate) fn ready_slot_count(&self) -> usize {
        self.core.lock_state().ready_batch_slots.len()
    }

    pub(crate) fn slot_assignment(&self, correlation_id: CorrelationId) -> Option<BatchSlot> {
        self.core
            .lock_state()
            .sequence_to_batch_slot
            .get(&correlation_id)
            .copied()
    }

    pub(crate) fn backlog_sequence_count(&self) -> usize {
        self.core.lock_state().sequence_to_backlog.len()
    }

    pub(crate) fn backlog_queue_count(&self) -> usize {
        self.core.lock_state().backlog_queues.len()
    }

    pub(crate) fn tracked_sequence_count(&self) -> usize {
        let state = self.core.lock_state();
        state.sequence_to_batch_slot.len() + state.sequence_to_backlog.len()
    }
}
