use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use tracing::{error, info, info_span, trace, Span};

use crate::{
    control::ControlOverrides,
    request::{CorrelationId, NullRequestProvider, RequestFlags, RequestHeader, RequestProvider},
    scheduler::{Payload, StandardRunFunc, Status},
    sequence_batch_scheduler::{BatchSlot, SchedulerCore},
};

/// Wait applied when a batcher has no work pending.
const DEFAULT_WAIT: Duration = Duration::from_millis(500);

/// Wait applied while the debug delay gate holds assembly back.
const DELAY_WAIT: Duration = Duration::from_millis(10);

/// `SequenceBatch` - one batcher: a fixed set of slot queues assembled into
/// constant-shape batches by a dedicated worker thread. Each slot carries at
/// most one sequence at a time; slots with no request available are padded
/// with null requests so the other payloads keep their batch positions.
pub(crate) struct SequenceBatch {
    /// Index of this batcher within the scheduler
    batcher_idx: u32,
    /// Name of the model being served, for logs and null requests
    model_name: String,
    /// Shared scheduler state, for slot release and the delay gate
    core: Arc<SchedulerCore>,
    /// Runner invoked with each assembled batch
    on_schedule: StandardRunFunc,
    /// START/CONTINUE/NOT-READY override sets, shared across batchers
    overrides: ControlOverrides,
    /// Slot queues and activity bookkeeping
    state: Mutex<BatchState>,
    /// Wakes the worker when a request lands while it is idle
    wake: Condvar,
    /// Tracing span
    span: Span,
}

struct BatchState {
    /// Per-slot ordered payload queues
    queues: Vec<VecDeque<Payload>>,
    /// Which slots currently carry a sequence
    active_slots: Vec<bool>,
    /// Largest active slot index, -1 when the batcher is empty
    max_active_slot: i32,
    /// Header of the first-ever request into this batcher, used to build
    /// null requests for empty slots
    null_request_header: Option<RequestHeader>,
    /// True while the worker is blocked on the condition variable
    scheduler_idle: bool,
    /// Termination flag
    exit: bool,
}

impl SequenceBatch {
    /// Creates the batcher and starts its worker thread.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        batcher_idx: u32,
        batch_size: usize,
        model_name: String,
        nice: i32,
        delay_cnt: usize,
        core: Arc<SchedulerCore>,
        overrides: ControlOverrides,
        on_schedule: StandardRunFunc,
    ) -> Result<(Arc<Self>, JoinHandle<()>), std::io::Error> {
        let batch = Arc::new(Self {
            batcher_idx,
            model_name,
            core,
            on_schedule,
            overrides,
            state: Mutex::new(BatchState {
                queues: (0..batch_size).map(|_| VecDeque::new()).collect(),
                active_slots: vec![false; batch_size],
                max_active_slot: -1,
                null_request_header: None,
                scheduler_idle: false,
                exit: false,
            }),
            wake: Condvar::new(),
            span: info_span!("sequence-batch", batcher_idx),
        });

        let worker = Arc::clone(&batch);
        let handle = thread::Builder::new()
            .name(format!("sequence-batch-{batcher_idx}"))
            .spawn(move || worker.scheduler_thread(nice, delay_cnt))?;

        Ok((batch, handle))
    }

    fn lock_state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a payload into `slot`. Called by the scheduler facade after
    /// routing, without the scheduler lock held.
    pub(crate) fn enqueue(&self, slot: u32, correlation_id: CorrelationId, payload: Payload) {
        let wake_runner;
        {
            let mut state = self.lock_state();

            // All requests in this batcher must share input shapes since
            // they execute together in a batch. The first request's header
            // stands in for empty slots when building null requests.
            if state.max_active_slot == -1 {
                state.null_request_header = Some(payload.request.request_header().clone());
            }

            state.queues[slot as usize].push_back(payload);
            state.active_slots[slot as usize] = true;
            state.max_active_slot = state.max_active_slot.max(slot as i32);

            // The actual wake happens outside the lock so the woken thread
            // does not immediately block on it.
            wake_runner = state.scheduler_idle;
        }

        trace!(
            "Queued sequence {correlation_id} request in batcher {}, slot {slot}",
            self.batcher_idx
        );

        if wake_runner {
            self.wake.notify_one();
        }
    }

    /// Asks the worker to exit. The caller joins the worker handle after.
    pub(crate) fn request_exit(&self) {
        {
            let mut state = self.lock_state();
            state.exit = true;
        }
        self.wake.notify_one();
    }

    /// Worker loop: repeatedly assembles the next batch from the slot
    /// queues and hands it to the runner. Does not wait for batch
    /// completion before assembling the next one.
    fn scheduler_thread(&self, nice: i32, mut delay_cnt: usize) {
        let span = self.span.clone();
        let _enter = span.enter();

        set_thread_nice(nice, self.batcher_idx);

        // For debugging, hold assembly until the queues contain the
        // configured number of entries across all batchers.
        if delay_cnt > 0 {
            info!(
                "Delaying batcher {} until {delay_cnt} queued payloads",
                self.batcher_idx
            );
        }

        loop {
            let mut batch: Vec<Payload> = Vec::new();

            // Hold the lock for as short a time as possible.
            {
                let mut state = self.lock_state();
                if state.exit {
                    break;
                }

                let mut wait: Option<Duration> = None;
                let mut adjust_max_active_slot = false;

                if delay_cnt > 0 {
                    wait = Some(DELAY_WAIT);
                    let total_size: usize = state.queues.iter().map(VecDeque::len).sum();
                    if !self
                        .core
                        .delay_scheduler(self.batcher_idx, total_size, delay_cnt)
                    {
                        delay_cnt = 0;
                    }
                    trace!(
                        "Delaying batcher {}, current total = {total_size}",
                        self.batcher_idx
                    );
                } else {
                    // Make sure there is at least one request to handle.
                    // Find the largest slot with a payload available.
                    let mut max_slot = state.max_active_slot;
                    while max_slot >= 0 && state.queues[max_slot as usize].is_empty() {
                        max_slot -= 1;
                    }

                    if max_slot < 0 {
                        wait = Some(DEFAULT_WAIT);
                    } else {
                        // Collect payloads from slot 0 to max_slot.
                        for slot in 0..=(max_slot as usize) {
                            match state.queues[slot].pop_front() {
                                None => {
                                    // No request in this slot. A null
                                    // request keeps the other payloads in
                                    // their batch positions.
                                    let header =
                                        state.null_request_header.clone().unwrap_or_default();
                                    let null_request = Arc::new(NullRequestProvider::new(
                                        header,
                                        self.model_name.clone(),
                                    ));
                                    null_request.set_input_override(self.overrides.not_ready());
                                    batch.push(Payload::null(null_request));
                                }
                                Some(payload) => {
                                    let flags = payload.request.request_header().flags;

                                    // The first payload of a sequence gets
                                    // the start indicator, every later one
                                    // the continue indicator.
                                    if flags.contains(RequestFlags::SEQUENCE_START) {
                                        payload.request.set_input_override(self.overrides.start());
                                    } else {
                                        payload.request.set_input_override(self.overrides.cont());
                                    }

                                    batch.push(payload);

                                    if flags.contains(RequestFlags::SEQUENCE_END) {
                                        // Nothing may follow the END marker.
                                        // It would be clobbered if a backlog
                                        // sequence is swapped into the slot.
                                        if !state.queues[slot].is_empty() {
                                            error!(
                                                "internal: unexpected requests after sequence end in slot {slot} for model '{}'",
                                                self.model_name
                                            );
                                        }

                                        let batch_slot =
                                            BatchSlot::new(self.batcher_idx, slot as u32);
                                        match self.core.release_batch_slot(batch_slot) {
                                            Some(promoted) => {
                                                // A backlogged sequence takes
                                                // over the slot.
                                                state.queues[slot] = promoted;
                                            }
                                            None => {
                                                state.active_slots[slot] = false;
                                                if slot as i32 == state.max_active_slot {
                                                    adjust_max_active_slot = true;
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }

                // One or more ending sequences may have freed the maximum
                // active slot. The shrink is deferred until after the full
                // sweep since multiple slots can end at once.
                if adjust_max_active_slot {
                    while state.max_active_slot >= 0
                        && !state.active_slots[state.max_active_slot as usize]
                    {
                        state.max_active_slot -= 1;
                    }
                }

                // Nothing to handle. Wait for a notification or for the
                // timeout before checking the queues again.
                if let Some(timeout) = wait {
                    state.scheduler_idle = true;
                    state = match self.wake.wait_timeout(state, timeout) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                    state.scheduler_idle = false;
                }
            }

            if !batch.is_empty() {
                (self.on_schedule)(self.batcher_idx, batch, Box::new(Self::complete_batch));
            }
        }

        trace!(
            "Stopping sequence-batch scheduler thread {}",
            self.batcher_idx
        );
    }

    /// Completes every payload of an executed batch in slot order.
    ///
    /// Null payloads have nowhere to report their errors, and such an error
    /// can have misaligned the whole batch. If any null payload failed while
    /// the batch status is OK, the batch status is elevated to that error so
    /// the real payloads see it. Exactly one successful payload per batch is
    /// credited with the model execution.
    fn complete_batch(mut payloads: Vec<Payload>, mut status: Status) {
        if status.is_ok() {
            for payload in &payloads {
                if payload.on_complete.is_none() {
                    let no_complete_status = if payload.status.is_err() {
                        payload.status.clone()
                    } else {
                        payload.compute_status.clone()
                    };
                    if let Err(err) = no_complete_status {
                        status = Err(err);
                        break;
                    }
                }
            }
        }

        let mut found_success = false;
        for payload in payloads.iter_mut() {
            let final_status = if status.is_ok() {
                if payload.status.is_err() {
                    payload.status.clone()
                } else {
                    payload.compute_status.clone()
                }
            } else {
                status.clone()
            };

            // The payloads executed together, so count one execution in the
            // first successful payload and keep the others at zero.
            if !found_success && final_status.is_ok() {
                if let Some(stats) = &payload.stats {
                    stats.set_model_execution_count(1);
                    found_success = true;
                }
            }

            if let Some(on_complete) = payload.on_complete.take() {
                on_complete(final_status);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn set_thread_nice(nice: i32, batcher_idx: u32) {
    // Applies to this worker thread only, not the whole process.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
    if rc == 0 {
        trace!("Starting sequence-batch scheduler thread {batcher_idx} at nice {nice}");
    } else {
        trace!(
            "Starting sequence-batch scheduler thread {batcher_idx} at default nice (requested nice {nice} failed)"
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn set_thread_nice(_nice: i32, batcher_idx: u32) {
    trace!("Starting sequence-batch scheduler thread {batcher_idx} at default nice");
}
