//! The timing thread: acquire due triggers, sleep until they are due (a
//! sleep any scheduling change can cut short), fire them, and hand the
//! resulting bundles to the worker pool.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, gauge, histogram};
use tracing::{debug, error, info, trace};

use super::SchedulerCore;
use crate::error::JobExecutionError;
use crate::job::{Job, JobExecutionContext};
use crate::store::TriggerFiredBundle;
use crate::trigger::{CompletedExecutionInstruction, Trigger};

#[derive(Default)]
pub(crate) struct SignalState {
    pub paused: bool,
    pub halted: bool,
    /// Set when the store reports a mutation that may have produced an
    /// earlier due trigger; the inner value is the candidate fire time when
    /// known.
    pub scheduling_change: Option<Option<DateTime<Utc>>>,
}

/// The wait/notify hub between the timing thread and everything else.
/// Sleeping always happens under this lock so a signal can always cut a
/// sleep short.
pub(crate) struct SchedulerSignal {
    pub state: Mutex<SignalState>,
    pub cond: Condvar,
}

impl SchedulerSignal {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SignalState {
                paused: true,
                ..SignalState::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn signal_scheduling_change(
        &self,
        candidate: Option<DateTime<Utc>>,
    ) {
        let mut state = self.state.lock().unwrap();
        // Keep the earliest pending candidate; None means "now".
        state.scheduling_change = match state.scheduling_change.take() {
            | None => Some(candidate),
            | Some(None) => Some(None),
            | Some(Some(existing)) => match candidate {
                | None => Some(None),
                | Some(c) => Some(Some(c.min(existing))),
            },
        };
        self.cond.notify_all();
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock().unwrap();
        state.paused = paused;
        self.cond.notify_all();
    }

    pub fn halt(&self) {
        let mut state = self.state.lock().unwrap();
        state.halted = true;
        self.cond.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().unwrap().halted
    }
}

/// Entry point of the scheduler thread. Holds the core weakly so dropping
/// the last scheduler handle ends the thread at its next iteration.
pub(crate) fn run(core: Weak<SchedulerCore>, signal: Arc<SchedulerSignal>) {
    info!("Scheduler thread started");
    loop {
        // Standby gate; also the halt point.
        {
            let mut state = signal.state.lock().unwrap();
            while state.paused && !state.halted {
                state = signal.cond.wait(state).unwrap();
            }
            if state.halted {
                break;
            }
        }

        let Some(core) = core.upgrade() else {
            break;
        };
        if !tick(&core, &signal) {
            break;
        }
    }
    info!("Scheduler thread terminated");
}

/// One pass of the loop. Returns false when the thread should exit.
fn tick(core: &Arc<SchedulerCore>, signal: &Arc<SchedulerSignal>) -> bool {
    let available = core.pool.block_for_available();
    if available == 0 {
        // The pool only reports zero when it has been shut down.
        return false;
    }

    let now = Utc::now();
    let max_count = available.min(core.config.scheduler.batch_max_count).max(1);
    let mut acquired = core.store.acquire_next_triggers(
        now + core.config.idle_wait_time(),
        max_count,
        core.config.batch_time_window(),
    );
    gauge!("cronloop.acquired_batch_size", acquired.len() as f64);

    if acquired.is_empty() {
        idle_wait(core, signal);
        return !signal.is_halted();
    }

    trace!("Acquired {} triggers", acquired.len());
    match wait_until_due(&acquired, signal) {
        | WaitOutcome::Due => {}
        | WaitOutcome::Abandon => {
            // An earlier candidate appeared (or we are halting); put the
            // batch back and start over.
            for trigger in &acquired {
                core.store.release_acquired_trigger(trigger);
            }
            return !signal.is_halted();
        }
    }

    let results = core.store.triggers_fired(&mut acquired);
    counter!("cronloop.batches_fired_total", 1);
    for result in results {
        let Some(bundle) = result.bundle else {
            continue;
        };
        let lag = (Utc::now()
            - bundle.scheduled_fire_time.unwrap_or(bundle.fire_time))
        .num_milliseconds() as f64;
        histogram!("cronloop.dispatch_lag_seconds", lag / 1000.0);
        dispatch(core, bundle);
    }
    true
}

fn idle_wait(core: &Arc<SchedulerCore>, signal: &Arc<SchedulerSignal>) {
    let mut state = signal.state.lock().unwrap();
    if state.halted || state.paused {
        return;
    }
    // A change that arrived before we got here counts as a wake-up.
    if state.scheduling_change.take().is_some() {
        return;
    }
    let wait = core
        .config
        .idle_wait_time()
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(30));
    let (mut state, _) = signal.cond.wait_timeout(state, wait).unwrap();
    state.scheduling_change = None;
}

enum WaitOutcome {
    Due,
    Abandon,
}

/// Sleeps until the batch's first fire time. A scheduling change with an
/// earlier candidate (or an unknown one) abandons the batch so the loop can
/// re-acquire.
fn wait_until_due(
    acquired: &[Trigger],
    signal: &Arc<SchedulerSignal>,
) -> WaitOutcome {
    let fire_at = acquired
        .iter()
        .filter_map(|t| t.next_fire_time)
        .min()
        .unwrap_or_else(Utc::now);

    loop {
        let wait = fire_at - Utc::now();
        // Waits this short are not worth parking for.
        if wait <= Duration::milliseconds(2) {
            return WaitOutcome::Due;
        }
        let mut state = signal.state.lock().unwrap();
        if state.halted || state.paused {
            return WaitOutcome::Abandon;
        }
        if let Some(candidate) = state.scheduling_change.take() {
            let earlier = match candidate {
                | None => true,
                | Some(c) => c < fire_at,
            };
            if earlier {
                debug!(
                    "Scheduling change with earlier candidate, abandoning \
                     wait"
                );
                return WaitOutcome::Abandon;
            }
            // Not earlier than what we already hold; keep sleeping.
            continue;
        }
        let wait = wait.to_std().unwrap_or_default();
        let _ = signal.cond.wait_timeout(state, wait).unwrap();
    }
}

/// Builds the execution context, consults the veto chain, and submits the
/// work item. Runs on the scheduler thread.
fn dispatch(core: &Arc<SchedulerCore>, bundle: TriggerFiredBundle) {
    let job = match core.job_factory().new_job(&bundle.job_detail) {
        | Ok(job) => job,
        | Err(e) => {
            error!(
                job_key = %bundle.job_detail.key,
                "Job instantiation failed: {e}"
            );
            core.listeners
                .notify_scheduler("scheduler_error", |l| {
                    l.scheduler_error(&e.to_string())
                });
            core.store.triggered_job_complete(
                &bundle.trigger,
                &bundle.job_detail,
                CompletedExecutionInstruction::SetAllJobTriggersError,
            );
            return;
        }
    };

    let context = JobExecutionContext::new(
        bundle.job_detail.clone(),
        bundle.trigger.clone(),
        bundle.calendar.clone(),
        bundle.recovering,
        bundle.fire_time,
        bundle.scheduled_fire_time,
        bundle.previous_fire_time,
        bundle.next_fire_time,
        core.scheduler_context(),
    );

    let vetoed =
        core.listeners
            .notify_trigger_fired_and_poll_veto(&bundle.trigger, &context);
    if vetoed {
        debug!(trigger_key = %bundle.trigger.key, "Execution vetoed");
        core.listeners.notify_job_execution_vetoed(&context);
        core.store.triggered_job_complete(
            &bundle.trigger,
            &bundle.job_detail,
            CompletedExecutionInstruction::SetTriggerComplete,
        );
        return;
    }

    core.listeners.notify_job_to_be_executed(&context);
    core.register_execution(&context);

    let worker_core = core.clone();
    let submitted = core.pool.submit(Box::new(move || {
        run_job(worker_core, job, context);
    }));
    if !submitted {
        debug!("Pool rejected work item during shutdown");
    }
}

/// Runs on a worker thread: execute, report, complete; loop when the
/// outcome asks for an immediate refire.
fn run_job(
    core: Arc<SchedulerCore>,
    job: Box<dyn Job>,
    mut context: JobExecutionContext,
) {
    loop {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            job.execute(&mut context)
        }));
        let error: Option<JobExecutionError> = match outcome {
            | Ok(Ok(())) => None,
            | Ok(Err(e)) => Some(e),
            | Err(_) => Some(JobExecutionError::new(format!(
                "job '{}' panicked",
                context.job_detail.key
            ))),
        };
        if let Some(e) = &error {
            error!(job_key = %context.job_detail.key, "Job failed: {e}");
        }

        let instruction = context.trigger.execution_complete(error.as_ref());
        core.listeners.notify_job_was_executed(&context, error.as_ref());
        core.listeners.notify_trigger_complete(
            &context.trigger,
            &context,
            instruction,
        );

        if instruction == CompletedExecutionInstruction::ReExecuteJob {
            context.refire_count += 1;
            trace!(
                job_key = %context.job_detail.key,
                refire_count = context.refire_count,
                "Re-firing job immediately"
            );
            core.listeners.notify_job_to_be_executed(&context);
            continue;
        }

        core.store.triggered_job_complete(
            &context.trigger,
            &context.job_detail,
            instruction,
        );
        break;
    }
    core.finish_execution(&context);
}
