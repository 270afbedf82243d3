//! The scheduler facade: owns the store, the worker pool, the listener
//! manager, and the timing thread. Clone handles are cheap and safe to call
//! from any thread.

mod thread;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::calendar::CalendarKind;
use crate::config::Config;
use crate::error::SchedulerError;
use crate::job::{JobDataMap, JobDetail, JobExecutionContext, JobFactory, RegistryJobFactory};
use crate::key::{JobKey, TriggerKey};
use crate::listener::ListenerManager;
use crate::matcher::GroupMatcher;
use crate::pool::WorkerPool;
use crate::store::{JobStore, RamJobStore, SchedulerSignaler};
use crate::trigger::{Trigger, TriggerState};

use thread::{run, SchedulerSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    NotStarted,
    Running,
    Standby,
    Shutdown,
}

/// Point-in-time description of the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerMetadata {
    pub scheduler_name: String,
    pub scheduler_instance_id: String,
    pub started: bool,
    pub in_standby_mode: bool,
    pub shutdown: bool,
    pub thread_pool_size: usize,
    pub jobs_executed: u64,
    pub job_store_name: &'static str,
}

/// Snapshot entry of one in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutingJob {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub recovering: bool,
}

pub(crate) struct SchedulerCore {
    pub(crate) config: Config,
    instance_name: String,
    instance_id: String,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) pool: WorkerPool,
    pub(crate) listeners: Arc<ListenerManager>,
    job_factory: RwLock<Arc<dyn JobFactory>>,
    context: Arc<Mutex<JobDataMap>>,
    signal: Arc<SchedulerSignal>,
    state: Mutex<LifecycleState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    executing: Mutex<HashMap<String, ExecutingJob>>,
    jobs_executed: AtomicU64,
    immediate_counter: AtomicU64,
}

impl SchedulerCore {
    pub(crate) fn job_factory(&self) -> Arc<dyn JobFactory> {
        self.job_factory.read().unwrap().clone()
    }

    pub(crate) fn scheduler_context(&self) -> Arc<Mutex<JobDataMap>> {
        self.context.clone()
    }

    pub(crate) fn register_execution(&self, context: &JobExecutionContext) {
        self.executing.lock().unwrap().insert(
            context.fire_instance_id.clone(),
            ExecutingJob {
                fire_instance_id: context.fire_instance_id.clone(),
                job_key: context.job_detail.key.clone(),
                trigger_key: context.trigger.key.clone(),
                fire_time: context.fire_time,
                recovering: context.recovering,
            },
        );
    }

    pub(crate) fn finish_execution(&self, context: &JobExecutionContext) {
        self.executing
            .lock()
            .unwrap()
            .remove(&context.fire_instance_id);
        self.jobs_executed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards store signals to the listener manager and the timing thread.
/// Deliberately narrow; it never calls back into the store.
struct CoreSignaler {
    listeners: Arc<ListenerManager>,
    signal: Arc<SchedulerSignal>,
}

impl SchedulerSignaler for CoreSignaler {
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_misfired(trigger);
    }

    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.listeners
            .notify_scheduler("trigger_finalized", |l| {
                l.trigger_finalized(trigger)
            });
    }

    fn notify_scheduler_listeners_job_deleted(&self, key: &JobKey) {
        self.listeners
            .notify_scheduler("job_deleted", |l| l.job_deleted(key));
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal.signal_scheduling_change(candidate);
    }

    fn notify_scheduler_listeners_error(&self, message: &str) {
        self.listeners
            .notify_scheduler("scheduler_error", |l| l.scheduler_error(message));
    }
}

/// The scheduler. All operations are callable from any thread; cloning
/// yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    /// Builds a scheduler over the in-memory store.
    pub fn new(config: Config) -> Result<Self, SchedulerError> {
        Self::with_store(config, Arc::new(RamJobStore::new()))
    }

    /// Builds a scheduler over a caller-supplied store implementation.
    pub fn with_store(
        config: Config,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, SchedulerError> {
        if config.thread_pool.thread_count == 0 {
            return Err(SchedulerError::Config(
                "thread_pool.thread_count must be at least 1".to_owned(),
            ));
        }
        if config.scheduler.batch_max_count == 0 {
            return Err(SchedulerError::Config(
                "scheduler.batch_max_count must be at least 1".to_owned(),
            ));
        }

        let instance_name = config.scheduler.instance_name.clone();
        let instance_id = config.resolve_instance_id();
        let listeners = Arc::new(ListenerManager::new());
        let signal = Arc::new(SchedulerSignal::new());
        let pool = WorkerPool::start(config.thread_pool.thread_count);

        store.set_misfire_threshold(config.misfire_threshold());
        store.initialize(Arc::new(CoreSignaler {
            listeners: listeners.clone(),
            signal: signal.clone(),
        }));

        let core = Arc::new(SchedulerCore {
            config,
            instance_name: instance_name.clone(),
            instance_id,
            store,
            pool,
            listeners,
            job_factory: RwLock::new(Arc::new(RegistryJobFactory::new())),
            context: Arc::new(Mutex::new(JobDataMap::new())),
            signal: signal.clone(),
            state: Mutex::new(LifecycleState::NotStarted),
            thread: Mutex::new(None),
            executing: Mutex::new(HashMap::new()),
            jobs_executed: AtomicU64::new(0),
            immediate_counter: AtomicU64::new(0),
        });

        let weak: Weak<SchedulerCore> = Arc::downgrade(&core);
        let thread_signal = signal;
        let handle = std::thread::Builder::new()
            .name(format!("{instance_name}-scheduler"))
            .spawn(move || run(weak, thread_signal))
            .map_err(|e| {
                SchedulerError::Config(format!(
                    "could not spawn scheduler thread: {e}"
                ))
            })?;
        *core.thread.lock().unwrap() = Some(handle);

        info!(
            scheduler = %core.instance_name,
            instance_id = %core.instance_id,
            "Scheduler created"
        );
        Ok(Self { core })
    }

    fn assert_available(&self) -> Result<(), SchedulerError> {
        if *self.core.state.lock().unwrap() == LifecycleState::Shutdown {
            return Err(SchedulerError::Unavailable);
        }
        Ok(())
    }

    // Lifecycle.

    pub fn start(&self) -> Result<(), SchedulerError> {
        {
            let state = self.core.state.lock().unwrap();
            match *state {
                | LifecycleState::Shutdown => {
                    return Err(SchedulerError::Unavailable)
                }
                | LifecycleState::Running => return Ok(()),
                | _ => {}
            }
        }
        self.core
            .listeners
            .notify_scheduler("scheduler_starting", |l| l.scheduler_starting());
        *self.core.state.lock().unwrap() = LifecycleState::Running;
        self.core.signal.set_paused(false);
        info!(scheduler = %self.core.instance_name, "Scheduler started");
        self.core
            .listeners
            .notify_scheduler("scheduler_started", |l| l.scheduler_started());
        Ok(())
    }

    /// Schedules a one-shot background `start` after `seconds`.
    pub fn start_delayed(&self, seconds: u64) -> Result<(), SchedulerError> {
        self.assert_available()?;
        let this = self.clone();
        std::thread::Builder::new()
            .name(format!("{}-delayed-start", self.core.instance_name))
            .spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(seconds));
                if let Err(e) = this.start() {
                    warn!("Delayed start failed: {e}");
                }
            })
            .map_err(|e| {
                SchedulerError::Config(format!(
                    "could not spawn delayed-start thread: {e}"
                ))
            })?;
        Ok(())
    }

    /// Halts trigger dispatch but keeps workers and state; `start` resumes.
    pub fn standby(&self) -> Result<(), SchedulerError> {
        self.assert_available()?;
        *self.core.state.lock().unwrap() = LifecycleState::Standby;
        self.core.signal.set_paused(true);
        info!(scheduler = %self.core.instance_name, "Scheduler in standby");
        self.core.listeners.notify_scheduler(
            "scheduler_in_standby_mode",
            |l| l.scheduler_in_standby_mode(),
        );
        Ok(())
    }

    /// Stops the timing thread and the pool. With `wait_for_jobs`, blocks
    /// until in-flight jobs finish.
    pub fn shutdown(&self, wait_for_jobs: bool) {
        {
            let mut state = self.core.state.lock().unwrap();
            if *state == LifecycleState::Shutdown {
                return;
            }
            *state = LifecycleState::Shutdown;
        }
        info!(
            scheduler = %self.core.instance_name,
            wait_for_jobs,
            "Scheduler shutting down"
        );
        self.core.listeners.notify_scheduler(
            "scheduler_shutting_down",
            |l| l.scheduler_shutting_down(),
        );

        self.core.signal.halt();
        // Release the pool first: the timing thread may be parked waiting
        // for a free worker, and only the pool can wake it from that.
        self.core.pool.shutdown(wait_for_jobs);
        if let Some(handle) = self.core.thread.lock().unwrap().take() {
            if self.core.config.scheduler.make_thread_daemon {
                // Daemon-equivalent: the halt signal is already on its way;
                // detach instead of blocking on the join.
                drop(handle);
            } else {
                let _ = handle.join();
            }
        }

        self.core
            .listeners
            .notify_scheduler("scheduler_shutdown", |l| l.scheduler_shutdown());
        info!(scheduler = %self.core.instance_name, "Scheduler shut down");
    }

    pub fn is_started(&self) -> bool {
        *self.core.state.lock().unwrap() == LifecycleState::Running
    }

    pub fn is_in_standby_mode(&self) -> bool {
        *self.core.state.lock().unwrap() == LifecycleState::Standby
    }

    pub fn is_shutdown(&self) -> bool {
        *self.core.state.lock().unwrap() == LifecycleState::Shutdown
    }

    pub fn metadata(&self) -> SchedulerMetadata {
        SchedulerMetadata {
            scheduler_name: self.core.instance_name.clone(),
            scheduler_instance_id: self.core.instance_id.clone(),
            started: self.is_started(),
            in_standby_mode: self.is_in_standby_mode(),
            shutdown: self.is_shutdown(),
            thread_pool_size: self.core.pool.thread_count(),
            jobs_executed: self.core.jobs_executed.load(Ordering::Relaxed),
            job_store_name: "RamJobStore",
        }
    }

    // Scheduling.

    /// Stores the job and its trigger, returning the first fire time.
    pub fn schedule_job(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.assert_available()?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::Config(format!(
                "trigger '{}' does not reference job '{}'",
                trigger.key, job.key
            )));
        }
        let (trigger, first) = self.prepare_trigger(trigger)?;
        self.core
            .store
            .store_job_and_trigger(job.clone(), trigger.clone())?;
        self.core
            .listeners
            .notify_scheduler("job_added", |l| l.job_added(&job.key));
        self.core
            .listeners
            .notify_scheduler("job_scheduled", |l| l.job_scheduled(&trigger));
        self.core.signal.signal_scheduling_change(Some(first));
        Ok(first)
    }

    /// Schedules a trigger against a job that is already stored.
    pub fn schedule_trigger(
        &self,
        trigger: Trigger,
    ) -> Result<DateTime<Utc>, SchedulerError> {
        self.assert_available()?;
        let (trigger, first) = self.prepare_trigger(trigger)?;
        self.core.store.store_trigger(trigger.clone(), false)?;
        self.core
            .listeners
            .notify_scheduler("job_scheduled", |l| l.job_scheduled(&trigger));
        self.core.signal.signal_scheduling_change(Some(first));
        Ok(first)
    }

    /// Bulk variant; with `replace = false` nothing lands if any key
    /// collides.
    pub fn schedule_jobs(
        &self,
        bundles: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), SchedulerError> {
        self.assert_available()?;
        let mut prepared = Vec::with_capacity(bundles.len());
        let mut earliest: Option<DateTime<Utc>> = None;
        for (job, triggers) in bundles {
            let mut ready = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                if trigger.job_key != job.key {
                    return Err(SchedulerError::Config(format!(
                        "trigger '{}' does not reference job '{}'",
                        trigger.key, job.key
                    )));
                }
                let (trigger, first) = self.prepare_trigger(trigger)?;
                earliest = Some(match earliest {
                    | Some(e) => e.min(first),
                    | None => first,
                });
                ready.push(trigger);
            }
            prepared.push((job, ready));
        }
        self.core.store.store_jobs_and_triggers(prepared, replace)?;
        if let Some(first) = earliest {
            self.core.signal.signal_scheduling_change(Some(first));
        }
        Ok(())
    }

    fn prepare_trigger(
        &self,
        mut trigger: Trigger,
    ) -> Result<(Trigger, DateTime<Utc>), SchedulerError> {
        trigger.validate()?;
        let calendar = match trigger.calendar_name.as_deref() {
            | Some(name) => Some(
                self.core.store.retrieve_calendar(name).ok_or_else(|| {
                    crate::error::StoreError::UnknownCalendar(name.to_owned())
                })?,
            ),
            | None => None,
        };
        let first = trigger
            .compute_first_fire_time(calendar.as_ref())
            .ok_or_else(|| {
                crate::error::TriggerError::WillNeverFire(trigger.key.clone())
            })?;
        Ok((trigger, first))
    }

    pub fn unschedule_job(
        &self,
        key: &TriggerKey,
    ) -> Result<bool, SchedulerError> {
        self.assert_available()?;
        let removed = self.core.store.remove_trigger(key)?;
        if removed {
            self.core
                .listeners
                .notify_scheduler("job_unscheduled", |l| l.job_unscheduled(key));
            self.core.signal.signal_scheduling_change(None);
        }
        Ok(removed)
    }

    pub fn unschedule_jobs(
        &self,
        keys: &[TriggerKey],
    ) -> Result<bool, SchedulerError> {
        let mut all = true;
        for key in keys {
            all &= self.unschedule_job(key)?;
        }
        Ok(all)
    }

    /// Atomically swaps a trigger. Returns the new first fire time, or
    /// `None` when the old trigger was not found.
    pub fn reschedule_job(
        &self,
        old: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        self.assert_available()?;
        let (trigger, first) = self.prepare_trigger(new_trigger)?;
        if !self.core.store.replace_trigger(old, trigger.clone())? {
            return Ok(None);
        }
        self.core
            .listeners
            .notify_scheduler("job_unscheduled", |l| l.job_unscheduled(old));
        self.core
            .listeners
            .notify_scheduler("job_scheduled", |l| l.job_scheduled(&trigger));
        self.core.signal.signal_scheduling_change(Some(first));
        Ok(Some(first))
    }

    /// Stores a job with no trigger. Requires durability unless
    /// `store_non_durable_while_awaiting_scheduling` is set.
    pub fn add_job(
        &self,
        job: JobDetail,
        replace: bool,
        store_non_durable_while_awaiting_scheduling: bool,
    ) -> Result<(), SchedulerError> {
        self.assert_available()?;
        if !job.durable && !store_non_durable_while_awaiting_scheduling {
            return Err(SchedulerError::NotDurable(job.key));
        }
        let key = job.key.clone();
        self.core.store.store_job(job, replace)?;
        self.core
            .listeners
            .notify_scheduler("job_added", |l| l.job_added(&key));
        Ok(())
    }

    pub fn delete_job(&self, key: &JobKey) -> Result<bool, SchedulerError> {
        self.assert_available()?;
        let triggers = self.core.store.triggers_for_job(key);
        let removed = self.core.store.remove_job(key)?;
        if removed {
            for trigger in &triggers {
                let tk = trigger.key.clone();
                self.core.listeners.notify_scheduler("job_unscheduled", |l| {
                    l.job_unscheduled(&tk)
                });
            }
            self.core
                .listeners
                .notify_scheduler("job_deleted", |l| l.job_deleted(key));
        }
        Ok(removed)
    }

    pub fn delete_jobs(&self, keys: &[JobKey]) -> Result<bool, SchedulerError> {
        let mut all = true;
        for key in keys {
            all &= self.delete_job(key)?;
        }
        Ok(all)
    }

    /// Fires the job now by synthesizing a one-shot trigger.
    pub fn trigger_job(
        &self,
        key: &JobKey,
        data: Option<JobDataMap>,
    ) -> Result<(), SchedulerError> {
        self.assert_available()?;
        if !self.core.store.check_job_exists(key) {
            return Err(crate::error::StoreError::UnknownJob(key.clone()).into());
        }
        let seq = self.core.immediate_counter.fetch_add(1, Ordering::SeqCst);
        let name =
            format!("MT_{seq}_{}", Utc::now().timestamp_millis());
        let mut trigger =
            Trigger::one_shot(TriggerKey::new(key.group(), name), key.clone());
        if let Some(data) = data {
            trigger.job_data = data;
        }
        trigger.compute_first_fire_time(None);
        self.core.store.store_trigger(trigger, false)?;
        self.core.signal.signal_scheduling_change(Some(Utc::now()));
        Ok(())
    }

    // Pause and resume.

    pub fn pause_trigger(&self, key: &TriggerKey) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.pause_trigger(key)?;
        self.core
            .listeners
            .notify_scheduler("trigger_paused", |l| l.trigger_paused(key));
        Ok(())
    }

    pub fn pause_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, SchedulerError> {
        self.assert_available()?;
        let groups = self.core.store.pause_triggers(matcher)?;
        for group in &groups {
            self.core
                .listeners
                .notify_scheduler("triggers_paused", |l| l.triggers_paused(group));
        }
        Ok(groups)
    }

    pub fn resume_trigger(
        &self,
        key: &TriggerKey,
    ) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.resume_trigger(key)?;
        self.core
            .listeners
            .notify_scheduler("trigger_resumed", |l| l.trigger_resumed(key));
        self.core.signal.signal_scheduling_change(None);
        Ok(())
    }

    pub fn resume_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, SchedulerError> {
        self.assert_available()?;
        let groups = self.core.store.resume_triggers(matcher)?;
        for group in &groups {
            self.core.listeners.notify_scheduler("triggers_resumed", |l| {
                l.triggers_resumed(group)
            });
        }
        self.core.signal.signal_scheduling_change(None);
        Ok(groups)
    }

    pub fn pause_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.pause_job(key)?;
        self.core
            .listeners
            .notify_scheduler("job_paused", |l| l.job_paused(key));
        Ok(())
    }

    pub fn pause_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, SchedulerError> {
        self.assert_available()?;
        let groups = self.core.store.pause_jobs(matcher)?;
        for group in &groups {
            self.core
                .listeners
                .notify_scheduler("jobs_paused", |l| l.jobs_paused(group));
        }
        Ok(groups)
    }

    pub fn resume_job(&self, key: &JobKey) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.resume_job(key)?;
        self.core
            .listeners
            .notify_scheduler("job_resumed", |l| l.job_resumed(key));
        self.core.signal.signal_scheduling_change(None);
        Ok(())
    }

    pub fn resume_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, SchedulerError> {
        self.assert_available()?;
        let groups = self.core.store.resume_jobs(matcher)?;
        for group in &groups {
            self.core
                .listeners
                .notify_scheduler("jobs_resumed", |l| l.jobs_resumed(group));
        }
        self.core.signal.signal_scheduling_change(None);
        Ok(groups)
    }

    pub fn pause_all(&self) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.pause_all()?;
        for group in self.core.store.trigger_group_names() {
            self.core.listeners.notify_scheduler("triggers_paused", |l| {
                l.triggers_paused(&group)
            });
        }
        Ok(())
    }

    pub fn resume_all(&self) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.resume_all()?;
        for group in self.core.store.trigger_group_names() {
            self.core.listeners.notify_scheduler("triggers_resumed", |l| {
                l.triggers_resumed(&group)
            });
        }
        self.core.signal.signal_scheduling_change(None);
        Ok(())
    }

    // Queries.

    pub fn get_job_detail(&self, key: &JobKey) -> Option<JobDetail> {
        self.core.store.retrieve_job(key)
    }

    pub fn get_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        self.core.store.retrieve_trigger(key)
    }

    pub fn get_trigger_state(&self, key: &TriggerKey) -> TriggerState {
        self.core.store.trigger_state(key)
    }

    pub fn get_triggers_of_job(&self, key: &JobKey) -> Vec<Trigger> {
        self.core.store.triggers_for_job(key)
    }

    pub fn get_job_keys(&self, matcher: &GroupMatcher) -> Vec<JobKey> {
        self.core.store.job_keys(matcher)
    }

    pub fn get_trigger_keys(&self, matcher: &GroupMatcher) -> Vec<TriggerKey> {
        self.core.store.trigger_keys(matcher)
    }

    pub fn get_job_group_names(&self) -> Vec<String> {
        self.core.store.job_group_names()
    }

    pub fn get_trigger_group_names(&self) -> Vec<String> {
        self.core.store.trigger_group_names()
    }

    pub fn get_paused_trigger_groups(&self) -> Vec<String> {
        self.core.store.paused_trigger_groups()
    }

    pub fn check_job_exists(&self, key: &JobKey) -> bool {
        self.core.store.check_job_exists(key)
    }

    pub fn check_trigger_exists(&self, key: &TriggerKey) -> bool {
        self.core.store.check_trigger_exists(key)
    }

    pub fn currently_executing_jobs(&self) -> Vec<ExecutingJob> {
        self.core.executing.lock().unwrap().values().cloned().collect()
    }

    pub fn clear(&self) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core.store.clear_all_scheduling_data();
        self.core.listeners.notify_scheduler(
            "scheduling_data_cleared",
            |l| l.scheduling_data_cleared(),
        );
        Ok(())
    }

    // Calendars.

    pub fn add_calendar(
        &self,
        name: &str,
        calendar: CalendarKind,
        replace: bool,
        update_triggers: bool,
    ) -> Result<(), SchedulerError> {
        self.assert_available()?;
        self.core
            .store
            .store_calendar(name, calendar, replace, update_triggers)?;
        Ok(())
    }

    pub fn delete_calendar(&self, name: &str) -> Result<bool, SchedulerError> {
        self.assert_available()?;
        Ok(self.core.store.remove_calendar(name)?)
    }

    pub fn get_calendar(&self, name: &str) -> Option<CalendarKind> {
        self.core.store.retrieve_calendar(name)
    }

    pub fn get_calendar_names(&self) -> Vec<String> {
        self.core.store.calendar_names()
    }

    // Plumbing.

    pub fn listener_manager(&self) -> Arc<ListenerManager> {
        self.core.listeners.clone()
    }

    pub fn set_job_factory(&self, factory: Arc<dyn JobFactory>) {
        *self.core.job_factory.write().unwrap() = factory;
    }

    /// The scheduler-wide context map, visible to all handles.
    pub fn context(&self) -> Arc<Mutex<JobDataMap>> {
        self.core.context.clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Last facade handle gone without an explicit shutdown: stop the
        // timing thread so the process can exit. Workers are left to drain.
        if Arc::strong_count(&self.core) == 1 && !self.is_shutdown() {
            self.core.signal.halt();
        }
    }
}
