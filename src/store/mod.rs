//! The job store contract: indexed job/trigger/calendar state plus the
//! acquire/fire/complete protocol the scheduler thread drives. The in-memory
//! implementation lives in [`ram`]; a persistent store can stand in behind
//! the same trait without changing the scheduler.

mod ram;

pub use ram::RamJobStore;

use chrono::{DateTime, Duration, Utc};

use crate::calendar::CalendarKind;
use crate::error::StoreError;
use crate::job::JobDetail;
use crate::key::{JobKey, TriggerKey};
use crate::matcher::GroupMatcher;
use crate::trigger::{CompletedExecutionInstruction, Trigger, TriggerState};

/// Everything a worker needs to run one firing, captured at fire time. The
/// job detail and trigger are clones; the store keeps its own copies.
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job_detail: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<CalendarKind>,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// Per-trigger outcome of [`JobStore::triggers_fired`]. A `None` bundle
/// means the trigger was skipped (no longer acquired, deleted, or its
/// calendar disappeared).
#[derive(Debug)]
pub struct TriggerFiredResult {
    pub bundle: Option<TriggerFiredBundle>,
}

/// The store's only outbound dependency: a narrow callback surface into the
/// scheduler. Implementations must not re-enter the store.
pub trait SchedulerSignaler: Send + Sync {
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);
    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);
    fn notify_scheduler_listeners_job_deleted(&self, key: &JobKey);
    /// A mutation may have produced an earlier due trigger; `candidate` is
    /// its fire time when known.
    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>);
    fn notify_scheduler_listeners_error(&self, message: &str);
}

/// The job store contract. All operations are atomic with respect to one
/// another; none of them invoke user code while holding internal locks.
pub trait JobStore: Send + Sync {
    /// Wires the signaler in. Called once by the scheduler before any other
    /// operation.
    fn initialize(&self, signaler: std::sync::Arc<dyn SchedulerSignaler>);

    fn set_misfire_threshold(&self, threshold: Duration);

    // Storage.
    fn store_job(
        &self,
        job: JobDetail,
        replace_existing: bool,
    ) -> Result<(), StoreError>;
    fn store_trigger(
        &self,
        trigger: Trigger,
        replace_existing: bool,
    ) -> Result<(), StoreError>;
    fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), StoreError>;
    /// With `replace = false`, all keys are prechecked and nothing is
    /// written if any of them collides.
    fn store_jobs_and_triggers(
        &self,
        bundles: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError>;
    fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError>;
    fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, StoreError>;
    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError>;
    fn remove_triggers(&self, keys: &[TriggerKey])
        -> Result<bool, StoreError>;
    fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError>;
    fn retrieve_job(&self, key: &JobKey) -> Option<JobDetail>;
    fn retrieve_trigger(&self, key: &TriggerKey) -> Option<Trigger>;
    fn check_job_exists(&self, key: &JobKey) -> bool;
    fn check_trigger_exists(&self, key: &TriggerKey) -> bool;
    fn clear_all_scheduling_data(&self);

    // Calendars.
    fn store_calendar(
        &self,
        name: &str,
        calendar: CalendarKind,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError>;
    fn remove_calendar(&self, name: &str) -> Result<bool, StoreError>;
    fn retrieve_calendar(&self, name: &str) -> Option<CalendarKind>;

    // Queries.
    fn number_of_jobs(&self) -> usize;
    fn number_of_triggers(&self) -> usize;
    fn number_of_calendars(&self) -> usize;
    fn job_keys(&self, matcher: &GroupMatcher) -> Vec<JobKey>;
    fn trigger_keys(&self, matcher: &GroupMatcher) -> Vec<TriggerKey>;
    fn job_group_names(&self) -> Vec<String>;
    fn trigger_group_names(&self) -> Vec<String>;
    fn calendar_names(&self) -> Vec<String>;
    fn triggers_for_job(&self, key: &JobKey) -> Vec<Trigger>;
    fn trigger_state(&self, key: &TriggerKey) -> TriggerState;

    // Pause and resume.
    fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;
    fn pause_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError>;
    fn pause_job(&self, key: &JobKey) -> Result<(), StoreError>;
    fn pause_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError>;
    fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError>;
    fn resume_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError>;
    fn resume_job(&self, key: &JobKey) -> Result<(), StoreError>;
    fn resume_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError>;
    fn pause_all(&self) -> Result<(), StoreError>;
    fn resume_all(&self) -> Result<(), StoreError>;
    fn paused_trigger_groups(&self) -> Vec<String>;

    // The acquire / fire / complete protocol.
    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Vec<Trigger>;
    fn release_acquired_trigger(&self, trigger: &Trigger);
    /// Advances each acquired trigger (both the stored copy and the caller's
    /// copy in `triggers`) and produces the fired bundles.
    fn triggers_fired(
        &self,
        triggers: &mut [Trigger],
    ) -> Vec<TriggerFiredResult>;
    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    );
}
