//! The volatile, in-memory job store. One store-wide mutex guards all
//! indices; listener-bound signals are captured under the lock and emitted
//! after it is released so user code never runs inside the critical
//! section.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::{
    JobStore, SchedulerSignaler, TriggerFiredBundle, TriggerFiredResult,
};
use crate::calendar::CalendarKind;
use crate::error::StoreError;
use crate::job::JobDetail;
use crate::key::{JobKey, TriggerKey};
use crate::matcher::GroupMatcher;
use crate::trigger::{
    CompletedExecutionInstruction, MisfireInstruction, Trigger, TriggerState,
};

/// Internal trigger lifecycle. The public view collapses this to
/// [`TriggerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalState {
    Waiting,
    Acquired,
    Paused,
    Blocked,
    PausedBlocked,
    Complete,
    Error,
}

struct TriggerRecord {
    trigger: Trigger,
    state: InternalState,
}

/// Ready-set ordering: next fire time ascending, then priority descending,
/// then key ascending.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct ReadyEntry {
    next_fire_time: DateTime<Utc>,
    priority: Reverse<i32>,
    key: TriggerKey,
}

impl ReadyEntry {
    fn for_trigger(trigger: &Trigger) -> Option<Self> {
        trigger.next_fire_time.map(|next_fire_time| Self {
            next_fire_time,
            priority: Reverse(trigger.priority),
            key: trigger.key.clone(),
        })
    }
}

/// Signals captured under the lock, delivered after it is dropped.
enum Signal {
    Misfired(Trigger),
    Finalized(Trigger),
    JobDeleted(JobKey),
    SchedulingChange(Option<DateTime<Utc>>),
}

struct Store {
    jobs: HashMap<JobKey, JobDetail>,
    jobs_by_group: HashMap<String, HashSet<JobKey>>,
    triggers: HashMap<TriggerKey, TriggerRecord>,
    triggers_by_group: HashMap<String, HashSet<TriggerKey>>,
    triggers_by_job: HashMap<JobKey, HashSet<TriggerKey>>,
    ready: BTreeSet<ReadyEntry>,
    paused_trigger_groups: HashSet<String>,
    paused_job_groups: HashSet<String>,
    blocked_jobs: HashSet<JobKey>,
    calendars: HashMap<String, CalendarKind>,
    misfire_threshold: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            jobs: HashMap::new(),
            jobs_by_group: HashMap::new(),
            triggers: HashMap::new(),
            triggers_by_group: HashMap::new(),
            triggers_by_job: HashMap::new(),
            ready: BTreeSet::new(),
            paused_trigger_groups: HashSet::new(),
            paused_job_groups: HashSet::new(),
            blocked_jobs: HashSet::new(),
            calendars: HashMap::new(),
            // Due-but-undispatched fire times older than this window count
            // as misfires.
            misfire_threshold: Duration::milliseconds(5000),
        }
    }
}

pub struct RamJobStore {
    inner: Mutex<Store>,
    signaler: RwLock<Option<Arc<dyn SchedulerSignaler>>>,
    /// Monotonic fire-instance counter, seeded with the wall clock so ids
    /// from successive process runs do not collide in logs.
    fire_instance_counter: AtomicI64,
}

impl Default for RamJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RamJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Store::default()),
            signaler: RwLock::new(None),
            fire_instance_counter: AtomicI64::new(
                Utc::now().timestamp_millis(),
            ),
        }
    }

    fn next_fire_instance_id(&self) -> String {
        self.fire_instance_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn emit(&self, signals: Vec<Signal>) {
        if signals.is_empty() {
            return;
        }
        let guard = self.signaler.read().unwrap();
        let Some(signaler) = guard.as_ref() else {
            return;
        };
        for signal in signals {
            match signal {
                | Signal::Misfired(t) => {
                    signaler.notify_trigger_listeners_misfired(&t)
                }
                | Signal::Finalized(t) => {
                    signaler.notify_scheduler_listeners_finalized(&t)
                }
                | Signal::JobDeleted(k) => {
                    signaler.notify_scheduler_listeners_job_deleted(&k)
                }
                | Signal::SchedulingChange(candidate) => {
                    signaler.signal_scheduling_change(candidate)
                }
            }
        }
    }
}

impl Store {
    fn insert_ready(&mut self, trigger: &Trigger) {
        if let Some(entry) = ReadyEntry::for_trigger(trigger) {
            self.ready.insert(entry);
        }
    }

    /// Removes the trigger's ready entry. Mutations always remove before
    /// touching fire times, so the computed entry matches; the fallback scan
    /// covers a trigger whose times were changed behind our back.
    fn remove_ready(&mut self, trigger: &Trigger) {
        if let Some(entry) = ReadyEntry::for_trigger(trigger) {
            if self.ready.remove(&entry) {
                return;
            }
        }
        if let Some(entry) = self
            .ready
            .iter()
            .find(|e| e.key == trigger.key)
            .cloned()
        {
            self.ready.remove(&entry);
        }
    }

    fn trigger_keys_of_job(&self, job: &JobKey) -> Vec<TriggerKey> {
        self.triggers_by_job
            .get(job)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn index_trigger(&mut self, trigger: &Trigger) {
        self.triggers_by_group
            .entry(trigger.key.group().to_owned())
            .or_default()
            .insert(trigger.key.clone());
        self.triggers_by_job
            .entry(trigger.job_key.clone())
            .or_default()
            .insert(trigger.key.clone());
    }

    fn unindex_trigger(&mut self, trigger: &Trigger) {
        if let Some(group) = self.triggers_by_group.get_mut(trigger.key.group())
        {
            group.remove(&trigger.key);
            if group.is_empty() {
                self.triggers_by_group.remove(trigger.key.group());
            }
        }
        if let Some(of_job) = self.triggers_by_job.get_mut(&trigger.job_key) {
            of_job.remove(&trigger.key);
            if of_job.is_empty() {
                self.triggers_by_job.remove(&trigger.job_key);
            }
        }
    }

    fn index_job(&mut self, job: &JobDetail) {
        self.jobs_by_group
            .entry(job.key.group().to_owned())
            .or_default()
            .insert(job.key.clone());
    }

    fn unindex_job(&mut self, key: &JobKey) {
        if let Some(group) = self.jobs_by_group.get_mut(key.group()) {
            group.remove(key);
            if group.is_empty() {
                self.jobs_by_group.remove(key.group());
            }
        }
    }

    /// Removes a trigger and, when its job is left trigger-less and is not
    /// durable, the job too. Signals are appended, not emitted.
    fn remove_trigger_record(
        &mut self,
        key: &TriggerKey,
        remove_orphaned_job: bool,
        signals: &mut Vec<Signal>,
    ) -> bool {
        let Some(record) = self.triggers.remove(key) else {
            return false;
        };
        self.remove_ready(&record.trigger);
        self.unindex_trigger(&record.trigger);

        if remove_orphaned_job {
            let job_key = record.trigger.job_key.clone();
            let orphaned = self
                .trigger_keys_of_job(&job_key)
                .is_empty();
            if orphaned {
                if let Some(job) = self.jobs.get(&job_key) {
                    if !job.durable {
                        self.jobs.remove(&job_key);
                        self.unindex_job(&job_key);
                        self.blocked_jobs.remove(&job_key);
                        signals.push(Signal::JobDeleted(job_key));
                    }
                }
            }
        }
        true
    }

    fn store_job_record(
        &mut self,
        job: JobDetail,
        replace_existing: bool,
    ) -> Result<(), StoreError> {
        if self.jobs.contains_key(&job.key) {
            if !replace_existing {
                return Err(StoreError::JobAlreadyExists(job.key));
            }
        } else {
            self.index_job(&job);
        }
        self.jobs.insert(job.key.clone(), job);
        Ok(())
    }

    fn store_trigger_record(
        &mut self,
        trigger: Trigger,
        replace_existing: bool,
        signals: &mut Vec<Signal>,
    ) -> Result<(), StoreError> {
        if self.triggers.contains_key(&trigger.key) {
            if !replace_existing {
                return Err(StoreError::TriggerAlreadyExists(trigger.key));
            }
            // Replace means remove-then-store; the old ready entry must go.
            self.remove_trigger_record(&trigger.key, false, signals);
        }
        let Some(job) = self.jobs.get(&trigger.job_key) else {
            return Err(StoreError::JobNotFound {
                trigger: trigger.key,
                job: trigger.job_key,
            });
        };
        let job_group_paused =
            self.paused_job_groups.contains(job.key.group());
        let trigger_group_paused = self
            .paused_trigger_groups
            .contains(trigger.key.group());
        let blocked = self.blocked_jobs.contains(&trigger.job_key);

        let state = if trigger_group_paused || job_group_paused {
            if blocked {
                InternalState::PausedBlocked
            } else {
                InternalState::Paused
            }
        } else if blocked {
            InternalState::Blocked
        } else {
            InternalState::Waiting
        };

        self.index_trigger(&trigger);
        if state == InternalState::Waiting {
            self.insert_ready(&trigger);
        }
        self.triggers
            .insert(trigger.key.clone(), TriggerRecord { trigger, state });
        Ok(())
    }

    /// Misfire check applied when a trigger is considered for acquisition or
    /// resumed. Returns true when the trigger's fire times were moved (or it
    /// completed).
    fn apply_misfire(
        record: &mut TriggerRecord,
        calendars: &HashMap<String, CalendarKind>,
        misfire_threshold: Duration,
        signals: &mut Vec<Signal>,
    ) -> bool {
        let mut misfire_time = Utc::now();
        if misfire_threshold > Duration::zero() {
            misfire_time -= misfire_threshold;
        }
        let Some(next) = record.trigger.next_fire_time else {
            return false;
        };
        if next > misfire_time
            || record.trigger.misfire_instruction == MisfireInstruction::Ignore
        {
            return false;
        }

        let calendar = record
            .trigger
            .calendar_name
            .as_deref()
            .and_then(|n| calendars.get(n));

        signals.push(Signal::Misfired(record.trigger.clone()));
        record.trigger.update_after_misfire(calendar);

        match record.trigger.next_fire_time {
            | None => {
                record.state = InternalState::Complete;
                signals.push(Signal::Finalized(record.trigger.clone()));
                true
            }
            | Some(new_next) if new_next == next => false,
            | Some(_) => true,
        }
    }

    fn pause_trigger_record(&mut self, key: &TriggerKey) {
        let Some(record) = self.triggers.get_mut(key) else {
            return;
        };
        match record.state {
            | InternalState::Complete => return,
            | InternalState::Blocked | InternalState::PausedBlocked => {
                record.state = InternalState::PausedBlocked;
            }
            | _ => record.state = InternalState::Paused,
        }
        let trigger = record.trigger.clone();
        self.remove_ready(&trigger);
    }

    fn resume_trigger_record(
        &mut self,
        key: &TriggerKey,
        signals: &mut Vec<Signal>,
    ) {
        let Some(record) = self.triggers.get_mut(key) else {
            return;
        };
        if record.state != InternalState::Paused
            && record.state != InternalState::PausedBlocked
        {
            return;
        }
        record.state = if self.blocked_jobs.contains(&record.trigger.job_key) {
            InternalState::Blocked
        } else {
            InternalState::Waiting
        };
        Self::apply_misfire(
            record,
            &self.calendars,
            self.misfire_threshold,
            signals,
        );
        if record.state == InternalState::Waiting {
            let trigger = record.trigger.clone();
            self.insert_ready(&trigger);
        }
    }

    fn matching_trigger_groups(&self, matcher: &GroupMatcher) -> Vec<String> {
        match matcher.as_equals() {
            | Some(group) => vec![group.to_owned()],
            | None => self
                .triggers_by_group
                .keys()
                .filter(|g| matcher.matches(g))
                .cloned()
                .collect(),
        }
    }

    fn matching_job_groups(&self, matcher: &GroupMatcher) -> Vec<String> {
        match matcher.as_equals() {
            | Some(group) => vec![group.to_owned()],
            | None => self
                .jobs_by_group
                .keys()
                .filter(|g| matcher.matches(g))
                .cloned()
                .collect(),
        }
    }
}

impl JobStore for RamJobStore {
    fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) {
        *self.signaler.write().unwrap() = Some(signaler);
    }

    fn set_misfire_threshold(&self, threshold: Duration) {
        let mut store = self.inner.lock().unwrap();
        if threshold < Duration::milliseconds(1) {
            warn!("Ignoring non-positive misfire threshold {threshold}");
            return;
        }
        store.misfire_threshold = threshold;
    }

    fn store_job(
        &self,
        job: JobDetail,
        replace_existing: bool,
    ) -> Result<(), StoreError> {
        let mut store = self.inner.lock().unwrap();
        store.store_job_record(job, replace_existing)
    }

    fn store_trigger(
        &self,
        trigger: Trigger,
        replace_existing: bool,
    ) -> Result<(), StoreError> {
        let mut signals = Vec::new();
        let result = {
            let mut store = self.inner.lock().unwrap();
            store.store_trigger_record(trigger, replace_existing, &mut signals)
        };
        self.emit(signals);
        result
    }

    fn store_job_and_trigger(
        &self,
        job: JobDetail,
        trigger: Trigger,
    ) -> Result<(), StoreError> {
        let mut signals = Vec::new();
        let result = {
            let mut store = self.inner.lock().unwrap();
            store.store_job_record(job, false)?;
            store.store_trigger_record(trigger, false, &mut signals)
        };
        self.emit(signals);
        result
    }

    fn store_jobs_and_triggers(
        &self,
        bundles: Vec<(JobDetail, Vec<Trigger>)>,
        replace: bool,
    ) -> Result<(), StoreError> {
        let mut signals = Vec::new();
        let result = {
            let mut store = self.inner.lock().unwrap();
            if !replace {
                // All-or-nothing: reject before any write.
                for (job, triggers) in &bundles {
                    if store.jobs.contains_key(&job.key) {
                        return Err(StoreError::JobAlreadyExists(
                            job.key.clone(),
                        ));
                    }
                    for trigger in triggers {
                        if store.triggers.contains_key(&trigger.key) {
                            return Err(StoreError::TriggerAlreadyExists(
                                trigger.key.clone(),
                            ));
                        }
                    }
                }
            }
            for (job, triggers) in bundles {
                store.store_job_record(job, true)?;
                for trigger in triggers {
                    store.store_trigger_record(trigger, true, &mut signals)?;
                }
            }
            Ok(())
        };
        self.emit(signals);
        result
    }

    fn remove_job(&self, key: &JobKey) -> Result<bool, StoreError> {
        let mut signals = Vec::new();
        let removed = {
            let mut store = self.inner.lock().unwrap();
            let mut found = false;
            for trigger_key in store.trigger_keys_of_job(key) {
                store.remove_trigger_record(&trigger_key, false, &mut signals);
                found = true;
            }
            if store.jobs.remove(key).is_some() {
                store.unindex_job(key);
                store.blocked_jobs.remove(key);
                found = true;
            }
            found
        };
        self.emit(signals);
        Ok(removed)
    }

    fn remove_jobs(&self, keys: &[JobKey]) -> Result<bool, StoreError> {
        let mut all = true;
        for key in keys {
            all &= self.remove_job(key)?;
        }
        Ok(all)
    }

    fn remove_trigger(&self, key: &TriggerKey) -> Result<bool, StoreError> {
        let mut signals = Vec::new();
        let removed = {
            let mut store = self.inner.lock().unwrap();
            store.remove_trigger_record(key, true, &mut signals)
        };
        self.emit(signals);
        Ok(removed)
    }

    fn remove_triggers(
        &self,
        keys: &[TriggerKey],
    ) -> Result<bool, StoreError> {
        let mut all = true;
        for key in keys {
            all &= self.remove_trigger(key)?;
        }
        Ok(all)
    }

    fn replace_trigger(
        &self,
        key: &TriggerKey,
        new_trigger: Trigger,
    ) -> Result<bool, StoreError> {
        let mut signals = Vec::new();
        let result = {
            let mut store = self.inner.lock().unwrap();
            let Some(existing) = store.triggers.get(key) else {
                return Ok(false);
            };
            if existing.trigger.job_key != new_trigger.job_key {
                return Err(StoreError::JobKeyMismatch {
                    old: key.clone(),
                    new: new_trigger.key,
                });
            }
            let old = existing.trigger.clone();
            // Keep the job even if it is non-durable; the new trigger
            // reattaches to it.
            store.remove_trigger_record(key, false, &mut signals);
            match store.store_trigger_record(new_trigger, false, &mut signals)
            {
                | Ok(()) => Ok(true),
                | Err(e) => {
                    // Put the old trigger back so the failure is clean.
                    store.store_trigger_record(old, false, &mut signals)?;
                    Err(e)
                }
            }
        };
        self.emit(signals);
        result
    }

    fn retrieve_job(&self, key: &JobKey) -> Option<JobDetail> {
        let store = self.inner.lock().unwrap();
        store.jobs.get(key).cloned()
    }

    fn retrieve_trigger(&self, key: &TriggerKey) -> Option<Trigger> {
        let store = self.inner.lock().unwrap();
        store.triggers.get(key).map(|r| r.trigger.clone())
    }

    fn check_job_exists(&self, key: &JobKey) -> bool {
        let store = self.inner.lock().unwrap();
        store.jobs.contains_key(key)
    }

    fn check_trigger_exists(&self, key: &TriggerKey) -> bool {
        let store = self.inner.lock().unwrap();
        store.triggers.contains_key(key)
    }

    fn clear_all_scheduling_data(&self) {
        let mut store = self.inner.lock().unwrap();
        let misfire_threshold = store.misfire_threshold;
        *store = Store {
            misfire_threshold,
            ..Store::default()
        };
        info!("All scheduling data cleared");
    }

    fn store_calendar(
        &self,
        name: &str,
        calendar: CalendarKind,
        replace_existing: bool,
        update_triggers: bool,
    ) -> Result<(), StoreError> {
        let mut store = self.inner.lock().unwrap();
        let existed = store.calendars.contains_key(name);
        if existed && !replace_existing {
            return Err(StoreError::CalendarAlreadyExists(name.to_owned()));
        }
        store.calendars.insert(name.to_owned(), calendar.clone());

        if existed && update_triggers {
            let affected: Vec<TriggerKey> = store
                .triggers
                .values()
                .filter(|r| {
                    r.trigger.calendar_name.as_deref() == Some(name)
                })
                .map(|r| r.trigger.key.clone())
                .collect();
            let misfire_threshold = store.misfire_threshold;
            for key in affected {
                let Some(record) = store.triggers.get(&key) else {
                    continue;
                };
                let trigger = record.trigger.clone();
                store.remove_ready(&trigger);
                let record = store.triggers.get_mut(&key).unwrap();
                record
                    .trigger
                    .update_with_new_calendar(&calendar, misfire_threshold);
                if record.state == InternalState::Waiting {
                    let trigger = record.trigger.clone();
                    store.insert_ready(&trigger);
                }
            }
        }
        Ok(())
    }

    fn remove_calendar(&self, name: &str) -> Result<bool, StoreError> {
        let mut store = self.inner.lock().unwrap();
        let in_use = store
            .triggers
            .values()
            .any(|r| r.trigger.calendar_name.as_deref() == Some(name));
        if in_use {
            return Err(StoreError::CalendarInUse(name.to_owned()));
        }
        Ok(store.calendars.remove(name).is_some())
    }

    fn retrieve_calendar(&self, name: &str) -> Option<CalendarKind> {
        let store = self.inner.lock().unwrap();
        store.calendars.get(name).cloned()
    }

    fn number_of_jobs(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn number_of_triggers(&self) -> usize {
        self.inner.lock().unwrap().triggers.len()
    }

    fn number_of_calendars(&self) -> usize {
        self.inner.lock().unwrap().calendars.len()
    }

    fn job_keys(&self, matcher: &GroupMatcher) -> Vec<JobKey> {
        let store = self.inner.lock().unwrap();
        let mut keys: Vec<JobKey> = match matcher.as_equals() {
            | Some(group) => store
                .jobs_by_group
                .get(group)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            | None => store
                .jobs_by_group
                .iter()
                .filter(|(g, _)| matcher.matches(g))
                .flat_map(|(_, set)| set.iter().cloned())
                .collect(),
        };
        keys.sort();
        keys
    }

    fn trigger_keys(&self, matcher: &GroupMatcher) -> Vec<TriggerKey> {
        let store = self.inner.lock().unwrap();
        let mut keys: Vec<TriggerKey> = match matcher.as_equals() {
            | Some(group) => store
                .triggers_by_group
                .get(group)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default(),
            | None => store
                .triggers_by_group
                .iter()
                .filter(|(g, _)| matcher.matches(g))
                .flat_map(|(_, set)| set.iter().cloned())
                .collect(),
        };
        keys.sort();
        keys
    }

    fn job_group_names(&self) -> Vec<String> {
        let store = self.inner.lock().unwrap();
        let mut names: Vec<String> =
            store.jobs_by_group.keys().cloned().collect();
        names.sort();
        names
    }

    fn trigger_group_names(&self) -> Vec<String> {
        let store = self.inner.lock().unwrap();
        let mut names: Vec<String> =
            store.triggers_by_group.keys().cloned().collect();
        names.sort();
        names
    }

    fn calendar_names(&self) -> Vec<String> {
        let store = self.inner.lock().unwrap();
        let mut names: Vec<String> = store.calendars.keys().cloned().collect();
        names.sort();
        names
    }

    fn triggers_for_job(&self, key: &JobKey) -> Vec<Trigger> {
        let store = self.inner.lock().unwrap();
        let mut triggers: Vec<Trigger> = store
            .trigger_keys_of_job(key)
            .into_iter()
            .filter_map(|k| store.triggers.get(&k))
            .map(|r| r.trigger.clone())
            .collect();
        triggers.sort_by(|a, b| a.key.cmp(&b.key));
        triggers
    }

    fn trigger_state(&self, key: &TriggerKey) -> TriggerState {
        let store = self.inner.lock().unwrap();
        match store.triggers.get(key).map(|r| r.state) {
            | None => TriggerState::None,
            | Some(InternalState::Waiting) | Some(InternalState::Acquired) => {
                TriggerState::Normal
            }
            | Some(InternalState::Paused)
            | Some(InternalState::PausedBlocked) => TriggerState::Paused,
            | Some(InternalState::Blocked) => TriggerState::Blocked,
            | Some(InternalState::Complete) => TriggerState::Complete,
            | Some(InternalState::Error) => TriggerState::Error,
        }
    }

    fn pause_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut store = self.inner.lock().unwrap();
        store.pause_trigger_record(key);
        Ok(())
    }

    fn pause_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError> {
        let mut store = self.inner.lock().unwrap();
        let groups = store.matching_trigger_groups(matcher);
        let mut paused = Vec::new();
        for group in groups {
            // Recording the group means triggers stored into it later start
            // out paused.
            if store.paused_trigger_groups.insert(group.clone()) {
                paused.push(group.clone());
            }
            let keys: Vec<TriggerKey> = store
                .triggers_by_group
                .get(&group)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for key in keys {
                store.pause_trigger_record(&key);
            }
        }
        Ok(paused)
    }

    fn pause_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut store = self.inner.lock().unwrap();
        for trigger_key in store.trigger_keys_of_job(key) {
            store.pause_trigger_record(&trigger_key);
        }
        Ok(())
    }

    fn pause_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError> {
        let mut store = self.inner.lock().unwrap();
        let groups = store.matching_job_groups(matcher);
        let mut paused = Vec::new();
        for group in groups {
            if store.paused_job_groups.insert(group.clone()) {
                paused.push(group.clone());
            }
            let jobs: Vec<JobKey> = store
                .jobs_by_group
                .get(&group)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for job in jobs {
                for trigger_key in store.trigger_keys_of_job(&job) {
                    store.pause_trigger_record(&trigger_key);
                }
            }
        }
        Ok(paused)
    }

    fn resume_trigger(&self, key: &TriggerKey) -> Result<(), StoreError> {
        let mut signals = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            store.resume_trigger_record(key, &mut signals);
        }
        self.emit(signals);
        Ok(())
    }

    fn resume_triggers(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError> {
        let mut signals = Vec::new();
        let resumed = {
            let mut store = self.inner.lock().unwrap();
            let groups = store.matching_trigger_groups(matcher);
            let mut resumed = Vec::new();
            for group in groups {
                if store.paused_trigger_groups.remove(&group) {
                    resumed.push(group.clone());
                }
                let keys: Vec<TriggerKey> = store
                    .triggers_by_group
                    .get(&group)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for key in keys {
                    // A trigger whose job group is still paused stays put.
                    let job_group_paused = store
                        .triggers
                        .get(&key)
                        .map(|r| {
                            store
                                .paused_job_groups
                                .contains(r.trigger.job_key.group())
                        })
                        .unwrap_or(false);
                    if !job_group_paused {
                        store.resume_trigger_record(&key, &mut signals);
                    }
                }
            }
            resumed
        };
        self.emit(signals);
        Ok(resumed)
    }

    fn resume_job(&self, key: &JobKey) -> Result<(), StoreError> {
        let mut signals = Vec::new();
        {
            let mut store = self.inner.lock().unwrap();
            for trigger_key in store.trigger_keys_of_job(key) {
                store.resume_trigger_record(&trigger_key, &mut signals);
            }
        }
        self.emit(signals);
        Ok(())
    }

    fn resume_jobs(
        &self,
        matcher: &GroupMatcher,
    ) -> Result<Vec<String>, StoreError> {
        let mut signals = Vec::new();
        let resumed = {
            let mut store = self.inner.lock().unwrap();
            let groups = store.matching_job_groups(matcher);
            let mut resumed = Vec::new();
            for group in groups {
                if store.paused_job_groups.remove(&group) {
                    resumed.push(group.clone());
                }
                let jobs: Vec<JobKey> = store
                    .jobs_by_group
                    .get(&group)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for job in jobs {
                    for trigger_key in store.trigger_keys_of_job(&job) {
                        let trigger_group_paused = store
                            .triggers
                            .get(&trigger_key)
                            .map(|r| {
                                store
                                    .paused_trigger_groups
                                    .contains(r.trigger.key.group())
                            })
                            .unwrap_or(false);
                        if !trigger_group_paused {
                            store.resume_trigger_record(
                                &trigger_key,
                                &mut signals,
                            );
                        }
                    }
                }
            }
            resumed
        };
        self.emit(signals);
        Ok(resumed)
    }

    fn pause_all(&self) -> Result<(), StoreError> {
        let groups = self.trigger_group_names();
        for group in groups {
            self.pause_triggers(&GroupMatcher::equals(group))?;
        }
        Ok(())
    }

    fn resume_all(&self) -> Result<(), StoreError> {
        {
            let mut store = self.inner.lock().unwrap();
            store.paused_job_groups.clear();
        }
        self.resume_triggers(&GroupMatcher::Anything)?;
        Ok(())
    }

    fn paused_trigger_groups(&self) -> Vec<String> {
        let store = self.inner.lock().unwrap();
        let mut groups: Vec<String> =
            store.paused_trigger_groups.iter().cloned().collect();
        groups.sort();
        groups
    }

    fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Vec<Trigger> {
        let mut signals = Vec::new();
        let result = {
            let mut guard = self.inner.lock().unwrap();
            let store = &mut *guard;
            if store.ready.is_empty() {
                return Vec::new();
            }

            let mut acquired = Vec::new();
            let mut acquired_jobs: HashSet<JobKey> = HashSet::new();
            let mut set_aside: Vec<TriggerKey> = Vec::new();
            let mut batch_end = no_later_than;

            while let Some(entry) = store.ready.pop_first() {
                let misfire_threshold = store.misfire_threshold;
                let Some(record) = store.triggers.get_mut(&entry.key) else {
                    continue;
                };
                if record.trigger.next_fire_time.is_none() {
                    continue;
                }

                if Store::apply_misfire(
                    record,
                    &store.calendars,
                    misfire_threshold,
                    &mut signals,
                ) {
                    let trigger = record.trigger.clone();
                    if trigger.next_fire_time.is_some() {
                        store.insert_ready(&trigger);
                    }
                    continue;
                }

                let next =
                    record.trigger.next_fire_time.expect("checked above");
                if next > batch_end {
                    let trigger = record.trigger.clone();
                    store.insert_ready(&trigger);
                    break;
                }

                let job_key = record.trigger.job_key.clone();
                let disallows_concurrency = store
                    .jobs
                    .get(&job_key)
                    .map(|j| j.concurrent_execution_disallowed)
                    .unwrap_or(false);
                if disallows_concurrency {
                    if acquired_jobs.contains(&job_key) {
                        // One per batch for this job; the rest go back in.
                        set_aside.push(entry.key.clone());
                        continue;
                    }
                    acquired_jobs.insert(job_key);
                }

                record.state = InternalState::Acquired;
                record.trigger.fire_instance_id =
                    Some(self.next_fire_instance_id());
                if acquired.is_empty() {
                    batch_end = next.max(Utc::now()) + time_window;
                }
                acquired.push(record.trigger.clone());
                if acquired.len() >= max_count {
                    break;
                }
            }

            for key in set_aside {
                if let Some(record) = store.triggers.get(&key) {
                    let trigger = record.trigger.clone();
                    store.insert_ready(&trigger);
                }
            }
            acquired
        };
        self.emit(signals);
        result
    }

    fn release_acquired_trigger(&self, trigger: &Trigger) {
        let mut store = self.inner.lock().unwrap();
        let Some(record) = store.triggers.get_mut(&trigger.key) else {
            return;
        };
        if record.state == InternalState::Acquired {
            record.state = InternalState::Waiting;
            let stored = record.trigger.clone();
            store.insert_ready(&stored);
        }
    }

    fn triggers_fired(
        &self,
        triggers: &mut [Trigger],
    ) -> Vec<TriggerFiredResult> {
        let mut results = Vec::with_capacity(triggers.len());
        let mut guard = self.inner.lock().unwrap();
        let store = &mut *guard;

        for caller_copy in triggers.iter_mut() {
            let Some(record) = store.triggers.get(&caller_copy.key) else {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            };
            if record.state != InternalState::Acquired
                || record.trigger.fire_instance_id
                    != caller_copy.fire_instance_id
            {
                results.push(TriggerFiredResult { bundle: None });
                continue;
            }
            // A named calendar that has gone missing blocks the firing.
            let calendar = match record.trigger.calendar_name.as_deref() {
                | Some(name) => match store.calendars.get(name) {
                    | Some(c) => Some(c.clone()),
                    | None => {
                        results.push(TriggerFiredResult { bundle: None });
                        continue;
                    }
                },
                | None => None,
            };

            let record = store.triggers.get_mut(&caller_copy.key).unwrap();
            let previous_fire_time = record.trigger.previous_fire_time;
            let scheduled_fire_time = record.trigger.next_fire_time;
            record.trigger.triggered(calendar.as_ref());
            record.state = InternalState::Waiting;
            *caller_copy = record.trigger.clone();

            let trigger = record.trigger.clone();
            let job = store
                .jobs
                .get(&trigger.job_key)
                .cloned()
                .expect("stored triggers always reference a stored job");

            if job.concurrent_execution_disallowed {
                // Freeze the job's other triggers until completion reports
                // back.
                for key in store.trigger_keys_of_job(&job.key) {
                    let Some(other) = store.triggers.get_mut(&key) else {
                        continue;
                    };
                    match other.state {
                        | InternalState::Waiting => {
                            other.state = InternalState::Blocked
                        }
                        | InternalState::Paused => {
                            other.state = InternalState::PausedBlocked
                        }
                        | _ => {}
                    }
                    let other_trigger = other.trigger.clone();
                    store.remove_ready(&other_trigger);
                }
                store.blocked_jobs.insert(job.key.clone());
            } else if trigger.next_fire_time.is_some() {
                store.insert_ready(&trigger);
            }

            results.push(TriggerFiredResult {
                bundle: Some(TriggerFiredBundle {
                    job_detail: job,
                    trigger,
                    calendar,
                    recovering: false,
                    fire_time: Utc::now(),
                    scheduled_fire_time,
                    previous_fire_time,
                    next_fire_time: caller_copy.next_fire_time,
                }),
            });
        }
        results
    }

    fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let mut signals = Vec::new();
        {
            let mut guard = self.inner.lock().unwrap();
            let store = &mut *guard;

            let flags = store.jobs.get_mut(&trigger.job_key).map(|job| {
                if job.persist_job_data_after_execution {
                    let mut data = job_detail.job_data.clone();
                    data.clear_dirty_flag();
                    job.job_data = data;
                }
                job.concurrent_execution_disallowed
            });
            match flags {
                | Some(true) => {
                    store.blocked_jobs.remove(&trigger.job_key);
                    for key in store.trigger_keys_of_job(&trigger.job_key) {
                        let Some(other) = store.triggers.get_mut(&key) else {
                            continue;
                        };
                        match other.state {
                            | InternalState::Blocked => {
                                other.state = InternalState::Waiting;
                                let t = other.trigger.clone();
                                store.insert_ready(&t);
                            }
                            | InternalState::PausedBlocked => {
                                other.state = InternalState::Paused;
                            }
                            | _ => {}
                        }
                    }
                    signals.push(Signal::SchedulingChange(None));
                }
                | Some(false) => {}
                // The job is gone; make sure it does not linger as blocked.
                | None => {
                    store.blocked_jobs.remove(&trigger.job_key);
                }
            }

            match instruction {
                | CompletedExecutionInstruction::Noop => {}
                | CompletedExecutionInstruction::ReExecuteJob => {
                    // The scheduler re-enqueues without store involvement.
                }
                | CompletedExecutionInstruction::DeleteTrigger => {
                    if trigger.next_fire_time.is_none() {
                        // Double-check against the stored copy: the job may
                        // have rescheduled this very trigger while running.
                        let stored_next = store
                            .triggers
                            .get(&trigger.key)
                            .and_then(|r| r.trigger.next_fire_time);
                        if stored_next.is_none() {
                            store.remove_trigger_record(
                                &trigger.key,
                                true,
                                &mut signals,
                            );
                        } else {
                            debug!(
                                trigger_key = %trigger.key,
                                "Deferring trigger deletion, it was \
                                 rescheduled during execution"
                            );
                        }
                    } else {
                        store.remove_trigger_record(
                            &trigger.key,
                            true,
                            &mut signals,
                        );
                        signals.push(Signal::SchedulingChange(None));
                    }
                }
                | CompletedExecutionInstruction::SetTriggerComplete => {
                    if let Some(record) = store.triggers.get_mut(&trigger.key)
                    {
                        record.state = InternalState::Complete;
                        let t = record.trigger.clone();
                        store.remove_ready(&t);
                    }
                    signals.push(Signal::SchedulingChange(None));
                }
                | CompletedExecutionInstruction::SetTriggerError => {
                    warn!(
                        trigger_key = %trigger.key,
                        "Trigger entering ERROR state after execution"
                    );
                    if let Some(record) = store.triggers.get_mut(&trigger.key)
                    {
                        record.state = InternalState::Error;
                        let t = record.trigger.clone();
                        store.remove_ready(&t);
                    }
                    signals.push(Signal::SchedulingChange(None));
                }
                | CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                    for key in store.trigger_keys_of_job(&trigger.job_key) {
                        if let Some(record) = store.triggers.get_mut(&key) {
                            record.state = InternalState::Complete;
                            let t = record.trigger.clone();
                            store.remove_ready(&t);
                        }
                    }
                    signals.push(Signal::SchedulingChange(None));
                }
                | CompletedExecutionInstruction::SetAllJobTriggersError => {
                    warn!(
                        job_key = %trigger.job_key,
                        "All triggers of job entering ERROR state"
                    );
                    for key in store.trigger_keys_of_job(&trigger.job_key) {
                        if let Some(record) = store.triggers.get_mut(&key) {
                            record.state = InternalState::Error;
                            let t = record.trigger.clone();
                            store.remove_ready(&t);
                        }
                    }
                    signals.push(Signal::SchedulingChange(None));
                }
            }
        }
        self.emit(signals);
    }
}
