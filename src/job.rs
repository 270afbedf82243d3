use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::calendar::CalendarKind;
use crate::error::{JobExecutionError, SchedulerError};
use crate::key::JobKey;
use crate::trigger::Trigger;

/// A string-to-value mapping carried by jobs and triggers. Tracks a dirty
/// flag that turns on with any mutation and only resets through
/// [`JobDataMap::clear_dirty_flag`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobDataMap {
    data: HashMap<String, Value>,
    #[serde(skip)]
    dirty: bool,
}

impl JobDataMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty_flag(&mut self) {
        self.dirty = false;
    }

    pub fn put(
        &mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Option<Value> {
        self.dirty = true;
        self.data.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.dirty = true;
        self.data.remove(key)
    }

    pub fn clear(&mut self) {
        self.dirty = true;
        self.data.clear();
    }

    /// Mutable access to an existing entry's value. Marks the map dirty even
    /// if the caller ends up not writing through it.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        let v = self.data.get_mut(key);
        if v.is_some() {
            self.dirty = true;
        }
        v
    }

    pub fn entry(&mut self, key: impl Into<String>) -> Entry<'_, String, Value> {
        self.dirty = true;
        self.data.entry(key.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.data.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.data.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.data.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Copies every entry of `other` into this map.
    pub fn merge(&mut self, other: &JobDataMap) {
        if other.data.is_empty() {
            return;
        }
        self.dirty = true;
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }
}

impl PartialEq for JobDataMap {
    fn eq(&self, other: &Self) -> bool {
        // The dirty flag is bookkeeping, not content.
        self.data == other.data
    }
}

/// The stored description of a job: identity, the runnable it resolves to,
/// its data, and the three behavior flags.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDetail {
    pub key: JobKey,
    pub description: Option<String>,
    /// Name the [`JobFactory`] resolves to a runnable at fire time.
    pub runnable: String,
    pub job_data: JobDataMap,
    /// A durable job may remain stored with no triggers pointing at it.
    pub durable: bool,
    /// Write data-map changes made during execution back to the store.
    pub persist_job_data_after_execution: bool,
    /// At most one execution of this job may be in flight at a time.
    pub concurrent_execution_disallowed: bool,
}

impl JobDetail {
    pub fn new(key: JobKey, runnable: impl Into<String>) -> Self {
        Self {
            key,
            description: None,
            runnable: runnable.into(),
            job_data: JobDataMap::new(),
            durable: false,
            persist_job_data_after_execution: false,
            concurrent_execution_disallowed: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_durability(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_persist_job_data(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    pub fn with_disallow_concurrency(mut self, disallow: bool) -> Self {
        self.concurrent_execution_disallowed = disallow;
        self
    }

    pub fn with_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.job_data.put(key, value);
        self.job_data.clear_dirty_flag();
        self
    }
}

/// User-supplied job code. Executed on a worker thread; the context is the
/// job's window into the firing that invoked it.
pub trait Job: Send {
    fn execute(
        &self,
        context: &mut JobExecutionContext,
    ) -> Result<(), JobExecutionError>;
}

impl<F> Job for F
where
    F: Fn(&mut JobExecutionContext) -> Result<(), JobExecutionError> + Send,
{
    fn execute(
        &self,
        context: &mut JobExecutionContext,
    ) -> Result<(), JobExecutionError> {
        self(context)
    }
}

/// Produces a fresh [`Job`] instance for each firing, resolved from the
/// job detail's `runnable` name.
pub trait JobFactory: Send + Sync {
    fn new_job(
        &self,
        detail: &JobDetail,
    ) -> Result<Box<dyn Job>, SchedulerError>;
}

type JobConstructor = dyn Fn() -> Box<dyn Job> + Send + Sync;

/// The default factory: a registry of constructors keyed by runnable name.
#[derive(Default)]
pub struct RegistryJobFactory {
    constructors: HashMap<String, Arc<JobConstructor>>,
}

impl RegistryJobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, runnable: impl Into<String>, ctor: F)
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        self.constructors.insert(runnable.into(), Arc::new(ctor));
    }
}

impl JobFactory for RegistryJobFactory {
    fn new_job(
        &self,
        detail: &JobDetail,
    ) -> Result<Box<dyn Job>, SchedulerError> {
        let ctor = self.constructors.get(&detail.runnable).ok_or_else(|| {
            SchedulerError::JobInstantiation(
                detail.key.clone(),
                format!("no job registered under '{}'", detail.runnable),
            )
        })?;
        Ok(ctor())
    }
}

/// Everything a job (and the listeners around it) can see about one firing.
/// The job detail and trigger are clones; mutating them affects nothing
/// outside this execution except through the persist-job-data opt-in.
pub struct JobExecutionContext {
    pub job_detail: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<CalendarKind>,
    pub recovering: bool,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    /// How many times this context has been re-fired by the
    /// refire-immediately flag. Zero on the first attempt.
    pub refire_count: u32,
    /// Slot for the job to leave a result for listeners to pick up.
    pub result: Option<Value>,
    merged_data: JobDataMap,
    scheduler_context: Arc<Mutex<JobDataMap>>,
}

impl JobExecutionContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        job_detail: JobDetail,
        trigger: Trigger,
        calendar: Option<CalendarKind>,
        recovering: bool,
        fire_time: DateTime<Utc>,
        scheduled_fire_time: Option<DateTime<Utc>>,
        previous_fire_time: Option<DateTime<Utc>>,
        next_fire_time: Option<DateTime<Utc>>,
        scheduler_context: Arc<Mutex<JobDataMap>>,
    ) -> Self {
        let fire_instance_id = trigger
            .fire_instance_id
            .clone()
            .unwrap_or_default();
        let mut merged_data = job_detail.job_data.clone();
        merged_data.merge(&trigger.job_data);
        merged_data.clear_dirty_flag();
        Self {
            job_detail,
            trigger,
            calendar,
            recovering,
            fire_instance_id,
            fire_time,
            scheduled_fire_time,
            previous_fire_time,
            next_fire_time,
            refire_count: 0,
            result: None,
            merged_data,
            scheduler_context,
        }
    }

    /// The scheduler-wide context map, shared by every execution and the
    /// facade.
    pub fn scheduler_context(&self) -> Arc<Mutex<JobDataMap>> {
        self.scheduler_context.clone()
    }

    /// Job data merged from the job detail and the trigger, trigger entries
    /// winning. Writes here do not persist; use
    /// [`JobExecutionContext::job_data_mut`] with the persist flag for that.
    pub fn merged_job_data(&self) -> &JobDataMap {
        &self.merged_data
    }

    /// The job detail's own data map. With
    /// `persist_job_data_after_execution` set, changes made here are written
    /// back to the store when the execution completes.
    pub fn job_data_mut(&mut self) -> &mut JobDataMap {
        &mut self.job_detail.job_data
    }
}

impl fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobExecutionContext")
            .field("job", &self.job_detail.key)
            .field("trigger", &self.trigger.key)
            .field("fire_instance_id", &self.fire_instance_id)
            .field("fire_time", &self.fire_time)
            .field("refire_count", &self.refire_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_map_is_clean() {
        let map = JobDataMap::new();
        assert!(!map.is_dirty());
        assert!(map.is_empty());
    }

    #[test]
    fn every_mutation_dirties() {
        let mut map = JobDataMap::new();
        map.put("a", 1);
        assert!(map.is_dirty());

        map.clear_dirty_flag();
        map.remove("a");
        assert!(map.is_dirty());

        map.clear_dirty_flag();
        map.clear();
        assert!(map.is_dirty());

        map.put("b", 2);
        map.clear_dirty_flag();
        *map.get_mut("b").unwrap() = Value::from(3);
        assert!(map.is_dirty());
        assert_eq!(Some(3), map.get_i64("b"));

        map.clear_dirty_flag();
        map.entry("c").or_insert(Value::from(true));
        assert!(map.is_dirty());

        map.clear_dirty_flag();
        let mut other = JobDataMap::new();
        other.put("d", "x");
        map.merge(&other);
        assert!(map.is_dirty());
        assert_eq!(Some("x"), map.get_str("d"));
    }

    #[test]
    fn reads_do_not_dirty() {
        let mut map = JobDataMap::new();
        map.put("a", 1);
        map.clear_dirty_flag();

        let _ = map.get("a");
        let _ = map.get_i64("a");
        let _ = map.contains_key("missing");
        let _ = map.iter().count();
        assert!(!map.is_dirty());
    }

    #[test]
    fn merging_empty_map_keeps_clean() {
        let mut map = JobDataMap::new();
        map.merge(&JobDataMap::new());
        assert!(!map.is_dirty());
    }

    #[test]
    fn detail_builder_leaves_data_clean() {
        let detail = JobDetail::new(JobKey::of_name("rollup"), "rollup_job")
            .with_durability(true)
            .with_data("batch", 7);
        assert!(detail.durable);
        assert!(!detail.job_data.is_dirty());
        assert_eq!(Some(7), detail.job_data.get_i64("batch"));
    }
}
