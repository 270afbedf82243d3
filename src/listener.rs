//! Listener registration and fan-out. Job and trigger listeners are scoped
//! by matchers over the event's key; scheduler listeners hear every
//! lifecycle event. A listener that panics is logged and skipped so the rest
//! of the chain still runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::error::JobExecutionError;
use crate::job::JobExecutionContext;
use crate::key::{JobKey, Key, TriggerKey};
use crate::matcher::Matcher;
use crate::trigger::{CompletedExecutionInstruction, Trigger};

/// Observes job execution around a firing.
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    fn job_to_be_executed(&self, _context: &JobExecutionContext) {}

    fn job_execution_vetoed(&self, _context: &JobExecutionContext) {}

    fn job_was_executed(
        &self,
        _context: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) {
    }
}

/// Observes trigger firings and may veto the execution they would start.
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    fn trigger_fired(&self, _trigger: &Trigger, _context: &JobExecutionContext) {
    }

    /// Return true to veto the job execution. Every registered listener is
    /// consulted even after the first veto.
    fn veto_job_execution(
        &self,
        _trigger: &Trigger,
        _context: &JobExecutionContext,
    ) -> bool {
        false
    }

    fn trigger_misfired(&self, _trigger: &Trigger) {}

    fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _context: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) {
    }
}

/// Observes scheduler lifecycle and scheduling-data changes.
#[allow(unused_variables)]
pub trait SchedulerListener: Send + Sync {
    fn name(&self) -> &str;

    fn scheduler_starting(&self) {}
    fn scheduler_started(&self) {}
    fn scheduler_in_standby_mode(&self) {}
    fn scheduler_shutting_down(&self) {}
    fn scheduler_shutdown(&self) {}
    fn scheduler_error(&self, message: &str) {}
    fn job_scheduled(&self, trigger: &Trigger) {}
    fn job_unscheduled(&self, key: &TriggerKey) {}
    fn job_added(&self, key: &JobKey) {}
    fn job_deleted(&self, key: &JobKey) {}
    fn job_paused(&self, key: &JobKey) {}
    fn job_resumed(&self, key: &JobKey) {}
    fn jobs_paused(&self, group: &str) {}
    fn jobs_resumed(&self, group: &str) {}
    fn trigger_paused(&self, key: &TriggerKey) {}
    fn trigger_resumed(&self, key: &TriggerKey) {}
    fn triggers_paused(&self, group: &str) {}
    fn triggers_resumed(&self, group: &str) {}
    fn trigger_finalized(&self, trigger: &Trigger) {}
    fn scheduling_data_cleared(&self) {}
}

struct Registration<L: ?Sized> {
    listener: Arc<L>,
    matchers: Vec<Matcher>,
}

impl<L: ?Sized> Registration<L> {
    fn matches(&self, key: &Key) -> bool {
        // No matchers means match everything.
        self.matchers.is_empty()
            || self.matchers.iter().any(|m| m.matches(key))
    }
}

#[derive(Default)]
struct Listeners {
    job: Vec<Registration<dyn JobListener>>,
    trigger: Vec<Registration<dyn TriggerListener>>,
    scheduler: Vec<Arc<dyn SchedulerListener>>,
}

/// Holds every registered listener. Shared by the facade (registration) and
/// the scheduler internals (fan-out).
#[derive(Default)]
pub struct ListenerManager {
    inner: RwLock<Listeners>,
}

fn guarded(name: &str, event: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(listener = name, event, "Listener panicked, continuing");
    }
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job listener. An existing listener with the same name is
    /// replaced.
    pub fn add_job_listener(
        &self,
        listener: Arc<dyn JobListener>,
        matchers: Vec<Matcher>,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner.job.retain(|r| r.listener.name() != listener.name());
        inner.job.push(Registration { listener, matchers });
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.job.len();
        inner.job.retain(|r| r.listener.name() != name);
        inner.job.len() != before
    }

    pub fn job_listener_names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .job
            .iter()
            .map(|r| r.listener.name().to_owned())
            .collect()
    }

    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<Matcher>,
    ) {
        let mut inner = self.inner.write().unwrap();
        inner
            .trigger
            .retain(|r| r.listener.name() != listener.name());
        inner.trigger.push(Registration { listener, matchers });
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.trigger.len();
        inner.trigger.retain(|r| r.listener.name() != name);
        inner.trigger.len() != before
    }

    pub fn trigger_listener_names(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner
            .trigger
            .iter()
            .map(|r| r.listener.name().to_owned())
            .collect()
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        let mut inner = self.inner.write().unwrap();
        inner.scheduler.retain(|l| l.name() != listener.name());
        inner.scheduler.push(listener);
    }

    pub fn remove_scheduler_listener(&self, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.scheduler.len();
        inner.scheduler.retain(|l| l.name() != name);
        inner.scheduler.len() != before
    }

    // Fan-out. Listener snapshots are taken up front so user code runs
    // without the registration lock held.

    fn job_listeners_for(
        &self,
        key: &JobKey,
    ) -> Vec<Arc<dyn JobListener>> {
        let inner = self.inner.read().unwrap();
        inner
            .job
            .iter()
            .filter(|r| r.matches(key.as_key()))
            .map(|r| r.listener.clone())
            .collect()
    }

    fn trigger_listeners_for(
        &self,
        key: &TriggerKey,
    ) -> Vec<Arc<dyn TriggerListener>> {
        let inner = self.inner.read().unwrap();
        inner
            .trigger
            .iter()
            .filter(|r| r.matches(key.as_key()))
            .map(|r| r.listener.clone())
            .collect()
    }

    fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.inner.read().unwrap().scheduler.clone()
    }

    pub(crate) fn notify_job_to_be_executed(
        &self,
        context: &JobExecutionContext,
    ) {
        for l in self.job_listeners_for(&context.job_detail.key) {
            guarded(l.name(), "job_to_be_executed", || {
                l.job_to_be_executed(context)
            });
        }
    }

    pub(crate) fn notify_job_execution_vetoed(
        &self,
        context: &JobExecutionContext,
    ) {
        for l in self.job_listeners_for(&context.job_detail.key) {
            guarded(l.name(), "job_execution_vetoed", || {
                l.job_execution_vetoed(context)
            });
        }
    }

    pub(crate) fn notify_job_was_executed(
        &self,
        context: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    ) {
        for l in self.job_listeners_for(&context.job_detail.key) {
            guarded(l.name(), "job_was_executed", || {
                l.job_was_executed(context, error)
            });
        }
    }

    /// Raises `trigger_fired` then collects vetoes; any listener answering
    /// true vetoes, but all of them are consulted.
    pub(crate) fn notify_trigger_fired_and_poll_veto(
        &self,
        trigger: &Trigger,
        context: &JobExecutionContext,
    ) -> bool {
        let mut vetoed = false;
        for l in self.trigger_listeners_for(&trigger.key) {
            guarded(l.name(), "trigger_fired", || l.trigger_fired(trigger, context));
            let name = l.name().to_owned();
            let result = catch_unwind(AssertUnwindSafe(|| {
                l.veto_job_execution(trigger, context)
            }));
            match result {
                | Ok(v) => vetoed |= v,
                | Err(_) => error!(
                    listener = name,
                    event = "veto_job_execution",
                    "Listener panicked, continuing"
                ),
            }
        }
        vetoed
    }

    pub(crate) fn notify_trigger_misfired(&self, trigger: &Trigger) {
        for l in self.trigger_listeners_for(&trigger.key) {
            guarded(l.name(), "trigger_misfired", || {
                l.trigger_misfired(trigger)
            });
        }
    }

    pub(crate) fn notify_trigger_complete(
        &self,
        trigger: &Trigger,
        context: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        for l in self.trigger_listeners_for(&trigger.key) {
            guarded(l.name(), "trigger_complete", || {
                l.trigger_complete(trigger, context, instruction)
            });
        }
    }

    pub(crate) fn notify_scheduler<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn SchedulerListener),
    {
        for l in self.scheduler_listeners() {
            guarded(l.name(), event, || f(l.as_ref()));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::matcher::Matcher;

    #[derive(Default)]
    struct CountingTriggerListener {
        name: String,
        veto: bool,
        fired: AtomicUsize,
        veto_polls: AtomicUsize,
    }

    impl CountingTriggerListener {
        fn new(name: &str, veto: bool) -> Self {
            Self {
                name: name.to_owned(),
                veto,
                ..Self::default()
            }
        }
    }

    impl TriggerListener for CountingTriggerListener {
        fn name(&self) -> &str {
            &self.name
        }

        fn trigger_fired(
            &self,
            _trigger: &Trigger,
            _context: &JobExecutionContext,
        ) {
            self.fired.fetch_add(1, Ordering::SeqCst);
        }

        fn veto_job_execution(
            &self,
            _trigger: &Trigger,
            _context: &JobExecutionContext,
        ) -> bool {
            self.veto_polls.fetch_add(1, Ordering::SeqCst);
            self.veto
        }
    }

    struct NamedSchedulerListener {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl SchedulerListener for NamedSchedulerListener {
        fn name(&self) -> &str {
            &self.name
        }

        fn scheduler_started(&self) {
            self.log.lock().unwrap().push(format!("{}:started", self.name));
        }
    }

    fn context_for(trigger: &Trigger) -> JobExecutionContext {
        let job = crate::job::JobDetail::new(trigger.job_key.clone(), "noop");
        JobExecutionContext::new(
            job,
            trigger.clone(),
            None,
            false,
            chrono::Utc::now(),
            None,
            None,
            None,
            Arc::new(Mutex::new(crate::job::JobDataMap::new())),
        )
    }

    fn sample_trigger(group: &str) -> Trigger {
        Trigger::simple(
            TriggerKey::new(group, "t"),
            JobKey::of_name("j"),
            0,
            chrono::Duration::zero(),
        )
    }

    #[test]
    fn all_listeners_polled_even_after_veto() {
        let manager = ListenerManager::new();
        let first = Arc::new(CountingTriggerListener::new("first", true));
        let second = Arc::new(CountingTriggerListener::new("second", false));
        manager.add_trigger_listener(first.clone(), Vec::new());
        manager.add_trigger_listener(second.clone(), Vec::new());

        let trigger = sample_trigger("g");
        let vetoed = manager
            .notify_trigger_fired_and_poll_veto(&trigger, &context_for(&trigger));
        assert!(vetoed);
        assert_eq!(1, first.veto_polls.load(Ordering::SeqCst));
        // The second listener still observed the event.
        assert_eq!(1, second.veto_polls.load(Ordering::SeqCst));
        assert_eq!(1, second.fired.load(Ordering::SeqCst));
    }

    #[test]
    fn matchers_scope_delivery() {
        let manager = ListenerManager::new();
        let scoped = Arc::new(CountingTriggerListener::new("scoped", false));
        manager.add_trigger_listener(
            scoped.clone(),
            vec![Matcher::group_equals("batch")],
        );

        let batch = sample_trigger("batch");
        let online = sample_trigger("online");
        manager.notify_trigger_fired_and_poll_veto(&batch, &context_for(&batch));
        manager
            .notify_trigger_fired_and_poll_veto(&online, &context_for(&online));
        assert_eq!(1, scoped.fired.load(Ordering::SeqCst));
    }

    #[test]
    fn no_matchers_means_everything() {
        let manager = ListenerManager::new();
        let open = Arc::new(CountingTriggerListener::new("open", false));
        manager.add_trigger_listener(open.clone(), Vec::new());

        let t = sample_trigger("anything");
        manager.notify_trigger_fired_and_poll_veto(&t, &context_for(&t));
        assert_eq!(1, open.fired.load(Ordering::SeqCst));
    }

    #[test]
    fn same_name_replaces() {
        let manager = ListenerManager::new();
        let a = Arc::new(CountingTriggerListener::new("dup", false));
        let b = Arc::new(CountingTriggerListener::new("dup", false));
        manager.add_trigger_listener(a.clone(), Vec::new());
        manager.add_trigger_listener(b.clone(), Vec::new());
        assert_eq!(vec!["dup".to_owned()], manager.trigger_listener_names());

        let t = sample_trigger("g");
        manager.notify_trigger_fired_and_poll_veto(&t, &context_for(&t));
        assert_eq!(0, a.fired.load(Ordering::SeqCst));
        assert_eq!(1, b.fired.load(Ordering::SeqCst));
    }

    #[test]
    fn removal_by_name() {
        let manager = ListenerManager::new();
        manager.add_trigger_listener(
            Arc::new(CountingTriggerListener::new("gone", false)),
            Vec::new(),
        );
        assert!(manager.remove_trigger_listener("gone"));
        assert!(!manager.remove_trigger_listener("gone"));
        assert!(manager.trigger_listener_names().is_empty());
    }

    #[test]
    fn panicking_listener_does_not_stop_the_chain() {
        struct Panicky;
        impl TriggerListener for Panicky {
            fn name(&self) -> &str {
                "panicky"
            }
            fn trigger_fired(
                &self,
                _trigger: &Trigger,
                _context: &JobExecutionContext,
            ) {
                panic!("listener bug");
            }
        }

        let manager = ListenerManager::new();
        let survivor = Arc::new(CountingTriggerListener::new("ok", false));
        manager.add_trigger_listener(Arc::new(Panicky), Vec::new());
        manager.add_trigger_listener(survivor.clone(), Vec::new());

        let t = sample_trigger("g");
        manager.notify_trigger_fired_and_poll_veto(&t, &context_for(&t));
        assert_eq!(1, survivor.fired.load(Ordering::SeqCst));
    }

    #[test]
    fn scheduler_listeners_hear_lifecycle_events() {
        let manager = ListenerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.add_scheduler_listener(Arc::new(NamedSchedulerListener {
            name: "a".to_owned(),
            log: log.clone(),
        }));
        manager.add_scheduler_listener(Arc::new(NamedSchedulerListener {
            name: "b".to_owned(),
            log: log.clone(),
        }));

        manager.notify_scheduler("scheduler_started", |l| l.scheduler_started());
        assert_eq!(
            vec!["a:started".to_owned(), "b:started".to_owned()],
            log.lock().unwrap().clone()
        );
    }
}
