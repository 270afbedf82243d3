use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use cronloop::{
    Config, GroupMatcher, JobDataMap, JobDetail, JobExecutionContext,
    JobExecutionError, JobKey, RegistryJobFactory, Scheduler, Trigger,
    TriggerKey, TriggerListener, TriggerState, REPEAT_INDEFINITELY,
};
use tracing_test::traced_test;

fn wait_for(timeout: StdDuration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(StdDuration::from_millis(10));
    }
    cond()
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.thread_pool.thread_count = 3;
    config.scheduler.batch_max_count = 10;
    config
}

fn counting_scheduler(
    runnable: &str,
    executions: Arc<AtomicUsize>,
) -> Scheduler {
    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    factory.register(runnable, move || {
        let executions = executions.clone();
        Box::new(
            move |_ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
            executions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });
    scheduler.set_job_factory(Arc::new(factory));
    scheduler
}

#[traced_test]
#[test]
fn schedules_and_executes_repeatedly() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("count", executions.clone());

    let job = JobDetail::new(JobKey::of_name("count"), "count");
    let trigger = Trigger::simple(
        TriggerKey::of_name("count"),
        job.key.clone(),
        2,
        Duration::milliseconds(100),
    )
    .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    // Three firings in total: start plus two repeats.
    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 3
    }));
    scheduler.shutdown(true);
    assert_eq!(3, executions.load(Ordering::SeqCst));
}

#[traced_test]
#[test]
fn scheduling_change_wakes_idle_scheduler() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("wake", executions.clone());
    // Default idle wait is 30 seconds; start with nothing scheduled so the
    // thread parks for the full window.
    scheduler.start().unwrap();
    std::thread::sleep(StdDuration::from_millis(100));

    let job = JobDetail::new(JobKey::of_name("wake"), "wake");
    let trigger = Trigger::one_shot(TriggerKey::of_name("wake"), job.key.clone())
        .with_start_time(Utc::now());
    let scheduled_at = Instant::now();
    scheduler.schedule_job(job, trigger).unwrap();

    // The firing must come from the wake-up signal, not from the 30s poll.
    assert!(wait_for(StdDuration::from_secs(5), || {
        executions.load(Ordering::SeqCst) >= 1
    }));
    assert!(scheduled_at.elapsed() < StdDuration::from_secs(10));
    scheduler.shutdown(true);
}

#[traced_test]
#[test]
fn veto_prevents_execution_and_completes_trigger() {
    struct VetoAll {
        vetoed: Arc<AtomicUsize>,
    }
    impl TriggerListener for VetoAll {
        fn name(&self) -> &str {
            "veto-all"
        }
        fn veto_job_execution(
            &self,
            _trigger: &Trigger,
            _context: &JobExecutionContext,
        ) -> bool {
            self.vetoed.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    let executions = Arc::new(AtomicUsize::new(0));
    let vetoed = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("vetoed", executions.clone());
    scheduler.listener_manager().add_trigger_listener(
        Arc::new(VetoAll {
            vetoed: vetoed.clone(),
        }),
        Vec::new(),
    );

    let job = JobDetail::new(JobKey::of_name("vetoed"), "vetoed");
    let trigger =
        Trigger::one_shot(TriggerKey::of_name("vetoed"), job.key.clone())
            .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        vetoed.load(Ordering::SeqCst) >= 1
    }));
    assert!(wait_for(StdDuration::from_secs(5), || {
        scheduler.get_trigger_state(&TriggerKey::of_name("vetoed"))
            == TriggerState::Complete
    }));
    scheduler.shutdown(true);
    assert_eq!(0, executions.load(Ordering::SeqCst));
}

#[traced_test]
#[test]
fn disallowed_concurrency_never_overlaps() {
    let in_flight = Arc::new(AtomicI64::new(0));
    let max_in_flight = Arc::new(AtomicI64::new(0));
    let executions = Arc::new(AtomicUsize::new(0));

    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        let executions = executions.clone();
        factory.register("serial", move || {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            let executions = executions.clone();
            Box::new(
            move |_ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(StdDuration::from_millis(150));
                in_flight.fetch_sub(1, Ordering::SeqCst);
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
    }
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("serial"), "serial")
        .with_disallow_concurrency(true);
    // Two triggers on the same job, both hot.
    let t1 = Trigger::simple(
        TriggerKey::of_name("serial-1"),
        job.key.clone(),
        REPEAT_INDEFINITELY,
        Duration::milliseconds(50),
    )
    .with_start_time(Utc::now());
    let t2 = Trigger::simple(
        TriggerKey::of_name("serial-2"),
        job.key.clone(),
        REPEAT_INDEFINITELY,
        Duration::milliseconds(50),
    )
    .with_start_time(Utc::now());
    scheduler.schedule_job(job, t1).unwrap();
    scheduler.schedule_trigger(t2).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 3
    }));
    scheduler.shutdown(true);
    assert_eq!(1, max_in_flight.load(Ordering::SeqCst));
}

#[traced_test]
#[test]
fn refire_immediately_runs_again_without_rescheduling() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    {
        let executions = executions.clone();
        factory.register("retry-once", move || {
            let executions = executions.clone();
            Box::new(
            move |ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
                executions.fetch_add(1, Ordering::SeqCst);
                if ctx.refire_count == 0 {
                    Err(JobExecutionError::new("transient")
                        .with_refire_immediately())
                } else {
                    Ok(())
                }
            })
        });
    }
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("retry"), "retry-once");
    let trigger =
        Trigger::one_shot(TriggerKey::of_name("retry"), job.key.clone())
            .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 2
    }));
    scheduler.shutdown(true);
    assert_eq!(2, executions.load(Ordering::SeqCst));
}

#[traced_test]
#[test]
fn unschedule_firing_trigger_flag_stops_the_trigger() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    {
        let executions = executions.clone();
        factory.register("one-strike", move || {
            let executions = executions.clone();
            Box::new(
            move |_ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
                executions.fetch_add(1, Ordering::SeqCst);
                Err(JobExecutionError::new("done with this trigger")
                    .with_unschedule_firing_trigger())
            })
        });
    }
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("strike"), "one-strike");
    let trigger = Trigger::simple(
        TriggerKey::of_name("strike"),
        job.key.clone(),
        REPEAT_INDEFINITELY,
        Duration::milliseconds(500),
    )
    .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 1
    }));
    assert!(wait_for(StdDuration::from_secs(5), || {
        scheduler.get_trigger_state(&TriggerKey::of_name("strike"))
            == TriggerState::Complete
    }));
    // No further firings arrive.
    std::thread::sleep(StdDuration::from_millis(1200));
    scheduler.shutdown(true);
    assert_eq!(1, executions.load(Ordering::SeqCst));
}

#[traced_test]
#[test]
fn trigger_job_fires_immediately() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("adhoc", executions.clone());
    scheduler.start().unwrap();

    let job = JobDetail::new(JobKey::of_name("adhoc"), "adhoc")
        .with_durability(true);
    scheduler.add_job(job, false, false).unwrap();
    scheduler
        .trigger_job(&JobKey::of_name("adhoc"), None)
        .unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 1
    }));
    scheduler.shutdown(true);
    // The synthesized one-shot trigger cleaned itself up.
    assert!(scheduler
        .get_triggers_of_job(&JobKey::of_name("adhoc"))
        .is_empty());
}

#[traced_test]
#[test]
fn standby_halts_dispatch_until_restart() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("standby", executions.clone());
    scheduler.start().unwrap();
    scheduler.standby().unwrap();
    assert!(scheduler.is_in_standby_mode());

    let job = JobDetail::new(JobKey::of_name("standby"), "standby");
    let trigger =
        Trigger::one_shot(TriggerKey::of_name("standby"), job.key.clone())
            .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();

    std::thread::sleep(StdDuration::from_millis(400));
    assert_eq!(0, executions.load(Ordering::SeqCst));

    scheduler.start().unwrap();
    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 1
    }));
    scheduler.shutdown(true);
}

#[traced_test]
#[test]
fn persisted_job_data_accumulates_across_executions() {
    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    factory.register("tally", || {
        Box::new(
            |ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
            let count =
                ctx.job_data_mut().get_i64("count").unwrap_or(0) + 1;
            ctx.job_data_mut().put("count", count);
            Ok(())
        })
    });
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("tally"), "tally")
        .with_persist_job_data(true)
        .with_durability(true)
        .with_data("count", 0);
    let trigger = Trigger::simple(
        TriggerKey::of_name("tally"),
        job.key.clone(),
        1,
        Duration::milliseconds(300),
    )
    .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        scheduler
            .get_job_detail(&JobKey::of_name("tally"))
            .and_then(|j| j.job_data.get_i64("count"))
            == Some(2)
    }));
    scheduler.shutdown(true);
}

#[traced_test]
#[test]
fn lifecycle_listener_event_ordering() {
    use cronloop::SchedulerListener;

    struct Recorder {
        log: Arc<Mutex<Vec<&'static str>>>,
    }
    impl SchedulerListener for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn scheduler_starting(&self) {
            self.log.lock().unwrap().push("starting");
        }
        fn scheduler_started(&self) {
            self.log.lock().unwrap().push("started");
        }
        fn scheduler_in_standby_mode(&self) {
            self.log.lock().unwrap().push("standby");
        }
        fn scheduler_shutting_down(&self) {
            self.log.lock().unwrap().push("shutting-down");
        }
        fn scheduler_shutdown(&self) {
            self.log.lock().unwrap().push("shutdown");
        }
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(test_config()).unwrap();
    scheduler
        .listener_manager()
        .add_scheduler_listener(Arc::new(Recorder { log: log.clone() }));

    scheduler.start().unwrap();
    scheduler.standby().unwrap();
    scheduler.start().unwrap();
    scheduler.shutdown(true);

    assert_eq!(
        vec![
            "starting",
            "started",
            "standby",
            "starting",
            "started",
            "shutting-down",
            "shutdown"
        ],
        log.lock().unwrap().clone()
    );
    // Post-shutdown operations are refused.
    assert!(scheduler.start().is_err());
    let job = JobDetail::new(JobKey::of_name("late"), "late");
    let trigger = Trigger::one_shot(TriggerKey::of_name("late"), job.key.clone());
    assert!(scheduler.schedule_job(job, trigger).is_err());
}

#[traced_test]
#[test]
fn pause_and_resume_through_the_facade() {
    let executions = Arc::new(AtomicUsize::new(0));
    let scheduler = counting_scheduler("pausable", executions.clone());

    let job = JobDetail::new(JobKey::new("batch", "pausable"), "pausable");
    let trigger = Trigger::simple(
        TriggerKey::new("batch", "pausable"),
        job.key.clone(),
        REPEAT_INDEFINITELY,
        Duration::milliseconds(100),
    )
    .with_start_time(Utc::now() + Duration::seconds(30));
    scheduler.schedule_job(job, trigger).unwrap();

    let paused = scheduler
        .pause_triggers(&GroupMatcher::equals("batch"))
        .unwrap();
    assert_eq!(vec!["batch".to_owned()], paused);
    assert_eq!(
        vec!["batch".to_owned()],
        scheduler.get_paused_trigger_groups()
    );
    assert_eq!(
        TriggerState::Paused,
        scheduler.get_trigger_state(&TriggerKey::new("batch", "pausable"))
    );

    scheduler
        .resume_triggers(&GroupMatcher::equals("batch"))
        .unwrap();
    assert_eq!(
        TriggerState::Normal,
        scheduler.get_trigger_state(&TriggerKey::new("batch", "pausable"))
    );
    assert!(scheduler.get_paused_trigger_groups().is_empty());
    scheduler.shutdown(false);
}

#[traced_test]
#[test]
fn job_data_map_merges_trigger_values_into_context() {
    let seen = Arc::new(Mutex::new(None::<(Option<i64>, Option<String>)>));
    let scheduler = Scheduler::new(test_config()).unwrap();
    let mut factory = RegistryJobFactory::new();
    {
        let seen = seen.clone();
        factory.register("observer", move || {
            let seen = seen.clone();
            Box::new(
            move |ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
                let merged = ctx.merged_job_data();
                *seen.lock().unwrap() = Some((
                    merged.get_i64("from-job"),
                    merged.get_str("from-trigger").map(str::to_owned),
                ));
                Ok(())
            })
        });
    }
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("observer"), "observer")
        .with_data("from-job", 42);
    let mut data = JobDataMap::new();
    data.put("from-trigger", "hello");
    let mut trigger =
        Trigger::one_shot(TriggerKey::of_name("observer"), job.key.clone())
            .with_start_time(Utc::now());
    trigger.job_data = data;
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        seen.lock().unwrap().is_some()
    }));
    scheduler.shutdown(true);
    assert_eq!(
        Some((Some(42), Some("hello".to_owned()))),
        seen.lock().unwrap().clone()
    );
}

#[traced_test]
#[test]
fn daemon_scheduler_thread_is_detached_on_shutdown() {
    let executions = Arc::new(AtomicUsize::new(0));
    let mut config = test_config();
    config.scheduler.make_thread_daemon = true;
    let scheduler = Scheduler::new(config).unwrap();
    let mut factory = RegistryJobFactory::new();
    {
        let executions = executions.clone();
        factory.register("daemonized", move || {
            let executions = executions.clone();
            Box::new(
            move |_ctx: &mut JobExecutionContext| -> Result<(), JobExecutionError> {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
    }
    scheduler.set_job_factory(Arc::new(factory));

    let job = JobDetail::new(JobKey::of_name("daemonized"), "daemonized");
    let trigger =
        Trigger::one_shot(TriggerKey::of_name("daemonized"), job.key.clone())
            .with_start_time(Utc::now());
    scheduler.schedule_job(job, trigger).unwrap();
    scheduler.start().unwrap();

    assert!(wait_for(StdDuration::from_secs(10), || {
        executions.load(Ordering::SeqCst) >= 1
    }));
    // Shutdown does not join the detached scheduler thread, but the
    // scheduler still ends up fully stopped and refuses further work.
    scheduler.shutdown(true);
    assert!(scheduler.is_shutdown());
    assert!(scheduler.start().is_err());
}
