//! An in-process job scheduler: named jobs and triggers, fire-time
//! computation for simple-interval, cron, and daily-time-window schedules,
//! calendar exclusions, pause/resume and misfire policies, and a bounded
//! worker pool that runs user job code.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use cronloop::{
//!     Config, JobDetail, JobKey, RegistryJobFactory, Scheduler, Trigger,
//!     TriggerKey,
//! };
//!
//! let scheduler = Scheduler::new(Config::default()).unwrap();
//!
//! let mut factory = RegistryJobFactory::new();
//! factory.register("heartbeat", || {
//!     Box::new(
//!         |_ctx: &mut cronloop::JobExecutionContext|
//!          -> Result<(), cronloop::JobExecutionError> {
//!             println!("lub-dub");
//!             Ok(())
//!         },
//!     )
//! });
//! scheduler.set_job_factory(Arc::new(factory));
//!
//! let job = JobDetail::new(JobKey::of_name("heartbeat"), "heartbeat");
//! let trigger = Trigger::cron(
//!     TriggerKey::of_name("every-minute"),
//!     job.key.clone(),
//!     "0 * * * * ?",
//! )
//! .unwrap();
//! scheduler.schedule_job(job, trigger).unwrap();
//! scheduler.start().unwrap();
//! ```

pub mod calendar;
pub mod config;
pub mod cron;
pub mod error;
pub mod job;
pub mod key;
pub mod listener;
pub mod matcher;
mod pool;
pub mod scheduler;
pub mod store;
pub mod trigger;

pub use calendar::{
    AnnualCalendar, BaseCalendar, Calendar, CalendarKind, CronCalendar,
    DailyCalendar, HolidayCalendar, MonthlyCalendar, WeeklyCalendar,
};
pub use config::{Config, ConfigLoader};
pub use cron::CronExpression;
pub use error::{
    CronParseError, JobExecutionError, SchedulerError, StoreError,
    TriggerError,
};
pub use job::{
    Job, JobDataMap, JobDetail, JobExecutionContext, JobFactory,
    RegistryJobFactory,
};
pub use key::{JobKey, Key, TriggerKey, DEFAULT_GROUP};
pub use listener::{
    JobListener, ListenerManager, SchedulerListener, TriggerListener,
};
pub use matcher::{GroupMatcher, Matcher};
pub use scheduler::{ExecutingJob, Scheduler, SchedulerMetadata};
pub use store::{
    JobStore, RamJobStore, SchedulerSignaler, TriggerFiredBundle,
    TriggerFiredResult,
};
pub use trigger::{
    compute_fire_times, CompletedExecutionInstruction, CronSchedule,
    DailyTimeIntervalSchedule, IntervalUnit, MisfireInstruction, Schedule,
    SimpleSchedule, TimeOfDay, Trigger, TriggerState, REPEAT_INDEFINITELY,
    DEFAULT_PRIORITY,
};
