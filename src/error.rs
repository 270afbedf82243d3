use thiserror::Error;

use crate::key::{JobKey, TriggerKey};

/// Errors raised while parsing or evaluating a cron expression.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("cron expression must have 6 or 7 fields, found {0}")]
    WrongFieldCount(usize),
    #[error("unexpected value '{value}' in {field} field")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} is out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: i32,
        min: i32,
        max: i32,
    },
    #[error(
        "support for specifying both a day-of-week and a day-of-month is \
         not implemented, use '?' in one of them"
    )]
    DayFieldConflict,
    #[error("'{0}' is not supported in the {1} field")]
    UnsupportedSpecial(char, &'static str),
    #[error("the 'W' option does not make sense with a value larger than 31")]
    WeekdayValueTooLarge,
}

/// Errors raised by trigger construction and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("cannot parse cron expression: {0}")]
    CronParse(#[from] CronParseError),
    #[error("unrecognized timezone '{0}', is this an IANA timezone?")]
    InvalidTimezone(String),
    #[error("trigger '{trigger}' is invalid: {reason}")]
    Validation { trigger: TriggerKey, reason: String },
    #[error(
        "trigger '{0}' will never fire given its schedule and calendar"
    )]
    WillNeverFire(TriggerKey),
    #[error("misfire instruction is not valid for this trigger family")]
    BadMisfireInstruction,
}

/// Errors raised by job store operations. Every operation either succeeds or
/// returns exactly one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("job '{0}' already exists in this store")]
    JobAlreadyExists(JobKey),
    #[error("trigger '{0}' already exists in this store")]
    TriggerAlreadyExists(TriggerKey),
    #[error("trigger '{trigger}' references job '{job}' which does not exist")]
    JobNotFound { trigger: TriggerKey, job: JobKey },
    #[error("job '{0}' is unknown to this store")]
    UnknownJob(JobKey),
    #[error("trigger '{0}' is unknown to this store")]
    UnknownTrigger(TriggerKey),
    #[error("calendar '{0}' already exists in this store")]
    CalendarAlreadyExists(String),
    #[error("calendar '{0}' is unknown to this store")]
    UnknownCalendar(String),
    #[error("calendar '{0}' is referenced by triggers and cannot be removed")]
    CalendarInUse(String),
    #[error(
        "new trigger '{new}' must reference the same job as the trigger it \
         replaces ('{old}')"
    )]
    JobKeyMismatch { old: TriggerKey, new: TriggerKey },
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

/// Error thrown from a user job's `execute`. Carries the flags the trigger's
/// completion logic turns into an execution instruction.
#[derive(Error, Debug, Clone)]
#[error("job execution failed: {message}")]
pub struct JobExecutionError {
    pub message: String,
    /// Immediately re-run the job on the same worker without going back
    /// through the ready set.
    pub refire_immediately: bool,
    /// Unschedule the trigger that fired this execution.
    pub unschedule_firing_trigger: bool,
    /// Unschedule every trigger of this job.
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            refire_immediately: false,
            unschedule_firing_trigger: false,
            unschedule_all_triggers: false,
        }
    }

    pub fn with_refire_immediately(mut self) -> Self {
        self.refire_immediately = true;
        self
    }

    pub fn with_unschedule_firing_trigger(mut self) -> Self {
        self.unschedule_firing_trigger = true;
        self
    }

    pub fn with_unschedule_all_triggers(mut self) -> Self {
        self.unschedule_all_triggers = true;
        self
    }
}

/// The error surfaced by the scheduler facade.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid scheduler configuration: {0}")]
    Config(String),
    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trigger(#[from] TriggerError),
    #[error("job '{0}' is not durable and no trigger was supplied for it")]
    NotDurable(JobKey),
    #[error("cannot instantiate job '{0}': {1}")]
    JobInstantiation(JobKey, String),
    #[error("the scheduler has been shut down and cannot perform operations")]
    Unavailable,
    #[error(transparent)]
    JobExecution(#[from] JobExecutionError),
}
