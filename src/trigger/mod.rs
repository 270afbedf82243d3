//! Triggers: when a job fires. Three schedule families share one common
//! attribute set and a small capability surface the store and scheduler
//! drive: compute the first fire time, advance after firing, recover from a
//! misfire, and re-plan when a calendar changes.

mod cron;
mod daily;
mod simple;

pub use cron::CronSchedule;
pub use daily::{DailyTimeIntervalSchedule, IntervalUnit, TimeOfDay};
pub use simple::{SimpleSchedule, REPEAT_INDEFINITELY};

use chrono::{DateTime, Datelike, Duration, Utc};
use chrono_tz::Tz;

use crate::calendar::{Calendar, CalendarKind};
use crate::error::TriggerError;
use crate::job::JobDataMap;
use crate::key::{JobKey, TriggerKey};

/// Triggers with equal fire times fire in descending priority order.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Schedules are not computed past this year; a candidate beyond it is
/// treated as "never fires again".
pub(crate) const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

/// Publicly visible state of a stored trigger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display,
)]
pub enum TriggerState {
    /// Not known to the store.
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

/// What a trigger wants done about fire times it missed by more than the
/// misfire threshold. Families accept different subsets; `validate` rejects
/// mismatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MisfireInstruction {
    /// Let the policy be chosen from the schedule's shape.
    Smart,
    /// Skip the misfire machinery entirely; late times fire late.
    Ignore,
    // Simple family.
    FireNow,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    RescheduleNextWithExistingCount,
    RescheduleNextWithRemainingCount,
    // Cron and daily-time-interval families.
    FireOnceNow,
    DoNothing,
}

/// What the scheduler should do once an execution finishes. Derived from the
/// job's outcome and the trigger's remaining schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

/// The schedule family, a tagged variant; all other trigger attributes are
/// common.
#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
    DailyTimeInterval(DailyTimeIntervalSchedule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub priority: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub calendar_name: Option<String>,
    pub misfire_instruction: MisfireInstruction,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    /// Assigned by the store when the trigger is acquired for firing.
    pub fire_instance_id: Option<String>,
    pub job_data: JobDataMap,
    pub schedule: Schedule,
}

impl Trigger {
    fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            priority: DEFAULT_PRIORITY,
            start_time: Utc::now(),
            end_time: None,
            calendar_name: None,
            misfire_instruction: MisfireInstruction::Smart,
            next_fire_time: None,
            previous_fire_time: None,
            fire_instance_id: None,
            job_data: JobDataMap::new(),
            schedule,
        }
    }

    /// A fixed-interval trigger firing `repeat_count + 1` times (or
    /// indefinitely with [`REPEAT_INDEFINITELY`]).
    pub fn simple(
        key: TriggerKey,
        job_key: JobKey,
        repeat_count: i32,
        repeat_interval: Duration,
    ) -> Self {
        Self::new(
            key,
            job_key,
            Schedule::Simple(SimpleSchedule {
                repeat_count,
                repeat_interval,
                times_triggered: 0,
            }),
        )
    }

    /// A one-shot trigger firing at its start time.
    pub fn one_shot(key: TriggerKey, job_key: JobKey) -> Self {
        Self::simple(key, job_key, 0, Duration::zero())
    }

    /// A cron trigger in UTC.
    pub fn cron(
        key: TriggerKey,
        job_key: JobKey,
        expression: &str,
    ) -> Result<Self, TriggerError> {
        Self::cron_in_timezone(key, job_key, expression, chrono_tz::UTC)
    }

    pub fn cron_in_timezone(
        key: TriggerKey,
        job_key: JobKey,
        expression: &str,
        tz: Tz,
    ) -> Result<Self, TriggerError> {
        let schedule = CronSchedule::parse(expression, tz)?;
        Ok(Self::new(key, job_key, Schedule::Cron(schedule)))
    }

    /// A trigger firing on an intra-day grid on selected days of the week.
    pub fn daily_time_interval(
        key: TriggerKey,
        job_key: JobKey,
        schedule: DailyTimeIntervalSchedule,
    ) -> Self {
        Self::new(key, job_key, Schedule::DailyTimeInterval(schedule))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = start;
        self
    }

    pub fn with_end_time(mut self, end: DateTime<Utc>) -> Self {
        self.end_time = Some(end);
        self
    }

    pub fn with_calendar(mut self, name: impl Into<String>) -> Self {
        self.calendar_name = Some(name.into());
        self
    }

    pub fn with_misfire_instruction(
        mut self,
        instruction: MisfireInstruction,
    ) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn with_data(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.job_data.put(key, value);
        self.job_data.clear_dirty_flag();
        self
    }

    /// The first raw schedule time strictly after `after` (now when `None`),
    /// ignoring calendars.
    pub fn fire_time_after(
        &self,
        after: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let after = after.unwrap_or_else(Utc::now);
        match &self.schedule {
            | Schedule::Simple(s) => {
                simple::fire_time_after(s, self.start_time, self.end_time, after)
            }
            | Schedule::Cron(c) => {
                cron::fire_time_after(c, self.start_time, self.end_time, after)
            }
            | Schedule::DailyTimeInterval(d) => daily::fire_time_after(
                d,
                self.start_time,
                self.end_time,
                after,
            ),
        }
    }

    /// Establishes the initial `next_fire_time`, honoring the calendar, and
    /// returns it.
    pub fn compute_first_fire_time(
        &mut self,
        calendar: Option<&CalendarKind>,
    ) -> Option<DateTime<Utc>> {
        let first = match &self.schedule {
            // The start time itself is a fire time for simple schedules.
            | Schedule::Simple(_) => Some(self.start_time),
            | _ => {
                self.fire_time_after(Some(
                    self.start_time - Duration::seconds(1),
                ))
            }
        };
        self.next_fire_time = self.advance_past_calendar(first, calendar);
        self.next_fire_time
    }

    /// Called by the store when this trigger fires: rolls previous/next fire
    /// time forward and counts the firing.
    pub fn triggered(&mut self, calendar: Option<&CalendarKind>) {
        match &mut self.schedule {
            | Schedule::Simple(s) => s.times_triggered += 1,
            | Schedule::DailyTimeInterval(d) => d.times_triggered += 1,
            | Schedule::Cron(_) => {}
        }
        self.previous_fire_time = self.next_fire_time;
        let next = self.fire_time_after(self.next_fire_time);
        self.next_fire_time = self.advance_past_calendar(next, calendar);
    }

    /// Applies this trigger's misfire policy, repositioning
    /// `next_fire_time` (and for the reschedule-now policies, the start
    /// time).
    pub fn update_after_misfire(&mut self, calendar: Option<&CalendarKind>) {
        match &self.schedule {
            | Schedule::Simple(_) => simple::update_after_misfire(self, calendar),
            | Schedule::Cron(_) => cron::update_after_misfire(self, calendar),
            | Schedule::DailyTimeInterval(_) => {
                daily::update_after_misfire(self, calendar)
            }
        }
    }

    /// Re-plans `next_fire_time` against a replaced calendar, starting from
    /// `max(now - misfire_threshold, previous_fire_time)`.
    pub fn update_with_new_calendar(
        &mut self,
        calendar: &CalendarKind,
        misfire_threshold: Duration,
    ) {
        let horizon = Utc::now() - misfire_threshold;
        let from = match self.previous_fire_time {
            | Some(prev) if prev > horizon => prev,
            | _ => horizon,
        };
        let next = self.fire_time_after(Some(from));
        self.next_fire_time = self.advance_past_calendar(next, Some(calendar));
    }

    /// The raw final fire time of the schedule, if it has one.
    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            | Schedule::Simple(s) => {
                simple::final_fire_time(s, self.start_time, self.end_time)
            }
            // Bounded only by the end time; walking the whole expression
            // forward is not worth it.
            | Schedule::Cron(_) | Schedule::DailyTimeInterval(_) => {
                self.end_time
            }
        }
    }

    /// True while the schedule can still produce fire times.
    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    pub fn validate(&self) -> Result<(), TriggerError> {
        let fail = |reason: &str| {
            Err(TriggerError::Validation {
                trigger: self.key.clone(),
                reason: reason.to_owned(),
            })
        };
        if let Some(end) = self.end_time {
            if end <= self.start_time {
                return fail("end time must be after start time");
            }
        }
        let misfire_ok = match &self.schedule {
            | Schedule::Simple(s) => {
                if s.repeat_count < REPEAT_INDEFINITELY {
                    return fail("repeat count must be >= -1");
                }
                if s.repeat_interval < Duration::zero() {
                    return fail("repeat interval cannot be negative");
                }
                if s.repeat_count != 0 && s.repeat_interval.is_zero() {
                    return fail(
                        "a repeating trigger needs a non-zero interval",
                    );
                }
                matches!(
                    self.misfire_instruction,
                    MisfireInstruction::Smart
                        | MisfireInstruction::Ignore
                        | MisfireInstruction::FireNow
                        | MisfireInstruction::RescheduleNowWithExistingRepeatCount
                        | MisfireInstruction::RescheduleNowWithRemainingRepeatCount
                        | MisfireInstruction::RescheduleNextWithExistingCount
                        | MisfireInstruction::RescheduleNextWithRemainingCount
                )
            }
            | Schedule::Cron(_) => {
                matches!(
                    self.misfire_instruction,
                    MisfireInstruction::Smart
                        | MisfireInstruction::Ignore
                        | MisfireInstruction::FireOnceNow
                        | MisfireInstruction::DoNothing
                )
            }
            | Schedule::DailyTimeInterval(d) => {
                daily::validate(d).map_err(|reason| {
                    TriggerError::Validation {
                        trigger: self.key.clone(),
                        reason,
                    }
                })?;
                matches!(
                    self.misfire_instruction,
                    MisfireInstruction::Smart
                        | MisfireInstruction::Ignore
                        | MisfireInstruction::FireOnceNow
                        | MisfireInstruction::DoNothing
                )
            }
        };
        if !misfire_ok {
            return Err(TriggerError::BadMisfireInstruction);
        }
        Ok(())
    }

    /// Derives the completion instruction from the execution outcome, per
    /// the flags on the error and the remaining schedule.
    pub fn execution_complete(
        &self,
        error: Option<&crate::error::JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(err) = error {
            if err.refire_immediately {
                return CompletedExecutionInstruction::ReExecuteJob;
            }
            if err.unschedule_firing_trigger {
                return CompletedExecutionInstruction::SetTriggerComplete;
            }
            if err.unschedule_all_triggers {
                return CompletedExecutionInstruction::SetAllJobTriggersComplete;
            }
        }
        if !self.may_fire_again() {
            return CompletedExecutionInstruction::DeleteTrigger;
        }
        CompletedExecutionInstruction::Noop
    }

    /// Steps `candidate` through the schedule until the calendar includes
    /// it. Gives up past [`YEAR_TO_GIVE_UP_SCHEDULING_AT`].
    pub(crate) fn advance_past_calendar(
        &self,
        mut candidate: Option<DateTime<Utc>>,
        calendar: Option<&CalendarKind>,
    ) -> Option<DateTime<Utc>> {
        let Some(cal) = calendar else {
            return candidate;
        };
        while let Some(t) = candidate {
            if cal.is_time_included(t) {
                break;
            }
            candidate = self.fire_time_after(Some(t));
            if let Some(t) = candidate {
                if t.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                    return None;
                }
            }
        }
        candidate
    }
}

/// Preview of the next `count` fire times of a trigger under a calendar,
/// without mutating the caller's copy.
pub fn compute_fire_times(
    trigger: &Trigger,
    calendar: Option<&CalendarKind>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut scratch = trigger.clone();
    let mut out = Vec::with_capacity(count);
    if scratch.next_fire_time.is_none() {
        scratch.compute_first_fire_time(calendar);
    }
    while out.len() < count {
        let Some(t) = scratch.next_fire_time else { break };
        out.push(t);
        scratch.triggered(calendar);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::calendar::WeeklyCalendar;

    fn test_trigger(schedule: Schedule) -> Trigger {
        Trigger::new(
            TriggerKey::of_name("t"),
            JobKey::of_name("j"),
            schedule,
        )
    }

    #[test]
    fn one_shot_fires_exactly_once() {
        let start = Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap();
        let mut t =
            test_trigger(Schedule::Simple(SimpleSchedule {
                repeat_count: 0,
                repeat_interval: Duration::zero(),
                times_triggered: 0,
            }))
            .with_start_time(start);
        assert_eq!(Some(start), t.compute_first_fire_time(None));
        t.triggered(None);
        assert_eq!(Some(start), t.previous_fire_time);
        assert_eq!(None, t.next_fire_time);
        assert!(!t.may_fire_again());
    }

    #[test]
    fn calendar_advance_skips_excluded_times() {
        // Fires daily at noon; weekends excluded by calendar.
        let start = Utc.with_ymd_and_hms(2023, 6, 9, 12, 0, 0).unwrap();
        let mut t = test_trigger(Schedule::Simple(SimpleSchedule {
            repeat_count: REPEAT_INDEFINITELY,
            repeat_interval: Duration::days(1),
            times_triggered: 0,
        }))
        .with_start_time(start);
        let cal = CalendarKind::Weekly(WeeklyCalendar::default());

        // 2023-06-09 is a Friday; first fire time is the start itself.
        assert_eq!(Some(start), t.compute_first_fire_time(Some(&cal)));
        t.triggered(Some(&cal));
        // Saturday and Sunday are skipped.
        assert_eq!(
            Some(Utc.with_ymd_and_hms(2023, 6, 12, 12, 0, 0).unwrap()),
            t.next_fire_time
        );
    }

    #[test]
    fn validation_rejects_zero_interval_repeat() {
        let t = test_trigger(Schedule::Simple(SimpleSchedule {
            repeat_count: 3,
            repeat_interval: Duration::zero(),
            times_triggered: 0,
        }));
        assert!(t.validate().is_err());
    }

    #[test]
    fn validation_rejects_foreign_misfire_instruction() {
        let t = test_trigger(Schedule::Simple(SimpleSchedule {
            repeat_count: 0,
            repeat_interval: Duration::zero(),
            times_triggered: 0,
        }))
        .with_misfire_instruction(MisfireInstruction::DoNothing);
        assert_eq!(
            Err(TriggerError::BadMisfireInstruction),
            t.validate()
        );
    }

    #[test]
    fn execution_complete_honors_error_flags() {
        let start = Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap();
        let mut t = test_trigger(Schedule::Simple(SimpleSchedule {
            repeat_count: REPEAT_INDEFINITELY,
            repeat_interval: Duration::seconds(1),
            times_triggered: 0,
        }))
        .with_start_time(start);
        t.compute_first_fire_time(None);

        use crate::error::JobExecutionError;
        assert_eq!(
            CompletedExecutionInstruction::Noop,
            t.execution_complete(None)
        );
        assert_eq!(
            CompletedExecutionInstruction::ReExecuteJob,
            t.execution_complete(Some(
                &JobExecutionError::new("x").with_refire_immediately()
            ))
        );
        assert_eq!(
            CompletedExecutionInstruction::SetTriggerComplete,
            t.execution_complete(Some(
                &JobExecutionError::new("x").with_unschedule_firing_trigger()
            ))
        );
        assert_eq!(
            CompletedExecutionInstruction::SetAllJobTriggersComplete,
            t.execution_complete(Some(
                &JobExecutionError::new("x").with_unschedule_all_triggers()
            ))
        );

        // Exhausted schedule asks for deletion.
        t.next_fire_time = None;
        assert_eq!(
            CompletedExecutionInstruction::DeleteTrigger,
            t.execution_complete(None)
        );
    }

    #[test]
    fn fire_time_preview() {
        let start = Utc.with_ymd_and_hms(2023, 3, 1, 12, 0, 0).unwrap();
        let t = test_trigger(Schedule::Simple(SimpleSchedule {
            repeat_count: 10,
            repeat_interval: Duration::minutes(5),
            times_triggered: 0,
        }))
        .with_start_time(start);
        let times = compute_fire_times(&t, None, 3);
        assert_eq!(
            vec![
                start,
                start + Duration::minutes(5),
                start + Duration::minutes(10)
            ],
            times
        );
    }
}
