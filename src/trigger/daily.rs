//! Daily time-interval schedules: an intra-day grid between two times of
//! day, repeated on selected days of the week. The slot counter restarts at
//! every day boundary.

use std::collections::HashSet;

use chrono::{
    DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday,
};

use super::{MisfireInstruction, Schedule, Trigger};
use crate::calendar::CalendarKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
}

impl IntervalUnit {
    fn seconds(&self) -> i64 {
        match self {
            | Self::Second => 1,
            | Self::Minute => 60,
            | Self::Hour => 3600,
        }
    }
}

/// Wall-clock time of day, second precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32, second: u32) -> Self {
        Self {
            hour,
            minute,
            second,
        }
    }

    fn as_naive(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
            .unwrap_or(NaiveTime::MIN)
    }

    fn is_valid(&self) -> bool {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyTimeIntervalSchedule {
    pub repeat_interval: i64,
    pub repeat_interval_unit: IntervalUnit,
    /// Total firings bound across all days, `None` for unbounded.
    pub repeat_count: Option<i64>,
    pub days_of_week: HashSet<Weekday>,
    pub start_time_of_day: TimeOfDay,
    pub end_time_of_day: TimeOfDay,
    pub times_triggered: i64,
}

impl Default for DailyTimeIntervalSchedule {
    fn default() -> Self {
        Self {
            repeat_interval: 1,
            repeat_interval_unit: IntervalUnit::Minute,
            repeat_count: None,
            days_of_week: all_days(),
            start_time_of_day: TimeOfDay::new(0, 0, 0),
            end_time_of_day: TimeOfDay::new(23, 59, 59),
            times_triggered: 0,
        }
    }
}

pub(crate) fn all_days() -> HashSet<Weekday> {
    [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ]
    .into_iter()
    .collect()
}

impl DailyTimeIntervalSchedule {
    pub fn every(interval: i64, unit: IntervalUnit) -> Self {
        Self {
            repeat_interval: interval,
            repeat_interval_unit: unit,
            ..Self::default()
        }
    }

    pub fn between(mut self, start: TimeOfDay, end: TimeOfDay) -> Self {
        self.start_time_of_day = start;
        self.end_time_of_day = end;
        self
    }

    pub fn on_days(
        mut self,
        days: impl IntoIterator<Item = Weekday>,
    ) -> Self {
        self.days_of_week = days.into_iter().collect();
        self
    }

    pub fn with_repeat_count(mut self, count: i64) -> Self {
        self.repeat_count = Some(count);
        self
    }

    fn interval_seconds(&self) -> i64 {
        self.repeat_interval * self.repeat_interval_unit.seconds()
    }
}

pub(super) fn validate(
    sched: &DailyTimeIntervalSchedule,
) -> Result<(), String> {
    if sched.repeat_interval <= 0 {
        return Err("repeat interval must be positive".to_owned());
    }
    if sched.interval_seconds() > 86_400 {
        return Err(
            "repeat interval cannot exceed 24 hours".to_owned()
        );
    }
    if !sched.start_time_of_day.is_valid() || !sched.end_time_of_day.is_valid()
    {
        return Err("time of day is out of range".to_owned());
    }
    if sched.start_time_of_day >= sched.end_time_of_day {
        return Err(
            "start time of day must precede end time of day".to_owned()
        );
    }
    if sched.days_of_week.is_empty() {
        return Err("at least one day of the week is required".to_owned());
    }
    Ok(())
}

pub(super) fn fire_time_after(
    sched: &DailyTimeIntervalSchedule,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if sched
        .repeat_count
        .is_some_and(|limit| sched.times_triggered > limit)
    {
        return None;
    }

    // Candidates must be strictly after `after` and no earlier than the
    // trigger start. The end time is inclusive for this family.
    let floor = after.max(start - Duration::seconds(1));
    if end.is_some_and(|e| floor >= e) {
        return None;
    }

    let interval_secs = sched.interval_seconds();
    let mut date = floor.date_naive();
    // Bounded walk; with at least one allowed weekday a slot is found within
    // a week.
    for _ in 0..8 {
        if sched.days_of_week.contains(&date.weekday()) {
            let window_start = Utc.from_utc_datetime(
                &date.and_time(sched.start_time_of_day.as_naive()),
            );
            let window_end = Utc.from_utc_datetime(
                &date.and_time(sched.end_time_of_day.as_naive()),
            );
            let candidate = if floor < window_start {
                Some(window_start)
            } else {
                let elapsed = (floor - window_start).num_seconds();
                let k = elapsed / interval_secs + 1;
                let slot =
                    window_start + Duration::seconds(k * interval_secs);
                (slot <= window_end).then_some(slot)
            };
            if let Some(slot) = candidate {
                if end.is_some_and(|e| slot > e) {
                    return None;
                }
                return Some(slot);
            }
        }
        date += Duration::days(1);
    }
    None
}

pub(super) fn update_after_misfire(
    trigger: &mut Trigger,
    calendar: Option<&CalendarKind>,
) {
    let Schedule::DailyTimeInterval(_) = &trigger.schedule else {
        return;
    };

    let mut instruction = trigger.misfire_instruction;
    if instruction == MisfireInstruction::Smart {
        instruction = MisfireInstruction::FireOnceNow;
    }

    match instruction {
        | MisfireInstruction::FireOnceNow => {
            trigger.next_fire_time = Some(Utc::now());
        }
        | MisfireInstruction::DoNothing => {
            let next = trigger.fire_time_after(Some(Utc::now()));
            trigger.next_fire_time =
                trigger.advance_past_calendar(next, calendar);
        }
        | _ => {}
    }
}
