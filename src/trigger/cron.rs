//! Cron-expression schedules.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use super::{MisfireInstruction, Schedule, Trigger};
use crate::calendar::CalendarKind;
use crate::cron::CronExpression;
use crate::error::TriggerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub expression: CronExpression,
}

impl CronSchedule {
    pub fn parse(expression: &str, tz: Tz) -> Result<Self, TriggerError> {
        let expression = CronExpression::parse(expression)?.with_timezone(tz);
        Ok(Self { expression })
    }

    pub fn timezone(&self) -> Tz {
        self.expression.timezone()
    }
}

pub(super) fn fire_time_after(
    sched: &CronSchedule,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // Nothing fires before the start time; the end time is inclusive.
    let after = after.max(start - Duration::seconds(1));
    if end.is_some_and(|e| after >= e) {
        return None;
    }
    let candidate = sched.expression.time_after(after)?;
    match end {
        | Some(e) if candidate > e => None,
        | _ => Some(candidate),
    }
}

pub(super) fn update_after_misfire(
    trigger: &mut Trigger,
    calendar: Option<&CalendarKind>,
) {
    let Schedule::Cron(_) = &trigger.schedule else {
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
