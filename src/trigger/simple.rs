//! Fixed-interval schedules: fire times are `start + k * interval` for
//! `k = 0..=repeat_count`, or unbounded.

use chrono::{DateTime, Duration, Utc};

use super::{MisfireInstruction, Schedule, Trigger};
use crate::calendar::CalendarKind;

/// Repeat forever.
pub const REPEAT_INDEFINITELY: i32 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct SimpleSchedule {
    /// Number of times to fire *after* the first firing; `-1` means no
    /// bound.
    pub repeat_count: i32,
    pub repeat_interval: Duration,
    pub times_triggered: i32,
}

impl SimpleSchedule {
    pub fn remaining_fire_count(&self) -> Option<i32> {
        if self.repeat_count == REPEAT_INDEFINITELY {
            None
        } else {
            Some((self.repeat_count - self.times_triggered + 1).max(0))
        }
    }
}

pub(super) fn fire_time_after(
    sched: &SimpleSchedule,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    // The end time is exclusive for this family.
    let within_end = |t: DateTime<Utc>| match end {
        | Some(end) => t < end,
        | None => true,
    };

    if after < start {
        return within_end(start).then_some(start);
    }

    let interval_ms = sched.repeat_interval.num_milliseconds();
    if interval_ms <= 0 {
        // A non-repeating schedule only ever fires at its start.
        return None;
    }

    let k = (after - start).num_milliseconds() / interval_ms + 1;
    if sched.repeat_count != REPEAT_INDEFINITELY
        && k > sched.repeat_count as i64
    {
        return None;
    }
    let candidate = start + Duration::milliseconds(k * interval_ms);
    within_end(candidate).then_some(candidate)
}

pub(super) fn final_fire_time(
    sched: &SimpleSchedule,
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    if sched.repeat_count == REPEAT_INDEFINITELY {
        return end.and_then(|e| {
            fire_time_before(sched, start, e)
        });
    }
    let last = start + sched.repeat_interval * sched.repeat_count;
    match end {
        | Some(e) if last >= e => fire_time_before(sched, start, e),
        | _ => Some(last),
    }
}

fn fire_time_before(
    sched: &SimpleSchedule,
    start: DateTime<Utc>,
    before: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if before <= start {
        return None;
    }
    let interval_ms = sched.repeat_interval.num_milliseconds();
    if interval_ms <= 0 {
        return Some(start);
    }
    let k = (before - start).num_milliseconds() - 1;
    Some(start + Duration::milliseconds(k / interval_ms * interval_ms))
}

/// Count of scheduled fire times in the half-open interval `(from, to]`.
fn times_fired_between(
    sched: &SimpleSchedule,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> i32 {
    let interval_ms = sched.repeat_interval.num_milliseconds();
    if interval_ms <= 0 || to <= from {
        return 0;
    }
    ((to - from).num_milliseconds() / interval_ms) as i32
}

pub(super) fn update_after_misfire(
    trigger: &mut Trigger,
    calendar: Option<&CalendarKind>,
) {
    let Schedule::Simple(sched) = &trigger.schedule else {
        return;
    };

    let mut instruction = trigger.misfire_instruction;
    if instruction == MisfireInstruction::Smart {
        instruction = if sched.repeat_count == 0 {
            MisfireInstruction::FireNow
        } else {
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount
        };
    } else if instruction == MisfireInstruction::FireNow
        && sched.repeat_count != 0
    {
        // Fire-now only makes sense for one-shot triggers; repeating ones
        // degrade to the remaining-count policy.
        instruction = MisfireInstruction::RescheduleNowWithRemainingRepeatCount;
    }

    let now = Utc::now();
    match instruction {
        | MisfireInstruction::FireNow => {
            trigger.next_fire_time = Some(now);
        }
        | MisfireInstruction::RescheduleNextWithExistingCount => {
            let next = trigger.fire_time_after(Some(now));
            trigger.next_fire_time =
                trigger.advance_past_calendar(next, calendar);
        }
        | MisfireInstruction::RescheduleNextWithRemainingCount => {
            let old_next = trigger.next_fire_time;
            let next = trigger.fire_time_after(Some(now));
            let next = trigger.advance_past_calendar(next, calendar);
            // The skipped grid slots count as spent firings.
            if let (Some(old), Some(new)) = (old_next, next) {
                let missed = {
                    let Schedule::Simple(sched) = &trigger.schedule else {
                        return;
                    };
                    times_fired_between(sched, old, new)
                };
                if let Schedule::Simple(sched) = &mut trigger.schedule {
                    sched.times_triggered += missed;
                }
            }
            trigger.next_fire_time = next;
        }
        | MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
            reschedule_now(trigger, now, false);
        }
        | MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
            reschedule_now(trigger, now, true);
        }
        | _ => {}
    }
}

/// Re-anchors the schedule at `now`. With `remaining`, the repeat count is
/// reduced by the firings already spent so the total number of executions is
/// preserved; otherwise the full count restarts from here.
fn reschedule_now(trigger: &mut Trigger, now: DateTime<Utc>, remaining: bool) {
    if let Schedule::Simple(sched) = &mut trigger.schedule {
        if remaining
            && sched.repeat_count != 0
            && sched.repeat_count != REPEAT_INDEFINITELY
        {
            sched.repeat_count =
                (sched.repeat_count - sched.times_triggered).max(0);
            sched.times_triggered = 0;
        }
    }
    if trigger.end_time.is_some_and(|end| end < now) {
        trigger.next_fire_time = None;
    } else {
        trigger.start_time = now;
        trigger.next_fire_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::key::{JobKey, TriggerKey};

    fn epoch_trigger(repeat_count: i32, interval_ms: i64) -> Trigger {
        Trigger::simple(
            TriggerKey::of_name("s"),
            JobKey::of_name("j"),
            repeat_count,
            Duration::milliseconds(interval_ms),
        )
        .with_start_time(Utc.timestamp_millis_opt(0).unwrap())
    }

    fn ms(t: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(t).unwrap()
    }

    #[test]
    fn fire_time_after_lands_on_grid() {
        let t = epoch_trigger(4, 10);
        assert_eq!(Some(ms(40)), t.fire_time_after(Some(ms(34))));
        assert_eq!(Some(ms(10)), t.fire_time_after(Some(ms(0))));
        assert_eq!(Some(ms(40)), t.fire_time_after(Some(ms(30))));
        // Five total firings (k = 0..=4); after the last there is nothing.
        assert_eq!(None, t.fire_time_after(Some(ms(40))));
    }

    #[test]
    fn before_start_returns_start() {
        let t = epoch_trigger(4, 10).with_start_time(ms(100));
        assert_eq!(Some(ms(100)), t.fire_time_after(Some(ms(34))));
    }

    #[test]
    fn end_time_is_exclusive() {
        let t = epoch_trigger(REPEAT_INDEFINITELY, 10).with_end_time(ms(40));
        assert_eq!(Some(ms(30)), t.fire_time_after(Some(ms(25))));
        assert_eq!(None, t.fire_time_after(Some(ms(30))));
    }

    #[test]
    fn indefinite_repeat_never_exhausts() {
        let t = epoch_trigger(REPEAT_INDEFINITELY, 10);
        assert_eq!(
            Some(ms(1_000_010)),
            t.fire_time_after(Some(ms(1_000_000)))
        );
    }

    #[test]
    fn final_fire_time_of_counted_schedule() {
        let t = epoch_trigger(4, 10);
        assert_eq!(Some(ms(40)), t.final_fire_time());
        let t = epoch_trigger(REPEAT_INDEFINITELY, 10).with_end_time(ms(45));
        assert_eq!(Some(ms(40)), t.final_fire_time());
    }

    #[test]
    fn misfire_fire_now_for_one_shot() {
        let mut t = epoch_trigger(0, 0)
            .with_misfire_instruction(MisfireInstruction::FireNow);
        t.next_fire_time = Some(ms(0));
        let before = Utc::now();
        t.update_after_misfire(None);
        let next = t.next_fire_time.unwrap();
        assert!(next >= before);
    }

    #[test]
    fn misfire_smart_keeps_remaining_count() {
        let mut t = epoch_trigger(10, 10);
        if let Schedule::Simple(s) = &mut t.schedule {
            s.times_triggered = 4;
        }
        t.next_fire_time = Some(ms(40));
        t.update_after_misfire(None);
        // Re-anchored at now with 6 repeats left and the counter reset.
        let Schedule::Simple(s) = &t.schedule else {
            panic!("simple schedule expected")
        };
        assert_eq!(6, s.repeat_count);
        assert_eq!(0, s.times_triggered);
        assert!(t.next_fire_time.unwrap() > ms(1_000));
        assert_eq!(t.next_fire_time.unwrap(), t.start_time);
    }

    #[test]
    fn misfire_reschedule_next_skips_to_future_slot() {
        let mut t = epoch_trigger(REPEAT_INDEFINITELY, 10)
            .with_misfire_instruction(
                MisfireInstruction::RescheduleNextWithExistingCount,
            );
        t.next_fire_time = Some(ms(40));
        t.update_after_misfire(None);
        let next = t.next_fire_time.unwrap();
        assert!(next > Utc::now() - Duration::seconds(1));
        // Still on the 10ms grid.
        assert_eq!(0, next.timestamp_millis() % 10);
    }

    #[test]
    fn misfire_past_end_time_exhausts() {
        let mut t = epoch_trigger(3, 10).with_end_time(ms(100));
        t.next_fire_time = Some(ms(20));
        t.update_after_misfire(None);
        assert_eq!(None, t.next_fire_time);
    }
}
