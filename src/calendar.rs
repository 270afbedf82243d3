//! Exclusion calendars. A calendar answers one question: is this instant
//! available for firing? Calendars nest; a time is included only if this
//! calendar and its base (recursively) both include it.

use std::collections::{BTreeSet, HashSet};

use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc,
    Weekday,
};

use crate::cron::CronExpression;

/// The common calendar contract.
pub trait Calendar {
    /// True when `instant` is available for firing under this calendar and
    /// its base.
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool;

    /// The next included instant at or after `instant`. Returns `instant`
    /// unchanged when it is already included.
    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc>;

    fn description(&self) -> Option<&str>;
}

/// Tagged variant of every calendar implementation, so stores can hold and
/// clone them without boxing.
#[derive(Debug, Clone, PartialEq)]
pub enum CalendarKind {
    Base(BaseCalendar),
    Cron(CronCalendar),
    Daily(DailyCalendar),
    Weekly(WeeklyCalendar),
    Monthly(MonthlyCalendar),
    Annual(AnnualCalendar),
    Holiday(HolidayCalendar),
}

impl Calendar for CalendarKind {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        match self {
            | Self::Base(c) => c.is_time_included(instant),
            | Self::Cron(c) => c.is_time_included(instant),
            | Self::Daily(c) => c.is_time_included(instant),
            | Self::Weekly(c) => c.is_time_included(instant),
            | Self::Monthly(c) => c.is_time_included(instant),
            | Self::Annual(c) => c.is_time_included(instant),
            | Self::Holiday(c) => c.is_time_included(instant),
        }
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            | Self::Base(c) => c.next_included_time(instant),
            | Self::Cron(c) => c.next_included_time(instant),
            | Self::Daily(c) => c.next_included_time(instant),
            | Self::Weekly(c) => c.next_included_time(instant),
            | Self::Monthly(c) => c.next_included_time(instant),
            | Self::Annual(c) => c.next_included_time(instant),
            | Self::Holiday(c) => c.next_included_time(instant),
        }
    }

    fn description(&self) -> Option<&str> {
        match self {
            | Self::Base(c) => c.description(),
            | Self::Cron(c) => c.description(),
            | Self::Daily(c) => c.description(),
            | Self::Weekly(c) => c.description(),
            | Self::Monthly(c) => c.description(),
            | Self::Annual(c) => c.description(),
            | Self::Holiday(c) => c.description(),
        }
    }
}

fn base_includes(
    base: &Option<Box<CalendarKind>>,
    instant: DateTime<Utc>,
) -> bool {
    base.as_ref().map_or(true, |b| b.is_time_included(instant))
}

/// A calendar that excludes nothing of its own; useful purely as a nesting
/// root or a stand-in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaseCalendar {
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl Calendar for BaseCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        match &self.base {
            | Some(b) => b.next_included_time(instant),
            | None => instant,
        }
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes every instant that satisfies a cron expression. The expression's
/// granularity is one second; an instant is excluded when the expression
/// matches its wall-clock second.
#[derive(Debug, Clone, PartialEq)]
pub struct CronCalendar {
    pub expression: CronExpression,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl CronCalendar {
    pub fn new(expression: CronExpression) -> Self {
        Self {
            expression,
            description: None,
            base: None,
        }
    }
}

impl Calendar for CronCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
            && !self.expression.is_satisfied_by(instant)
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let mut t = instant;
        while !self.is_time_included(t) {
            t += Duration::seconds(1);
        }
        t
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes a daily wall-clock window (or everything outside it when
/// inverted).
#[derive(Debug, Clone, PartialEq)]
pub struct DailyCalendar {
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    /// When set, the window is the *included* part of the day instead.
    pub invert: bool,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl DailyCalendar {
    pub fn new(window_start: NaiveTime, window_end: NaiveTime) -> Self {
        Self {
            window_start,
            window_end,
            invert: false,
            description: None,
            base: None,
        }
    }

    fn in_window(&self, instant: DateTime<Utc>) -> bool {
        let t = instant.time();
        t >= self.window_start && t <= self.window_end
    }
}

impl Calendar for DailyCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        if !base_includes(&self.base, instant) {
            return false;
        }
        if self.invert {
            self.in_window(instant)
        } else {
            !self.in_window(instant)
        }
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        if self.is_time_included(instant) {
            return instant;
        }
        if self.invert {
            // Next window start, today or tomorrow.
            let today = instant.date_naive().and_time(self.window_start);
            let candidate = if instant.time() <= self.window_start {
                today
            } else {
                today + Duration::days(1)
            };
            candidate.and_utc()
        } else {
            // Just past the window end.
            let end = instant.date_naive().and_time(self.window_end);
            (end + Duration::seconds(1)).and_utc()
        }
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes whole days of the week. The default mask excludes Saturday and
/// Sunday.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyCalendar {
    pub excluded_days: HashSet<Weekday>,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl Default for WeeklyCalendar {
    fn default() -> Self {
        let mut excluded_days = HashSet::new();
        excluded_days.insert(Weekday::Sat);
        excluded_days.insert(Weekday::Sun);
        Self {
            excluded_days,
            description: None,
            base: None,
        }
    }
}

impl WeeklyCalendar {
    pub fn new(excluded_days: impl IntoIterator<Item = Weekday>) -> Self {
        Self {
            excluded_days: excluded_days.into_iter().collect(),
            description: None,
            base: None,
        }
    }
}

impl Calendar for WeeklyCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
            && !self.excluded_days.contains(&instant.weekday())
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        // All seven days excluded would never terminate.
        if self.excluded_days.len() >= 7 {
            return instant;
        }
        let mut t = instant;
        while !self.is_time_included(t) {
            t = (t.date_naive() + Duration::days(1))
                .and_time(NaiveTime::MIN)
                .and_utc();
        }
        t
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes days of the month (1..=31).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonthlyCalendar {
    pub excluded_days: BTreeSet<u32>,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl MonthlyCalendar {
    pub fn new(excluded_days: impl IntoIterator<Item = u32>) -> Self {
        Self {
            excluded_days: excluded_days.into_iter().collect(),
            description: None,
            base: None,
        }
    }
}

impl Calendar for MonthlyCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
            && !self.excluded_days.contains(&instant.day())
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        if self.excluded_days.len() >= 31 {
            return instant;
        }
        let mut t = instant;
        while !self.is_time_included(t) {
            t = (t.date_naive() + Duration::days(1))
                .and_time(NaiveTime::MIN)
                .and_utc();
        }
        t
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes one or more (month, day) pairs in every year.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnualCalendar {
    pub excluded_days: BTreeSet<(u32, u32)>,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl AnnualCalendar {
    pub fn new(excluded_days: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            excluded_days: excluded_days.into_iter().collect(),
            description: None,
            base: None,
        }
    }

    pub fn exclude(&mut self, month: u32, day: u32) {
        self.excluded_days.insert((month, day));
    }
}

impl Calendar for AnnualCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
            && !self
                .excluded_days
                .contains(&(instant.month(), instant.day()))
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let mut t = instant;
        while !self.is_time_included(t) {
            t = (t.date_naive() + Duration::days(1))
                .and_time(NaiveTime::MIN)
                .and_utc();
        }
        t
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// Excludes specific dates, time-of-day ignored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HolidayCalendar {
    pub excluded_dates: BTreeSet<NaiveDate>,
    pub description: Option<String>,
    pub base: Option<Box<CalendarKind>>,
}

impl HolidayCalendar {
    pub fn new(excluded_dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            excluded_dates: excluded_dates.into_iter().collect(),
            description: None,
            base: None,
        }
    }

    pub fn exclude(&mut self, date: NaiveDate) {
        self.excluded_dates.insert(date);
    }
}

impl Calendar for HolidayCalendar {
    fn is_time_included(&self, instant: DateTime<Utc>) -> bool {
        base_includes(&self.base, instant)
            && !self.excluded_dates.contains(&instant.date_naive())
    }

    fn next_included_time(&self, instant: DateTime<Utc>) -> DateTime<Utc> {
        let mut t = instant;
        while !self.is_time_included(t) {
            t = (t.date_naive() + Duration::days(1))
                .and_time(NaiveTime::MIN)
                .and_utc();
        }
        t
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn utc(
        y: i32,
        mo: u32,
        d: u32,
        h: u32,
        mi: u32,
        s: u32,
    ) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn weekly_excludes_weekends_by_default() {
        let cal = WeeklyCalendar::default();
        // 2023-06-10 is a Saturday.
        assert!(!cal.is_time_included(utc(2023, 6, 10, 12, 0, 0)));
        assert!(!cal.is_time_included(utc(2023, 6, 11, 12, 0, 0)));
        assert!(cal.is_time_included(utc(2023, 6, 12, 12, 0, 0)));
        assert_eq!(
            utc(2023, 6, 12, 0, 0, 0),
            cal.next_included_time(utc(2023, 6, 10, 12, 0, 0))
        );
    }

    #[test]
    fn daily_window_exclusion() {
        let cal = DailyCalendar::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        );
        assert!(!cal.is_time_included(utc(2023, 6, 12, 12, 0, 0)));
        assert!(cal.is_time_included(utc(2023, 6, 12, 18, 0, 0)));
        assert_eq!(
            utc(2023, 6, 12, 17, 0, 1),
            cal.next_included_time(utc(2023, 6, 12, 12, 0, 0))
        );
    }

    #[test]
    fn daily_window_inverted() {
        let mut cal = DailyCalendar::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        );
        cal.invert = true;
        assert!(cal.is_time_included(utc(2023, 6, 12, 12, 0, 0)));
        assert!(!cal.is_time_included(utc(2023, 6, 12, 18, 0, 0)));
        assert_eq!(
            utc(2023, 6, 13, 9, 0, 0),
            cal.next_included_time(utc(2023, 6, 12, 18, 0, 0))
        );
    }

    #[test]
    fn annual_and_holiday() {
        let annual = AnnualCalendar::new([(12, 25)]);
        assert!(!annual.is_time_included(utc(2023, 12, 25, 8, 0, 0)));
        assert!(!annual.is_time_included(utc(2030, 12, 25, 8, 0, 0)));
        assert!(annual.is_time_included(utc(2023, 12, 24, 8, 0, 0)));

        let holiday = HolidayCalendar::new([NaiveDate::from_ymd_opt(
            2023, 7, 4,
        )
        .unwrap()]);
        assert!(!holiday.is_time_included(utc(2023, 7, 4, 23, 59, 59)));
        assert!(holiday.is_time_included(utc(2024, 7, 4, 8, 0, 0)));
    }

    #[test]
    fn monthly_excluded_day() {
        let cal = MonthlyCalendar::new([1]);
        assert!(!cal.is_time_included(utc(2023, 6, 1, 0, 0, 0)));
        assert!(cal.is_time_included(utc(2023, 6, 2, 0, 0, 0)));
    }

    #[test]
    fn cron_calendar_excludes_matching_times() {
        // Exclude the top of every hour.
        let expr = CronExpression::parse("0 0 * * * ?").unwrap();
        let cal = CronCalendar::new(expr);
        assert!(!cal.is_time_included(utc(2023, 6, 12, 9, 0, 0)));
        assert!(cal.is_time_included(utc(2023, 6, 12, 9, 0, 1)));
    }

    #[test]
    fn base_composition_is_logical_and() {
        let weekly = WeeklyCalendar::default();
        let mut holiday = HolidayCalendar::new([NaiveDate::from_ymd_opt(
            2023, 6, 12,
        )
        .unwrap()]);
        holiday.base = Some(Box::new(CalendarKind::Weekly(weekly)));

        // Monday, but a holiday: excluded by this calendar.
        assert!(!holiday.is_time_included(utc(2023, 6, 12, 9, 0, 0)));
        // Saturday, not a holiday: excluded by the base.
        assert!(!holiday.is_time_included(utc(2023, 6, 10, 9, 0, 0)));
        // Tuesday, not a holiday: included by both.
        assert!(holiday.is_time_included(utc(2023, 6, 13, 9, 0, 0)));
    }
}
