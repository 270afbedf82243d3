//! Seven-field cron expressions: `sec min hour day-of-month month
//! day-of-week [year]`, with the extended day syntax (`L`, `L-n`, `W`, `LW`,
//! `dow#n`, month and weekday names). Evaluation is zone-aware; the smallest
//! scheduled instant strictly after a given time is found by cascading field
//! search, carrying overflow upward and resetting lower fields on every
//! carry.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CronParseError;

/// Years above this are treated as "never"; keeps the search loop bounded.
const MAX_YEAR: i32 = 2299;

const MONTH_NAMES: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT",
    "NOV", "DEC",
];

// 1 = SUN .. 7 = SAT, the traditional cron numbering.
const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum DomKind {
    /// The field was `?`; day-of-week drives day selection.
    Unspecified,
    /// Plain value set.
    Values,
    /// `L` / `L-n` / `LW`: last day of month, minus `offset`, optionally
    /// pulled to the nearest weekday.
    Last { offset: u32, weekday: bool },
    /// `nW`: nearest weekday to the single day in the value set.
    NearestWeekday,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DowKind {
    /// The field was `?`; day-of-month drives day selection.
    Unspecified,
    /// Plain value set.
    Values,
    /// `nL`: the last occurrence in the month of the single day-of-week in
    /// the value set.
    LastOfMonth,
    /// `dow#n`: the nth occurrence in the month.
    Nth(u32),
}

/// A parsed cron expression bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronExpression {
    source: String,
    tz: Tz,
    seconds: BTreeSet<u32>,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days_of_month: BTreeSet<u32>,
    months: BTreeSet<u32>,
    days_of_week: BTreeSet<u32>,
    /// Empty set means every year.
    years: BTreeSet<i32>,
    dom_kind: DomKind,
    dow_kind: DowKind,
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.tz == other.tz
    }
}
impl Eq for CronExpression {}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpression::parse(s)
    }
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 6 && fields.len() != 7 {
            return Err(CronParseError::WrongFieldCount(fields.len()));
        }

        let seconds = parse_numeric_field(fields[0], "seconds", 0, 59)?;
        let minutes = parse_numeric_field(fields[1], "minutes", 0, 59)?;
        let hours = parse_numeric_field(fields[2], "hours", 0, 23)?;
        let (days_of_month, dom_kind) = parse_day_of_month(fields[3])?;
        let months = parse_month_field(fields[4])?;
        let (days_of_week, dow_kind) = parse_day_of_week(fields[5])?;
        let years = if fields.len() == 7 {
            parse_year_field(fields[6])?
        } else {
            BTreeSet::new()
        };

        // Exactly one of the two day fields must be '?'. Driving day
        // selection from both at once is not supported.
        match (&dom_kind, &dow_kind) {
            | (DomKind::Unspecified, DowKind::Unspecified) => {
                return Err(CronParseError::DayFieldConflict);
            }
            | (DomKind::Unspecified, _) | (_, DowKind::Unspecified) => {}
            | _ => return Err(CronParseError::DayFieldConflict),
        }

        Ok(Self {
            source: expression.to_owned(),
            tz: chrono_tz::UTC,
            seconds,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            years,
            dom_kind,
            dow_kind,
        })
    }

    pub fn with_timezone(mut self, tz: Tz) -> Self {
        self.tz = tz;
        self
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when `instant`, truncated to whole seconds, is a scheduled time
    /// of this expression.
    pub fn is_satisfied_by(&self, instant: DateTime<Utc>) -> bool {
        let floored = instant
            .with_nanosecond(0)
            .expect("zero nanosecond is always valid");
        match self.time_after(floored - chrono::Duration::seconds(1)) {
            | Some(next) => next == floored,
            | None => false,
        }
    }

    /// The smallest scheduled instant strictly greater than `after`, or
    /// `None` if the expression never fires again.
    pub fn time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.tz);
        let mut cur = Cursor {
            year: local.year(),
            month: local.month(),
            day: local.day(),
            hour: local.hour(),
            minute: local.minute(),
            second: local.second(),
        };
        cur.add_seconds(1);

        loop {
            if cur.year > MAX_YEAR {
                return None;
            }

            // Seconds.
            match self.seconds.range(cur.second..).next() {
                | Some(&s) => cur.second = s,
                | None => {
                    cur.second = *self.seconds.iter().next().unwrap();
                    cur.add_minutes(1);
                }
            }

            // Minutes. A carry resets seconds and restarts the cascade.
            match self.minutes.range(cur.minute..).next() {
                | Some(&m) if m == cur.minute => {}
                | Some(&m) => {
                    cur.minute = m;
                    cur.second = 0;
                    continue;
                }
                | None => {
                    cur.minute = *self.minutes.iter().next().unwrap();
                    cur.second = 0;
                    cur.add_hours(1);
                    continue;
                }
            }

            // Hours.
            match self.hours.range(cur.hour..).next() {
                | Some(&h) if h == cur.hour => {}
                | Some(&h) => {
                    cur.hour = h;
                    cur.minute = 0;
                    cur.second = 0;
                    continue;
                }
                | None => {
                    cur.hour = *self.hours.iter().next().unwrap();
                    cur.minute = 0;
                    cur.second = 0;
                    cur.add_days(1);
                    continue;
                }
            }

            // Day of month / day of week.
            match self.find_day(&mut cur) {
                | DayResult::Unchanged => {}
                | DayResult::Moved => {
                    cur.hour = 0;
                    cur.minute = 0;
                    cur.second = 0;
                    continue;
                }
                | DayResult::NextMonth => {
                    cur.day = 1;
                    cur.hour = 0;
                    cur.minute = 0;
                    cur.second = 0;
                    cur.add_months(1);
                    continue;
                }
            }

            // Month.
            match self.months.range(cur.month..).next() {
                | Some(&m) if m == cur.month => {}
                | Some(&m) => {
                    cur.month = m;
                    cur.day = 1;
                    cur.hour = 0;
                    cur.minute = 0;
                    cur.second = 0;
                    continue;
                }
                | None => {
                    cur.month = *self.months.iter().next().unwrap();
                    cur.day = 1;
                    cur.hour = 0;
                    cur.minute = 0;
                    cur.second = 0;
                    cur.year += 1;
                    continue;
                }
            }

            // Year.
            if !self.years.is_empty() {
                match self.years.range(cur.year..).next() {
                    | Some(&y) if y == cur.year => {}
                    | Some(&y) => {
                        cur.year = y;
                        cur.month = 1;
                        cur.day = 1;
                        cur.hour = 0;
                        cur.minute = 0;
                        cur.second = 0;
                        continue;
                    }
                    | None => return None,
                }
            }

            // All fields satisfied; materialize in the zone. A time that
            // falls in a DST gap does not exist; skip past the gap and keep
            // searching.
            match self.resolve_local(&cur) {
                | Some(t) => return Some(t.with_timezone(&Utc)),
                | None => {
                    cur.add_hours(1);
                    continue;
                }
            }
        }
    }

    fn resolve_local(&self, cur: &Cursor) -> Option<DateTime<Tz>> {
        match self.tz.with_ymd_and_hms(
            cur.year, cur.month, cur.day, cur.hour, cur.minute, cur.second,
        ) {
            | LocalResult::Single(t) => Some(t),
            // Clock-back fold: take the earlier instant.
            | LocalResult::Ambiguous(earliest, _) => Some(earliest),
            | LocalResult::None => None,
        }
    }

    /// Resolve the day within `cur`'s month. `Moved` means the cursor day
    /// changed (time-of-day must reset); `NextMonth` means no day in this
    /// month can match.
    fn find_day(&self, cur: &mut Cursor) -> DayResult {
        let last_dom = days_in_month(cur.year, cur.month);

        if self.dow_kind == DowKind::Unspecified {
            // Day-of-month driven.
            match &self.dom_kind {
                | DomKind::Last { offset, weekday } => {
                    let mut day = last_dom.saturating_sub(*offset);
                    if day < 1 {
                        return DayResult::NextMonth;
                    }
                    if *weekday {
                        day = pull_to_weekday(cur.year, cur.month, day, last_dom);
                    }
                    if day < cur.day {
                        return DayResult::NextMonth;
                    }
                    if day != cur.day {
                        cur.day = day;
                        return DayResult::Moved;
                    }
                    DayResult::Unchanged
                }
                | DomKind::NearestWeekday => {
                    let target = *self.days_of_month.iter().next().unwrap();
                    if target > last_dom {
                        return DayResult::NextMonth;
                    }
                    let day = pull_to_weekday(
                        cur.year, cur.month, target, last_dom,
                    );
                    if day < cur.day {
                        return DayResult::NextMonth;
                    }
                    if day != cur.day {
                        cur.day = day;
                        return DayResult::Moved;
                    }
                    DayResult::Unchanged
                }
                | _ => {
                    match self.days_of_month.range(cur.day..).next() {
                        | Some(&d) if d > last_dom => DayResult::NextMonth,
                        | Some(&d) if d == cur.day => DayResult::Unchanged,
                        | Some(&d) => {
                            cur.day = d;
                            DayResult::Moved
                        }
                        | None => DayResult::NextMonth,
                    }
                }
            }
        } else {
            // Day-of-week driven.
            let cur_dow = day_of_week(cur.year, cur.month, cur.day);
            match &self.dow_kind {
                | DowKind::LastOfMonth => {
                    let dow = *self.days_of_week.iter().next().unwrap();
                    let mut day = cur.day + days_until(cur_dow, dow);
                    if day > last_dom {
                        return DayResult::NextMonth;
                    }
                    while day + 7 <= last_dom {
                        day += 7;
                    }
                    if day != cur.day {
                        cur.day = day;
                        return DayResult::Moved;
                    }
                    DayResult::Unchanged
                }
                | DowKind::Nth(nth) => {
                    let dow = *self.days_of_week.iter().next().unwrap();
                    let candidate = cur.day + days_until(cur_dow, dow);
                    // Which occurrence of `dow` would `candidate` be?
                    let occurrence = (candidate - 1) / 7 + 1;
                    if occurrence > *nth {
                        return DayResult::NextMonth;
                    }
                    let day = candidate + (*nth - occurrence) * 7;
                    if day > last_dom {
                        return DayResult::NextMonth;
                    }
                    if day != cur.day {
                        cur.day = day;
                        return DayResult::Moved;
                    }
                    DayResult::Unchanged
                }
                | _ => {
                    let next_dow = self
                        .days_of_week
                        .range(cur_dow..)
                        .next()
                        .copied()
                        .unwrap_or_else(|| {
                            *self.days_of_week.iter().next().unwrap()
                        });
                    let day = cur.day + days_until(cur_dow, next_dow);
                    if day > last_dom {
                        return DayResult::NextMonth;
                    }
                    if day != cur.day {
                        cur.day = day;
                        return DayResult::Moved;
                    }
                    DayResult::Unchanged
                }
            }
        }
    }
}

enum DayResult {
    Unchanged,
    Moved,
    NextMonth,
}

/// Civil date-time cursor the search walks over. Kept as plain integers so
/// carries can be normalized without constructing intermediate `DateTime`s.
struct Cursor {
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl Cursor {
    fn add_seconds(&mut self, n: u32) {
        self.second += n;
        let carry = self.second / 60;
        self.second %= 60;
        if carry > 0 {
            self.add_minutes(carry);
        }
    }

    fn add_minutes(&mut self, n: u32) {
        self.minute += n;
        let carry = self.minute / 60;
        self.minute %= 60;
        if carry > 0 {
            self.add_hours(carry);
        }
    }

    fn add_hours(&mut self, n: u32) {
        self.hour += n;
        let carry = self.hour / 24;
        self.hour %= 24;
        if carry > 0 {
            self.add_days(carry);
        }
    }

    fn add_days(&mut self, n: u32) {
        self.day += n;
        while self.day > days_in_month(self.year, self.month) {
            self.day -= days_in_month(self.year, self.month);
            self.add_months(1);
        }
    }

    fn add_months(&mut self, n: u32) {
        let zero_based = self.month - 1 + n;
        self.year += (zero_based / 12) as i32;
        self.month = zero_based % 12 + 1;
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        | 1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        | 4 | 6 | 9 | 11 => 30,
        | 2 => {
            if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 {
                29
            } else {
                28
            }
        }
        | _ => unreachable!("month is always 1..=12 here"),
    }
}

/// 1 = Sunday .. 7 = Saturday.
fn day_of_week(year: i32, month: u32, day: u32) -> u32 {
    NaiveDate::from_ymd_opt(year, month, day)
        .expect("cursor dates are normalized")
        .weekday()
        .num_days_from_sunday()
        + 1
}

/// Days to add to get from weekday `from` to the next (or same) `to`.
fn days_until(from: u32, to: u32) -> u32 {
    (to + 7 - from) % 7
}

/// Shift a Saturday to Friday and a Sunday to Monday, staying inside the
/// month.
fn pull_to_weekday(year: i32, month: u32, day: u32, last_dom: u32) -> u32 {
    match day_of_week(year, month, day) {
        // Saturday
        | 7 => {
            if day == 1 {
                day + 2
            } else {
                day - 1
            }
        }
        // Sunday
        | 1 => {
            if day == last_dom {
                day - 2
            } else {
                day + 1
            }
        }
        | _ => day,
    }
}

fn parse_int(
    field: &'static str,
    raw: &str,
) -> Result<i32, CronParseError> {
    raw.parse::<i32>().map_err(|_| CronParseError::InvalidValue {
        field,
        value: raw.to_owned(),
    })
}

fn check_range(
    field: &'static str,
    value: i32,
    min: i32,
    max: i32,
) -> Result<u32, CronParseError> {
    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(value as u32)
}

/// Expand one element (`*`, `a`, `a-b`, with optional `/step`) into the set.
/// Ranges with start greater than end wrap around the field's domain.
fn add_element(
    set: &mut BTreeSet<u32>,
    field: &'static str,
    element: &str,
    min: i32,
    max: i32,
    name_lookup: Option<&dyn Fn(&str) -> Option<i32>>,
) -> Result<(), CronParseError> {
    let (base, step) = match element.split_once('/') {
        | Some((b, s)) => {
            let step = parse_int(field, s)?;
            if step <= 0 {
                return Err(CronParseError::InvalidValue {
                    field,
                    value: element.to_owned(),
                });
            }
            (b, step as u32)
        }
        | None => (element, 1),
    };

    let resolve = |raw: &str| -> Result<i32, CronParseError> {
        if let Some(lookup) = name_lookup {
            if let Some(v) = lookup(&raw.to_ascii_uppercase()) {
                return Ok(v);
            }
        }
        parse_int(field, raw)
    };

    let (start, end) = if base == "*" {
        (min as u32, max as u32)
    } else if let Some((a, b)) = base.split_once('-') {
        let a = check_range(field, resolve(a)?, min, max)?;
        let b = check_range(field, resolve(b)?, min, max)?;
        (a, b)
    } else {
        let a = check_range(field, resolve(base)?, min, max)?;
        // A bare value with a step means "from a to max".
        if element.contains('/') {
            (a, max as u32)
        } else {
            set.insert(a);
            return Ok(());
        }
    };

    if start <= end {
        let mut v = start;
        while v <= end {
            set.insert(v);
            v += step;
        }
    } else {
        // Wrapping range, e.g. seconds `55-5` or weekdays `FRI-MON`.
        let min = min as u32;
        let span = max as u32 - min + 1;
        let positions = (end + span - start) % span + 1;
        let mut offset = 0;
        while offset < positions {
            set.insert(min + (start - min + offset) % span);
            offset += step;
        }
    }
    Ok(())
}

fn parse_numeric_field(
    raw: &str,
    field: &'static str,
    min: i32,
    max: i32,
) -> Result<BTreeSet<u32>, CronParseError> {
    let mut set = BTreeSet::new();
    for element in raw.split(',') {
        add_element(&mut set, field, element, min, max, None)?;
    }
    if set.is_empty() {
        return Err(CronParseError::InvalidValue {
            field,
            value: raw.to_owned(),
        });
    }
    Ok(set)
}

fn parse_month_field(raw: &str) -> Result<BTreeSet<u32>, CronParseError> {
    let lookup = |name: &str| -> Option<i32> {
        MONTH_NAMES
            .iter()
            .position(|m| *m == name)
            .map(|idx| idx as i32 + 1)
    };
    let mut set = BTreeSet::new();
    for element in raw.split(',') {
        add_element(&mut set, "month", element, 1, 12, Some(&lookup))?;
    }
    if set.is_empty() {
        return Err(CronParseError::InvalidValue {
            field: "month",
            value: raw.to_owned(),
        });
    }
    Ok(set)
}

fn parse_year_field(raw: &str) -> Result<BTreeSet<i32>, CronParseError> {
    if raw == "*" {
        return Ok(BTreeSet::new());
    }
    let mut set = BTreeSet::new();
    for element in raw.split(',') {
        add_element(&mut set, "year", element, 1970, MAX_YEAR, None)?;
    }
    Ok(set.into_iter().map(|y| y as i32).collect())
}

fn parse_day_of_month(
    raw: &str,
) -> Result<(BTreeSet<u32>, DomKind), CronParseError> {
    if raw == "?" {
        return Ok((BTreeSet::new(), DomKind::Unspecified));
    }

    let upper = raw.to_ascii_uppercase();
    if upper == "L" {
        return Ok((
            BTreeSet::new(),
            DomKind::Last {
                offset: 0,
                weekday: false,
            },
        ));
    }
    if upper == "LW" {
        return Ok((
            BTreeSet::new(),
            DomKind::Last {
                offset: 0,
                weekday: true,
            },
        ));
    }
    if let Some(offset_raw) = upper.strip_prefix("L-") {
        let offset = parse_int("day-of-month", offset_raw)?;
        let offset = check_range("day-of-month", offset, 0, 30)?;
        return Ok((
            BTreeSet::new(),
            DomKind::Last {
                offset,
                weekday: false,
            },
        ));
    }
    if upper.contains('L') {
        return Err(CronParseError::UnsupportedSpecial('L', "day-of-month"));
    }
    if let Some(day_raw) = upper.strip_suffix('W') {
        let day = parse_int("day-of-month", day_raw)?;
        if day > 31 {
            return Err(CronParseError::WeekdayValueTooLarge);
        }
        let day = check_range("day-of-month", day, 1, 31)?;
        let mut set = BTreeSet::new();
        set.insert(day);
        return Ok((set, DomKind::NearestWeekday));
    }
    if upper.contains('W') {
        return Err(CronParseError::UnsupportedSpecial('W', "day-of-month"));
    }

    let set = parse_numeric_field(raw, "day-of-month", 1, 31)?;
    Ok((set, DomKind::Values))
}

fn parse_day_of_week(
    raw: &str,
) -> Result<(BTreeSet<u32>, DowKind), CronParseError> {
    if raw == "?" {
        return Ok((BTreeSet::new(), DowKind::Unspecified));
    }

    let lookup = |name: &str| -> Option<i32> {
        DAY_NAMES
            .iter()
            .position(|d| *d == name)
            .map(|idx| idx as i32 + 1)
    };

    let upper = raw.to_ascii_uppercase();
    if upper == "L" {
        // Bare 'L' in day-of-week means Saturday.
        let mut set = BTreeSet::new();
        set.insert(7);
        return Ok((set, DowKind::Values));
    }
    if let Some(dow_raw) = upper.strip_suffix('L') {
        let dow = lookup(dow_raw)
            .map(Ok)
            .unwrap_or_else(|| parse_int("day-of-week", dow_raw))?;
        let dow = check_range("day-of-week", dow, 1, 7)?;
        let mut set = BTreeSet::new();
        set.insert(dow);
        return Ok((set, DowKind::LastOfMonth));
    }
    if let Some((dow_raw, nth_raw)) = upper.split_once('#') {
        let dow = lookup(dow_raw)
            .map(Ok)
            .unwrap_or_else(|| parse_int("day-of-week", dow_raw))?;
        let dow = check_range("day-of-week", dow, 1, 7)?;
        let nth = parse_int("day-of-week", nth_raw)?;
        let nth = check_range("day-of-week", nth, 1, 5)?;
        let mut set = BTreeSet::new();
        set.insert(dow);
        return Ok((set, DowKind::Nth(nth)));
    }

    let mut set = BTreeSet::new();
    for element in upper.split(',') {
        add_element(&mut set, "day-of-week", element, 1, 7, Some(&lookup))?;
    }
    if set.is_empty() {
        return Err(CronParseError::InvalidValue {
            field: "day-of-week",
            value: raw.to_owned(),
        });
    }
    Ok((set, DowKind::Values))
}
