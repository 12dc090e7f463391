//! 5-field cron expressions: minute, hour, day-of-month, month, day-of-week.
//!
//! Supported syntax per field: `*`, `*/n`, `a`, `a-b`, `a-b/n`, and
//! comma-separated lists of those. Day-of-week accepts 0-7 with both 0 and
//! 7 meaning Sunday. Ticks are minute-aligned UTC instants.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! either field matches (classic vixie-cron semantics).

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use super::ScheduleError;

/// One parsed field: a bitmask of allowed values plus whether the field was
/// restricted at all (`*` and `*/1` count as unrestricted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    mask: u64,
    restricted: bool,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.mask & (1u64 << value) != 0
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
}

impl CronExpression {
    /// Parse the common 5-field form.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(ScheduleError::FieldCount(fields.len()));
        }

        Ok(Self {
            minute: parse_field(fields[0], "minute", 0, 59)?,
            hour: parse_field(fields[1], "hour", 0, 23)?,
            day_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            month: parse_field(fields[3], "month", 1, 12)?,
            day_of_week: parse_dow_field(fields[4])?,
        })
    }

    /// The smallest minute-aligned tick `>= from`.
    ///
    /// Returns `None` only for expressions with no reachable tick within
    /// five years (e.g. Feb 30).
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = ceil_to_minute(from);
        let mut date = start.date_naive();
        let mut minute_of_day = start.hour() * 60 + start.minute();

        // Bounded walk; leap-day-only schedules need up to 4 years.
        for _ in 0..(366 * 5) {
            if self.day_matches(date) {
                let mut m = minute_of_day;
                while m < 24 * 60 {
                    let (hour, minute) = (m / 60, m % 60);
                    if !self.hour.contains(hour) {
                        // Skip to the top of the next hour.
                        m = (hour + 1) * 60;
                        continue;
                    }
                    if self.minute.contains(minute) {
                        let naive = date.and_hms_opt(hour, minute, 0)?;
                        return Some(Utc.from_utc_datetime(&naive));
                    }
                    m += 1;
                }
            }
            date = date.succ_opt()?;
            minute_of_day = 0;
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.month.contains(date.month()) {
            return false;
        }
        let dom_ok = self.day_of_month.contains(date.day());
        let dow_ok = self
            .day_of_week
            .contains(date.weekday().num_days_from_sunday());

        match (self.day_of_month.restricted, self.day_of_week.restricted) {
            // Both restricted: vixie OR rule.
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            format_field(&self.minute, 0, 59),
            format_field(&self.hour, 0, 23),
            format_field(&self.day_of_month, 1, 31),
            format_field(&self.month, 1, 12),
            format_field(&self.day_of_week, 0, 6),
        )
    }
}

fn ceil_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    let floored = t
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    if floored < t {
        floored + Duration::minutes(1)
    } else {
        floored
    }
}

fn parse_field(
    raw: &str,
    name: &'static str,
    min: u32,
    max: u32,
) -> Result<FieldSet, ScheduleError> {
    if raw.is_empty() {
        return Err(ScheduleError::InvalidField {
            field: name,
            value: raw.to_string(),
        });
    }

    let mut mask = 0u64;
    let mut restricted = false;

    for term in raw.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((range, step_str)) => {
                let step: u32 = step_str.parse().map_err(|_| ScheduleError::InvalidField {
                    field: name,
                    value: term.to_string(),
                })?;
                if step == 0 {
                    return Err(ScheduleError::ZeroStep { field: name });
                }
                (range, step)
            }
            None => (term, 1),
        };

        let (start, end, wildcard) = if range == "*" {
            (min, max, true)
        } else if let Some((a, b)) = range.split_once('-') {
            let start = parse_value(a, name, min, max)?;
            let end = parse_value(b, name, min, max)?;
            if start > end {
                return Err(ScheduleError::InvertedRange {
                    field: name,
                    start,
                    end,
                });
            }
            (start, end, false)
        } else {
            let value = parse_value(range, name, min, max)?;
            (value, value, false)
        };

        if !wildcard || step > 1 {
            restricted = true;
        }

        let mut v = start;
        while v <= end {
            mask |= 1u64 << v;
            v += step;
        }
    }

    Ok(FieldSet { mask, restricted })
}

// Day-of-week gets its own parser so 7 folds onto Sunday before the mask is
// built.
fn parse_dow_field(raw: &str) -> Result<FieldSet, ScheduleError> {
    let parsed = parse_field(raw, "day-of-week", 0, 7)?;
    let mut mask = parsed.mask & 0x7f;
    if parsed.mask & (1u64 << 7) != 0 {
        mask |= 1;
    }
    Ok(FieldSet {
        mask,
        restricted: parsed.restricted,
    })
}

fn parse_value(raw: &str, name: &'static str, min: u32, max: u32) -> Result<u32, ScheduleError> {
    let value: u32 = raw.parse().map_err(|_| ScheduleError::InvalidField {
        field: name,
        value: raw.to_string(),
    })?;
    if value < min || value > max {
        return Err(ScheduleError::OutOfRange {
            field: name,
            value,
            min,
            max,
        });
    }
    Ok(value)
}

fn format_field(field: &FieldSet, min: u32, max: u32) -> String {
    if !field.restricted {
        return "*".to_string();
    }
    let values: Vec<String> = (min..=max)
        .filter(|v| field.contains(*v))
        .map(|v| v.to_string())
        .collect();
    values.join(",")
}
