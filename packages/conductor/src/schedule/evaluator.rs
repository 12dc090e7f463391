//! Due-ness evaluation over manifests.
//!
//! `next_due_at` is the single source of truth for "should this manifest be
//! enqueued now". Cron schedules are evaluated on minute boundaries with a
//! one-minute guard after the previous enqueue, so a polling cycle that
//! straddles a tick cannot double-fire.

use chrono::{DateTime, Duration, Timelike, Utc};

use super::cron::CronExpression;
use super::ScheduleError;
use crate::store::{Manifest, ScheduleType};

/// Validate the schedule shape and syntax of a manifest.
///
/// Called at seeding time; a failure disables the offending manifest with a
/// persisted note instead of failing startup.
pub fn validate_schedule(manifest: &Manifest) -> Result<(), ScheduleError> {
    match manifest.schedule_type {
        ScheduleType::None | ScheduleType::OnDemand => Ok(()),
        ScheduleType::Cron => {
            if manifest.interval_seconds.is_some() {
                return Err(ScheduleError::InvalidInterval(manifest.interval_seconds));
            }
            let expression = manifest
                .cron_expression
                .as_deref()
                .ok_or(ScheduleError::MissingCronExpression)?;
            CronExpression::parse(expression).map(|_| ())
        }
        ScheduleType::Interval => match manifest.interval_seconds {
            Some(secs) if secs > 0 && manifest.cron_expression.is_none() => Ok(()),
            other => Err(ScheduleError::InvalidInterval(other)),
        },
    }
}

/// When the manifest next becomes eligible, or `None` for schedules that
/// only fire on explicit triggers.
pub fn next_due_at(
    manifest: &Manifest,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    match manifest.schedule_type {
        ScheduleType::None | ScheduleType::OnDemand => Ok(None),
        ScheduleType::Interval => {
            let secs = match manifest.interval_seconds {
                Some(secs) if secs > 0 => secs,
                other => return Err(ScheduleError::InvalidInterval(other)),
            };
            Ok(Some(match manifest.last_successful_run_at {
                None => now,
                Some(last) => last + Duration::seconds(secs),
            }))
        }
        ScheduleType::Cron => {
            let expression = manifest
                .cron_expression
                .as_deref()
                .ok_or(ScheduleError::MissingCronExpression)?;
            let cron = CronExpression::parse(expression)?;

            // Evaluate from the current minute, but never re-fire within a
            // minute of the previous enqueue.
            let mut floor = floor_to_minute(now);
            if let Some(last_enqueued) = manifest.last_enqueued_at {
                let guard = floor_to_minute(last_enqueued) + Duration::minutes(1);
                floor = floor.max(guard);
            }
            Ok(cron.next_after(floor))
        }
    }
}

/// A manifest is due iff its next tick is not in the future.
pub fn is_due(manifest: &Manifest, now: DateTime<Utc>) -> Result<bool, ScheduleError> {
    Ok(next_due_at(manifest, now)?.is_some_and(|due| due <= now))
}

/// Inverse helper: render an interval as a cron expression with the same
/// tick set, for intervals that divide an hour or a day evenly. Intervals
/// that do not divide fall back to `*/k * * * *` with `k = min(minutes, 59)`.
pub fn to_cron_expression(interval: Duration) -> String {
    let minutes = interval.num_minutes().max(1);

    if minutes < 60 && 60 % minutes == 0 {
        return if minutes == 1 {
            "* * * * *".to_string()
        } else {
            format!("*/{minutes} * * * *")
        };
    }

    if minutes % 60 == 0 {
        let hours = minutes / 60;
        if hours < 24 && 24 % hours == 0 {
            return if hours == 1 {
                "0 * * * *".to_string()
            } else {
                format!("0 */{hours} * * *")
            };
        }
        if hours == 24 {
            return "0 0 * * *".to_string();
        }
    }

    format!("*/{} * * * *", minutes.min(59))
}

fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}
