use crate::store::tasks::ScheduleType;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;

/// Next fire time after `from` for a repeating schedule. `None` means the
/// schedule does not repeat (one-shot tasks are done after their fire).
pub fn next_run_after(
    schedule_type: ScheduleType,
    value: &str,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match schedule_type {
        ScheduleType::Once => Ok(None),
        ScheduleType::Interval => {
            let secs = interval_seconds(value)?;
            Ok(Some(from + ChronoDuration::seconds(secs)))
        }
        ScheduleType::Cron => Ok(Some(next_cron_fire(value, from)?)),
    }
}

/// First fire time for a newly added task.
pub fn initial_next_run(
    schedule_type: ScheduleType,
    value: &str,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    match schedule_type {
        ScheduleType::Once => {
            let at = DateTime::parse_from_rfc3339(value)
                .with_context(|| format!("Invalid one-shot time (want RFC3339): {value}"))?
                .with_timezone(&Utc);
            Ok(at)
        }
        ScheduleType::Interval => {
            let secs = interval_seconds(value)?;
            Ok(now + ChronoDuration::seconds(secs))
        }
        ScheduleType::Cron => next_cron_fire(value, now),
    }
}

pub fn validate(schedule_type: ScheduleType, value: &str) -> Result<()> {
    initial_next_run(schedule_type, value, Utc::now()).map(|_| ())
}

fn interval_seconds(value: &str) -> Result<i64> {
    let trimmed = value.trim().trim_end_matches('s');
    let secs: i64 = trimmed
        .parse()
        .with_context(|| format!("Invalid interval (want seconds): {value}"))?;
    if secs <= 0 {
        anyhow::bail!("Interval must be positive: {value}");
    }
    Ok(secs)
}

fn next_cron_fire(expression: &str, from: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let schedule = CronSchedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expression}"))?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))
}

fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();

    match field_count {
        // standard crontab syntax: minute hour day month weekday
        5 => Ok(format!("0 {expression}")),
        // crate-native syntax includes seconds (+ optional year)
        6 | 7 => Ok(expression.to_string()),
        _ => anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5, 6, or 7 fields, got {field_count})"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn interval_advances_from_now() {
        let from = Utc.with_ymd_and_hms(2026, 2, 16, 12, 0, 0).unwrap();
        let next = next_run_after(ScheduleType::Interval, "60", from)
            .unwrap()
            .unwrap();
        assert_eq!(next, from + ChronoDuration::seconds(60));

        let suffixed = next_run_after(ScheduleType::Interval, "90s", from)
            .unwrap()
            .unwrap();
        assert_eq!(suffixed, from + ChronoDuration::seconds(90));
    }

    #[test]
    fn interval_rejects_garbage() {
        let from = Utc::now();
        assert!(next_run_after(ScheduleType::Interval, "0", from).is_err());
        assert!(next_run_after(ScheduleType::Interval, "-5", from).is_err());
        assert!(next_run_after(ScheduleType::Interval, "soon", from).is_err());
    }

    #[test]
    fn one_shot_does_not_repeat() {
        let next = next_run_after(ScheduleType::Once, "2026-06-01T00:00:00Z", Utc::now()).unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn one_shot_initial_run_is_the_given_time() {
        let at = initial_next_run(
            ScheduleType::Once,
            "2026-06-01T09:30:00Z",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 6, 1, 9, 30, 0).unwrap());
    }

    #[test]
    fn five_field_cron_is_normalized() {
        let from = Utc.with_ymd_and_hms(2026, 2, 16, 8, 30, 0).unwrap();
        let next = next_run_after(ScheduleType::Cron, "0 9 * * *", from)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn invalid_cron_field_count_is_rejected() {
        let err = validate(ScheduleType::Cron, "* * * *").unwrap_err();
        assert!(err.to_string().contains("expected 5, 6, or 7 fields"));
    }
}
