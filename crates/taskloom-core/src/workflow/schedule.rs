//! Cron expression handling for workflow timers.
//!
//! Accepts standard 5-field cron, 6-field cron with seconds, and a few
//! human-readable forms ("every 5 minutes", "hourly", "every day at 09:30").
//! Occurrences are computed with `croner`.

use chrono::{DateTime, Utc};
use taskloom_types::error::ValidationIssue;

use crate::error::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid schedule '{0}'")]
    Invalid(String),
}

impl From<ScheduleError> for EngineError {
    fn from(e: ScheduleError) -> Self {
        EngineError::Validation(vec![ValidationIssue::new("cron", e.to_string())])
    }
}

/// Rewrite `input` as a 6-field cron expression.
pub fn normalize_schedule(input: &str) -> Result<String, ScheduleError> {
    let trimmed = input.trim();
    let invalid = || ScheduleError::Invalid(trimmed.to_string());

    match trimmed.split_whitespace().count() {
        5 => return Ok(format!("0 {trimmed}")),
        6 => return Ok(trimmed.to_string()),
        _ => {}
    }

    let lower = trimmed.to_lowercase();
    match lower.as_str() {
        "every minute" | "minutely" => return Ok("0 * * * * *".to_string()),
        "every hour" | "hourly" => return Ok("0 0 * * * *".to_string()),
        "every day" | "daily" => return Ok("0 0 0 * * *".to_string()),
        _ => {}
    }

    let rest = lower.strip_prefix("every ").ok_or_else(invalid)?;

    if let Some(at) = rest.strip_prefix("day at ") {
        let (hour, minute) = at.split_once(':').ok_or_else(invalid)?;
        let hour: u32 = hour.trim().parse().map_err(|_| invalid())?;
        let minute: u32 = minute.trim().parse().map_err(|_| invalid())?;
        if hour >= 24 || minute >= 60 {
            return Err(invalid());
        }
        return Ok(format!("0 {minute} {hour} * * *"));
    }

    let (count, unit) = rest.split_once(' ').ok_or_else(invalid)?;
    let n: u32 = count.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }
    match unit.trim().trim_end_matches('s') {
        "second" => Ok(format!("*/{n} * * * * *")),
        "minute" => Ok(format!("0 */{n} * * * *")),
        "hour" => Ok(format!("0 0 */{n} * * *")),
        _ => Err(invalid()),
    }
}

/// Parse `expression` into a croner schedule.
pub fn parse_schedule(expression: &str) -> Result<croner::Cron, ScheduleError> {
    let normalized = normalize_schedule(expression)?;
    normalized
        .parse::<croner::Cron>()
        .map_err(|e| ScheduleError::Invalid(format!("{expression}: {e}")))
}

/// The first occurrence strictly after `after`.
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let cron = parse_schedule(expression)?;
    Ok(cron.iter_after(after).next())
}
