//! Schedule definitions for schedulable components
//!
//! A component is scheduled either with a fixed delay (period + initial delay
//! in a time unit) or with a cron expression. The two forms are mutually
//! exclusive.

use std::{fmt, str::FromStr, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Unit for fixed-delay periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
  Milliseconds,
  #[default]
  Seconds,
  Minutes,
  Hours,
}

impl TimeUnit {
  pub fn to_duration(self, amount: u64) -> Duration {
    match self {
      Self::Milliseconds => Duration::from_millis(amount),
      Self::Seconds => Duration::from_secs(amount),
      Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
      Self::Hours => Duration::from_secs(amount.saturating_mul(3600)),
    }
  }
}

impl FromStr for TimeUnit {
  type Err = ScheduleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "ms" | "millis" | "milliseconds" => Ok(Self::Milliseconds),
      "s" | "sec" | "secs" | "seconds" => Ok(Self::Seconds),
      "m" | "min" | "mins" | "minutes" => Ok(Self::Minutes),
      "h" | "hour" | "hours" => Ok(Self::Hours),
      other => Err(ScheduleError::Unit(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
  #[error("schedule declares both a fixed period and a cron expression")]
  Conflict,
  #[error("schedule declares neither a period nor a cron expression")]
  Missing,
  #[error("schedule period must be greater than zero")]
  ZeroPeriod,
  #[error("unknown time unit: {0}")]
  Unit(String),
  #[error("invalid cron expression '{expression}': {message}")]
  Cron { expression: String, message: String },
}

/// Parsed cron expression, keeping the source text for display.
#[derive(Clone)]
pub struct CronSchedule {
  expression: String,
  schedule: cron::Schedule,
}

impl CronSchedule {
  /// Parse a cron expression. Classic five-field expressions are accepted
  /// and run at second zero.
  pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
      format!("0 {}", trimmed)
    } else {
      trimmed.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::Cron {
      expression: trimmed.to_string(),
      message: e.to_string(),
    })?;
    Ok(Self {
      expression: trimmed.to_string(),
      schedule,
    })
  }

  pub fn expression(&self) -> &str {
    &self.expression
  }

  /// Time until the next fire, or `None` if the expression never fires again.
  pub fn until_next(&self) -> Option<Duration> {
    let now = Utc::now();
    let next = self.schedule.after(&now).next()?;
    Some((next - now).to_std().unwrap_or(Duration::ZERO))
  }
}

impl fmt::Debug for CronSchedule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("CronSchedule").field(&self.expression).finish()
  }
}

impl PartialEq for CronSchedule {
  fn eq(&self, other: &Self) -> bool {
    self.expression == other.expression
  }
}

/// How a schedulable component is invoked.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleSpec {
  /// Run `initial_delay` after scheduling, then `period` after each completion
  FixedDelay {
    period: u64,
    initial_delay: u64,
    unit: TimeUnit,
  },
  Cron(CronSchedule),
}

impl ScheduleSpec {
  pub fn fixed(period: u64, initial_delay: u64, unit: TimeUnit) -> Result<Self, ScheduleError> {
    if period == 0 {
      return Err(ScheduleError::ZeroPeriod);
    }
    Ok(Self::FixedDelay {
      period,
      initial_delay,
      unit,
    })
  }

  pub fn cron(expression: &str) -> Result<Self, ScheduleError> {
    CronSchedule::parse(expression).map(Self::Cron)
  }

  /// Build a spec from optional parts, enforcing that exactly one form is used.
  pub fn from_parts(
    period: Option<u64>,
    initial_delay: Option<u64>,
    unit: Option<TimeUnit>,
    cron: Option<&str>,
  ) -> Result<Self, ScheduleError> {
    match (period, cron) {
      (Some(_), Some(_)) => Err(ScheduleError::Conflict),
      (None, None) => Err(ScheduleError::Missing),
      (Some(period), None) => Self::fixed(period, initial_delay.unwrap_or(0), unit.unwrap_or_default()),
      (None, Some(expr)) => {
        if initial_delay.is_some() {
          return Err(ScheduleError::Conflict);
        }
        Self::cron(expr)
      }
    }
  }

  /// Delay before the first invocation.
  pub fn first_delay(&self) -> Option<Duration> {
    match self {
      Self::FixedDelay {
        initial_delay, unit, ..
      } => Some(unit.to_duration(*initial_delay)),
      Self::Cron(cron) => cron.until_next(),
    }
  }

  /// Delay between the end of one invocation and the start of the next.
  pub fn next_delay(&self) -> Option<Duration> {
    match self {
      Self::FixedDelay { period, unit, .. } => Some(unit.to_duration(*period)),
      Self::Cron(cron) => cron.until_next(),
    }
  }
}

impl fmt::Display for ScheduleSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::FixedDelay {
        period,
        initial_delay,
        unit,
      } => write!(f, "every {} {:?} (initial delay {})", period, unit, initial_delay),
      Self::Cron(cron) => write!(f, "cron '{}'", cron.expression()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fixed_delay_durations() {
    let spec = ScheduleSpec::fixed(2, 5, TimeUnit::Minutes).unwrap();
    assert_eq!(spec.first_delay(), Some(Duration::from_secs(300)));
    assert_eq!(spec.next_delay(), Some(Duration::from_secs(120)));
    assert_eq!(ScheduleSpec::fixed(0, 0, TimeUnit::Seconds), Err(ScheduleError::ZeroPeriod));
  }

  #[test]
  fn test_forms_are_mutually_exclusive() {
    assert_eq!(
      ScheduleSpec::from_parts(Some(10), None, None, Some("* * * * *")),
      Err(ScheduleError::Conflict)
    );
    assert_eq!(ScheduleSpec::from_parts(None, None, None, None), Err(ScheduleError::Missing));
    assert_eq!(
      ScheduleSpec::from_parts(None, Some(3), None, Some("* * * * *")),
      Err(ScheduleError::Conflict)
    );
  }

  #[test]
  fn test_cron_accepts_five_fields() {
    let spec = ScheduleSpec::cron("*/5 * * * *").expect("five-field cron");
    let delay = spec.first_delay().expect("fires again");
    assert!(delay <= Duration::from_secs(300));
    assert!(matches!(ScheduleSpec::cron("not a cron"), Err(ScheduleError::Cron { .. })));
  }

  #[test]
  fn test_time_unit_parsing() {
    assert_eq!("ms".parse::<TimeUnit>(), Ok(TimeUnit::Milliseconds));
    assert_eq!("Minutes".parse::<TimeUnit>(), Ok(TimeUnit::Minutes));
    assert!("fortnights".parse::<TimeUnit>().is_err());
  }
}
