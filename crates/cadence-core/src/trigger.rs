use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Days, Duration, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Defines when and how often a job should fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire exactly once at the given UTC instant.
    Once { at: DateTime<Utc> },

    /// Fire repeatedly with a fixed interval in seconds.
    ///
    /// The first fire time is `start`, or one interval after the job was
    /// added when no start is given.
    Interval {
        every_secs: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start: Option<DateTime<Utc>>,
    },

    /// Fire every day at the given local hour and minute.
    Daily { hour: u8, minute: u8 },

    /// Fire on a specific weekday (0 = Monday … 6 = Sunday) at the given local time.
    Weekly { day: u8, hour: u8, minute: u8 },

    /// Fire according to a cron expression (seconds field first).
    Cron { expression: String },
}

/// A recurrence rule bound to a timezone.
///
/// Wall-clock schedules (`Daily`, `Weekly`, `Cron`) are evaluated in
/// `timezone`; `Once` and `Interval` are absolute and ignore it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(flatten)]
    pub schedule: Schedule,
    #[serde(default = "default_timezone")]
    pub timezone: Tz,
}

fn default_timezone() -> Tz {
    chrono_tz::UTC
}

impl Trigger {
    /// Build a UTC-bound trigger, rejecting out-of-range fields.
    pub fn new(schedule: Schedule) -> Result<Self> {
        let trigger = Self {
            schedule,
            timezone: default_timezone(),
        };
        trigger.validate()?;
        Ok(trigger)
    }

    pub fn once(at: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::Once { at },
            timezone: default_timezone(),
        }
    }

    pub fn interval(every_secs: u64) -> Result<Self> {
        Self::new(Schedule::Interval {
            every_secs,
            start: None,
        })
    }

    pub fn daily(hour: u8, minute: u8) -> Result<Self> {
        Self::new(Schedule::Daily { hour, minute })
    }

    pub fn weekly(day: u8, hour: u8, minute: u8) -> Result<Self> {
        Self::new(Schedule::Weekly { day, hour, minute })
    }

    pub fn cron(expression: impl Into<String>) -> Result<Self> {
        Self::new(Schedule::Cron {
            expression: expression.into(),
        })
    }

    /// Builder form of [`Trigger::bind_timezone`].
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.bind_timezone(timezone);
        self
    }

    pub fn bind_timezone(&mut self, timezone: Tz) {
        self.timezone = timezone;
    }

    /// Check field ranges. Deserialized triggers bypass the constructors, so
    /// callers loading them from disk or config should run this too.
    pub fn validate(&self) -> Result<()> {
        match &self.schedule {
            Schedule::Once { .. } => Ok(()),
            Schedule::Interval { every_secs, .. } => {
                if *every_secs == 0 || i64::try_from(*every_secs).is_err() {
                    return Err(CoreError::InvalidSchedule(format!(
                        "interval must be between 1 and {} seconds, got {every_secs}",
                        i64::MAX
                    )));
                }
                Ok(())
            }
            Schedule::Daily { hour, minute } => check_time(*hour, *minute),
            Schedule::Weekly { day, hour, minute } => {
                if *day > 6 {
                    return Err(CoreError::InvalidSchedule(format!(
                        "weekday must be 0 (Monday) to 6 (Sunday), got {day}"
                    )));
                }
                check_time(*hour, *minute)
            }
            Schedule::Cron { expression } => cron::Schedule::from_str(expression)
                .map(|_| ())
                .map_err(|e| CoreError::InvalidSchedule(format!("cron '{expression}': {e}"))),
        }
    }

    /// Compute the next fire time strictly after `previous`.
    ///
    /// `previous` is `None` when the job has never fired; wall-clock
    /// schedules then search forward from `now`. Returns `None` when the
    /// schedule is exhausted.
    pub fn get_next_fire_time(
        &self,
        previous: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::Once { at } => match previous {
                None => Some(*at),
                Some(_) => None,
            },

            Schedule::Interval { every_secs, start } => {
                let every = Duration::try_seconds(i64::try_from(*every_secs).ok()?)?;
                match previous {
                    Some(prev) => prev.checked_add_signed(every),
                    None => start.or_else(|| now.checked_add_signed(every)),
                }
            }

            Schedule::Daily { hour, minute } => {
                next_wall_clock(self.timezone, previous.unwrap_or(now), *hour, *minute, None)
            }

            Schedule::Weekly { day, hour, minute } => next_wall_clock(
                self.timezone,
                previous.unwrap_or(now),
                *hour,
                *minute,
                Some(*day),
            ),

            Schedule::Cron { expression } => {
                let schedule = cron::Schedule::from_str(expression).ok()?;
                let base = previous.unwrap_or(now).with_timezone(&self.timezone);
                schedule
                    .after(&base)
                    .next()
                    .map(|dt| dt.with_timezone(&Utc))
            }
        }
    }
}

fn check_time(hour: u8, minute: u8) -> Result<()> {
    if hour > 23 || minute > 59 {
        return Err(CoreError::InvalidSchedule(format!(
            "time of day out of range: {hour:02}:{minute:02}"
        )));
    }
    Ok(())
}

/// First local `hour:minute` (optionally on `weekday`) strictly after `base`.
fn next_wall_clock(
    timezone: Tz,
    base: DateTime<Utc>,
    hour: u8,
    minute: u8,
    weekday: Option<u8>,
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), 0)?;
    let start_date = base.with_timezone(&timezone).date_naive();

    // Two weeks of candidates: a weekly slot can fall into a DST gap once.
    for offset in 0..=14 {
        let date = start_date.checked_add_days(Days::new(offset))?;
        if let Some(day) = weekday {
            if date.weekday().num_days_from_monday() != u32::from(day) {
                continue;
            }
        }
        if let Some(candidate) = resolve_local(timezone, date.and_time(time)) {
            if candidate > base {
                return Some(candidate);
            }
        }
    }
    None
}

/// Map a local wall-clock time to UTC. Times inside a DST gap do not exist;
/// ambiguous times take the earlier instant.
fn resolve_local(timezone: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    match timezone.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().expect("valid timestamp")
    }

    #[test]
    fn once_fires_only_without_previous() {
        let at = utc("2026-03-01T10:00:00Z");
        let trigger = Trigger::once(at);
        let now = utc("2026-03-01T12:00:00Z");

        assert_eq!(trigger.get_next_fire_time(None, now), Some(at));
        assert_eq!(trigger.get_next_fire_time(Some(at), now), None);
    }

    #[test]
    fn interval_steps_from_previous() {
        let trigger = Trigger::interval(90).unwrap();
        let prev = utc("2026-03-01T10:00:00Z");
        let now = utc("2026-03-01T10:00:30Z");

        assert_eq!(
            trigger.get_next_fire_time(Some(prev), now),
            Some(utc("2026-03-01T10:01:30Z"))
        );
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-01T10:02:00Z"))
        );
    }

    #[test]
    fn interval_uses_start_for_first_fire() {
        let start = utc("2026-03-01T09:00:00Z");
        let trigger = Trigger::new(Schedule::Interval {
            every_secs: 60,
            start: Some(start),
        })
        .unwrap();
        assert_eq!(
            trigger.get_next_fire_time(None, utc("2026-03-01T12:00:00Z")),
            Some(start)
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(Trigger::interval(0).is_err());
    }

    #[test]
    fn daily_rolls_over_to_tomorrow() {
        let trigger = Trigger::daily(8, 30).unwrap();
        let now = utc("2026-03-01T09:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-02T08:30:00Z"))
        );

        let early = utc("2026-03-01T08:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, early),
            Some(utc("2026-03-01T08:30:00Z"))
        );
    }

    #[test]
    fn daily_is_strictly_after_previous() {
        let trigger = Trigger::daily(8, 30).unwrap();
        let prev = utc("2026-03-01T08:30:00Z");
        assert_eq!(
            trigger.get_next_fire_time(Some(prev), prev),
            Some(utc("2026-03-02T08:30:00Z"))
        );
    }

    #[test]
    fn daily_honours_bound_timezone() {
        let trigger = Trigger::daily(9, 0)
            .unwrap()
            .with_timezone(chrono_tz::Europe::Berlin);
        // 09:00 CET is 08:00 UTC in winter.
        let now = utc("2026-01-10T00:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-01-10T08:00:00Z"))
        );
    }

    #[test]
    fn daily_skips_dst_gap() {
        // 02:30 does not exist in Berlin on 2026-03-29.
        let trigger = Trigger::daily(2, 30)
            .unwrap()
            .with_timezone(chrono_tz::Europe::Berlin);
        let now = utc("2026-03-28T12:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-30T00:30:00Z"))
        );
    }

    #[test]
    fn weekly_finds_next_weekday() {
        // 2026-03-04 is a Wednesday; ask for Friday (4) 18:00.
        let trigger = Trigger::weekly(4, 18, 0).unwrap();
        let now = utc("2026-03-04T10:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-06T18:00:00Z"))
        );
    }

    #[test]
    fn weekly_same_day_after_slot_waits_a_week() {
        let trigger = Trigger::weekly(2, 9, 0).unwrap();
        let now = utc("2026-03-04T10:00:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-11T09:00:00Z"))
        );
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        assert!(Trigger::daily(24, 0).is_err());
        assert!(Trigger::daily(0, 60).is_err());
        assert!(Trigger::weekly(7, 0, 0).is_err());
    }

    #[test]
    fn cron_next_occurrence() {
        let trigger = Trigger::cron("0 */15 * * * *").unwrap();
        let now = utc("2026-03-01T10:07:00Z");
        assert_eq!(
            trigger.get_next_fire_time(None, now),
            Some(utc("2026-03-01T10:15:00Z"))
        );
        assert_eq!(
            trigger.get_next_fire_time(Some(utc("2026-03-01T10:15:00Z")), now),
            Some(utc("2026-03-01T10:30:00Z"))
        );
    }

    #[test]
    fn invalid_cron_is_rejected() {
        let err = Trigger::cron("not a cron").unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn serde_flattens_schedule_and_names_timezone() {
        let trigger = Trigger::daily(7, 5)
            .unwrap()
            .with_timezone(chrono_tz::America::New_York);
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["kind"], "daily");
        assert_eq!(json["hour"], 7);
        assert_eq!(json["timezone"], "America/New_York");

        let back: Trigger = serde_json::from_value(json).unwrap();
        assert_eq!(back, trigger);
    }

    #[test]
    fn missing_timezone_defaults_to_utc() {
        let trigger: Trigger =
            serde_json::from_str(r#"{"kind":"interval","every_secs":30}"#).unwrap();
        assert_eq!(trigger.timezone, chrono_tz::UTC);
    }
}
