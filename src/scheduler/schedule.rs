// ABOUTME: WeeklySchedule - a day/hour/minute on a fixed UTC offset
// ABOUTME: Computes the next firing instant after a given moment

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklySchedule {
    weekday: Weekday,
    time: NaiveTime,
    offset: FixedOffset,
}

impl WeeklySchedule {
    pub fn new(weekday: Weekday, hour: u32, minute: u32, utc_offset_minutes: i32) -> Result<Self> {
        if hour > 23 {
            bail!("hour must be between 0 and 23, got {}", hour);
        }
        if minute > 59 {
            bail!("minute must be between 0 and 59, got {}", minute);
        }
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .with_context(|| format!("invalid time {:02}:{:02}", hour, minute))?;
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .with_context(|| format!("invalid UTC offset of {} minutes", utc_offset_minutes))?;

        Ok(Self {
            weekday,
            time,
            offset,
        })
    }

    /// First firing strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset);
        let days_ahead = (7 + self.weekday.num_days_from_monday()
            - local.weekday().num_days_from_monday())
            % 7;

        let date = local.date_naive() + Duration::days(i64::from(days_ahead));
        let mut candidate = self.at(date);
        if candidate <= now {
            candidate = self.at(date + Duration::days(7));
        }
        candidate
    }

    fn at(&self, date: chrono::NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(self.time);
        let shift = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&(local - shift))
    }
}

impl fmt::Display for WeeklySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "every {} at {} (UTC{})",
            self.weekday,
            self.time.format("%H:%M"),
            self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_next_sunday_midnight_ist() {
        let schedule = WeeklySchedule::new(Weekday::Sun, 0, 0, 330).unwrap();
        // Saturday 12:00 UTC is Saturday 17:30 IST
        let next = schedule.next_after(utc(2026, 10, 17, 12, 0));
        assert_eq!(next, utc(2026, 10, 17, 18, 30));
    }

    #[test]
    fn test_exact_firing_time_moves_a_week() {
        let schedule = WeeklySchedule::new(Weekday::Sun, 0, 0, 330).unwrap();
        let next = schedule.next_after(utc(2026, 10, 17, 18, 30));
        assert_eq!(next, utc(2026, 10, 24, 18, 30));
    }

    #[test]
    fn test_later_same_day() {
        let schedule = WeeklySchedule::new(Weekday::Wed, 3, 15, 0).unwrap();
        // Wednesday 2026-10-14 01:00 UTC
        let next = schedule.next_after(utc(2026, 10, 14, 1, 0));
        assert_eq!(next, utc(2026, 10, 14, 3, 15));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(WeeklySchedule::new(Weekday::Sun, 24, 0, 0).is_err());
        assert!(WeeklySchedule::new(Weekday::Sun, 0, 60, 0).is_err());
        assert!(WeeklySchedule::new(Weekday::Sun, 0, 0, 24 * 60).is_err());
    }

    #[test]
    fn test_display() {
        let schedule = WeeklySchedule::new(Weekday::Sun, 0, 0, 330).unwrap();
        assert_eq!(schedule.to_string(), "every Sun at 00:00 (UTC+05:30)");
    }
}
